// =============================================================================
// Engine Configuration — hot-reloadable ambient settings
// =============================================================================
//
// Mirrors the teacher's runtime_config.rs pattern: every field has a serde
// default so old config files on disk still deserialize after a field is
// added, and `save()` writes atomically (tmp file + rename) so a crash
// mid-write never leaves a half-written config behind.
// =============================================================================

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::tick_loop::{MAX_FPS, MIN_FPS};

fn default_target_fps() -> u32 {
    60
}

fn default_acceleration() -> f64 {
    1.0
}

fn default_error_threshold() -> u32 {
    3
}

fn default_series_retention() -> usize {
    5000
}

fn default_push_backlog() -> usize {
    256
}

fn default_max_concurrent_creations() -> usize {
    num_cpus::get()
}

fn default_reading_templates_timeout_secs() -> u64 {
    30
}

fn default_creating_objects_timeout_secs() -> u64 {
    120
}

fn default_progress_ttl_hours() -> u64 {
    24
}

/// Top-level engine configuration, loaded once at startup and hot-reloadable
/// thereafter via `EngineConfig::load`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_target_fps")]
    pub target_fps: u32,

    #[serde(default = "default_acceleration")]
    pub initial_acceleration: f64,

    #[serde(default = "default_error_threshold")]
    pub error_threshold: u32,

    #[serde(default = "default_series_retention")]
    pub series_retention: usize,

    #[serde(default = "default_push_backlog")]
    pub push_backlog: usize,

    #[serde(default = "default_max_concurrent_creations")]
    pub max_concurrent_creations: usize,

    /// Per-stage soft deadlines for the Instance Factory pipeline (spec
    /// §Timeouts: `stageTimeouts:{readingTemplates, creatingObjects}`).
    #[serde(default = "default_reading_templates_timeout_secs")]
    pub reading_templates_timeout_secs: u64,

    #[serde(default = "default_creating_objects_timeout_secs")]
    pub creating_objects_timeout_secs: u64,

    /// How long a terminal progress record is kept before the periodic sweep
    /// purges it (spec §Configuration `progressTtlHours`, default 24).
    /// In-flight records are never purged regardless of age.
    #[serde(default = "default_progress_ttl_hours")]
    pub progress_ttl_hours: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            target_fps: default_target_fps(),
            initial_acceleration: default_acceleration(),
            error_threshold: default_error_threshold(),
            series_retention: default_series_retention(),
            push_backlog: default_push_backlog(),
            max_concurrent_creations: default_max_concurrent_creations(),
            reading_templates_timeout_secs: default_reading_templates_timeout_secs(),
            creating_objects_timeout_secs: default_creating_objects_timeout_secs(),
            progress_ttl_hours: default_progress_ttl_hours(),
        }
    }
}

impl EngineConfig {
    /// Load from `path`, falling back to defaults if the file does not
    /// exist. A malformed file is an error — it almost certainly means a
    /// manual edit went wrong and silently ignoring it would hide that.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&contents)?;
        Ok(config.clamped())
    }

    /// Persist atomically: write to a sibling `.tmp` file, then rename over
    /// the target. A crash between the two leaves either the old file intact
    /// or the new one complete — never a half-written config.
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let tmp_path = path.with_extension("json.tmp");
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(&tmp_path, contents)?;
        std::fs::rename(&tmp_path, path)?;
        Ok(())
    }

    fn clamped(mut self) -> Self {
        self.target_fps = self.target_fps.clamp(MIN_FPS, MAX_FPS);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_values_are_sane() {
        let config = EngineConfig::default();
        assert_eq!(config.target_fps, 60);
        assert_eq!(config.initial_acceleration, 1.0);
        assert_eq!(config.error_threshold, 3);
        assert_eq!(config.series_retention, 5000);
        assert_eq!(config.reading_templates_timeout_secs, 30);
        assert_eq!(config.creating_objects_timeout_secs, 120);
        assert_eq!(config.progress_ttl_hours, 24);
    }

    #[test]
    fn empty_json_object_fills_in_all_defaults() {
        let config: EngineConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.target_fps, 60);
        assert_eq!(config.series_retention, 5000);
    }

    #[test]
    fn partial_json_keeps_specified_fields_and_defaults_the_rest() {
        let config: EngineConfig = serde_json::from_str(r#"{"target_fps": 30}"#).unwrap();
        assert_eq!(config.target_fps, 30);
        assert_eq!(config.push_backlog, 256);
    }

    #[test]
    fn load_missing_file_returns_defaults() {
        let dir = std::env::temp_dir().join(format!("aurora-config-test-missing-{}", std::process::id()));
        let path = dir.join("config.json");
        let config = EngineConfig::load(&path).unwrap();
        assert_eq!(config.target_fps, 60);
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = std::env::temp_dir().join(format!("aurora-config-test-roundtrip-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.json");

        let mut config = EngineConfig::default();
        config.target_fps = 45;
        config.save(&path).unwrap();

        let loaded = EngineConfig::load(&path).unwrap();
        assert_eq!(loaded.target_fps, 45);

        std::fs::remove_dir_all(&dir).ok();
    }
}
