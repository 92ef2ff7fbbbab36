// =============================================================================
// Error Tracker & Closed Error Taxonomy
// =============================================================================
//
// Two related but distinct concerns live here:
//
//   1. `ErrorTracker` (component B) — per-object error counts feeding the
//      Lifecycle Manager's destruction threshold. Errors raised from a
//      lifecycle hook are recovered locally here; they never reach a client.
//
//   2. `EngineError` — the closed taxonomy from the command/query surface
//      (component J/L). These *do* cross into client-visible responses, each
//      carrying a stable `code()` string for the JSON error envelope.
// =============================================================================

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

use crate::ids::ObjectId;

// =============================================================================
// ErrorTracker (component B)
// =============================================================================

/// Record of the most recent error raised by a single object.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorRecord {
    pub count: u32,
    pub last_kind: String,
    pub last_at: DateTime<Utc>,
}

/// Per-object error counters with a configured destruction threshold.
///
/// Reaching the threshold invokes a callback supplied at construction; the
/// callback is invoked without holding the tracker's lock so it is free to
/// call back into the registry or lifecycle manager.
pub struct ErrorTracker {
    records: RwLock<HashMap<ObjectId, ErrorRecord>>,
    threshold: u32,
    on_threshold: Box<dyn Fn(ObjectId) + Send + Sync>,
}

impl ErrorTracker {
    /// `threshold` — number of recorded errors after which `on_threshold` is
    /// invoked for that object. `on_threshold` typically schedules the
    /// object for `Destroying`.
    pub fn new(threshold: u32, on_threshold: impl Fn(ObjectId) + Send + Sync + 'static) -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            threshold,
            on_threshold: Box::new(on_threshold),
        }
    }

    /// Record an error for `id`, returning the new count. If the count has
    /// just reached the threshold, `on_threshold` is invoked.
    pub fn record(&self, id: ObjectId, kind: impl Into<String>) -> u32 {
        let kind = kind.into();
        let new_count = {
            let mut records = self.records.write();
            let entry = records.entry(id).or_insert(ErrorRecord {
                count: 0,
                last_kind: kind.clone(),
                last_at: Utc::now(),
            });
            entry.count += 1;
            entry.last_kind = kind.clone();
            entry.last_at = Utc::now();
            entry.count
        };

        warn!(object_id = %id, kind = %kind, count = new_count, threshold = self.threshold, "object error recorded");

        if new_count == self.threshold {
            warn!(object_id = %id, threshold = self.threshold, "error threshold reached — scheduling destruction");
            (self.on_threshold)(id);
        }

        new_count
    }

    /// Current error count for `id` (0 if none recorded).
    pub fn count(&self, id: ObjectId) -> u32 {
        self.records.read().get(&id).map(|r| r.count).unwrap_or(0)
    }

    /// Reset the counter for `id`. Called after a successful `Destroyed`
    /// transition (or, in principle, on object reuse — ids are never reused
    /// in practice, but resetting is still correct).
    pub fn clear(&self, id: ObjectId) {
        self.records.write().remove(&id);
    }

    /// Aggregate error statistics across all tracked objects, used by
    /// `getSystemOverview()`.
    pub fn total_errors(&self) -> u64 {
        self.records.read().values().map(|r| r.count as u64).sum()
    }

    pub fn tracked_object_count(&self) -> usize {
        self.records.read().len()
    }
}

// =============================================================================
// EngineError — closed taxonomy (component J/L, §7)
// =============================================================================

/// The closed set of error codes the command/query surface can return.
/// `code()` yields the exact wire string from spec §7.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("template not found: {0}")]
    TemplateNotFound(String),

    #[error("instance not found: {0}")]
    InstanceNotFound(String),

    #[error("stock not found: {0}")]
    StockNotFound(String),

    #[error("series not found: {0}")]
    SeriesNotFound(String),

    #[error("progress record not found: {0}")]
    ProgressNotFound(String),

    #[error("illegal state: {0}")]
    IllegalState(String),

    #[error("illegal transition: {0}")]
    IllegalTransition(String),

    #[error("instance busy: {0}")]
    InstanceBusy(String),

    #[error("stage timeout: {0}")]
    StageTimeout(String),

    #[error("worker crashed: {0}")]
    WorkerCrashed(String),

    #[error("lagging subscriber: {0}")]
    LaggingSubscriber(String),

    #[error("timestamp regression: {0}")]
    TimestampRegression(String),

    #[error("series already exists: {0}")]
    SeriesExists(String),

    #[error("invalid acceleration: {0}")]
    InvalidAcceleration(String),

    #[error("insufficient shares: {0}")]
    InsufficientShares(String),

    #[error("oversubscribed shares: {0}")]
    OversubscribedShares(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("cancelled: {0}")]
    Cancelled(String),

    #[error("internal error")]
    Internal(#[from] anyhow::Error),
}

impl EngineError {
    /// Stable machine-readable code for the JSON error envelope.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "ValidationError",
            Self::TemplateNotFound(_) => "TemplateNotFound",
            Self::InstanceNotFound(_) => "InstanceNotFound",
            Self::StockNotFound(_) => "StockNotFound",
            Self::SeriesNotFound(_) => "SeriesNotFound",
            Self::ProgressNotFound(_) => "ProgressNotFound",
            Self::IllegalState(_) => "IllegalState",
            Self::IllegalTransition(_) => "IllegalTransition",
            Self::InstanceBusy(_) => "InstanceBusy",
            Self::StageTimeout(_) => "StageTimeout",
            Self::WorkerCrashed(_) => "WorkerCrashed",
            Self::LaggingSubscriber(_) => "LaggingSubscriber",
            Self::TimestampRegression(_) => "TimestampRegression",
            Self::SeriesExists(_) => "SeriesExists",
            Self::InvalidAcceleration(_) => "InvalidAcceleration",
            Self::InsufficientShares(_) => "InsufficientShares",
            Self::OversubscribedShares(_) => "OversubscribedShares",
            Self::Forbidden(_) => "Forbidden",
            Self::Cancelled(_) => "Cancelled",
            Self::Internal(_) => "InternalError",
        }
    }

    /// Log at an appropriate level and return `self` unchanged — used at
    /// pipeline boundaries so internal errors always leave a stack trace in
    /// the logs even though the client only sees the opaque message.
    pub fn logged(self) -> Self {
        match &self {
            Self::Internal(err) => {
                tracing::error!(error = ?err, "internal error");
            }
            other => {
                info!(code = other.code(), message = %other, "command error");
            }
        }
        self
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn records_increment_and_report_count() {
        let tracker = ErrorTracker::new(3, |_| {});
        let id = ObjectId(1);
        assert_eq!(tracker.record(id, "boom"), 1);
        assert_eq!(tracker.record(id, "boom"), 2);
        assert_eq!(tracker.count(id), 2);
    }

    #[test]
    fn threshold_callback_fires_exactly_once_at_threshold() {
        let fired = Arc::new(AtomicU32::new(0));
        let fired2 = fired.clone();
        let tracker = ErrorTracker::new(3, move |_| {
            fired2.fetch_add(1, Ordering::SeqCst);
        });
        let id = ObjectId(7);
        tracker.record(id, "e1");
        tracker.record(id, "e2");
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        tracker.record(id, "e3");
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        tracker.record(id, "e4");
        assert_eq!(fired.load(Ordering::SeqCst), 1, "only fires once at the boundary");
    }

    #[test]
    fn clear_resets_counter() {
        let tracker = ErrorTracker::new(3, |_| {});
        let id = ObjectId(1);
        tracker.record(id, "e");
        tracker.clear(id);
        assert_eq!(tracker.count(id), 0);
    }

    #[test]
    fn error_codes_match_taxonomy() {
        assert_eq!(EngineError::Validation("x".into()).code(), "ValidationError");
        assert_eq!(EngineError::InstanceBusy("x".into()).code(), "InstanceBusy");
        assert_eq!(
            EngineError::Internal(anyhow::anyhow!("boom")).code(),
            "InternalError"
        );
    }
}
