// =============================================================================
// Lifecycle Manager (component E) — facade over A-D
// =============================================================================
//
// Composes the Id Generator, Error Tracker, Object Registry and Tick Loop
// into the single surface the rest of the engine (and, one level up, the
// Instance Controller) uses to create, destroy, pause and resume runtime
// objects and to drive or inspect the simulation clock.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};

use crate::clock::SimulatedClock;
use crate::entities::RuntimeObject;
use crate::errors::{EngineError, EngineResult, ErrorTracker};
use crate::ids::{IdGenerator, ObjectId};
use crate::registry::Registry;
use crate::tick_loop::TickLoop;
use crate::timeseries::TimeSeriesManager;
use crate::types::LifecycleState;

/// Snapshot of engine-wide health, returned by `getSystemOverview()`.
#[derive(Debug, Clone, Serialize)]
pub struct SystemOverview {
    pub state_counts: HashMap<LifecycleState, usize>,
    pub total_objects: usize,
    pub target_fps: u32,
    pub actual_fps: f64,
    pub tick_count: u64,
    pub last_overrun_ms: Option<f64>,
    pub total_errors: u64,
    pub tracked_error_objects: usize,
}

/// Default number of recorded errors on an object before it is scheduled for
/// destruction.
pub const DEFAULT_ERROR_THRESHOLD: u32 = 3;

pub struct LifecycleManager {
    pub registry: Arc<Registry<RuntimeObject>>,
    pub error_tracker: Arc<ErrorTracker>,
    pub tick_loop: Arc<TickLoop>,
    pub timeseries: Arc<TimeSeriesManager>,
    pub clock: Arc<SimulatedClock>,
}

impl LifecycleManager {
    pub fn new(initial_fps: u32, acceleration: f64, error_threshold: u32) -> Self {
        let ids = Arc::new(IdGenerator::new());
        let registry: Arc<Registry<RuntimeObject>> = Arc::new(Registry::new(ids));
        let timeseries = Arc::new(TimeSeriesManager::new(crate::timeseries::DEFAULT_RETENTION));
        let clock = Arc::new(SimulatedClock::new(acceleration));

        let registry_for_tracker = Arc::clone(&registry);
        let error_tracker = Arc::new(ErrorTracker::new(error_threshold, move |id| {
            if let Err(e) = registry_for_tracker.transition(id, LifecycleState::Destroying) {
                warn!(object_id = %id, error = %e, "error-threshold destruction request rejected");
            }
        }));

        let tick_loop = Arc::new(TickLoop::new(
            initial_fps,
            Arc::clone(&registry),
            Arc::clone(&timeseries),
            Arc::clone(&clock),
            Arc::clone(&error_tracker),
        ));

        Self {
            registry,
            error_tracker,
            tick_loop,
            timeseries,
            clock,
        }
    }

    /// Strict in contract, per `TickLoop::start`: fails with `IllegalState`
    /// if the loop is already running.
    pub fn start(self: &Arc<Self>) -> EngineResult<()> {
        self.tick_loop.start()?;
        info!("lifecycle manager started");
        Ok(())
    }

    /// Strict in contract, per `TickLoop::stop`: fails with `IllegalState`
    /// if the loop is already stopped.
    pub async fn stop(&self) -> EngineResult<()> {
        self.tick_loop.stop().await?;
        info!("lifecycle manager stopped");
        Ok(())
    }

    pub fn set_fps(&self, fps: u32) -> EngineResult<()> {
        self.tick_loop.set_fps(fps)
    }

    /// Construct and register a new object in `Ready` state. The activation
    /// hook fires on the tick loop's next frame.
    pub fn create(&self, f: impl FnOnce(ObjectId) -> RuntimeObject) -> ObjectId {
        let id = self.registry.insert_with(f);
        info!(object_id = %id, "object created");
        id
    }

    /// Request destruction of `id`. Legal from `Ready`, `Active` or `Paused`;
    /// the tick loop runs `on_destroy` and finalizes the transition to
    /// `Destroyed` on its next frame.
    pub fn destroy(&self, id: ObjectId) -> EngineResult<()> {
        self.registry.transition(id, LifecycleState::Destroying)
    }

    pub fn pause(&self, id: ObjectId) -> EngineResult<()> {
        self.registry.transition(id, LifecycleState::Paused)
    }

    pub fn resume(&self, id: ObjectId) -> EngineResult<()> {
        self.registry.transition(id, LifecycleState::Active)
    }

    /// Request destruction of every live object. Individual rejections (an
    /// object already mid-destruction) are logged, not propagated — the
    /// caller wants "as many as possible," not all-or-nothing.
    pub fn destroy_all(&self) {
        let mut count = 0;
        for state in [LifecycleState::Ready, LifecycleState::Active, LifecycleState::Paused] {
            for id in self.registry.iterate(state) {
                match self.destroy(id) {
                    Ok(()) => count += 1,
                    Err(e) => warn!(object_id = %id, error = %e, "destroy_all: could not destroy object"),
                }
            }
        }
        info!(count, "destroy_all requested destruction of objects");
    }

    pub fn get_system_overview(&self) -> SystemOverview {
        SystemOverview {
            state_counts: self.registry.counts_by_state(),
            total_objects: self.registry.len(),
            target_fps: self.tick_loop.target_fps(),
            actual_fps: self.tick_loop.actual_fps(),
            tick_count: self.tick_loop.tick_count(),
            last_overrun_ms: self.tick_loop.last_overrun_ms(),
            total_errors: self.error_tracker.total_errors(),
            tracked_error_objects: self.error_tracker.tracked_object_count(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::Stock;
    use crate::types::StockCategory;

    fn sample_stock_ctor(id: ObjectId) -> RuntimeObject {
        RuntimeObject::Stock(Stock::new(id, "AAA", "Acme", StockCategory::Technology, 10.0, 100, 0.0, 0.1))
    }

    #[test]
    fn create_places_object_in_ready_state() {
        let lm = LifecycleManager::new(30, 1.0, DEFAULT_ERROR_THRESHOLD);
        let id = lm.create(sample_stock_ctor);
        assert_eq!(lm.registry.state_of(id), Some(LifecycleState::Ready));
    }

    #[test]
    fn pause_resume_round_trip() {
        let lm = LifecycleManager::new(30, 1.0, DEFAULT_ERROR_THRESHOLD);
        let id = lm.create(sample_stock_ctor);
        lm.registry.transition(id, LifecycleState::Active).unwrap();
        lm.pause(id).unwrap();
        assert_eq!(lm.registry.state_of(id), Some(LifecycleState::Paused));
        lm.resume(id).unwrap();
        assert_eq!(lm.registry.state_of(id), Some(LifecycleState::Active));
    }

    #[test]
    fn destroy_all_schedules_every_live_object() {
        let lm = LifecycleManager::new(30, 1.0, DEFAULT_ERROR_THRESHOLD);
        for _ in 0..5 {
            lm.create(sample_stock_ctor);
        }
        lm.destroy_all();
        let counts = lm.registry.counts_by_state();
        assert_eq!(*counts.get(&LifecycleState::Destroying).unwrap(), 5);
    }

    #[test]
    fn system_overview_reflects_object_counts() {
        let lm = LifecycleManager::new(30, 1.0, DEFAULT_ERROR_THRESHOLD);
        lm.create(sample_stock_ctor);
        lm.create(sample_stock_ctor);
        let overview = lm.get_system_overview();
        assert_eq!(overview.total_objects, 2);
        assert_eq!(overview.target_fps, 30);
    }

    #[test]
    fn error_threshold_schedules_destruction() {
        let lm = LifecycleManager::new(30, 1.0, 2);
        let id = lm.create(sample_stock_ctor);
        lm.registry.transition(id, LifecycleState::Active).unwrap();
        lm.error_tracker.record(id, "e1");
        assert_eq!(lm.registry.state_of(id), Some(LifecycleState::Active));
        lm.error_tracker.record(id, "e2");
        assert_eq!(lm.registry.state_of(id), Some(LifecycleState::Destroying));
    }
}
