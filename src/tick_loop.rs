// =============================================================================
// Tick Loop (component D) — fixed-frequency driver of every lifecycle hook
// =============================================================================
//
// One dedicated tokio task per market instance, running at a configurable
// target frequency (1-120 FPS). Each frame:
//
//   1. Ready objects are activated (on_activate, Ready -> Active).
//   2. Active objects are ticked (on_tick) in ascending id order.
//   3. Destroying objects are torn down (on_destroy, Destroying -> Destroyed).
//   4. Destroyed objects are compacted out of the registry.
//   5. actualFps is updated via an exponential moving average and the loop
//      sleeps off whatever is left of the frame budget. A frame that runs
//      long is logged as an overrun rather than silently absorbed.
// =============================================================================

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{info, trace, warn};

use crate::clock::SimulatedClock;
use crate::entities::{LifecycleHooks, RuntimeObject, TickContext};
use crate::errors::{EngineError, EngineResult};
use crate::errors::ErrorTracker;
use crate::registry::Registry;
use crate::timeseries::TimeSeriesManager;
use crate::types::LifecycleState;

pub const MIN_FPS: u32 = 1;
pub const MAX_FPS: u32 = 120;

/// Smoothing factor for the actualFps exponential moving average. Lower is
/// smoother/slower to react; chosen so a sustained frequency change settles
/// within roughly a second at typical FPS values.
const FPS_EMA_ALPHA: f64 = 0.1;

struct SharedState {
    target_fps: AtomicU32,
    running: AtomicBool,
    tick_count: AtomicU64,
    actual_fps: RwLock<f64>,
    last_overrun_ms: RwLock<Option<f64>>,
}

/// Fixed-frequency driver for one market instance's object lifecycle.
pub struct TickLoop {
    shared: Arc<SharedState>,
    stop_signal: Arc<Notify>,
    handle: RwLock<Option<JoinHandle<()>>>,
    registry: Arc<Registry<RuntimeObject>>,
    timeseries: Arc<TimeSeriesManager>,
    clock: Arc<SimulatedClock>,
    error_tracker: Arc<ErrorTracker>,
}

impl TickLoop {
    pub fn new(
        initial_fps: u32,
        registry: Arc<Registry<RuntimeObject>>,
        timeseries: Arc<TimeSeriesManager>,
        clock: Arc<SimulatedClock>,
        error_tracker: Arc<ErrorTracker>,
    ) -> Self {
        Self {
            shared: Arc::new(SharedState {
                target_fps: AtomicU32::new(initial_fps.clamp(MIN_FPS, MAX_FPS)),
                running: AtomicBool::new(false),
                tick_count: AtomicU64::new(0),
                actual_fps: RwLock::new(0.0),
                last_overrun_ms: RwLock::new(None),
            }),
            stop_signal: Arc::new(Notify::new()),
            handle: RwLock::new(None),
            registry,
            timeseries,
            clock,
            error_tracker,
        }
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    pub fn tick_count(&self) -> u64 {
        self.shared.tick_count.load(Ordering::Relaxed)
    }

    pub fn actual_fps(&self) -> f64 {
        *self.shared.actual_fps.read()
    }

    pub fn target_fps(&self) -> u32 {
        self.shared.target_fps.load(Ordering::Relaxed)
    }

    pub fn last_overrun_ms(&self) -> Option<f64> {
        *self.shared.last_overrun_ms.read()
    }

    /// Change the target frequency. Takes effect on the next frame boundary.
    pub fn set_fps(&self, fps: u32) -> EngineResult<()> {
        if !(MIN_FPS..=MAX_FPS).contains(&fps) {
            return Err(EngineError::Validation(format!(
                "fps {fps} outside [{MIN_FPS}, {MAX_FPS}]"
            )));
        }
        self.shared.target_fps.store(fps, Ordering::Relaxed);
        Ok(())
    }

    /// Start the tick loop. Spawns a dedicated tokio task that runs until
    /// `stop()` is called. Strict in contract: starting an already-running
    /// loop fails with `IllegalState` rather than silently no-op'ing.
    pub fn start(self: &Arc<Self>) -> EngineResult<()> {
        if self.shared.running.swap(true, Ordering::AcqRel) {
            return Err(EngineError::IllegalState("tick loop is already running".into()));
        }
        let this = Arc::clone(self);
        let handle = tokio::spawn(async move {
            this.run().await;
        });
        *self.handle.write() = Some(handle);
        info!("tick loop started");
        Ok(())
    }

    /// Signal the loop to stop and wait for the current frame to finish.
    /// Strict in contract: stopping an already-stopped loop fails with
    /// `IllegalState`.
    pub async fn stop(&self) -> EngineResult<()> {
        if !self.shared.running.swap(false, Ordering::AcqRel) {
            return Err(EngineError::IllegalState("tick loop is not running".into()));
        }
        self.stop_signal.notify_one();
        let handle = self.handle.write().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        info!("tick loop stopped");
        Ok(())
    }

    async fn run(self: Arc<Self>) {
        loop {
            if !self.shared.running.load(Ordering::Acquire) {
                break;
            }
            let frame_start = Instant::now();

            tokio::select! {
                _ = self.stop_signal.notified() => break,
                _ = self.run_single_tick() => {}
            }

            let elapsed = frame_start.elapsed();
            self.update_actual_fps(elapsed);

            let period = Duration::from_secs_f64(1.0 / self.target_fps() as f64);
            if elapsed < period {
                tokio::select! {
                    _ = tokio::time::sleep(period - elapsed) => {}
                    _ = self.stop_signal.notified() => break,
                }
            } else {
                let overrun_ms = (elapsed - period).as_secs_f64() * 1000.0;
                *self.shared.last_overrun_ms.write() = Some(overrun_ms);
                warn!(overrun_ms, frame_ms = elapsed.as_secs_f64() * 1000.0, "tick loop frame overran its budget");
            }
        }
    }

    async fn run_single_tick(&self) {
        let tick_id = self.shared.tick_count.fetch_add(1, Ordering::Relaxed) + 1;
        let sim_time = self.clock.now();
        let dt_seconds = (1.0 / self.target_fps() as f64) * self.clock.acceleration();

        let ctx = TickContext {
            registry: &self.registry,
            timeseries: &self.timeseries,
            tick_id,
            sim_time,
            dt_seconds,
        };

        for id in self.registry.iterate(LifecycleState::Ready) {
            if let Err(e) = self.registry.transition(id, LifecycleState::Active) {
                warn!(object_id = %id, error = %e, "failed to activate ready object");
                continue;
            }
            let result = self.registry.with_mut(id, |obj| obj.on_activate(&ctx));
            if let Some(Err(e)) = result {
                self.error_tracker.record(id, format!("on_activate: {e}"));
            }
        }

        for id in self.registry.iterate(LifecycleState::Active) {
            let result = self.registry.with_mut(id, |obj| obj.on_tick(&ctx));
            match result {
                Some(Err(e)) => {
                    self.error_tracker.record(id, format!("on_tick: {e}"));
                }
                Some(Ok(())) => {}
                None => trace!(object_id = %id, "object vanished mid-tick"),
            }
        }

        for id in self.registry.iterate(LifecycleState::Destroying) {
            let result = self.registry.with_mut(id, |obj| obj.on_destroy(&ctx));
            if let Some(Err(e)) = result {
                self.error_tracker.record(id, format!("on_destroy: {e}"));
            }
            if let Err(e) = self.registry.transition(id, LifecycleState::Destroyed) {
                warn!(object_id = %id, error = %e, "failed to finalize destruction");
            } else {
                self.error_tracker.clear(id);
            }
        }

        self.registry.compact();
    }

    fn update_actual_fps(&self, elapsed: Duration) {
        let instantaneous = if elapsed.as_secs_f64() > 0.0 {
            1.0 / elapsed.as_secs_f64()
        } else {
            self.target_fps() as f64
        };
        let mut actual = self.shared.actual_fps.write();
        *actual = if *actual == 0.0 {
            instantaneous
        } else {
            FPS_EMA_ALPHA * instantaneous + (1.0 - FPS_EMA_ALPHA) * *actual
        };
    }
}
