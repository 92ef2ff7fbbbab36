// =============================================================================
// Simulated Clock (component G)
// =============================================================================
//
// Maps wall-clock time onto simulated time at an adjustable acceleration
// factor (0.1x - 1000x). Changing the acceleration resets the anchor pair so
// simulated time stays continuous across the change — no jump, no rewind.
// =============================================================================

use std::time::Instant;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::errors::EngineError;

pub const MIN_ACCELERATION: f64 = 0.1;
pub const MAX_ACCELERATION: f64 = 1000.0;

struct Anchor {
    real_anchor: Instant,
    sim_anchor: DateTime<Utc>,
    acceleration: f64,
}

/// A per-instance clock mapping real elapsed time to simulated time.
pub struct SimulatedClock {
    anchor: RwLock<Anchor>,
}

impl SimulatedClock {
    pub fn new(acceleration: f64) -> Self {
        let acceleration = acceleration.clamp(MIN_ACCELERATION, MAX_ACCELERATION);
        Self {
            anchor: RwLock::new(Anchor {
                real_anchor: Instant::now(),
                sim_anchor: Utc::now(),
                acceleration,
            }),
        }
    }

    /// Current simulated time.
    pub fn now(&self) -> DateTime<Utc> {
        let anchor = self.anchor.read();
        let elapsed = anchor.real_anchor.elapsed().as_secs_f64() * anchor.acceleration;
        anchor.sim_anchor + ChronoDuration::milliseconds((elapsed * 1000.0) as i64)
    }

    pub fn acceleration(&self) -> f64 {
        self.anchor.read().acceleration
    }

    /// Change the acceleration factor, re-anchoring at the current moment so
    /// simulated time does not jump.
    pub fn set_acceleration(&self, new_acceleration: f64) -> Result<(), EngineError> {
        if !(MIN_ACCELERATION..=MAX_ACCELERATION).contains(&new_acceleration) {
            return Err(EngineError::InvalidAcceleration(format!(
                "{new_acceleration} outside [{MIN_ACCELERATION}, {MAX_ACCELERATION}]"
            )));
        }
        let now = self.now();
        let mut anchor = self.anchor.write();
        anchor.real_anchor = Instant::now();
        anchor.sim_anchor = now;
        anchor.acceleration = new_acceleration;
        debug!(new_acceleration, "clock acceleration changed");
        if new_acceleration < 1.0 || new_acceleration > 100.0 {
            warn!(new_acceleration, "acceleration far from real-time, simulated candles may look unusual");
        }
        Ok(())
    }
}
