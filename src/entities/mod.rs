// =============================================================================
// Runtime Entities (component F) — Exchange, Stock, AiTrader
// =============================================================================
//
// Entity kinds are compile-time-known, so dispatch uses a closed sum type
// (`RuntimeObject`) rather than a trait object: the Tick Loop never needs to
// allocate or downcast to drive a hook. See SPEC_FULL.md §9 for the rationale.
// =============================================================================

pub mod exchange;
pub mod stock;
pub mod trader;

use chrono::{DateTime, Utc};

use crate::errors::EngineError;
use crate::ids::ObjectId;
use crate::registry::Registry;
use crate::timeseries::manager::TimeSeriesManager;

pub use exchange::Exchange;
pub use stock::Stock;
pub use trader::AiTrader;

/// Error surfaced by a lifecycle hook. Distinct from [`EngineError`]: hook
/// errors never reach a client directly, they are recorded by the
/// `ErrorTracker` and may escalate to a forced `Destroying` transition.
#[derive(Debug, Clone)]
pub struct HookError(pub String);

impl std::fmt::Display for HookError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for HookError {}

impl From<EngineError> for HookError {
    fn from(e: EngineError) -> Self {
        HookError(e.to_string())
    }
}

pub type HookResult<T = ()> = Result<T, HookError>;

/// Everything a lifecycle hook needs to interact with the rest of the
/// engine: the shared registry (to look up other entities by id), the
/// time-series manager (to push points), and the current tick/time.
pub struct TickContext<'a> {
    pub registry: &'a Registry<RuntimeObject>,
    pub timeseries: &'a TimeSeriesManager,
    pub tick_id: u64,
    pub sim_time: DateTime<Utc>,
    pub dt_seconds: f64,
}

/// Lifecycle hooks every runtime entity kind implements. The Tick Loop calls
/// `on_tick` once per frame for every object in `Active` state, in ascending
/// id order; the other hooks fire on the corresponding state transition.
pub trait LifecycleHooks {
    fn on_activate(&mut self, _ctx: &TickContext) -> HookResult {
        Ok(())
    }

    fn on_tick(&mut self, ctx: &TickContext) -> HookResult;

    fn on_pause(&mut self, _ctx: &TickContext) -> HookResult {
        Ok(())
    }

    fn on_resume(&mut self, _ctx: &TickContext) -> HookResult {
        Ok(())
    }

    fn on_destroy(&mut self, _ctx: &TickContext) -> HookResult {
        Ok(())
    }
}

/// Closed sum of every runtime entity kind the registry can hold. Each
/// variant owns its domain state; dispatch is a single match with no
/// indirection.
#[derive(Debug, Clone)]
pub enum RuntimeObject {
    Exchange(Exchange),
    Stock(Stock),
    Trader(AiTrader),
}

impl RuntimeObject {
    pub fn id(&self) -> ObjectId {
        match self {
            Self::Exchange(e) => e.id,
            Self::Stock(s) => s.id,
            Self::Trader(t) => t.id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Exchange(_) => "Exchange",
            Self::Stock(_) => "Stock",
            Self::Trader(_) => "Trader",
        }
    }

    pub fn as_exchange(&self) -> Option<&Exchange> {
        match self {
            Self::Exchange(e) => Some(e),
            _ => None,
        }
    }

    pub fn as_stock(&self) -> Option<&Stock> {
        match self {
            Self::Stock(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_stock_mut(&mut self) -> Option<&mut Stock> {
        match self {
            Self::Stock(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_trader(&self) -> Option<&AiTrader> {
        match self {
            Self::Trader(t) => Some(t),
            _ => None,
        }
    }
}

impl LifecycleHooks for RuntimeObject {
    fn on_activate(&mut self, ctx: &TickContext) -> HookResult {
        match self {
            Self::Exchange(e) => e.on_activate(ctx),
            Self::Stock(s) => LifecycleHooks::on_activate(s, ctx),
            Self::Trader(t) => t.on_activate(ctx),
        }
    }

    fn on_tick(&mut self, ctx: &TickContext) -> HookResult {
        match self {
            Self::Exchange(e) => e.on_tick(ctx),
            Self::Stock(s) => LifecycleHooks::on_tick(s, ctx),
            Self::Trader(t) => t.on_tick(ctx),
        }
    }

    fn on_pause(&mut self, ctx: &TickContext) -> HookResult {
        match self {
            Self::Exchange(e) => e.on_pause(ctx),
            Self::Stock(s) => LifecycleHooks::on_pause(s, ctx),
            Self::Trader(t) => t.on_pause(ctx),
        }
    }

    fn on_resume(&mut self, ctx: &TickContext) -> HookResult {
        match self {
            Self::Exchange(e) => e.on_resume(ctx),
            Self::Stock(s) => LifecycleHooks::on_resume(s, ctx),
            Self::Trader(t) => t.on_resume(ctx),
        }
    }

    fn on_destroy(&mut self, ctx: &TickContext) -> HookResult {
        match self {
            Self::Exchange(e) => e.on_destroy(ctx),
            Self::Stock(s) => LifecycleHooks::on_destroy(s, ctx),
            Self::Trader(t) => t.on_destroy(ctx),
        }
    }
}

/// `Stock` itself has no per-tick behaviour of its own — its price evolves
/// via `apply_price_step`, called by its owning `Exchange`'s hook — so its
/// hook impl is a no-op that only exists to satisfy `RuntimeObject`'s uniform
/// dispatch.
impl LifecycleHooks for Stock {
    fn on_tick(&mut self, _ctx: &TickContext) -> HookResult {
        Ok(())
    }
}
