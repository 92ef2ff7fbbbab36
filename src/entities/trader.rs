// =============================================================================
// AiTrader — autonomous decision-maker that buys and sells listed stocks
// =============================================================================

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use super::{HookResult, LifecycleHooks, TickContext};
use crate::ids::ObjectId;
use crate::types::{RiskProfile, TradingStyle};

/// One open position: shares held and their volume-weighted average cost.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Holding {
    pub quantity: u64,
    pub average_cost: f64,
}

/// One recorded fill. Kept in a bounded per-trader ring so `export` can
/// surface a trading history without the log growing without bound over a
/// long-lived instance (spec §4.J `export` clause (c): last 1000 trades).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TradeLogEntry {
    pub stock_id: ObjectId,
    pub delta_qty: i64,
    pub price: f64,
    pub executed_at: DateTime<Utc>,
}

/// Per-trader trade-log cap (spec Open Questions: fixed at 1000).
pub const TRADE_LOG_CAPACITY: usize = 1000;

/// An autonomous trader that periodically decides whether to buy or sell one
/// of the stocks it watches. The decision policy is keyed off `risk_profile`:
/// conservative traders dip-buy and only take profit at a wide gain, while
/// moderate/aggressive traders use progressively looser thresholds. The exact
/// thresholds are tunable per-instance via `strategy_parameters`.
#[derive(Clone, Serialize, Deserialize)]
pub struct AiTrader {
    pub id: ObjectId,
    pub name: String,
    pub exchange_id: ObjectId,
    pub watched_stock_ids: Vec<ObjectId>,
    pub risk_profile: RiskProfile,
    pub trading_style: TradingStyle,
    pub cash: f64,
    /// Maximum number of distinct symbols held at once.
    pub max_positions: u32,
    /// Open positions, keyed by the stock's object id.
    pub holdings: HashMap<ObjectId, Holding>,
    /// Named tunables for the risk-profile's decision policy (e.g.
    /// `dip_buy_threshold`, `take_profit_threshold`). Populated from
    /// [`RiskProfile`] defaults at construction and overridable thereafter.
    pub strategy_parameters: HashMap<String, f64>,
    /// Most recent fills, oldest first, capped at [`TRADE_LOG_CAPACITY`].
    pub trade_log: VecDeque<TradeLogEntry>,
    #[serde(skip, default = "default_rng")]
    rng: StdRng,
}

fn default_rng() -> StdRng {
    StdRng::from_os_rng()
}

impl std::fmt::Debug for AiTrader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AiTrader")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("exchange_id", &self.exchange_id)
            .field("risk_profile", &self.risk_profile)
            .field("trading_style", &self.trading_style)
            .field("cash", &self.cash)
            .field("max_positions", &self.max_positions)
            .field("holdings", &self.holdings)
            .finish()
    }
}

/// Default strategy-parameter keys, shared by every risk profile.
const DIP_BUY_THRESHOLD: &str = "dip_buy_threshold";
const TAKE_PROFIT_THRESHOLD: &str = "take_profit_threshold";
const ACTION_PROBABILITY: &str = "action_probability";
const POSITION_FRACTION: &str = "position_fraction";

impl AiTrader {
    pub fn new(
        id: ObjectId,
        name: impl Into<String>,
        exchange_id: ObjectId,
        risk_profile: RiskProfile,
        trading_style: TradingStyle,
        starting_cash: f64,
        max_positions: u32,
        seed: u64,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            exchange_id,
            watched_stock_ids: Vec::new(),
            risk_profile,
            trading_style,
            cash: starting_cash,
            max_positions,
            holdings: HashMap::new(),
            strategy_parameters: Self::default_strategy_parameters(risk_profile),
            trade_log: VecDeque::new(),
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Default tunables per risk profile. Only the conservative policy's
    /// thresholds are pinned by a testable scenario (dip-buy at -5% from
    /// average cost, take-profit at +20%); moderate and aggressive use
    /// progressively wider dip-buy discounts and lower take-profit bars,
    /// reflecting a willingness to average down further and realize gains
    /// sooner, implemented the same way and tuned by feel.
    fn default_strategy_parameters(risk_profile: RiskProfile) -> HashMap<String, f64> {
        let (dip_buy, take_profit, action_probability, position_fraction) = match risk_profile {
            RiskProfile::Conservative => (0.95, 1.20, 0.02, 0.05),
            RiskProfile::Moderate => (0.90, 1.12, 0.08, 0.15),
            RiskProfile::Aggressive => (0.85, 1.06, 0.2, 0.35),
        };
        HashMap::from([
            (DIP_BUY_THRESHOLD.to_string(), dip_buy),
            (TAKE_PROFIT_THRESHOLD.to_string(), take_profit),
            (ACTION_PROBABILITY.to_string(), action_probability),
            (POSITION_FRACTION.to_string(), position_fraction),
        ])
    }

    fn parameter(&self, key: &str, default: f64) -> f64 {
        self.strategy_parameters.get(key).copied().unwrap_or(default)
    }

    pub fn watch(&mut self, stock_id: ObjectId) {
        if !self.watched_stock_ids.contains(&stock_id) {
            self.watched_stock_ids.push(stock_id);
        }
    }

    /// Probability of acting on any given tick. Aggressive traders trade
    /// more often and in larger size; conservative traders trade rarely.
    fn action_probability(&self) -> f64 {
        self.parameter(ACTION_PROBABILITY, 0.08)
    }

    /// Fraction of available cash (for a buy) committed to a single trade.
    fn position_fraction(&self) -> f64 {
        self.parameter(POSITION_FRACTION, 0.15)
    }

    /// Decide what, if anything, to do about `stock_id` at `price` given the
    /// current holding (if any). Never returns both a buy and a sell: at most
    /// one intent per symbol per tick, per spec.
    fn decide(&self, stock_id: ObjectId, price: f64) -> Option<Intent> {
        let dip_buy_threshold = self.parameter(DIP_BUY_THRESHOLD, 0.90);
        let take_profit_threshold = self.parameter(TAKE_PROFIT_THRESHOLD, 1.12);

        if let Some(holding) = self.holdings.get(&stock_id) {
            if price >= holding.average_cost * take_profit_threshold {
                return Some(Intent::Sell);
            }
            if price <= holding.average_cost * dip_buy_threshold && self.cash > 0.0 {
                return Some(Intent::Buy);
            }
            return None;
        }

        if (self.holdings.len() as u32) < self.max_positions && self.cash > 0.0 {
            return Some(Intent::Buy);
        }
        None
    }

    /// Apply a fill to the in-memory holding ledger. Buys update the
    /// volume-weighted average cost; sells reduce quantity and drop the
    /// holding entirely once it reaches zero (a fresh entry re-opens clean).
    /// Public so the instance factory can seed a trader's initial allocation
    /// through the same bookkeeping a live buy goes through.
    pub fn record_fill(&mut self, stock_id: ObjectId, delta_qty: i64, price: f64) {
        if delta_qty > 0 {
            let qty = delta_qty as u64;
            let entry = self.holdings.entry(stock_id).or_insert(Holding { quantity: 0, average_cost: price });
            let total_cost = entry.average_cost * entry.quantity as f64 + price * qty as f64;
            entry.quantity += qty;
            entry.average_cost = total_cost / entry.quantity as f64;
            self.cash -= qty as f64 * price;
        } else {
            let qty = (-delta_qty) as u64;
            self.cash += qty as f64 * price;
            if let Some(entry) = self.holdings.get_mut(&stock_id) {
                entry.quantity = entry.quantity.saturating_sub(qty);
                if entry.quantity == 0 {
                    self.holdings.remove(&stock_id);
                }
            }
        }

        self.trade_log.push_back(TradeLogEntry { stock_id, delta_qty, price, executed_at: Utc::now() });
        if self.trade_log.len() > TRADE_LOG_CAPACITY {
            self.trade_log.pop_front();
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Intent {
    Buy,
    Sell,
}

impl LifecycleHooks for AiTrader {
    fn on_tick(&mut self, ctx: &TickContext) -> HookResult {
        if self.watched_stock_ids.is_empty() {
            return Ok(());
        }
        if self.rng.gen::<f64>() > self.action_probability() {
            return Ok(());
        }

        let idx = self.rng.random_range(0..self.watched_stock_ids.len());
        let stock_id = self.watched_stock_ids[idx];

        let price = match ctx.registry.with_ref(stock_id, |obj| obj.as_stock().map(|s| s.current_price)) {
            Some(Some(p)) => p,
            _ => return Ok(()),
        };

        let intent = match self.decide(stock_id, price) {
            Some(intent) => intent,
            None => return Ok(()),
        };

        let fraction = self.position_fraction();
        let trade_result = match intent {
            Intent::Buy => {
                let spend = self.cash * fraction;
                let qty = (spend / price).floor() as i64;
                if qty <= 0 {
                    return Ok(());
                }
                let applied = ctx
                    .registry
                    .with_mut(stock_id, |obj| obj.as_stock_mut().map(|s| s.apply_trade(self.id, qty, price)));
                match applied {
                    Some(Some(Ok(()))) => {
                        self.record_fill(stock_id, qty, price);
                        Some((qty, price))
                    }
                    _ => None,
                }
            }
            Intent::Sell => {
                let held = self.holdings.get(&stock_id).map(|h| h.quantity).unwrap_or(0);
                if held == 0 {
                    return Ok(());
                }
                let qty = held as i64;
                let applied = ctx
                    .registry
                    .with_mut(stock_id, |obj| obj.as_stock_mut().map(|s| s.apply_trade(self.id, -qty, price)));
                match applied {
                    Some(Some(Ok(()))) => {
                        self.record_fill(stock_id, -qty, price);
                        Some((-qty, price))
                    }
                    _ => None,
                }
            }
        };

        if let Some((qty, price)) = trade_result {
            trace!(trader_id = %self.id, stock_id = %stock_id, qty, price, "trader executed trade");
        }
        Ok(())
    }

    fn on_activate(&mut self, ctx: &TickContext) -> HookResult {
        debug!(trader_id = %self.id, risk_profile = %self.risk_profile, watched = self.watched_stock_ids.len(), tick = ctx.tick_id, "trader activated");
        Ok(())
    }
}
