// =============================================================================
// Export snapshot schema — a point-in-time view of one market instance
// =============================================================================
//
// Modeled on the teacher's `AppState::build_snapshot()`: walk every live
// subsystem once and assemble a single serializable struct, rather than
// exposing the live registry/timeseries types directly to clients.
// =============================================================================

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::entities::trader::{Holding, TradeLogEntry};
use crate::entities::RuntimeObject;
use crate::ids::ObjectId;
use crate::lifecycle::{LifecycleManager, SystemOverview};
use crate::types::{LifecycleState, RiskProfile, StockCategory, TradingStyle};

#[derive(Debug, Clone, Serialize)]
pub struct ExchangeSnapshot {
    pub id: ObjectId,
    pub name: String,
    pub stock_ids: Vec<ObjectId>,
    pub trader_ids: Vec<ObjectId>,
    pub ticks_elapsed: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct StockSnapshot {
    pub id: ObjectId,
    pub symbol: String,
    pub company_name: String,
    pub category: StockCategory,
    pub current_price: f64,
    pub market_cap: f64,
    pub shares_outstanding: u64,
    pub total_shares: u64,
    pub state: LifecycleState,
}

#[derive(Debug, Clone, Serialize)]
pub struct TraderSnapshot {
    pub id: ObjectId,
    pub name: String,
    pub risk_profile: RiskProfile,
    pub trading_style: TradingStyle,
    pub cash: f64,
    pub max_positions: u32,
    pub holdings: std::collections::HashMap<ObjectId, Holding>,
    pub watched_stock_ids: Vec<ObjectId>,
    pub state: LifecycleState,
    /// Last [`crate::entities::trader::TRADE_LOG_CAPACITY`] fills, oldest first.
    pub trading_log: Vec<TradeLogEntry>,
}

#[derive(Debug, Clone, Serialize)]
pub struct InstanceSnapshot {
    pub generated_at: DateTime<Utc>,
    pub overview: SystemOverview,
    pub exchanges: Vec<ExchangeSnapshot>,
    pub stocks: Vec<StockSnapshot>,
    pub traders: Vec<TraderSnapshot>,
}

/// Assemble a full snapshot of `lm`'s registry. Iterates every non-destroyed
/// state so paused objects still appear (only `Destroyed` is excluded, since
/// it is compacted out of the registry within the same tick anyway).
pub fn build_snapshot(lm: &LifecycleManager) -> InstanceSnapshot {
    let mut exchanges = Vec::new();
    let mut stocks = Vec::new();
    let mut traders = Vec::new();

    for state in [LifecycleState::Ready, LifecycleState::Active, LifecycleState::Paused, LifecycleState::Destroying] {
        for id in lm.registry.iterate(state) {
            lm.registry.with_ref(id, |obj| match obj {
                RuntimeObject::Exchange(e) => exchanges.push(ExchangeSnapshot {
                    id: e.id,
                    name: e.name.clone(),
                    stock_ids: e.stock_ids.clone(),
                    trader_ids: e.trader_ids.clone(),
                    ticks_elapsed: e.ticks_elapsed,
                }),
                RuntimeObject::Stock(s) => stocks.push(StockSnapshot {
                    id: s.id,
                    symbol: s.symbol.clone(),
                    company_name: s.company_name.clone(),
                    category: s.category,
                    current_price: s.current_price,
                    market_cap: s.market_cap(),
                    shares_outstanding: s.shares_outstanding(),
                    total_shares: s.total_shares,
                    state,
                }),
                RuntimeObject::Trader(t) => traders.push(TraderSnapshot {
                    id: t.id,
                    name: t.name.clone(),
                    risk_profile: t.risk_profile,
                    trading_style: t.trading_style,
                    cash: t.cash,
                    max_positions: t.max_positions,
                    holdings: t.holdings.clone(),
                    watched_stock_ids: t.watched_stock_ids.clone(),
                    state,
                    trading_log: t.trade_log.iter().copied().collect(),
                }),
            });
        }
    }

    InstanceSnapshot {
        generated_at: Utc::now(),
        overview: lm.get_system_overview(),
        exchanges,
        stocks,
        traders,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::{AiTrader, Exchange, Stock};

    #[test]
    fn snapshot_includes_every_live_entity_kind() {
        let lm = LifecycleManager::new(30, 1.0, 5);
        let exchange_id = lm.create(|id| RuntimeObject::Exchange(Exchange::new(id, "NASDAQ-SIM", 1)));
        let stock_id = lm.create(|id| RuntimeObject::Stock(Stock::new(id, "AAA", "Acme", StockCategory::Technology, 10.0, 100, 0.0, 0.1)));
        lm.create(|id| RuntimeObject::Trader(AiTrader::new(id, "bot-0", exchange_id, RiskProfile::Moderate, TradingStyle::Swing, 1000.0, 5, 1)));
        let _ = stock_id;

        let snapshot = build_snapshot(&lm);
        assert_eq!(snapshot.exchanges.len(), 1);
        assert_eq!(snapshot.stocks.len(), 1);
        assert_eq!(snapshot.traders.len(), 1);
        assert_eq!(snapshot.overview.total_objects, 3);
    }

    /// Round-trip law: a snapshot taken after trades have been applied
    /// reproduces the live holder quantities and trader cash bit-exactly.
    /// There is no separate "import" operation in this engine — a caller
    /// re-materializes an instance from `{templateId, snapshot}`, so the
    /// property this guards is that the snapshot's `holdings`/`cash` fields
    /// are themselves exact, not derived or rounded on the way out.
    #[test]
    fn snapshot_reproduces_holder_quantities_and_trader_cash_exactly() {
        let lm = LifecycleManager::new(30, 1.0, 5);
        let exchange_id = lm.create(|id| RuntimeObject::Exchange(Exchange::new(id, "NASDAQ-SIM", 1)));
        let stock_id = lm.create(|id| RuntimeObject::Stock(Stock::new(id, "AAA", "Acme", StockCategory::Technology, 10.0, 1000, 0.0, 0.1)));
        let trader_id = lm.create(|id| RuntimeObject::Trader(AiTrader::new(id, "bot-0", exchange_id, RiskProfile::Moderate, TradingStyle::Swing, 1000.0, 5, 1)));

        lm.registry.with_mut(stock_id, |obj| {
            if let RuntimeObject::Stock(s) = obj {
                s.apply_trade(trader_id, 50, 10.0).unwrap();
            }
        });
        lm.registry.with_mut(trader_id, |obj| {
            if let RuntimeObject::Trader(t) = obj {
                t.cash -= 500.0;
                t.holdings.insert(stock_id, crate::entities::trader::Holding { quantity: 50, average_cost: 10.0 });
            }
        });

        let snapshot = build_snapshot(&lm);
        let stock_snapshot = &snapshot.stocks[0];
        let trader_snapshot = &snapshot.traders[0];

        assert_eq!(stock_snapshot.shares_outstanding, 50);
        assert_eq!(trader_snapshot.cash, 500.0);

        let (_, live_holding) = lm
            .registry
            .with_ref(trader_id, |obj| obj.as_trader().map(|t| (t.cash, *t.holdings.get(&stock_id).unwrap())))
            .flatten()
            .unwrap();
        assert_eq!(live_holding.quantity, 50);
        assert_eq!(live_holding.average_cost, 10.0);
    }

    #[test]
    fn snapshot_surfaces_the_traders_trading_log() {
        let lm = LifecycleManager::new(30, 1.0, 5);
        let exchange_id = lm.create(|id| RuntimeObject::Exchange(Exchange::new(id, "NASDAQ-SIM", 1)));
        let stock_id = lm.create(|id| RuntimeObject::Stock(Stock::new(id, "AAA", "Acme", StockCategory::Technology, 10.0, 1000, 0.0, 0.1)));
        let trader_id = lm.create(|id| RuntimeObject::Trader(AiTrader::new(id, "bot-0", exchange_id, RiskProfile::Moderate, TradingStyle::Swing, 1000.0, 5, 1)));

        lm.registry.with_mut(trader_id, |obj| {
            if let RuntimeObject::Trader(t) = obj {
                t.record_fill(stock_id, 10, 10.0);
                t.record_fill(stock_id, -5, 11.0);
            }
        });

        let snapshot = build_snapshot(&lm);
        let trader_snapshot = &snapshot.traders[0];
        assert_eq!(trader_snapshot.trading_log.len(), 2);
        assert_eq!(trader_snapshot.trading_log[0].delta_qty, 10);
        assert_eq!(trader_snapshot.trading_log[1].delta_qty, -5);
    }
}
