// =============================================================================
// Exchange — owns a basket of stocks and drives their price random walk
// =============================================================================

use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, StandardNormal};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use super::{HookResult, LifecycleHooks, TickContext};
use crate::ids::ObjectId;

/// A single exchange instance: the top-level container a market instance
/// creates one of per template. Owns the set of stocks it lists and the
/// traders registered to trade on it.
#[derive(Clone, Serialize, Deserialize)]
pub struct Exchange {
    pub id: ObjectId,
    pub name: String,
    pub stock_ids: Vec<ObjectId>,
    pub trader_ids: Vec<ObjectId>,
    /// Ticks elapsed since activation, used for aggregation bucket alignment.
    pub ticks_elapsed: u64,
    #[serde(skip, default = "default_rng")]
    rng: StdRng,
}

fn default_rng() -> StdRng {
    StdRng::from_os_rng()
}

impl std::fmt::Debug for Exchange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Exchange")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("stock_ids", &self.stock_ids)
            .field("trader_ids", &self.trader_ids)
            .field("ticks_elapsed", &self.ticks_elapsed)
            .finish()
    }
}

impl Exchange {
    pub fn new(id: ObjectId, name: impl Into<String>, seed: u64) -> Self {
        Self {
            id,
            name: name.into(),
            stock_ids: Vec::new(),
            trader_ids: Vec::new(),
            ticks_elapsed: 0,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn list_stock(&mut self, stock_id: ObjectId) {
        if !self.stock_ids.contains(&stock_id) {
            self.stock_ids.push(stock_id);
        }
    }

    pub fn register_trader(&mut self, trader_id: ObjectId) {
        if !self.trader_ids.contains(&trader_id) {
            self.trader_ids.push(trader_id);
        }
    }

    fn draw_normal(&mut self) -> f64 {
        StandardNormal.sample(&mut self.rng)
    }
}

impl LifecycleHooks for Exchange {
    fn on_activate(&mut self, ctx: &TickContext) -> HookResult {
        for stock_id in self.stock_ids.clone() {
            let price = ctx
                .registry
                .with_ref(stock_id, |obj| obj.as_stock().map(|s| s.current_price))
                .flatten();
            if let Some(price) = price {
                ctx.timeseries.ensure_series(stock_id, price, ctx.sim_time);
            }
        }
        debug!(exchange_id = %self.id, stocks = self.stock_ids.len(), "exchange activated");
        Ok(())
    }

    fn on_tick(&mut self, ctx: &TickContext) -> HookResult {
        self.ticks_elapsed += 1;

        for stock_id in self.stock_ids.clone() {
            let z = self.draw_normal();
            let updated = ctx.registry.with_mut(stock_id, |obj| {
                if let Some(stock) = obj.as_stock_mut() {
                    stock.apply_price_step(ctx.dt_seconds, z);
                    Some((stock.current_price, 0u64))
                } else {
                    None
                }
            });

            if let Some(Some((price, volume))) = updated {
                ctx.timeseries
                    .ingest(stock_id, ctx.sim_time, price, volume)
                    .map_err(|e| super::HookError(e.to_string()))?;
            }
        }

        trace!(exchange_id = %self.id, tick = ctx.tick_id, "exchange tick complete");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_exchange_has_no_stocks_or_traders() {
        let ex = Exchange::new(ObjectId(1), "NASDAQ-SIM", 42);
        assert!(ex.stock_ids.is_empty());
        assert!(ex.trader_ids.is_empty());
    }

    #[test]
    fn listing_same_stock_twice_is_idempotent() {
        let mut ex = Exchange::new(ObjectId(1), "NASDAQ-SIM", 42);
        ex.list_stock(ObjectId(5));
        ex.list_stock(ObjectId(5));
        assert_eq!(ex.stock_ids, vec![ObjectId(5)]);
    }

    #[test]
    fn seeded_rng_is_reproducible() {
        let mut a = Exchange::new(ObjectId(1), "X", 7);
        let mut b = Exchange::new(ObjectId(1), "X", 7);
        let seq_a: Vec<f64> = (0..5).map(|_| a.draw_normal()).collect();
        let seq_b: Vec<f64> = (0..5).map(|_| b.draw_normal()).collect();
        assert_eq!(seq_a, seq_b);
    }
}
