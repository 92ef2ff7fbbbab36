// =============================================================================
// Stock — issued shares, holder ledger, current price
// =============================================================================

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::errors::EngineError;
use crate::ids::ObjectId;
use crate::types::StockCategory;

/// A single tradable stock within one exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stock {
    pub id: ObjectId,
    /// Uppercase alphanumeric, 1-10 chars.
    pub symbol: String,
    pub company_name: String,
    pub category: StockCategory,
    /// 2 dp, positive.
    pub issue_price: f64,
    pub total_shares: u64,
    pub current_price: f64,
    /// trader id -> quantity held.
    pub holders: HashMap<ObjectId, u64>,
    /// Random-walk parameters for this stock, set by the template.
    pub drift: f64,
    pub volatility: f64,
}

impl Stock {
    pub fn new(
        id: ObjectId,
        symbol: impl Into<String>,
        company_name: impl Into<String>,
        category: StockCategory,
        issue_price: f64,
        total_shares: u64,
        drift: f64,
        volatility: f64,
    ) -> Self {
        Self {
            id,
            symbol: symbol.into(),
            company_name: company_name.into(),
            category,
            issue_price,
            total_shares,
            current_price: issue_price,
            holders: HashMap::new(),
            drift,
            volatility,
        }
    }

    /// Current market capitalisation, derived rather than stored so it can
    /// never drift out of sync with price or share count.
    pub fn market_cap(&self) -> f64 {
        self.current_price * self.total_shares as f64
    }

    /// Sum of all holder quantities.
    pub fn shares_outstanding(&self) -> u64 {
        self.holders.values().sum()
    }

    /// Validate the symbol format required by spec §3: uppercase
    /// alphanumeric, 1-10 characters.
    pub fn is_valid_symbol(symbol: &str) -> bool {
        !symbol.is_empty()
            && symbol.len() <= 10
            && symbol.chars().all(|c| c.is_ascii_uppercase() || c.is_ascii_digit())
    }

    /// Apply a trade for `trader_id`: `delta_qty` positive for a buy,
    /// negative for a sell, at `price`. Enforces the holder-quantity
    /// invariants atomically — either the whole trade applies or none of it
    /// does.
    pub fn apply_trade(
        &mut self,
        trader_id: ObjectId,
        delta_qty: i64,
        price: f64,
    ) -> Result<(), EngineError> {
        let current = *self.holders.get(&trader_id).unwrap_or(&0);

        if delta_qty < 0 {
            let sell_qty = (-delta_qty) as u64;
            if sell_qty > current {
                return Err(EngineError::InsufficientShares(format!(
                    "trader {trader_id} holds {current} of {}, cannot sell {sell_qty}",
                    self.symbol
                )));
            }
        } else {
            let buy_qty = delta_qty as u64;
            let prospective_total = self.shares_outstanding() + buy_qty;
            if prospective_total > self.total_shares {
                return Err(EngineError::OversubscribedShares(format!(
                    "{}: {prospective_total} would exceed total shares {}",
                    self.symbol, self.total_shares
                )));
            }
        }

        let new_qty = if delta_qty < 0 {
            current - (-delta_qty) as u64
        } else {
            current + delta_qty as u64
        };

        if new_qty == 0 {
            self.holders.remove(&trader_id);
        } else {
            self.holders.insert(trader_id, new_qty);
        }

        self.current_price = price.max(0.01);

        debug!(
            symbol = %self.symbol,
            trader_id = %trader_id,
            delta_qty,
            price,
            new_qty,
            "trade applied"
        );
        Ok(())
    }

    /// Advance the price by one log-normal random-walk step. `z` is a
    /// standard-normal draw supplied by the caller (the exchange owns the
    /// RNG so price paths are reproducible from a single seed).
    pub fn apply_price_step(&mut self, dt: f64, z: f64) {
        let factor = 1.0 + self.drift * dt + self.volatility * dt.sqrt() * z;
        self.current_price = (self.current_price * factor).max(0.01);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_stock() -> Stock {
        Stock::new(
            ObjectId(1),
            "AAA",
            "Acme Corp",
            StockCategory::Technology,
            10.0,
            1000,
            0.0,
            0.2,
        )
    }

    #[test]
    fn buy_increases_holder_quantity() {
        let mut s = sample_stock();
        s.apply_trade(ObjectId(2), 100, 11.0).unwrap();
        assert_eq!(s.holders.get(&ObjectId(2)), Some(&100));
        assert_eq!(s.current_price, 11.0);
    }

    #[test]
    fn sell_more_than_held_is_rejected() {
        let mut s = sample_stock();
        s.apply_trade(ObjectId(2), 50, 10.0).unwrap();
        let err = s.apply_trade(ObjectId(2), -60, 10.0).unwrap_err();
        assert_eq!(err.code(), "InsufficientShares");
        // Rejected trade leaves holding unchanged.
        assert_eq!(s.holders.get(&ObjectId(2)), Some(&50));
    }

    #[test]
    fn buy_beyond_total_shares_is_rejected() {
        let mut s = sample_stock();
        s.apply_trade(ObjectId(2), 900, 10.0).unwrap();
        let err = s.apply_trade(ObjectId(3), 200, 10.0).unwrap_err();
        assert_eq!(err.code(), "OversubscribedShares");
    }

    #[test]
    fn selling_to_zero_removes_holder_entry() {
        let mut s = sample_stock();
        s.apply_trade(ObjectId(2), 10, 10.0).unwrap();
        s.apply_trade(ObjectId(2), -10, 10.0).unwrap();
        assert!(!s.holders.contains_key(&ObjectId(2)));
    }

    #[test]
    fn market_cap_tracks_price_and_shares() {
        let mut s = sample_stock();
        s.current_price = 20.0;
        assert_eq!(s.market_cap(), 20.0 * 1000.0);
    }

    #[test]
    fn symbol_validation() {
        assert!(Stock::is_valid_symbol("AAPL"));
        assert!(Stock::is_valid_symbol("A1"));
        assert!(!Stock::is_valid_symbol(""));
        assert!(!Stock::is_valid_symbol("TOOLONGSYMBOL"));
        assert!(!Stock::is_valid_symbol("aapl"));
    }

    #[test]
    fn price_step_never_goes_non_positive() {
        let mut s = sample_stock();
        s.current_price = 0.02;
        s.volatility = 5.0;
        s.apply_price_step(1.0, -10.0);
        assert!(s.current_price > 0.0);
    }
}
