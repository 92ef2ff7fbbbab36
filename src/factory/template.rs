// =============================================================================
// Market templates — the blueprint an Instance Factory materializes
// =============================================================================
//
// Persistent template storage is out of scope (an external collaborator's
// concern); `TemplateStore` is the seam it plugs into. `InMemoryTemplateStore`
// is the one implementation this crate carries, useful for tests and for
// driving the factory without a real storage backend wired in.
// =============================================================================

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::{EngineError, EngineResult};
use crate::types::{RiskProfile, StockCategory, TradingStyle};

/// Blueprint for one stock to be created when a template is materialized.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StockTemplate {
    pub symbol: String,
    pub company_name: String,
    pub category: StockCategory,
    pub issue_price: f64,
    pub total_shares: u64,
    pub drift: f64,
    pub volatility: f64,
}

/// Blueprint for a cohort of traders sharing a risk/style profile.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraderCohortTemplate {
    pub name_prefix: String,
    pub count: u32,
    pub risk_profile: RiskProfile,
    pub trading_style: TradingStyle,
    pub starting_cash: f64,
    /// Maximum number of distinct symbols a trader from this cohort will
    /// hold a position in at once.
    #[serde(default = "default_max_positions")]
    pub max_positions: u32,
}

fn default_max_positions() -> u32 {
    5
}

/// Algorithm used to assign each stock's initial holder ledger across the
/// traders created alongside it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AllocationStrategy {
    EqualDistribution,
    WeightedRandom,
    RiskBased,
}

/// Full blueprint for one market instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketTemplate {
    pub id: String,
    pub exchange_name: String,
    pub stocks: Vec<StockTemplate>,
    pub trader_cohorts: Vec<TraderCohortTemplate>,
    pub allocation_strategy: AllocationStrategy,
    pub initial_fps: u32,
    pub initial_acceleration: f64,
}

impl MarketTemplate {
    pub fn total_trader_count(&self) -> u32 {
        self.trader_cohorts.iter().map(|c| c.count).sum()
    }

    /// Structural validation independent of any storage backend: symbol
    /// format, positive prices/shares, non-empty stock list.
    pub fn validate(&self) -> EngineResult<()> {
        if self.stocks.is_empty() {
            return Err(EngineError::Validation("template has no stocks".into()));
        }
        for stock in &self.stocks {
            if !crate::entities::Stock::is_valid_symbol(&stock.symbol) {
                return Err(EngineError::Validation(format!("invalid symbol: {}", stock.symbol)));
            }
            if stock.issue_price <= 0.0 {
                return Err(EngineError::Validation(format!("{}: issue_price must be positive", stock.symbol)));
            }
            if stock.total_shares == 0 {
                return Err(EngineError::Validation(format!("{}: total_shares must be positive", stock.symbol)));
            }
        }
        if self.total_trader_count() == 0 {
            return Err(EngineError::Validation("template has no traders".into()));
        }
        Ok(())
    }
}

/// Storage seam for templates. Implementations outside this crate are
/// expected to back this with a real database; `InMemoryTemplateStore` is
/// the only implementation carried here.
#[async_trait]
pub trait TemplateStore: Send + Sync {
    async fn get(&self, template_id: &str) -> EngineResult<MarketTemplate>;
    async fn put(&self, template: MarketTemplate) -> EngineResult<()>;
    async fn list_ids(&self) -> EngineResult<Vec<String>>;
}

/// Non-persistent `TemplateStore`. Templates vanish on process restart —
/// adequate for tests and local experimentation, not for production use.
#[derive(Default)]
pub struct InMemoryTemplateStore {
    templates: RwLock<HashMap<String, MarketTemplate>>,
}

impl InMemoryTemplateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `template`, assigning it a fresh id if it doesn't already have
    /// a non-empty one.
    pub fn insert(&self, mut template: MarketTemplate) -> String {
        if template.id.is_empty() {
            template.id = Uuid::new_v4().to_string();
        }
        let id = template.id.clone();
        self.templates.write().insert(id.clone(), template);
        id
    }
}

#[async_trait]
impl TemplateStore for InMemoryTemplateStore {
    async fn get(&self, template_id: &str) -> EngineResult<MarketTemplate> {
        self.templates
            .read()
            .get(template_id)
            .cloned()
            .ok_or_else(|| EngineError::TemplateNotFound(template_id.to_string()))
    }

    async fn put(&self, template: MarketTemplate) -> EngineResult<()> {
        self.templates.write().insert(template.id.clone(), template);
        Ok(())
    }

    async fn list_ids(&self) -> EngineResult<Vec<String>> {
        Ok(self.templates.read().keys().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_template() -> MarketTemplate {
        MarketTemplate {
            id: "t1".into(),
            exchange_name: "NASDAQ-SIM".into(),
            stocks: vec![StockTemplate {
                symbol: "AAA".into(),
                company_name: "Acme".into(),
                category: StockCategory::Technology,
                issue_price: 10.0,
                total_shares: 1000,
                drift: 0.0,
                volatility: 0.2,
            }],
            trader_cohorts: vec![TraderCohortTemplate {
                name_prefix: "bot".into(),
                count: 5,
                risk_profile: RiskProfile::Moderate,
                trading_style: TradingStyle::Swing,
                starting_cash: 10000.0,
                max_positions: 5,
            }],
            allocation_strategy: AllocationStrategy::EqualDistribution,
            initial_fps: 30,
            initial_acceleration: 1.0,
        }
    }

    #[test]
    fn valid_template_passes_validation() {
        assert!(sample_template().validate().is_ok());
    }

    #[test]
    fn template_with_no_stocks_fails_validation() {
        let mut t = sample_template();
        t.stocks.clear();
        assert_eq!(t.validate().unwrap_err().code(), "ValidationError");
    }

    #[test]
    fn template_with_invalid_symbol_fails_validation() {
        let mut t = sample_template();
        t.stocks[0].symbol = "lowercase".into();
        assert_eq!(t.validate().unwrap_err().code(), "ValidationError");
    }

    #[tokio::test]
    async fn in_memory_store_round_trips_a_template() {
        let store = InMemoryTemplateStore::new();
        let id = store.insert(sample_template());
        let fetched = store.get(&id).await.unwrap();
        assert_eq!(fetched.exchange_name, "NASDAQ-SIM");
    }

    #[tokio::test]
    async fn in_memory_store_unknown_id_errors() {
        let store = InMemoryTemplateStore::new();
        let err = store.get("missing").await.unwrap_err();
        assert_eq!(err.code(), "TemplateNotFound");
    }
}
