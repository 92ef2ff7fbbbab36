// =============================================================================
// Instance Factory (component I) — worker-pool-gated instance creation
// =============================================================================
//
// Materializes one market instance from a template: reads it from the
// `TemplateStore`, allocates ids and registers an Exchange/its Stocks/its
// AiTraders, and hands back a running `LifecycleManager`. Concurrent
// creations are bounded by a semaphore sized to the number of CPUs so a
// burst of instance-create requests can't starve the tick loops already
// running. Each stage is individually cancellable and has its own timeout;
// a failure or cancellation rolls back by destroying whatever was already
// created.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Serialize;
use tokio::sync::{broadcast, Semaphore};
use tracing::{info, warn};

use super::allocation::{equal_distribution, risk_based, weighted_random};
use super::template::{AllocationStrategy, MarketTemplate, TemplateStore};
use crate::entities::{AiTrader, Exchange, RuntimeObject, Stock};
use crate::errors::{EngineError, EngineResult};
use crate::ids::ObjectId;
use crate::lifecycle::LifecycleManager;

/// Stage of the instance-creation pipeline a job is currently in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Stage {
    Initializing,
    ReadingTemplate,
    CreatingObjects,
    Finalizing,
    Complete,
    Cancelled,
    Error,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Progress record for one in-flight (or completed) creation job, polled via
/// `InstanceFactory::progress`.
#[derive(Debug, Clone, Serialize)]
pub struct ProgressRecord {
    pub job_id: String,
    pub stage: Stage,
    pub percent: u8,
    pub message: String,
    pub instance_id: Option<String>,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    /// Set once the job reaches a terminal stage (`Complete`/`Cancelled`/
    /// `Error`). Drives the progress-TTL sweep; `None` marks a record as
    /// in-flight, which the sweep never purges regardless of age.
    pub completed_at: Option<DateTime<Utc>>,
}

impl ProgressRecord {
    fn new(job_id: String) -> Self {
        Self {
            job_id,
            stage: Stage::Initializing,
            percent: 0,
            message: "queued".into(),
            instance_id: None,
            error: None,
            started_at: Utc::now(),
            completed_at: None,
        }
    }

    fn is_terminal(&self) -> bool {
        matches!(self.stage, Stage::Complete | Stage::Cancelled | Stage::Error)
    }
}

/// Per-stage soft deadlines and the error/progress-retention knobs the
/// pipeline runs with. Defaults mirror spec §Configuration; a caller (e.g.
/// `main.rs`, reading `EngineConfig`) can override them via
/// `InstanceFactory::with_config`.
#[derive(Debug, Clone, Copy)]
pub struct FactoryConfig {
    pub reading_templates_timeout: Duration,
    pub creating_objects_timeout: Duration,
    pub error_threshold: u32,
    pub progress_ttl: Duration,
}

impl Default for FactoryConfig {
    fn default() -> Self {
        Self {
            reading_templates_timeout: Duration::from_secs(30),
            creating_objects_timeout: Duration::from_secs(120),
            error_threshold: crate::lifecycle::DEFAULT_ERROR_THRESHOLD,
            progress_ttl: Duration::from_secs(24 * 3600),
        }
    }
}

pub struct InstanceFactory {
    semaphore: Arc<Semaphore>,
    template_store: Arc<dyn TemplateStore>,
    progress: Arc<RwLock<HashMap<String, ProgressRecord>>>,
    cancel_flags: Arc<RwLock<HashMap<String, Arc<AtomicBool>>>>,
    progress_events: broadcast::Sender<ProgressRecord>,
    config: FactoryConfig,
}

impl InstanceFactory {
    pub fn new(template_store: Arc<dyn TemplateStore>) -> Self {
        Self::with_config(template_store, FactoryConfig::default())
    }

    pub fn with_config(template_store: Arc<dyn TemplateStore>, config: FactoryConfig) -> Self {
        let (progress_events, _) = broadcast::channel(1024);
        let progress = Arc::new(RwLock::new(HashMap::new()));
        spawn_progress_sweeper(Arc::clone(&progress), config.progress_ttl);
        Self {
            semaphore: Arc::new(Semaphore::new(num_cpus::get())),
            template_store,
            progress,
            cancel_flags: Arc::new(RwLock::new(HashMap::new())),
            progress_events,
            config,
        }
    }

    pub fn progress(&self, job_id: &str) -> EngineResult<ProgressRecord> {
        self.progress
            .read()
            .get(job_id)
            .cloned()
            .ok_or_else(|| EngineError::ProgressNotFound(job_id.to_string()))
    }

    /// Subscribe to every progress update this factory emits, across all
    /// jobs. Callers (the Instance Controller's push forwarder) filter by
    /// `job_id` themselves.
    pub fn subscribe_progress(&self) -> broadcast::Receiver<ProgressRecord> {
        self.progress_events.subscribe()
    }

    /// Signal a running job to stop at its next checkpoint. A job that has
    /// already reached `Complete` or `Error` ignores the request.
    pub fn cancel(&self, job_id: &str) -> EngineResult<()> {
        let flag = self
            .cancel_flags
            .read()
            .get(job_id)
            .cloned()
            .ok_or_else(|| EngineError::ProgressNotFound(job_id.to_string()))?;
        flag.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn set_progress(&self, job_id: &str, stage: Stage, percent: u8, message: impl Into<String>) {
        let record = {
            let mut progress = self.progress.write();
            let Some(record) = progress.get_mut(job_id) else { return };
            record.stage = stage;
            record.percent = percent;
            record.message = message.into();
            if record.is_terminal() {
                record.completed_at = Some(Utc::now());
            }
            record.clone()
        };
        let _ = self.progress_events.send(record);
    }

    /// Drop terminal progress records whose `completed_at` is older than
    /// `progressTtlHours` (spec §Configuration, default 24). In-flight
    /// records are never purged regardless of age. Exposed directly (the
    /// background sweep calls the same logic) so it can be exercised without
    /// waiting out the sweep's own interval.
    pub fn purge_expired_progress(&self) {
        purge_expired(&self.progress, self.config.progress_ttl);
    }

    /// Run the full pipeline for `template_id`, returning the live
    /// `LifecycleManager` for the new instance on success.
    pub async fn create_instance(
        &self,
        job_id: String,
        template_id: &str,
    ) -> EngineResult<Arc<LifecycleManager>> {
        self.progress.write().insert(job_id.clone(), ProgressRecord::new(job_id.clone()));
        let cancel_flag = Arc::new(AtomicBool::new(false));
        self.cancel_flags.write().insert(job_id.clone(), Arc::clone(&cancel_flag));

        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|e| EngineError::Internal(anyhow::anyhow!("semaphore closed: {e}")))?;

        let result = self.run_pipeline(&job_id, template_id, &cancel_flag).await;

        match &result {
            Ok(_) => {
                let record = {
                    let mut progress = self.progress.write();
                    progress.get_mut(&job_id).map(|record| {
                        record.stage = Stage::Complete;
                        record.percent = 100;
                        record.message = "instance created".into();
                        record.instance_id = Some(job_id.clone());
                        record.completed_at = Some(Utc::now());
                        record.clone()
                    })
                };
                if let Some(record) = record {
                    let _ = self.progress_events.send(record);
                }
            }
            Err(e) if e.code() == "Cancelled" => {
                self.set_progress(&job_id, Stage::Cancelled, 0, "cancelled by caller");
            }
            Err(e) => {
                let record = {
                    let mut progress = self.progress.write();
                    progress.get_mut(&job_id).map(|record| {
                        record.stage = Stage::Error;
                        record.error = Some(e.to_string());
                        record.completed_at = Some(Utc::now());
                        record.clone()
                    })
                };
                if let Some(record) = record {
                    let _ = self.progress_events.send(record);
                }
            }
        }
        result
    }

    async fn run_pipeline(
        &self,
        job_id: &str,
        template_id: &str,
        cancel_flag: &Arc<AtomicBool>,
    ) -> EngineResult<Arc<LifecycleManager>> {
        self.check_cancelled(cancel_flag)?;
        self.set_progress(job_id, Stage::ReadingTemplate, 10, "reading template");
        let template = tokio::time::timeout(self.config.reading_templates_timeout, self.template_store.get(template_id))
            .await
            .map_err(|_| EngineError::StageTimeout("ReadingTemplate".into()))??;
        template.validate()?;

        self.check_cancelled(cancel_flag)?;
        self.set_progress(job_id, Stage::CreatingObjects, 40, "creating objects");
        let lm = Arc::new(LifecycleManager::new(template.initial_fps, template.initial_acceleration, self.config.error_threshold));

        let build_result = tokio::time::timeout(self.config.creating_objects_timeout, self.materialize(&lm, &template, cancel_flag)).await;
        match build_result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                lm.destroy_all();
                return Err(e);
            }
            Err(_) => {
                lm.destroy_all();
                return Err(EngineError::StageTimeout("CreatingObjects".into()));
            }
        }

        self.check_cancelled_rollback(cancel_flag, &lm)?;
        self.set_progress(job_id, Stage::Finalizing, 90, "finalizing");
        lm.start()?;

        info!(job_id, exchange = %template.exchange_name, "instance creation pipeline complete");
        Ok(lm)
    }

    async fn materialize(
        &self,
        lm: &Arc<LifecycleManager>,
        template: &MarketTemplate,
        cancel_flag: &Arc<AtomicBool>,
    ) -> EngineResult<()> {
        let exchange_id = lm.create(|id| RuntimeObject::Exchange(Exchange::new(id, template.exchange_name.clone(), rand::random())));

        let mut trader_ids: Vec<(ObjectId, crate::types::RiskProfile)> = Vec::new();
        for cohort in &template.trader_cohorts {
            self.check_cancelled(cancel_flag)?;
            for i in 0..cohort.count {
                let name = format!("{}-{i}", cohort.name_prefix);
                let risk_profile = cohort.risk_profile;
                let trading_style = cohort.trading_style;
                let starting_cash = cohort.starting_cash;
                let max_positions = cohort.max_positions;
                let seed = rand::random();
                let trader_id = lm.create(move |id| {
                    RuntimeObject::Trader(AiTrader::new(id, name, exchange_id, risk_profile, trading_style, starting_cash, max_positions, seed))
                });
                lm.registry.with_mut(exchange_id, |obj| {
                    if let RuntimeObject::Exchange(e) = obj {
                        e.register_trader(trader_id);
                    }
                });
                trader_ids.push((trader_id, risk_profile));
            }
        }

        for stock_template in &template.stocks {
            self.check_cancelled(cancel_flag)?;
            let st = stock_template.clone();
            let stock_id = lm.create(move |id| {
                RuntimeObject::Stock(Stock::new(id, st.symbol, st.company_name, st.category, st.issue_price, st.total_shares, st.drift, st.volatility))
            });
            lm.registry.with_mut(exchange_id, |obj| {
                if let RuntimeObject::Exchange(e) = obj {
                    e.list_stock(stock_id);
                }
            });

            let allocation = match template.allocation_strategy {
                AllocationStrategy::EqualDistribution => {
                    let ids: Vec<ObjectId> = trader_ids.iter().map(|(id, _)| *id).collect();
                    equal_distribution(stock_template.total_shares, &ids)
                }
                AllocationStrategy::WeightedRandom => {
                    let mut rng = StdRng::from_os_rng();
                    weighted_random(stock_template.total_shares, &trader_ids, &mut rng)
                }
                AllocationStrategy::RiskBased => risk_based(stock_template.total_shares, &trader_ids),
            };

            for (trader_id, qty) in allocation {
                if qty == 0 {
                    continue;
                }
                let issue_price = st_issue_price(stock_template);
                let applied = lm.registry.with_mut(stock_id, |obj| {
                    if let RuntimeObject::Stock(s) = obj {
                        s.apply_trade(trader_id, qty as i64, issue_price)
                    } else {
                        Ok(())
                    }
                });
                lm.registry.with_mut(trader_id, |obj| {
                    if let RuntimeObject::Trader(t) = obj {
                        t.watch(stock_id);
                        // Only reflect the allocation in the trader's own
                        // ledger (and debit its starting cash) if the stock
                        // side actually accepted it.
                        if matches!(applied, Some(Ok(()))) {
                            t.record_fill(stock_id, qty as i64, issue_price);
                        }
                    }
                });
                if let Some(Err(e)) = applied {
                    warn!(error = %e, "initial allocation trade rejected");
                }
            }
        }

        Ok(())
    }

    fn check_cancelled(&self, flag: &Arc<AtomicBool>) -> EngineResult<()> {
        if flag.load(Ordering::SeqCst) {
            Err(EngineError::Cancelled("job cancelled".into()))
        } else {
            Ok(())
        }
    }

    fn check_cancelled_rollback(&self, flag: &Arc<AtomicBool>, lm: &Arc<LifecycleManager>) -> EngineResult<()> {
        if flag.load(Ordering::SeqCst) {
            lm.destroy_all();
            Err(EngineError::Cancelled("job cancelled".into()))
        } else {
            Ok(())
        }
    }
}

fn st_issue_price(t: &super::template::StockTemplate) -> f64 {
    t.issue_price
}

fn purge_expired(progress: &Arc<RwLock<HashMap<String, ProgressRecord>>>, ttl: Duration) {
    let ttl = chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::zero());
    let cutoff = Utc::now() - ttl;
    progress.write().retain(|_, record| match record.completed_at {
        Some(completed_at) => completed_at > cutoff,
        None => true,
    });
}

/// Periodic background sweep dropping expired terminal progress records, per
/// spec §4.I "Progress records older than 24 hours (terminal ones) are
/// purged by a periodic sweep." Runs for the lifetime of the factory; there
/// is no explicit shutdown since it only ever touches its own `progress` map.
fn spawn_progress_sweeper(progress: Arc<RwLock<HashMap<String, ProgressRecord>>>, ttl: Duration) {
    let sweep_interval = ttl.min(Duration::from_secs(3600)).max(Duration::from_secs(1));
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(sweep_interval);
        loop {
            interval.tick().await;
            purge_expired(&progress, ttl);
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::super::template::{InMemoryTemplateStore, StockTemplate, TraderCohortTemplate};
    use crate::types::{RiskProfile, StockCategory, TradingStyle};

    fn sample_template() -> MarketTemplate {
        MarketTemplate {
            id: String::new(),
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
                count: 3,
                risk_profile: RiskProfile::Moderate,
                trading_style: TradingStyle::Swing,
                starting_cash: 10000.0,
                max_positions: 5,
            }],
            allocation_strategy: AllocationStrategy::EqualDistribution,
            initial_fps: 10,
            initial_acceleration: 1.0,
        }
    }

    #[tokio::test]
    async fn create_instance_builds_exchange_stocks_and_traders() {
        let store = Arc::new(InMemoryTemplateStore::new());
        let id = store.insert(sample_template());
        let factory = InstanceFactory::new(store);

        let lm = factory.create_instance("job-1".into(), &id).await.unwrap();
        assert_eq!(lm.registry.len(), 1 + 1 + 3); // exchange + stock + traders
        let progress = factory.progress("job-1").unwrap();
        assert_eq!(progress.stage, Stage::Complete);

        // Initial allocation must be reflected in each trader's own ledger,
        // not just the stock's holder map, and debited from starting cash.
        // The tick loop may have already activated objects by the time we
        // observe them, so check both pre- and post-activation states.
        for state in [crate::types::LifecycleState::Ready, crate::types::LifecycleState::Active] {
            for id in lm.registry.iterate(state) {
                lm.registry.with_ref(id, |obj| {
                    if let RuntimeObject::Trader(t) = obj {
                        assert!(t.cash < 10_000.0);
                        assert!(!t.holdings.is_empty());
                    }
                });
            }
        }

        lm.stop().await.unwrap();
    }

    #[tokio::test]
    async fn create_instance_unknown_template_errors_and_records_progress() {
        let store = Arc::new(InMemoryTemplateStore::new());
        let factory = InstanceFactory::new(store);
        let err = factory.create_instance("job-2".into(), "missing").await.unwrap_err();
        assert_eq!(err.code(), "TemplateNotFound");
        let progress = factory.progress("job-2").unwrap();
        assert_eq!(progress.stage, Stage::Error);
    }

    #[tokio::test]
    async fn invalid_template_fails_validation_before_creating_objects() {
        let store = Arc::new(InMemoryTemplateStore::new());
        let mut template = sample_template();
        template.stocks.clear();
        let id = store.insert(template);
        let factory = InstanceFactory::new(store);
        let err = factory.create_instance("job-3".into(), &id).await.unwrap_err();
        assert_eq!(err.code(), "ValidationError");
    }

    #[test]
    fn cancel_unknown_job_errors() {
        let store = Arc::new(InMemoryTemplateStore::new());
        let factory = InstanceFactory::new(store);
        assert!(factory.cancel("nope").is_err());
    }

    /// A job whose cancel flag is already set when `materialize` starts
    /// bails out at its first per-cohort checkpoint with `Cancelled`, and
    /// the caller's rollback (`lm.destroy_all()`, driven by the pipeline's
    /// own error arm) leaves nothing behind. This exercises the same
    /// checkpoint `InstanceFactory::cancel` flips mid-flight, deterministically
    /// rather than racing a concurrent `cancel()` call against scheduling.
    #[tokio::test]
    async fn materialize_observes_a_cancel_flag_set_before_it_starts() {
        let store = Arc::new(InMemoryTemplateStore::new());
        let id = store.insert(sample_template());
        let factory = InstanceFactory::new(store);
        let template = factory.template_store.get(&id).await.unwrap();

        let lm = Arc::new(LifecycleManager::new(template.initial_fps, template.initial_acceleration, 5));
        let cancel_flag = Arc::new(AtomicBool::new(true));

        let err = factory.materialize(&lm, &template, &cancel_flag).await.unwrap_err();
        assert_eq!(err.code(), "Cancelled");
        assert_eq!(lm.registry.len(), 1); // only the exchange created before the first checkpoint
    }

    /// The full `create_instance` path surfaces the same rollback: a job
    /// cancelled through the public API before it is ever polled ends in
    /// `Stage::Error`/`Cancelled` with no instance produced.
    #[tokio::test]
    async fn create_instance_rejects_a_job_cancelled_at_the_first_checkpoint() {
        let store = Arc::new(InMemoryTemplateStore::new());
        let id = store.insert(sample_template());
        let factory = Arc::new(InstanceFactory::new(store));

        // Prime progress/cancel-flag bookkeeping the way create_instance does,
        // then flip the flag before the pipeline ever runs.
        let job_id = "cancel-me".to_string();
        factory.progress.write().insert(job_id.clone(), ProgressRecord::new(job_id.clone()));
        let cancel_flag = Arc::new(AtomicBool::new(false));
        factory.cancel_flags.write().insert(job_id.clone(), Arc::clone(&cancel_flag));
        factory.cancel(&job_id).unwrap();

        let result = factory.run_pipeline(&job_id, &id, &cancel_flag).await;
        assert_eq!(result.unwrap_err().code(), "Cancelled");
    }

    #[test]
    fn default_factory_config_matches_spec_defaults() {
        let config = FactoryConfig::default();
        assert_eq!(config.reading_templates_timeout, Duration::from_secs(30));
        assert_eq!(config.creating_objects_timeout, Duration::from_secs(120));
        assert_eq!(config.error_threshold, 3);
        assert_eq!(config.progress_ttl, Duration::from_secs(24 * 3600));
    }

    /// A terminal record older than the configured TTL is purged; an
    /// in-flight record (`completed_at: None`) of the same age is not, and
    /// neither is a terminal record younger than the TTL.
    #[test]
    fn purge_expired_progress_drops_only_stale_terminal_records() {
        let store = Arc::new(InMemoryTemplateStore::new());
        let factory = InstanceFactory::with_config(
            store,
            FactoryConfig {
                progress_ttl: Duration::from_secs(3600),
                ..FactoryConfig::default()
            },
        );

        let mut stale_terminal = ProgressRecord::new("stale".into());
        stale_terminal.stage = Stage::Complete;
        stale_terminal.completed_at = Some(Utc::now() - chrono::Duration::hours(2));

        let mut fresh_terminal = ProgressRecord::new("fresh".into());
        fresh_terminal.stage = Stage::Complete;
        fresh_terminal.completed_at = Some(Utc::now());

        let mut old_in_flight = ProgressRecord::new("in-flight".into());
        old_in_flight.started_at = Utc::now() - chrono::Duration::hours(2);

        factory.progress.write().insert("stale".into(), stale_terminal);
        factory.progress.write().insert("fresh".into(), fresh_terminal);
        factory.progress.write().insert("in-flight".into(), old_in_flight);

        factory.purge_expired_progress();

        let remaining = factory.progress.read();
        assert!(!remaining.contains_key("stale"));
        assert!(remaining.contains_key("fresh"));
        assert!(remaining.contains_key("in-flight"));
    }
}
