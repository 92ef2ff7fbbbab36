// =============================================================================
// Instance Controller (component J) — owns every live market instance
// =============================================================================
//
// A plain, explicitly-constructed facade (never a global singleton, per
// SPEC_FULL.md §9) wrapping the Instance Factory and the set of instances it
// has produced. Shared across the external interface adapter via `Arc`.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tracing::warn;
use uuid::Uuid;

use crate::errors::{EngineError, EngineResult};
use crate::factory::{InstanceFactory, ProgressRecord, Stage};
use crate::lifecycle::{LifecycleManager, SystemOverview};
use crate::push_bus::{PushBus, PushEvent, DEFAULT_BACKLOG};
use crate::registry::RegistryEvent;
use crate::types::InstanceStatus;

/// Metadata the controller tracks alongside each instance's
/// `LifecycleManager`.
#[derive(Clone)]
pub struct InstanceHandle {
    pub instance_id: String,
    pub template_id: String,
    pub owner_id: Option<String>,
    pub name: Option<String>,
    pub status: InstanceStatus,
    pub created_at: DateTime<Utc>,
    pub lifecycle: Option<Arc<LifecycleManager>>,
    pub push_bus: Arc<PushBus>,
}

/// Summary view returned by list/get queries — omits the live handle.
#[derive(Debug, Clone, Serialize)]
pub struct InstanceSummary {
    pub instance_id: String,
    pub template_id: String,
    pub owner_id: Option<String>,
    pub name: Option<String>,
    pub status: InstanceStatus,
    pub created_at: DateTime<Utc>,
    pub overview: Option<SystemOverview>,
}

pub struct InstanceController {
    factory: Arc<InstanceFactory>,
    instances: Arc<RwLock<HashMap<String, InstanceHandle>>>,
}

impl InstanceController {
    pub fn new(factory: Arc<InstanceFactory>) -> Self {
        Self {
            factory,
            instances: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Kick off creation of a new instance from `template_id` on the
    /// factory's worker pool and return the request id immediately — HTTP
    /// 202 semantics per spec §6. The instance is visible to `list`/`get`
    /// in `Creating` status right away; its `lifecycle` handle and push
    /// forwarders attach once the pipeline reaches `Complete`. Poll
    /// [`InstanceController::get_progress`] with the returned id to follow
    /// the pipeline to completion. `owner_id` is stored verbatim and used
    /// only to filter `list_instances`/authorize `get_instance`,
    /// `delete_instance`, and `export` — per spec §4.J, ownership is not
    /// itself authentication, just a caller-supplied tag (auth proper is an
    /// external collaborator per spec §1).
    pub fn create_instance(&self, template_id: &str, owner_id: Option<String>, name: Option<String>) -> String {
        let instance_id = Uuid::new_v4().to_string();
        let push_bus = Arc::new(PushBus::new(DEFAULT_BACKLOG));
        self.instances.write().insert(
            instance_id.clone(),
            InstanceHandle {
                instance_id: instance_id.clone(),
                template_id: template_id.to_string(),
                owner_id,
                name,
                status: InstanceStatus::Creating,
                created_at: Utc::now(),
                lifecycle: None,
                push_bus: Arc::clone(&push_bus),
            },
        );

        let job_id = instance_id.clone();
        let template_id = template_id.to_string();
        let factory = Arc::clone(&self.factory);
        let instances = Arc::clone(&self.instances);
        let forward_bus = Arc::clone(&push_bus);
        let forward_job_id = job_id.clone();
        tokio::spawn(async move {
            forward_progress_until_terminal(Arc::clone(&factory), forward_job_id, forward_bus).await;
        });
        tokio::spawn(async move {
            let instance_id2 = job_id.clone();
            match factory.create_instance(job_id, &template_id).await {
                Ok(lm) => {
                    spawn_push_forwarders(Arc::clone(&lm), Arc::clone(&push_bus));
                    let mut instances = instances.write();
                    if let Some(handle) = instances.get_mut(&instance_id2) {
                        handle.status = InstanceStatus::Active;
                        handle.lifecycle = Some(lm);
                    }
                    drop(instances);
                    push_bus.publish(PushEvent::InstanceStatusChanged {
                        instance_id: instance_id2,
                        status: InstanceStatus::Active,
                        at: Utc::now(),
                    });
                }
                Err(e) => {
                    warn!(instance_id = %instance_id2, error = %e, "instance creation pipeline failed");
                    if e.code() == "Cancelled" {
                        // Per spec §8 scenario 6: a cancelled creation leaves
                        // no instance visible to list()/get(), not an Error
                        // one — the rollback already destroyed every object
                        // the pipeline had registered.
                        instances.write().remove(&instance_id2);
                    } else if let Some(handle) = instances.write().get_mut(&instance_id2) {
                        handle.status = InstanceStatus::Error;
                    }
                    push_bus.publish(PushEvent::InstanceStatusChanged {
                        instance_id: instance_id2,
                        status: InstanceStatus::Error,
                        at: Utc::now(),
                    });
                }
            }
        });
        instance_id
    }

    /// Poll the creation pipeline's progress record for `instance_id`.
    pub fn get_progress(&self, instance_id: &str) -> EngineResult<ProgressRecord> {
        self.factory.progress(instance_id)
    }

    /// Cancel an in-flight creation request. Only meaningful while the
    /// instance is still `Creating`; a request that already reached
    /// `Complete`/`Error` rejects the cancel per spec §4.I (the Complete
    /// stage is non-cancellable).
    pub fn cancel_creation(&self, instance_id: &str) -> EngineResult<()> {
        let status = self
            .instances
            .read()
            .get(instance_id)
            .map(|h| h.status)
            .ok_or_else(|| EngineError::InstanceNotFound(instance_id.to_string()))?;
        if status != InstanceStatus::Creating {
            return Err(EngineError::IllegalState(format!(
                "instance {instance_id} is not in Creating status"
            )));
        }
        self.factory.cancel(instance_id)
    }

    pub fn push_bus_of(&self, instance_id: &str) -> EngineResult<Arc<PushBus>> {
        self.instances
            .read()
            .get(instance_id)
            .map(|h| Arc::clone(&h.push_bus))
            .ok_or_else(|| EngineError::InstanceNotFound(instance_id.to_string()))
    }

    /// Fetch one instance's details. If `owner_id` is supplied, the instance
    /// must be owned by that caller or an instance owned by someone else
    /// reads as `Forbidden` — a caller can't even probe `InstanceNotFound`
    /// vs `Forbidden` to enumerate other owners' instance ids, since both
    /// require already knowing the id.
    pub fn get_instance(&self, instance_id: &str, owner_id: Option<&str>) -> EngineResult<InstanceSummary> {
        let instances = self.instances.read();
        let handle = instances
            .get(instance_id)
            .ok_or_else(|| EngineError::InstanceNotFound(instance_id.to_string()))?;
        Self::check_owner(handle, owner_id)?;
        Ok(Self::summarize(handle))
    }

    /// List instances, filtered to `owner_id`'s own when supplied (per spec
    /// §4.J `list(userId)`); with no `owner_id`, returns every instance —
    /// the admin/debug view.
    pub fn list_instances(&self, owner_id: Option<&str>) -> Vec<InstanceSummary> {
        self.instances
            .read()
            .values()
            .filter(|h| owner_id.is_none() || h.owner_id.as_deref() == owner_id)
            .map(Self::summarize)
            .collect()
    }

    fn check_owner(handle: &InstanceHandle, owner_id: Option<&str>) -> EngineResult<()> {
        match owner_id {
            None => Ok(()),
            Some(caller) if handle.owner_id.as_deref() == Some(caller) => Ok(()),
            Some(_) => Err(EngineError::Forbidden(handle.instance_id.clone())),
        }
    }

    /// Stop an instance's tick loop without removing it from the controller
    /// (its state remains queryable). Reversible via `resume_instance`.
    pub async fn stop_instance(&self, instance_id: &str) -> EngineResult<()> {
        let lifecycle = self.lifecycle_of(instance_id, None)?;
        lifecycle.stop().await?;
        let mut instances = self.instances.write();
        if let Some(handle) = instances.get_mut(instance_id) {
            handle.status = InstanceStatus::Stopped;
        }
        Ok(())
    }

    pub fn resume_instance(&self, instance_id: &str) -> EngineResult<()> {
        let lifecycle = self.lifecycle_of(instance_id, None)?;
        lifecycle.start()?;
        let mut instances = self.instances.write();
        if let Some(handle) = instances.get_mut(instance_id) {
            handle.status = InstanceStatus::Active;
        }
        Ok(())
    }

    /// Stop and permanently remove an instance. Rejects with `InstanceBusy`
    /// while the matching creation request is still in flight, per spec
    /// §4.J — the caller should wait for `Complete`/`Error` (or cancel the
    /// request) before deleting.
    pub async fn delete_instance(&self, instance_id: &str, owner_id: Option<&str>) -> EngineResult<()> {
        let handle = {
            let mut instances = self.instances.write();
            match instances.get(instance_id) {
                None => return Err(EngineError::InstanceNotFound(instance_id.to_string())),
                Some(h) => Self::check_owner(h, owner_id)?,
            }
            match instances.get(instance_id) {
                Some(h) if h.status == InstanceStatus::Creating => {
                    return Err(EngineError::InstanceBusy(instance_id.to_string()));
                }
                _ => {}
            }
            instances
                .remove(instance_id)
                .ok_or_else(|| EngineError::InstanceNotFound(instance_id.to_string()))?
        };
        if let Some(lifecycle) = handle.lifecycle {
            lifecycle.destroy_all();
            // The instance may already be stopped (via `stop_instance`); that
            // is not a failure for a delete, which only cares that the loop
            // ends up stopped.
            if lifecycle.tick_loop.is_running() {
                let _ = lifecycle.stop().await;
            }
        }
        Ok(())
    }

    /// Fetch the live `LifecycleManager` behind an instance — used by the
    /// export/snapshot endpoint and by object-level commands. `owner_id`
    /// gates access the same way [`InstanceController::get_instance`] does.
    pub fn lifecycle_of(&self, instance_id: &str, owner_id: Option<&str>) -> EngineResult<Arc<LifecycleManager>> {
        let instances = self.instances.read();
        let handle = instances
            .get(instance_id)
            .ok_or_else(|| EngineError::InstanceNotFound(instance_id.to_string()))?;
        Self::check_owner(handle, owner_id)?;
        handle
            .lifecycle
            .clone()
            .ok_or_else(|| EngineError::InstanceNotFound(instance_id.to_string()))
    }

    fn summarize(handle: &InstanceHandle) -> InstanceSummary {
        InstanceSummary {
            instance_id: handle.instance_id.clone(),
            template_id: handle.template_id.clone(),
            owner_id: handle.owner_id.clone(),
            name: handle.name.clone(),
            status: handle.status,
            created_at: handle.created_at,
            overview: handle.lifecycle.as_ref().map(|lm| lm.get_system_overview()),
        }
    }
}

/// Bridge a freshly-created instance's registry and time-series events onto
/// its push bus. Runs for the lifetime of the instance; both source channels
/// close when `lm` is dropped, which ends these tasks naturally.
fn spawn_push_forwarders(lm: Arc<LifecycleManager>, push_bus: Arc<PushBus>) {
    let mut registry_events = lm.registry.subscribe();
    let bus = Arc::clone(&push_bus);
    tokio::spawn(async move {
        while let Ok(event) = registry_events.recv().await {
            if let RegistryEvent::StateChanged { id, from, to } = event {
                bus.publish(PushEvent::ObjectStateChanged { id, from, to, at: Utc::now() });
            }
        }
    });

    let mut series_deltas = lm.timeseries.subscribe();
    tokio::spawn(async move {
        while let Ok(delta) = series_deltas.recv().await {
            push_bus.publish(PushEvent::SeriesDelta(delta));
        }
    });
}

/// Forward the factory's global progress-update stream onto one instance's
/// push bus, filtered to `job_id`, per the `{instanceId, type: "progress"}`
/// subscription in spec §6. Exits once a terminal stage for this job is
/// observed, since no further updates for it will ever arrive.
async fn forward_progress_until_terminal(factory: Arc<InstanceFactory>, job_id: String, push_bus: Arc<PushBus>) {
    let mut events = factory.subscribe_progress();
    loop {
        match events.recv().await {
            Ok(record) if record.job_id == job_id => {
                let terminal = matches!(record.stage, Stage::Complete | Stage::Error | Stage::Cancelled);
                push_bus.publish(PushEvent::ProgressUpdate(record));
                if terminal {
                    break;
                }
            }
            Ok(_) => continue,
            Err(_) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::factory::template::{AllocationStrategy, InMemoryTemplateStore, StockTemplate, TraderCohortTemplate};
    use crate::factory::MarketTemplate;
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
                count: 2,
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

    /// `create_instance` returns immediately; poll `get_progress` until the
    /// background pipeline reaches a terminal stage, mirroring how a real
    /// client follows scenario 1 of spec §8.
    async fn wait_for_terminal(controller: &InstanceController, instance_id: &str) -> ProgressRecord {
        for _ in 0..200 {
            let progress = controller.get_progress(instance_id).unwrap();
            if matches!(progress.stage, Stage::Complete | Stage::Error | Stage::Cancelled) {
                return progress;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        panic!("instance {instance_id} did not reach a terminal stage in time");
    }

    #[tokio::test]
    async fn create_get_and_delete_instance_round_trip() {
        let store = Arc::new(InMemoryTemplateStore::new());
        let template_id = store.insert(sample_template());
        let factory = Arc::new(InstanceFactory::new(store));
        let controller = InstanceController::new(factory);

        let instance_id = controller.create_instance(&template_id, None, None);
        let progress = wait_for_terminal(&controller, &instance_id).await;
        assert_eq!(progress.stage, Stage::Complete);

        let summary = controller.get_instance(&instance_id, None).unwrap();
        assert_eq!(summary.status, InstanceStatus::Active);
        assert!(summary.overview.is_some());

        controller.delete_instance(&instance_id, None).await.unwrap();
        assert!(controller.get_instance(&instance_id, None).is_err());
    }

    #[tokio::test]
    async fn unknown_template_leaves_instance_in_error_status() {
        let store = Arc::new(InMemoryTemplateStore::new());
        let factory = Arc::new(InstanceFactory::new(store));
        let controller = InstanceController::new(factory);

        let instance_id = controller.create_instance("missing", None, None);
        let progress = wait_for_terminal(&controller, &instance_id).await;
        assert_eq!(progress.stage, Stage::Error);
        assert_eq!(controller.get_instance(&instance_id, None).unwrap().status, InstanceStatus::Error);
    }

    #[tokio::test]
    async fn delete_while_creating_is_rejected_as_busy() {
        let store = Arc::new(InMemoryTemplateStore::new());
        let template_id = store.insert(sample_template());
        let factory = Arc::new(InstanceFactory::new(store));
        let controller = InstanceController::new(factory);

        let instance_id = controller.create_instance(&template_id, None, None);
        // The pipeline runs on its own spawned task; a delete issued before
        // it reaches Complete must be rejected, not racily succeed.
        let result = controller.delete_instance(&instance_id, None).await;
        if let Err(e) = result {
            assert_eq!(e.code(), "InstanceBusy");
        }
        wait_for_terminal(&controller, &instance_id).await;
        controller.delete_instance(&instance_id, None).await.unwrap();
    }

    #[tokio::test]
    async fn stop_and_resume_instance() {
        let store = Arc::new(InMemoryTemplateStore::new());
        let template_id = store.insert(sample_template());
        let factory = Arc::new(InstanceFactory::new(store));
        let controller = InstanceController::new(factory);

        let instance_id = controller.create_instance(&template_id, None, None);
        wait_for_terminal(&controller, &instance_id).await;

        controller.stop_instance(&instance_id).await.unwrap();
        assert_eq!(controller.get_instance(&instance_id, None).unwrap().status, InstanceStatus::Stopped);
        controller.resume_instance(&instance_id).unwrap();
        assert_eq!(controller.get_instance(&instance_id, None).unwrap().status, InstanceStatus::Active);
        controller.delete_instance(&instance_id, None).await.unwrap();
    }

    #[tokio::test]
    async fn cancel_creation_rejects_once_complete() {
        let store = Arc::new(InMemoryTemplateStore::new());
        let template_id = store.insert(sample_template());
        let factory = Arc::new(InstanceFactory::new(store));
        let controller = InstanceController::new(factory);

        let instance_id = controller.create_instance(&template_id, None, None);
        wait_for_terminal(&controller, &instance_id).await;
        let err = controller.cancel_creation(&instance_id).unwrap_err();
        assert_eq!(err.code(), "IllegalState");
        controller.delete_instance(&instance_id, None).await.unwrap();
    }

    #[tokio::test]
    async fn instance_is_scoped_to_its_owner() {
        let store = Arc::new(InMemoryTemplateStore::new());
        let template_id = store.insert(sample_template());
        let factory = Arc::new(InstanceFactory::new(store));
        let controller = InstanceController::new(factory);

        let instance_id = controller.create_instance(&template_id, Some("alice".into()), None);
        wait_for_terminal(&controller, &instance_id).await;

        assert!(controller.get_instance(&instance_id, Some("alice")).is_ok());
        let err = controller.get_instance(&instance_id, Some("bob")).unwrap_err();
        assert_eq!(err.code(), "Forbidden");
        let err = controller.delete_instance(&instance_id, Some("bob")).await.unwrap_err();
        assert_eq!(err.code(), "Forbidden");

        assert_eq!(controller.list_instances(Some("alice")).len(), 1);
        assert_eq!(controller.list_instances(Some("bob")).len(), 0);
        assert_eq!(controller.list_instances(None).len(), 1);

        controller.delete_instance(&instance_id, Some("alice")).await.unwrap();
    }
}
