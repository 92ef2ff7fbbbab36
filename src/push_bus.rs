// =============================================================================
// Push Bus (component K) — per-instance pub/sub fan-out to external clients
// =============================================================================
//
// A single broadcast channel per market instance, carrying every event an
// external client (WS adapter, eventually) might want pushed to it: registry
// state changes, series deltas, and instance-status changes. A slow
// subscriber falls behind rather than slowing down publishers; it is told so
// via `LaggingSubscriber` rather than silently skipping events.
// =============================================================================

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{trace, warn};

use crate::errors::EngineError;
use crate::factory::ProgressRecord;
use crate::ids::ObjectId;
use crate::timeseries::SeriesDelta;
use crate::types::{InstanceStatus, LifecycleState};

/// Default bounded backlog per subscriber before it is considered lagging.
pub const DEFAULT_BACKLOG: usize = 256;

/// Every kind of event the push bus can carry.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum PushEvent {
    ObjectStateChanged {
        id: ObjectId,
        from: LifecycleState,
        to: LifecycleState,
        at: DateTime<Utc>,
    },
    SeriesDelta(SeriesDelta),
    InstanceStatusChanged {
        instance_id: String,
        status: InstanceStatus,
        at: DateTime<Utc>,
    },
    ProgressUpdate(ProgressRecord),
}

pub struct PushBus {
    sender: broadcast::Sender<PushEvent>,
}

impl PushBus {
    pub fn new(backlog: usize) -> Self {
        let (sender, _) = broadcast::channel(backlog.max(1));
        Self { sender }
    }

    /// Publish an event to every current subscriber. A channel with no
    /// subscribers silently drops the event — there is nobody to lag.
    pub fn publish(&self, event: PushEvent) {
        if self.sender.send(event).is_err() {
            trace!("push bus has no subscribers");
        }
    }

    pub fn subscribe(&self) -> PushSubscriber {
        PushSubscriber {
            inner: self.sender.subscribe(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for PushBus {
    fn default() -> Self {
        Self::new(DEFAULT_BACKLOG)
    }
}

/// A single client's view onto the push bus. Wraps the raw broadcast
/// receiver so lag surfaces as an `EngineError` the WS adapter can report
/// to the client instead of silently dropping messages.
pub struct PushSubscriber {
    inner: broadcast::Receiver<PushEvent>,
}

impl PushSubscriber {
    pub async fn recv(&mut self) -> Result<PushEvent, EngineError> {
        match self.inner.recv().await {
            Ok(event) => Ok(event),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "push bus subscriber lagged");
                Err(EngineError::LaggingSubscriber(format!("missed {skipped} events")))
            }
            Err(broadcast::error::RecvError::Closed) => {
                Err(EngineError::Internal(anyhow::anyhow!("push bus closed")))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscriber_receives_published_event() {
        let bus = PushBus::new(8);
        let mut sub = bus.subscribe();
        bus.publish(PushEvent::InstanceStatusChanged {
            instance_id: "i1".into(),
            status: InstanceStatus::Active,
            at: Utc::now(),
        });
        let event = sub.recv().await.unwrap();
        matches!(event, PushEvent::InstanceStatusChanged { .. });
    }

    #[tokio::test]
    async fn lagging_subscriber_reports_lag_as_error() {
        let bus = PushBus::new(2);
        let mut sub = bus.subscribe();
        for i in 0..5 {
            bus.publish(PushEvent::ObjectStateChanged {
                id: ObjectId(i),
                from: LifecycleState::Ready,
                to: LifecycleState::Active,
                at: Utc::now(),
            });
        }
        let err = sub.recv().await.unwrap_err();
        assert_eq!(err.code(), "LaggingSubscriber");
    }

    #[test]
    fn subscriber_count_tracks_active_subscriptions() {
        let bus = PushBus::new(8);
        assert_eq!(bus.subscriber_count(), 0);
        let _a = bus.subscribe();
        let _b = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 2);
    }
}
