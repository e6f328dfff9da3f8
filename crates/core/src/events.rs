use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::tenant::TenantId;
use crate::types::{NodeId, NodeStatus, RunId, RunStatus};

/// A status change published to the notification gateway
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub run_id: RunId,
    pub tenant_id: TenantId,
    pub timestamp: DateTime<Utc>,
    pub event_type: StatusChangeEvent,
}

impl Event {
    pub fn new(run_id: RunId, tenant_id: TenantId, event_type: StatusChangeEvent) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            run_id,
            tenant_id,
            timestamp: Utc::now(),
            event_type,
        }
    }
}

/// Kinds of status changes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StatusChangeEvent {
    RunStatusChanged {
        status: RunStatus,
    },
    NodeStatusChanged {
        node_id: NodeId,
        status: NodeStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    NodeRetrying {
        node_id: NodeId,
        attempt: u32,
        delay_ms: u64,
        reason: String,
    },
}

/// Sink for status-change notifications
#[async_trait::async_trait]
pub trait NotificationGateway: Send + Sync {
    async fn publish(&self, event: Event) -> anyhow::Result<()>;
}

/// Fans events out to in-process subscribers
pub struct BroadcastNotifier {
    sender: broadcast::Sender<Event>,
}

impl BroadcastNotifier {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }
}

impl Default for BroadcastNotifier {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait::async_trait]
impl NotificationGateway for BroadcastNotifier {
    async fn publish(&self, event: Event) -> anyhow::Result<()> {
        // No subscribers is not an error
        let _ = self.sender.send(event);
        Ok(())
    }
}

/// Discards every event
pub struct NoopNotifier;

#[async_trait::async_trait]
impl NotificationGateway for NoopNotifier {
    async fn publish(&self, _event: Event) -> anyhow::Result<()> {
        Ok(())
    }
}
