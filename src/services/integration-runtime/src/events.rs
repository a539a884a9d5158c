//! Typed publish/subscribe channels
//!
//! One broadcast channel per event category. The runtime facade owns the bus
//! and hands clones of it to every component that publishes.

use crate::alerts::Alert;
use crate::models::{BatchProgress, IntegrationHealth};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;

const CHANNEL_CAPACITY: usize = 1024;

/// Integration lifecycle event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum IntegrationEvent {
    Registered { integration_id: String, name: String },
    Updated { integration_id: String, name: String },
    Unregistered { integration_id: String, name: String },
}

impl IntegrationEvent {
    pub fn integration_id(&self) -> &str {
        match self {
            IntegrationEvent::Registered { integration_id, .. }
            | IntegrationEvent::Updated { integration_id, .. }
            | IntegrationEvent::Unregistered { integration_id, .. } => integration_id,
        }
    }
}

/// Batch lifecycle and progress event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum BatchEvent {
    Created { operation_id: String },
    Started { operation_id: String },
    Progress { operation_id: String, progress: BatchProgress },
    Completed { operation_id: String, progress: BatchProgress },
    Failed { operation_id: String, error: String },
    Cancelled { operation_id: String },
    RolledBack { operation_id: String, restored: usize },
}

impl BatchEvent {
    pub fn operation_id(&self) -> &str {
        match self {
            BatchEvent::Created { operation_id }
            | BatchEvent::Started { operation_id }
            | BatchEvent::Progress { operation_id, .. }
            | BatchEvent::Completed { operation_id, .. }
            | BatchEvent::Failed { operation_id, .. }
            | BatchEvent::Cancelled { operation_id }
            | BatchEvent::RolledBack { operation_id, .. } => operation_id,
        }
    }
}

/// Alert lifecycle event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AlertEvent {
    Created(Alert),
    Escalated(Alert),
    Acknowledged(Alert),
    Resolved { integration_id: String, alert_ids: Vec<String> },
}

/// Channel set shared by every runtime component
#[derive(Debug, Clone)]
pub struct EventBus {
    integrations: broadcast::Sender<IntegrationEvent>,
    batches: broadcast::Sender<BatchEvent>,
    health: broadcast::Sender<IntegrationHealth>,
    alerts: broadcast::Sender<AlertEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (integrations, _) = broadcast::channel(CHANNEL_CAPACITY);
        let (batches, _) = broadcast::channel(CHANNEL_CAPACITY);
        let (health, _) = broadcast::channel(CHANNEL_CAPACITY);
        let (alerts, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            integrations,
            batches,
            health,
            alerts,
        }
    }

    // A send error only means nobody is listening right now.

    pub fn publish_integration(&self, event: IntegrationEvent) {
        if self.integrations.send(event).is_err() {
            trace!("No integration event subscribers");
        }
    }

    pub fn publish_batch(&self, event: BatchEvent) {
        if self.batches.send(event).is_err() {
            trace!("No batch event subscribers");
        }
    }

    pub fn publish_health(&self, health: IntegrationHealth) {
        if self.health.send(health).is_err() {
            trace!("No health subscribers");
        }
    }

    pub fn publish_alert(&self, event: AlertEvent) {
        if self.alerts.send(event).is_err() {
            trace!("No alert subscribers");
        }
    }

    pub fn subscribe_integrations(&self) -> broadcast::Receiver<IntegrationEvent> {
        self.integrations.subscribe()
    }

    pub fn subscribe_batches(&self) -> broadcast::Receiver<BatchEvent> {
        self.batches.subscribe()
    }

    pub fn subscribe_health(&self) -> broadcast::Receiver<IntegrationHealth> {
        self.health.subscribe()
    }

    pub fn subscribe_alerts(&self) -> broadcast::Receiver<AlertEvent> {
        self.alerts.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscribers_receive_in_order() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe_batches();

        bus.publish_batch(BatchEvent::Created {
            operation_id: "op".to_string(),
        });
        bus.publish_batch(BatchEvent::Started {
            operation_id: "op".to_string(),
        });

        assert!(matches!(rx.recv().await.unwrap(), BatchEvent::Created { .. }));
        assert!(matches!(rx.recv().await.unwrap(), BatchEvent::Started { .. }));
    }

    #[test]
    fn test_publish_without_subscribers_is_silent() {
        let bus = EventBus::new();
        bus.publish_integration(IntegrationEvent::Registered {
            integration_id: "a".to_string(),
            name: "a".to_string(),
        });
    }

    #[test]
    fn test_event_wire_format() {
        let event = IntegrationEvent::Unregistered {
            integration_id: "id-1".to_string(),
            name: "notes".to_string(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "unregistered");
        assert_eq!(json["integration_id"], "id-1");
    }
}
