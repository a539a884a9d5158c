//! WebSocket Module
//!
//! Real-time channel for hosts. Clients can subscribe to integrations,
//! execute tools and list integrations; the server pushes health updates,
//! alerts, integration lifecycle events and batch progress.
//!
//! A client with no subscriptions receives the health and alert events of
//! every integration; once it subscribes, only those of its subscriptions.

use crate::{
    alerts::Alert,
    events::{AlertEvent, BatchEvent, IntegrationEvent},
    models::{ExecuteRequest, ExecutionResult, Integration, IntegrationHealth, Permission},
    server::{AppState, IntegrationRuntime},
};
use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast::error::RecvError, mpsc};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Client to server messages
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMessage {
    #[serde(rename_all = "camelCase")]
    Subscribe { integration_id: String },
    #[serde(rename_all = "camelCase")]
    Unsubscribe { integration_id: String },
    #[serde(rename_all = "camelCase")]
    Execute {
        #[serde(default)]
        request_id: Option<String>,
        integration_id: String,
        tool: String,
        #[serde(default)]
        params: Option<Value>,
        #[serde(default)]
        permissions: Vec<Permission>,
    },
    #[serde(rename_all = "camelCase")]
    List {
        #[serde(default)]
        integration_id: Option<String>,
    },
    Ping,
}

/// Server to client messages
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMessage {
    #[serde(rename_all = "camelCase")]
    Connected {
        connection_id: String,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename_all = "camelCase")]
    Result {
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        result: ExecutionResult,
    },
    #[serde(rename_all = "camelCase")]
    Integrations {
        #[serde(skip_serializing_if = "Option::is_none")]
        integration_id: Option<String>,
        integrations: Vec<Integration>,
    },
    #[serde(rename_all = "camelCase")]
    Subscribed { integration_id: String },
    #[serde(rename_all = "camelCase")]
    Unsubscribed { integration_id: String },
    HealthUpdate { health: IntegrationHealth },
    Alert { alert: Alert },
    AlertAcknowledged { alert: Alert },
    #[serde(rename_all = "camelCase")]
    AlertsResolved {
        integration_id: String,
        alert_ids: Vec<String>,
    },
    IntegrationEvent { event: IntegrationEvent },
    BatchProgress { event: BatchEvent },
    Error { message: String },
    Pong,
}

impl ServerMessage {
    fn into_message(self) -> Option<Message> {
        match serde_json::to_string(&self) {
            Ok(text) => Some(Message::Text(text)),
            Err(e) => {
                warn!(error = %e, "Failed to encode WebSocket message");
                None
            }
        }
    }
}

/// Per-connection subscription state
#[derive(Debug)]
pub struct Connection {
    pub id: String,
    pub connected_at: DateTime<Utc>,
    subscriptions: RwLock<HashSet<String>>,
}

impl Connection {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            connected_at: Utc::now(),
            subscriptions: RwLock::new(HashSet::new()),
        }
    }

    pub fn subscribe(&self, integration_id: &str) {
        self.subscriptions.write().insert(integration_id.to_string());
    }

    pub fn unsubscribe(&self, integration_id: &str) -> bool {
        self.subscriptions.write().remove(integration_id)
    }

    /// Whether events of `integration_id` are forwarded to this connection
    pub fn wants(&self, integration_id: &str) -> bool {
        let subscriptions = self.subscriptions.read();
        subscriptions.is_empty() || subscriptions.contains(integration_id)
    }

    pub fn route_health(&self, health: IntegrationHealth) -> Option<ServerMessage> {
        self.wants(&health.integration_id)
            .then_some(ServerMessage::HealthUpdate { health })
    }

    pub fn route_alert(&self, event: AlertEvent) -> Option<ServerMessage> {
        let (integration_id, message) = match event {
            AlertEvent::Created(alert) | AlertEvent::Escalated(alert) => {
                (alert.integration_id.clone(), ServerMessage::Alert { alert })
            }
            AlertEvent::Acknowledged(alert) => (
                alert.integration_id.clone(),
                ServerMessage::AlertAcknowledged { alert },
            ),
            AlertEvent::Resolved {
                integration_id,
                alert_ids,
            } => (
                integration_id.clone(),
                ServerMessage::AlertsResolved {
                    integration_id,
                    alert_ids,
                },
            ),
        };
        self.wants(&integration_id).then_some(message)
    }
}

impl Default for Connection {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Default)]
struct WebSocketStats {
    total_connections: AtomicU64,
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
}

/// Snapshot of hub counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HubStats {
    pub active_connections: usize,
    pub total_connections: u64,
    pub messages_sent: u64,
    pub messages_received: u64,
}

/// WebSocket connection hub
#[derive(Debug, Default)]
pub struct WebSocketHub {
    connections: DashMap<String, Arc<Connection>>,
    stats: WebSocketStats,
}

impl WebSocketHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> HubStats {
        HubStats {
            active_connections: self.connections.len(),
            total_connections: self.stats.total_connections.load(Ordering::Relaxed),
            messages_sent: self.stats.messages_sent.load(Ordering::Relaxed),
            messages_received: self.stats.messages_received.load(Ordering::Relaxed),
        }
    }

    /// Serve one connection until the client goes away
    pub async fn handle_connection(
        self: Arc<Self>,
        runtime: Arc<IntegrationRuntime>,
        socket: WebSocket,
    ) {
        let connection = Arc::new(Connection::new());
        let connection_id = connection.id.clone();
        self.connections
            .insert(connection_id.clone(), Arc::clone(&connection));
        self.stats.total_connections.fetch_add(1, Ordering::Relaxed);
        info!(connection_id = %connection_id, "WebSocket connection opened");

        let (mut sink, mut stream) = socket.split();
        let (queue_tx, mut queue_rx) = mpsc::unbounded_channel::<ServerMessage>();

        let _ = queue_tx.send(ServerMessage::Connected {
            connection_id: connection_id.clone(),
            timestamp: Utc::now(),
        });

        let outgoing = {
            let hub = Arc::clone(&self);
            let connection = Arc::clone(&connection);
            let events = runtime.events().clone();
            tokio::spawn(async move {
                let mut health = events.subscribe_health();
                let mut alerts = events.subscribe_alerts();
                let mut integrations = events.subscribe_integrations();
                let mut batches = events.subscribe_batches();

                loop {
                    let outbound = tokio::select! {
                        queued = queue_rx.recv() => match queued {
                            Some(message) => Some(message),
                            None => break,
                        },
                        event = health.recv() => match accept(event, &connection.id) {
                            ControlFlow::Break(()) => break,
                            ControlFlow::Continue(event) => {
                                event.and_then(|health| connection.route_health(health))
                            }
                        },
                        event = alerts.recv() => match accept(event, &connection.id) {
                            ControlFlow::Break(()) => break,
                            ControlFlow::Continue(event) => {
                                event.and_then(|alert| connection.route_alert(alert))
                            }
                        },
                        event = integrations.recv() => match accept(event, &connection.id) {
                            ControlFlow::Break(()) => break,
                            ControlFlow::Continue(event) => {
                                event.map(|event| ServerMessage::IntegrationEvent { event })
                            }
                        },
                        event = batches.recv() => match accept(event, &connection.id) {
                            ControlFlow::Break(()) => break,
                            ControlFlow::Continue(event) => {
                                event.map(|event| ServerMessage::BatchProgress { event })
                            }
                        },
                    };

                    let Some(message) = outbound.and_then(ServerMessage::into_message) else {
                        continue;
                    };
                    if let Err(e) = sink.send(message).await {
                        debug!(connection_id = %connection.id, error = %e, "WebSocket send failed");
                        break;
                    }
                    hub.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
                }
            })
        };

        while let Some(received) = stream.next().await {
            match received {
                Ok(Message::Text(text)) => {
                    self.stats.messages_received.fetch_add(1, Ordering::Relaxed);
                    match serde_json::from_str::<ClientMessage>(&text) {
                        Ok(message) => {
                            handle_client_message(&runtime, &connection, &queue_tx, message)
                        }
                        Err(e) => {
                            let _ = queue_tx.send(ServerMessage::Error {
                                message: format!("Invalid message: {}", e),
                            });
                        }
                    }
                }
                Ok(Message::Close(_)) => {
                    debug!(connection_id = %connection_id, "WebSocket closed by client");
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(connection_id = %connection_id, error = %e, "WebSocket receive error");
                    break;
                }
            }
        }

        outgoing.abort();
        self.connections.remove(&connection_id);
        info!(connection_id = %connection_id, "WebSocket connection closed");
    }
}

fn accept<T>(received: Result<T, RecvError>, connection_id: &str) -> ControlFlow<(), Option<T>> {
    match received {
        Ok(event) => ControlFlow::Continue(Some(event)),
        Err(RecvError::Lagged(skipped)) => {
            warn!(connection_id = %connection_id, skipped, "WebSocket client lagging, events dropped");
            ControlFlow::Continue(None)
        }
        Err(RecvError::Closed) => ControlFlow::Break(()),
    }
}

fn handle_client_message(
    runtime: &Arc<IntegrationRuntime>,
    connection: &Connection,
    queue: &mpsc::UnboundedSender<ServerMessage>,
    message: ClientMessage,
) {
    match message {
        ClientMessage::Subscribe { integration_id } => {
            let reply = if runtime.store().contains(&integration_id) {
                connection.subscribe(&integration_id);
                ServerMessage::Subscribed { integration_id }
            } else {
                ServerMessage::Error {
                    message: format!("Integration not found: {}", integration_id),
                }
            };
            let _ = queue.send(reply);
        }
        ClientMessage::Unsubscribe { integration_id } => {
            connection.unsubscribe(&integration_id);
            let _ = queue.send(ServerMessage::Unsubscribed { integration_id });
        }
        ClientMessage::Execute {
            request_id,
            integration_id,
            tool,
            params,
            permissions,
        } => {
            let runtime = Arc::clone(runtime);
            let queue = queue.clone();
            tokio::spawn(async move {
                let result = runtime
                    .execute(ExecuteRequest {
                        integration_id,
                        tool,
                        params: params.unwrap_or_else(|| Value::Object(Default::default())),
                        permissions,
                    })
                    .await;
                let _ = queue.send(ServerMessage::Result { request_id, result });
            });
        }
        ClientMessage::List { integration_id } => {
            let integrations = match &integration_id {
                Some(id) => runtime.store().get(id).into_iter().collect(),
                None => runtime.store().list(),
            };
            let _ = queue.send(ServerMessage::Integrations {
                integration_id,
                integrations,
            });
        }
        ClientMessage::Ping => {
            let _ = queue.send(ServerMessage::Pong);
        }
    }
}

/// Upgrade handler shared by the API router and the monitor listener
pub async fn websocket_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    let hub = Arc::clone(&state.hub);
    let runtime = Arc::clone(&state.runtime);
    ws.on_upgrade(move |socket| hub.handle_connection(runtime, socket))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::{AlertSeverity, AlertType};
    use serde_json::json;

    fn alert_for(integration_id: &str) -> Alert {
        Alert {
            id: "alert-1".to_string(),
            integration_id: integration_id.to_string(),
            integration_name: "notes".to_string(),
            alert_type: AlertType::Offline,
            severity: AlertSeverity::Critical,
            message: "offline".to_string(),
            threshold: 0.0,
            actual_value: 0.0,
            escalation_level: 0,
            created_at: Utc::now(),
            acknowledged: false,
            acknowledged_at: None,
            escalated_at: None,
        }
    }

    #[test]
    fn test_client_message_parsing() {
        let message: ClientMessage =
            serde_json::from_value(json!({ "type": "subscribe", "integrationId": "abc" })).unwrap();
        assert_eq!(
            message,
            ClientMessage::Subscribe {
                integration_id: "abc".to_string()
            }
        );

        let message: ClientMessage = serde_json::from_value(json!({
            "type": "execute",
            "integrationId": "abc",
            "tool": "create",
            "params": { "title": "x" }
        }))
        .unwrap();
        assert!(matches!(
            message,
            ClientMessage::Execute { ref tool, request_id: None, .. } if tool == "create"
        ));

        let message: ClientMessage = serde_json::from_value(json!({ "type": "list" })).unwrap();
        assert_eq!(message, ClientMessage::List { integration_id: None });

        assert!(serde_json::from_value::<ClientMessage>(json!({ "type": "reboot" })).is_err());
    }

    #[test]
    fn test_server_message_shape() {
        let value = serde_json::to_value(ServerMessage::Subscribed {
            integration_id: "abc".to_string(),
        })
        .unwrap();
        assert_eq!(value, json!({ "type": "subscribed", "integrationId": "abc" }));

        let value = serde_json::to_value(ServerMessage::HealthUpdate {
            health: IntegrationHealth::new("abc", "notes"),
        })
        .unwrap();
        assert_eq!(value["type"], "health-update");
        assert_eq!(value["health"]["integrationId"], "abc");

        let value = serde_json::to_value(ServerMessage::AlertAcknowledged {
            alert: alert_for("abc"),
        })
        .unwrap();
        assert_eq!(value["type"], "alert-acknowledged");
    }

    #[test]
    fn test_unsubscribed_connection_receives_everything() {
        let connection = Connection::new();
        assert!(connection
            .route_health(IntegrationHealth::new("abc", "notes"))
            .is_some());
        assert!(connection
            .route_alert(AlertEvent::Created(alert_for("xyz")))
            .is_some());
    }

    #[test]
    fn test_subscriptions_filter_health_and_alerts() {
        let connection = Connection::new();
        connection.subscribe("abc");

        assert!(connection
            .route_health(IntegrationHealth::new("abc", "notes"))
            .is_some());
        assert!(connection
            .route_health(IntegrationHealth::new("xyz", "other"))
            .is_none());
        assert!(matches!(
            connection.route_alert(AlertEvent::Acknowledged(alert_for("abc"))),
            Some(ServerMessage::AlertAcknowledged { .. })
        ));
        assert!(connection
            .route_alert(AlertEvent::Created(alert_for("xyz")))
            .is_none());

        assert!(connection.unsubscribe("abc"));
        assert!(connection.wants("xyz"));
    }
}
