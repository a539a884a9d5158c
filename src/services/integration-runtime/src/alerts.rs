//! Alert management
//!
//! Alerts are raised by the health monitor when a snapshot crosses a
//! threshold. At most one unacknowledged alert exists per
//! `(integration, alert type)`. Unacknowledged alerts escalate to the
//! configured channels after a delay.

use crate::{
    config::{EscalationChannel, HealthConfig},
    events::{AlertEvent, EventBus},
    security::SecurityManager,
    Result, RuntimeError,
};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Escalations stop after this level
const MAX_ESCALATION_LEVEL: u32 = 3;

/// Alert type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertType {
    ConsecutiveFailures,
    ErrorRate,
    ResponseTime,
    Offline,
}

impl fmt::Display for AlertType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AlertType::ConsecutiveFailures => "consecutive_failures",
            AlertType::ErrorRate => "error_rate",
            AlertType::ResponseTime => "response_time",
            AlertType::Offline => "offline",
        };
        f.write_str(name)
    }
}

/// Alert severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Warning,
    Critical,
}

/// Threshold alert for one integration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Alert {
    pub id: String,
    pub integration_id: String,
    pub integration_name: String,
    #[serde(rename = "type")]
    pub alert_type: AlertType,
    pub severity: AlertSeverity,
    pub message: String,
    pub threshold: f64,
    pub actual_value: f64,
    pub escalation_level: u32,
    pub created_at: DateTime<Utc>,
    pub acknowledged: bool,
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub escalated_at: Option<DateTime<Utc>>,
}

/// Parameters of a new alert
#[derive(Debug, Clone)]
pub struct NewAlert {
    pub integration_id: String,
    pub integration_name: String,
    pub alert_type: AlertType,
    pub severity: AlertSeverity,
    pub message: String,
    pub threshold: f64,
    pub actual_value: f64,
}

/// Alert manager
#[derive(Debug)]
pub struct AlertManager {
    alerts: DashMap<String, Alert>,
    /// Unacknowledged alert id per (integration, type)
    active: DashMap<(String, AlertType), String>,
    escalations: DashMap<String, CancellationToken>,
    escalation_delay: Duration,
    channels: Vec<EscalationChannel>,
    events: EventBus,
    client: Client,
    /// Domain policy applied to webhook targets
    security: Option<Arc<SecurityManager>>,
}

impl AlertManager {
    pub fn new(config: &HealthConfig, events: EventBus) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .user_agent("Integration Runtime Alert Escalation")
            .build()
            .unwrap_or_else(|_| Client::new());

        Self {
            alerts: DashMap::new(),
            active: DashMap::new(),
            escalations: DashMap::new(),
            escalation_delay: Duration::from_secs(config.escalation_delay_seconds),
            channels: config.escalation_channels.clone(),
            events,
            client,
            security: None,
        }
    }

    /// Check webhook hosts against the runtime's domain policy before delivery
    pub fn with_security(mut self, security: Arc<SecurityManager>) -> Self {
        self.security = Some(security);
        self
    }

    fn webhook_allowed(&self, url: &str) -> bool {
        self.security
            .as_ref()
            .map_or(true, |security| security.is_allowed_url(url))
    }

    /// Raise an alert unless an unacknowledged one of the same type exists
    pub fn raise(self: &Arc<Self>, draft: NewAlert) -> Option<Alert> {
        let key = (draft.integration_id.clone(), draft.alert_type);
        let alert = match self.active.entry(key) {
            dashmap::mapref::entry::Entry::Occupied(_) => return None,
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                let alert = Alert {
                    id: Uuid::new_v4().to_string(),
                    integration_id: draft.integration_id,
                    integration_name: draft.integration_name,
                    alert_type: draft.alert_type,
                    severity: draft.severity,
                    message: draft.message,
                    threshold: draft.threshold,
                    actual_value: draft.actual_value,
                    escalation_level: 0,
                    created_at: Utc::now(),
                    acknowledged: false,
                    acknowledged_at: None,
                    escalated_at: None,
                };
                vacant.insert(alert.id.clone());
                alert
            }
        };

        self.alerts.insert(alert.id.clone(), alert.clone());
        warn!(
            alert_id = %alert.id,
            integration_id = %alert.integration_id,
            alert_type = %alert.alert_type,
            severity = ?alert.severity,
            actual_value = alert.actual_value,
            threshold = alert.threshold,
            "Alert raised"
        );
        self.events.publish_alert(AlertEvent::Created(alert.clone()));
        self.schedule_escalation(&alert.id);
        Some(alert)
    }

    fn schedule_escalation(self: &Arc<Self>, alert_id: &str) {
        let token = CancellationToken::new();
        self.escalations.insert(alert_id.to_string(), token.clone());

        let manager: Weak<Self> = Arc::downgrade(self);
        let alert_id = alert_id.to_string();
        let delay = self.escalation_delay;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
                let Some(manager) = manager.upgrade() else {
                    break;
                };
                match manager.escalate(&alert_id).await {
                    Some(level) if level < MAX_ESCALATION_LEVEL => continue,
                    _ => {
                        manager.escalations.remove(&alert_id);
                        break;
                    }
                }
            }
        });
    }

    /// Bump the escalation level of an unacknowledged alert and notify channels
    async fn escalate(&self, alert_id: &str) -> Option<u32> {
        let alert = {
            let mut entry = self.alerts.get_mut(alert_id)?;
            if entry.acknowledged {
                return None;
            }
            entry.escalation_level += 1;
            entry.escalated_at = Some(Utc::now());
            entry.clone()
        };

        warn!(
            alert_id = %alert.id,
            integration_id = %alert.integration_id,
            escalation_level = alert.escalation_level,
            "Alert escalated"
        );
        self.events.publish_alert(AlertEvent::Escalated(alert.clone()));
        for channel in &self.channels {
            self.deliver(channel, &alert).await;
        }
        Some(alert.escalation_level)
    }

    /// Returns whether the channel accepted the alert
    async fn deliver(&self, channel: &EscalationChannel, alert: &Alert) -> bool {
        match channel {
            EscalationChannel::Log => {
                error!(
                    alert_id = %alert.id,
                    integration_id = %alert.integration_id,
                    integration_name = %alert.integration_name,
                    alert_type = %alert.alert_type,
                    escalation_level = alert.escalation_level,
                    message = %alert.message,
                    "Unacknowledged alert"
                );
                true
            }
            EscalationChannel::Webhook { url } => {
                if !self.webhook_allowed(url) {
                    warn!(alert_id = %alert.id, url = %url, "Webhook host refused by domain policy");
                    return false;
                }
                match self.client.post(url).json(alert).send().await {
                    Ok(response) if response.status().is_success() => {
                        info!(alert_id = %alert.id, url = %url, "Alert delivered to webhook");
                        true
                    }
                    Ok(response) => {
                        warn!(
                            alert_id = %alert.id,
                            url = %url,
                            status = %response.status(),
                            "Webhook rejected alert"
                        );
                        false
                    }
                    Err(e) => {
                        warn!(alert_id = %alert.id, url = %url, error = %e, "Webhook delivery failed");
                        false
                    }
                }
            }
        }
    }

    /// Acknowledge an alert; stops escalation and allows a new alert of the same type
    pub fn acknowledge(&self, alert_id: &str) -> Result<Alert> {
        let alert = {
            let mut entry = self
                .alerts
                .get_mut(alert_id)
                .ok_or_else(|| RuntimeError::not_found("Alert", alert_id))?;
            if !entry.acknowledged {
                entry.acknowledged = true;
                entry.acknowledged_at = Some(Utc::now());
            }
            entry.clone()
        };

        self.active
            .remove_if(&(alert.integration_id.clone(), alert.alert_type), |_, id| {
                id == alert_id
            });
        if let Some((_, token)) = self.escalations.remove(alert_id) {
            token.cancel();
        }

        info!(alert_id = %alert_id, integration_id = %alert.integration_id, "Alert acknowledged");
        self.events
            .publish_alert(AlertEvent::Acknowledged(alert.clone()));
        Ok(alert)
    }

    /// Clear every alert of an integration
    pub fn resolve_integration(&self, integration_id: &str) -> Vec<String> {
        let ids: Vec<String> = self
            .alerts
            .iter()
            .filter(|entry| entry.integration_id == integration_id)
            .map(|entry| entry.id.clone())
            .collect();
        if ids.is_empty() {
            return ids;
        }

        for id in &ids {
            self.alerts.remove(id);
            if let Some((_, token)) = self.escalations.remove(id) {
                token.cancel();
            }
        }
        self.active.retain(|(owner, _), _| owner != integration_id);

        info!(integration_id = %integration_id, count = ids.len(), "Alerts resolved");
        self.events.publish_alert(AlertEvent::Resolved {
            integration_id: integration_id.to_string(),
            alert_ids: ids.clone(),
        });
        ids
    }

    pub fn get(&self, alert_id: &str) -> Option<Alert> {
        self.alerts.get(alert_id).map(|entry| entry.clone())
    }

    /// Alerts newest first; acknowledged ones only when asked for
    pub fn list(&self, include_acknowledged: bool) -> Vec<Alert> {
        let mut alerts: Vec<Alert> = self
            .alerts
            .iter()
            .filter(|entry| include_acknowledged || !entry.acknowledged)
            .map(|entry| entry.clone())
            .collect();
        alerts.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        alerts
    }

    pub fn for_integration(&self, integration_id: &str) -> Vec<Alert> {
        self.list(true)
            .into_iter()
            .filter(|alert| alert.integration_id == integration_id)
            .collect()
    }

    /// Stop all pending escalations
    pub fn shutdown(&self) {
        for entry in self.escalations.iter() {
            entry.value().cancel();
        }
        self.escalations.clear();
    }
}
