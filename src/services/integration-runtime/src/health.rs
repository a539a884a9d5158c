//! Health Monitoring Module
//!
//! Each monitored integration gets its own timer. Every tick runs one
//! representative tool call through the dispatcher under a timeout, folds the
//! outcome into rolling metrics and re-derives the health status. Status
//! changes and threshold crossings are broadcast and raised as alerts.

use crate::{
    alerts::{AlertManager, AlertSeverity, AlertType, NewAlert},
    config::HealthConfig,
    dispatcher::RequestDispatcher,
    events::EventBus,
    models::{HealthStatus, Integration, IntegrationHealth, MinuteBucket},
    store::IntegrationStore,
    telemetry::create_health_check_span,
    Result, RuntimeError,
};
use chrono::{DateTime, DurationRound, Utc};
use dashmap::DashMap;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::time::{interval_at, timeout, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};

/// Per-minute buckets retained
const MINUTE_BUCKETS: usize = 60;

/// Outcome of one probe
#[derive(Debug, Clone)]
struct ProbeOutcome {
    success: bool,
    response_time_ms: u64,
    error: Option<String>,
}

#[derive(Debug, Clone)]
struct HealthState {
    health: IntegrationHealth,
    history: VecDeque<u64>,
}

/// Health monitor for integrations
#[derive(Debug)]
pub struct HealthMonitor {
    store: Arc<IntegrationStore>,
    dispatcher: Arc<RequestDispatcher>,
    alerts: Arc<AlertManager>,
    events: EventBus,
    config: HealthConfig,
    states: DashMap<String, HealthState>,
    timers: DashMap<String, CancellationToken>,
}

impl HealthMonitor {
    pub fn new(
        store: Arc<IntegrationStore>,
        dispatcher: Arc<RequestDispatcher>,
        alerts: Arc<AlertManager>,
        events: EventBus,
        config: HealthConfig,
    ) -> Self {
        Self {
            store,
            dispatcher,
            alerts,
            events,
            config,
            states: DashMap::new(),
            timers: DashMap::new(),
        }
    }

    pub fn config(&self) -> &HealthConfig {
        &self.config
    }

    /// Start the periodic check timer for one integration
    pub fn start_monitoring(self: &Arc<Self>, integration_id: &str) -> Result<()> {
        let integration = self
            .store
            .get(integration_id)
            .ok_or_else(|| RuntimeError::not_found("Integration", integration_id))?;
        self.ensure_state(&integration);

        if self.timers.contains_key(integration_id) {
            return Ok(());
        }

        let token = CancellationToken::new();
        self.timers
            .insert(integration_id.to_string(), token.clone());

        let period = Duration::from_secs(self.config.check_interval_seconds);
        let monitor: Weak<Self> = Arc::downgrade(self);
        let id = integration_id.to_string();
        tokio::spawn(async move {
            let mut ticker = interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let Some(monitor) = monitor.upgrade() else {
                    break;
                };
                if let Err(e) = monitor.check(&id).await {
                    debug!(integration_id = %id, error = %e, "Health check skipped");
                }
            }
            debug!(integration_id = %id, "Health timer stopped");
        });

        info!(
            integration_id = %integration_id,
            interval_seconds = self.config.check_interval_seconds,
            "Health monitoring started"
        );
        Ok(())
    }

    /// Stop the timer for one integration
    pub fn stop_monitoring(&self, integration_id: &str) -> bool {
        match self.timers.remove(integration_id) {
            Some((_, token)) => {
                token.cancel();
                info!(integration_id = %integration_id, "Health monitoring stopped");
                true
            }
            None => false,
        }
    }

    pub fn is_monitoring(&self, integration_id: &str) -> bool {
        self.timers.contains_key(integration_id)
    }

    /// Stop monitoring and drop all health state and alerts of an integration
    pub fn forget(&self, integration_id: &str) {
        self.stop_monitoring(integration_id);
        self.states.remove(integration_id);
        self.alerts.resolve_integration(integration_id);
    }

    /// Stop every timer
    pub fn shutdown(&self) {
        for entry in self.timers.iter() {
            entry.value().cancel();
        }
        self.timers.clear();
        info!("Health monitor stopped");
    }

    /// Run one check now
    pub async fn check(&self, integration_id: &str) -> Result<IntegrationHealth> {
        let integration = self
            .store
            .get(integration_id)
            .ok_or_else(|| RuntimeError::not_found("Integration", integration_id))?;
        self.ensure_state(&integration);

        let span = create_health_check_span(&integration.id, &integration.name);
        let outcome = self.probe(&integration).instrument(span.clone()).await;
        span.record("response_time_ms", outcome.response_time_ms);

        // Unregistered while the probe was in flight; forget() already dropped the state
        let Some((health, previous)) = self.record(&integration, outcome) else {
            debug!(integration_id = %integration.id, "Integration removed during health check");
            return Err(RuntimeError::not_found("Integration", &integration.id));
        };
        span.record("status", tracing::field::display(health.status));

        if previous != health.status {
            info!(
                integration_id = %integration.id,
                from = %previous,
                to = %health.status,
                "Integration health changed"
            );
        }

        if !self.store.contains(&integration.id) {
            self.states.remove(&integration.id);
            return Err(RuntimeError::not_found("Integration", &integration.id));
        }
        self.evaluate_alerts(&health);
        self.events.publish_health(health.clone());
        Ok(health)
    }

    async fn probe(&self, integration: &Integration) -> ProbeOutcome {
        let Some(tool) = integration.tools.first() else {
            return ProbeOutcome {
                success: false,
                response_time_ms: 0,
                error: Some("integration has no tools".to_string()),
            };
        };
        let params: Value = tool
            .examples
            .first()
            .map(|example| example.input.clone())
            .unwrap_or_else(|| json!({}));

        let limit = Duration::from_secs(self.config.check_timeout_seconds);
        let started = Instant::now();
        let call = self.dispatcher.execute_tool(&integration.id, &tool.name, params);

        match timeout(limit, call).await {
            Ok(result) => ProbeOutcome {
                success: result.success,
                response_time_ms: started.elapsed().as_millis() as u64,
                error: result.error.map(|error| error.message),
            },
            Err(_) => {
                warn!(integration_id = %integration.id, tool = %tool.name, "Health check timed out");
                ProbeOutcome {
                    success: false,
                    response_time_ms: limit.as_millis() as u64,
                    error: Some(format!(
                        "Health check timed out after {}s",
                        self.config.check_timeout_seconds
                    )),
                }
            }
        }
    }

    fn ensure_state(&self, integration: &Integration) {
        self.states
            .entry(integration.id.clone())
            .or_insert_with(|| HealthState {
                health: IntegrationHealth::new(&integration.id, &integration.name),
                history: VecDeque::with_capacity(self.config.history_size),
            });
    }

    /// Fold one probe into the metrics; returns the new snapshot and previous
    /// status, or `None` when the state was dropped mid-check
    fn record(
        &self,
        integration: &Integration,
        outcome: ProbeOutcome,
    ) -> Option<(IntegrationHealth, HealthStatus)> {
        let mut state = self.states.get_mut(&integration.id)?;
        let previous = state.health.status;
        let now = Utc::now();

        if state.history.len() >= self.config.history_size {
            state.history.pop_front();
        }
        state.history.push_back(outcome.response_time_ms);
        let (avg, p95, p99) = response_stats(&state.history);

        let health = &mut state.health;
        health.integration_name = integration.name.clone();
        health.last_check = Some(now);

        let metrics = &mut health.metrics;
        metrics.total_requests += 1;
        if outcome.success {
            metrics.successful_requests += 1;
        }
        let failed = metrics.total_requests - metrics.successful_requests;
        metrics.error_rate = failed as f64 / metrics.total_requests as f64;
        metrics.uptime = metrics.successful_requests as f64 / metrics.total_requests as f64;
        metrics.avg_response_time_ms = avg;
        metrics.p95_response_time_ms = p95;
        metrics.p99_response_time_ms = p99;
        metrics.last_response_time_ms = outcome.response_time_ms;
        record_bucket(&mut metrics.minute_buckets, now, outcome.success);

        if outcome.success {
            health.consecutive_failures = 0;
        } else {
            health.consecutive_failures += 1;
            health.last_error = outcome.error;
        }

        health.status = derive_status(health, &self.config);
        Some((health.clone(), previous))
    }

    fn evaluate_alerts(&self, health: &IntegrationHealth) {
        if health.status == HealthStatus::Healthy {
            self.alerts.resolve_integration(&health.integration_id);
            return;
        }

        let metrics = &health.metrics;
        let draft = |alert_type, severity, message: String, threshold: f64, actual_value: f64| NewAlert {
            integration_id: health.integration_id.clone(),
            integration_name: health.integration_name.clone(),
            alert_type,
            severity,
            message,
            threshold,
            actual_value,
        };
        let alerts = Arc::clone(&self.alerts);

        if health.consecutive_failures >= self.config.unhealthy_threshold {
            alerts.raise(draft(
                AlertType::ConsecutiveFailures,
                AlertSeverity::Critical,
                format!(
                    "{} failed {} consecutive health checks",
                    health.integration_name, health.consecutive_failures
                ),
                self.config.unhealthy_threshold as f64,
                health.consecutive_failures as f64,
            ));
        }
        if health.status == HealthStatus::Offline {
            alerts.raise(draft(
                AlertType::Offline,
                AlertSeverity::Critical,
                format!("{} is offline", health.integration_name),
                0.0,
                metrics.uptime,
            ));
        }
        if metrics.error_rate >= self.config.degraded_error_rate {
            alerts.raise(draft(
                AlertType::ErrorRate,
                AlertSeverity::Warning,
                format!(
                    "{} error rate is {:.1}%",
                    health.integration_name,
                    metrics.error_rate * 100.0
                ),
                self.config.degraded_error_rate,
                metrics.error_rate,
            ));
        }
        if metrics.avg_response_time_ms > self.config.response_time_threshold_ms as f64 {
            alerts.raise(draft(
                AlertType::ResponseTime,
                AlertSeverity::Warning,
                format!(
                    "{} responds in {:.0}ms on average",
                    health.integration_name, metrics.avg_response_time_ms
                ),
                self.config.response_time_threshold_ms as f64,
                metrics.avg_response_time_ms,
            ));
        }
    }

    pub fn get_health(&self, integration_id: &str) -> Option<IntegrationHealth> {
        self.states
            .get(integration_id)
            .map(|state| state.health.clone())
    }

    /// Every tracked integration ordered by name
    pub fn all_health(&self) -> Vec<IntegrationHealth> {
        let mut all: Vec<IntegrationHealth> = self
            .states
            .iter()
            .map(|state| state.health.clone())
            .collect();
        all.sort_by(|a, b| a.integration_name.cmp(&b.integration_name));
        all
    }
}

/// Status rules, first match wins
pub fn derive_status(health: &IntegrationHealth, config: &HealthConfig) -> HealthStatus {
    let metrics = &health.metrics;
    if health.consecutive_failures >= config.unhealthy_threshold {
        HealthStatus::Unhealthy
    } else if metrics.total_requests > 0 && metrics.uptime == 0.0 {
        HealthStatus::Offline
    } else if metrics.error_rate >= config.degraded_error_rate
        || metrics.avg_response_time_ms > config.response_time_threshold_ms as f64
    {
        HealthStatus::Degraded
    } else {
        HealthStatus::Healthy
    }
}

/// Average, p95 and p99 (nearest rank) of the response time history
fn response_stats(history: &VecDeque<u64>) -> (f64, u64, u64) {
    if history.is_empty() {
        return (0.0, 0, 0);
    }
    let mut sorted: Vec<u64> = history.iter().copied().collect();
    sorted.sort_unstable();
    let avg = sorted.iter().sum::<u64>() as f64 / sorted.len() as f64;
    (avg, percentile(&sorted, 95.0), percentile(&sorted, 99.0))
}

fn percentile(sorted: &[u64], pct: f64) -> u64 {
    let rank = ((pct / 100.0) * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}

fn record_bucket(buckets: &mut Vec<MinuteBucket>, now: DateTime<Utc>, success: bool) {
    let minute = now
        .duration_trunc(chrono::Duration::minutes(1))
        .unwrap_or(now);
    match buckets.last_mut() {
        Some(bucket) if bucket.minute == minute => {
            bucket.requests += 1;
            if !success {
                bucket.failures += 1;
            }
        }
        _ => buckets.push(MinuteBucket {
            minute,
            requests: 1,
            failures: u64::from(!success),
        }),
    }
    if buckets.len() > MINUTE_BUCKETS {
        let excess = buckets.len() - MINUTE_BUCKETS;
        buckets.drain(..excess);
    }
}
