//! Health Check Handlers
//!
//! Service liveness plus per-integration health as derived by the monitor.

use crate::{
    models::{HealthStatus, IntegrationHealth},
    server::AppState,
    Result, RuntimeError,
};
use axum::{
    extract::{Path, State},
    response::Json,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::info;

/// Basic health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// `healthy` when every monitored integration is healthy, else `degraded`
    pub status: String,
    /// Uptime in seconds
    pub uptime: u64,
    /// Registered integrations
    pub integrations: usize,
    pub version: String,
    pub environment: String,
    /// Integrations per derived status
    pub statuses: BTreeMap<String, usize>,
    pub timestamp: DateTime<Utc>,
}

/// Service health
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let runtime = state.runtime();

    let mut statuses = BTreeMap::new();
    for health in runtime.health().all_health() {
        *statuses.entry(health.status.to_string()).or_insert(0) += 1;
    }
    let degraded = statuses
        .iter()
        .any(|(status, count)| *count > 0 && status != &HealthStatus::Healthy.to_string());

    Json(HealthResponse {
        status: if degraded { "degraded" } else { "healthy" }.to_string(),
        uptime: runtime.uptime_seconds(),
        integrations: runtime.store().len(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        environment: runtime.config().environment.clone(),
        statuses,
        timestamp: Utc::now(),
    })
}

/// Health of every monitored integration
pub async fn all_integration_health(State(state): State<AppState>) -> Json<Vec<IntegrationHealth>> {
    Json(state.runtime().health().all_health())
}

/// Last derived health of one integration
pub async fn integration_health(
    State(state): State<AppState>,
    Path(integration_id): Path<String>,
) -> Result<Json<IntegrationHealth>> {
    let runtime = state.runtime();
    let integration = runtime
        .store()
        .get(&integration_id)
        .ok_or_else(|| RuntimeError::not_found("Integration", &integration_id))?;

    let health = runtime
        .health()
        .get_health(&integration_id)
        .unwrap_or_else(|| IntegrationHealth::new(&integration.id, &integration.name));
    Ok(Json(health))
}

/// Run one health check immediately
pub async fn check_integration_health(
    State(state): State<AppState>,
    Path(integration_id): Path<String>,
) -> Result<Json<IntegrationHealth>> {
    let health = state.runtime().health().check(&integration_id).await?;
    info!(
        integration_id = %integration_id,
        status = %health.status,
        "On-demand health check completed"
    );
    Ok(Json(health))
}
