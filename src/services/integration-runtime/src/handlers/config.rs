//! Configuration Handlers

use crate::{models::RateLimit, server::AppState};
use axum::{extract::State, response::Json};
use serde::Serialize;

/// Public view of the runtime configuration
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigResponse {
    pub port: u16,
    pub monitor_port: Option<u16>,
    pub version: String,
    pub environment: String,
    pub sandbox_enabled: bool,
    pub require_signatures: bool,
    pub capabilities: Vec<&'static str>,
    pub limits: LimitsResponse,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LimitsResponse {
    pub max_execution_ms: u64,
    pub max_memory_mb: u64,
    pub default_rate_limit: RateLimit,
    pub max_body_bytes: usize,
}

pub async fn get_config(State(state): State<AppState>) -> Json<ConfigResponse> {
    let runtime = state.runtime();
    let config = runtime.config();
    let security = runtime.security();

    Json(ConfigResponse {
        port: config.server.port,
        monitor_port: config.server.monitor_port,
        version: env!("CARGO_PKG_VERSION").to_string(),
        environment: config.environment.clone(),
        sandbox_enabled: security.sandbox_enabled(),
        require_signatures: config.security.require_signatures,
        capabilities: vec![
            "register",
            "execute",
            "batch",
            "rollback",
            "health",
            "alerts",
            "websocket",
            "signatures",
        ],
        limits: LimitsResponse {
            max_execution_ms: config.security.max_execution_ms,
            max_memory_mb: config.security.max_memory_mb,
            default_rate_limit: security.default_rate_limit(),
            max_body_bytes: config.server.max_body_bytes,
        },
    })
}
