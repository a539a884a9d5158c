//! Alert Handlers

use crate::{alerts::Alert, server::AppState, Result};
use axum::{
    extract::{Path, Query, State},
    response::Json,
};
use serde::Deserialize;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertQuery {
    #[serde(default)]
    pub include_acknowledged: bool,
    pub integration_id: Option<String>,
}

pub async fn list_alerts(
    State(state): State<AppState>,
    Query(query): Query<AlertQuery>,
) -> Json<Vec<Alert>> {
    let alerts = state.runtime().alerts();
    let mut listed = match &query.integration_id {
        Some(integration_id) => alerts.for_integration(integration_id),
        None => alerts.list(true),
    };
    if !query.include_acknowledged {
        listed.retain(|alert| !alert.acknowledged);
    }
    Json(listed)
}

/// Acknowledge an alert; cancels its escalation and broadcasts `alert-acknowledged`
pub async fn acknowledge_alert(
    State(state): State<AppState>,
    Path(alert_id): Path<String>,
) -> Result<Json<Alert>> {
    Ok(Json(state.runtime().alerts().acknowledge(&alert_id)?))
}
