//! Batch Operation Handlers

use crate::{
    handlers::ApiJson,
    models::{BatchConfig, BatchItem, BatchOperation, BatchType, Snapshot},
    server::AppState,
    Result, RuntimeError,
};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
};
use serde::{Deserialize, Serialize};
use tracing::info;

/// Batch creation request
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateBatchRequest {
    #[serde(rename = "type")]
    pub batch_type: BatchType,
    pub items: Vec<BatchItem>,
    #[serde(default)]
    pub config: Option<BatchConfig>,
    /// Start the run immediately in the background
    #[serde(default)]
    pub run: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RollbackResponse {
    pub operation_id: String,
    pub restored: usize,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchDetailResponse {
    #[serde(flatten)]
    pub operation: BatchOperation,
    pub snapshots: Vec<Snapshot>,
}

pub async fn create_batch(
    State(state): State<AppState>,
    ApiJson(request): ApiJson<CreateBatchRequest>,
) -> Result<(StatusCode, Json<BatchOperation>)> {
    let engine = state.runtime().batch();
    let operation = engine.create(request.batch_type, request.items, request.config)?;
    if request.run {
        engine.spawn_run(&operation.id)?;
    }
    Ok((StatusCode::CREATED, Json(operation)))
}

pub async fn list_batches(State(state): State<AppState>) -> Json<Vec<BatchOperation>> {
    Json(state.runtime().batch().list())
}

pub async fn get_batch(
    State(state): State<AppState>,
    Path(operation_id): Path<String>,
) -> Result<Json<BatchDetailResponse>> {
    let engine = state.runtime().batch();
    let operation = engine
        .get(&operation_id)
        .ok_or_else(|| RuntimeError::not_found("Batch operation", &operation_id))?;
    Ok(Json(BatchDetailResponse {
        snapshots: engine.snapshots(&operation_id),
        operation,
    }))
}

/// Start a pending operation; progress arrives over the event channels
pub async fn run_batch(
    State(state): State<AppState>,
    Path(operation_id): Path<String>,
) -> Result<(StatusCode, Json<BatchOperation>)> {
    let engine = state.runtime().batch();
    engine.spawn_run(&operation_id)?;
    info!(operation_id = %operation_id, "Batch run started via API");
    let operation = engine
        .get(&operation_id)
        .ok_or_else(|| RuntimeError::not_found("Batch operation", &operation_id))?;
    Ok((StatusCode::ACCEPTED, Json(operation)))
}

pub async fn cancel_batch(
    State(state): State<AppState>,
    Path(operation_id): Path<String>,
) -> Result<Json<BatchOperation>> {
    Ok(Json(state.runtime().batch().cancel(&operation_id)?))
}

pub async fn rollback_batch(
    State(state): State<AppState>,
    Path(operation_id): Path<String>,
) -> Result<Json<RollbackResponse>> {
    let restored = state.runtime().batch().rollback(&operation_id).await?;
    Ok(Json(RollbackResponse {
        operation_id,
        restored,
    }))
}

pub async fn delete_batch(
    State(state): State<AppState>,
    Path(operation_id): Path<String>,
) -> Result<StatusCode> {
    state.runtime().batch().cleanup(&operation_id)?;
    Ok(StatusCode::NO_CONTENT)
}
