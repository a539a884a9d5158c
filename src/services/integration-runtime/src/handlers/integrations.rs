//! Integration Management Handlers
//!
//! Registration, lookup, search, update and removal of integrations.

use crate::{
    handlers::ApiJson,
    models::{Category, Integration, IntegrationPatch, Manifest, RegisterResponse},
    server::AppState,
    store::{IntegrationFilter, StoreStats},
    Result, RuntimeError,
};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{info, warn};

/// Search query; `tags` is comma separated
#[derive(Debug, Default, Deserialize)]
pub struct SearchQuery {
    pub name: Option<String>,
    pub category: Option<Category>,
    pub author: Option<String>,
    pub tags: Option<String>,
}

impl From<SearchQuery> for IntegrationFilter {
    fn from(query: SearchQuery) -> Self {
        let tags = query.tags.map(|tags| {
            tags.split(',')
                .map(str::trim)
                .filter(|tag| !tag.is_empty())
                .map(str::to_string)
                .collect::<Vec<_>>()
        });
        IntegrationFilter {
            name: query.name,
            category: query.category,
            author: query.author,
            tags: tags.filter(|tags| !tags.is_empty()),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct SearchResponse {
    pub integrations: Vec<Integration>,
    pub total: usize,
    pub stats: StoreStats,
}

/// All registered integrations, sorted by name
pub async fn list_integrations(State(state): State<AppState>) -> Json<Vec<Integration>> {
    Json(state.runtime().store().list())
}

/// Validate, sandbox and register an integration
pub async fn register_integration(
    State(state): State<AppState>,
    ApiJson(integration): ApiJson<Integration>,
) -> Result<(StatusCode, Json<RegisterResponse>)> {
    let name = integration.name.clone();
    match state.runtime().register(integration).await {
        Ok(response) => {
            info!(
                integration_id = %response.id,
                integration_name = %name,
                warnings = response.warnings.len(),
                "Integration registered via API"
            );
            Ok((StatusCode::CREATED, Json(response)))
        }
        Err(e) => {
            warn!(integration_name = %name, error = %e, "Integration registration rejected");
            Err(e)
        }
    }
}

/// Manifest of one integration, including install metadata
pub async fn get_integration(
    State(state): State<AppState>,
    Path(integration_id): Path<String>,
) -> Result<Json<Manifest>> {
    state
        .runtime()
        .store()
        .get_manifest(&integration_id)
        .map(Json)
        .ok_or_else(|| RuntimeError::not_found("Integration", integration_id))
}

pub async fn update_integration(
    State(state): State<AppState>,
    Path(integration_id): Path<String>,
    ApiJson(patch): ApiJson<IntegrationPatch>,
) -> Result<Json<Integration>> {
    let updated = state.runtime().update(&integration_id, &patch).await?;
    Ok(Json(updated))
}

pub async fn unregister_integration(
    State(state): State<AppState>,
    Path(integration_id): Path<String>,
) -> Result<Json<Value>> {
    let removed = state.runtime().unregister(&integration_id).await?;
    Ok(Json(json!({
        "id": removed.id,
        "name": removed.name,
        "status": "unregistered",
    })))
}

pub async fn search_integrations(
    State(state): State<AppState>,
    Query(query): Query<SearchQuery>,
) -> Json<SearchResponse> {
    let store = state.runtime().store();
    let integrations = store.search(&query.into()).await;
    Json(SearchResponse {
        total: integrations.len(),
        integrations,
        stats: store.stats(),
    })
}
