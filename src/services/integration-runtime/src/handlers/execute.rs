//! Tool Execution Handler

use crate::{handlers::ApiJson, models::ExecuteRequest, server::AppState, RuntimeError};
use axum::{
    extract::State,
    http::{header::RETRY_AFTER, HeaderValue, StatusCode},
    response::{IntoResponse, Json, Response},
};
use validator::Validate;

/// Dispatch one tool call.
///
/// The body is always an `ExecutionResult`; a rate-limited call additionally
/// carries a `Retry-After` header.
pub async fn execute_tool(
    State(state): State<AppState>,
    ApiJson(request): ApiJson<ExecuteRequest>,
) -> Response {
    if let Err(e) = request.validate() {
        return RuntimeError::validation("request", e.to_string()).into_response();
    }

    let result = state.runtime().execute(request).await;
    let retry_after = result
        .error
        .as_ref()
        .and_then(|error| error.retry_after);

    let mut response = (StatusCode::OK, Json(result)).into_response();
    if let Some(seconds) = retry_after {
        if let Ok(value) = HeaderValue::from_str(&seconds.to_string()) {
            response.headers_mut().insert(RETRY_AFTER, value);
        }
    }
    response
}
