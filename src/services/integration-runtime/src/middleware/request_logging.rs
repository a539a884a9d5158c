//! Request Logging Middleware
//!
//! Logs every HTTP request with its request id, status and latency, and
//! bounds request handling time by the configured server timeout.

use crate::{server::AppState, telemetry::create_request_span};
use axum::{
    extract::{Request, State},
    http::{HeaderMap, StatusCode},
    middleware::Next,
    response::{IntoResponse, Json, Response},
};
use serde_json::json;
use std::time::Instant;
use tracing::{error, info, warn, Instrument};
use uuid::Uuid;

const SLOW_REQUEST_MS: u64 = 1000;

/// Request id assigned to the current request, available as an extension
#[derive(Debug, Clone)]
pub struct RequestId(pub String);

/// Request logging middleware
pub async fn request_logging_middleware(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    let start_time = Instant::now();
    let method = request.method().clone();
    let uri = request.uri().clone();
    let request_id = extract_or_generate_request_id(request.headers());
    request
        .extensions_mut()
        .insert(RequestId(request_id.clone()));

    let span = create_request_span(method.as_str(), uri.path(), &request_id);
    let timeout = state.runtime().config().request_timeout();

    let response = async {
        info!(method = %method, uri = %uri, request_id = %request_id, "HTTP request started");

        match tokio::time::timeout(timeout, next.run(request)).await {
            Ok(response) => response,
            Err(_) => {
                warn!(
                    request_id = %request_id,
                    timeout_ms = timeout.as_millis() as u64,
                    "HTTP request timed out"
                );
                (
                    StatusCode::REQUEST_TIMEOUT,
                    Json(json!({
                        "error": {
                            "code": "REQUEST_TIMEOUT",
                            "message": format!("Request exceeded {}s", timeout.as_secs()),
                        }
                    })),
                )
                    .into_response()
            }
        }
    }
    .instrument(span.clone())
    .await;

    let status_code = response.status();
    let response_time_ms = start_time.elapsed().as_millis() as u64;
    span.record("status_code", status_code.as_u16());
    span.record("response_time_ms", response_time_ms);

    let _entered = span.enter();
    match determine_log_level(&status_code) {
        LogLevel::Info => info!(
            method = %method,
            uri = %uri,
            request_id = %request_id,
            status_code = status_code.as_u16(),
            response_time_ms,
            "HTTP request completed"
        ),
        LogLevel::Warn => warn!(
            method = %method,
            uri = %uri,
            request_id = %request_id,
            status_code = status_code.as_u16(),
            response_time_ms,
            "HTTP request completed with warning status"
        ),
        LogLevel::Error => error!(
            method = %method,
            uri = %uri,
            request_id = %request_id,
            status_code = status_code.as_u16(),
            response_time_ms,
            "HTTP request failed"
        ),
    }

    if response_time_ms > SLOW_REQUEST_MS {
        warn!(
            method = %method,
            uri = %uri,
            request_id = %request_id,
            response_time_ms,
            "Slow request detected"
        );
    }

    response
}

/// Extract or generate request ID
fn extract_or_generate_request_id(headers: &HeaderMap) -> String {
    ["x-request-id", "x-correlation-id"]
        .iter()
        .find_map(|name| headers.get(*name).and_then(|value| value.to_str().ok()))
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LogLevel {
    Info,
    Warn,
    Error,
}

fn determine_log_level(status: &StatusCode) -> LogLevel {
    if status.is_server_error() {
        LogLevel::Error
    } else if status.is_client_error() {
        LogLevel::Warn
    } else {
        LogLevel::Info
    }
}
