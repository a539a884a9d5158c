//! Telemetry Module
//!
//! Structured logging setup and span helpers shared by the runtime components.

use crate::{config::LoggingConfig, Result, RuntimeError};
use tracing::info;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

/// Initialize tracing and logging. `RUST_LOG` wins over the configured level.
pub fn init_tracing(config: &LoggingConfig) -> Result<()> {
    let log_level = config.level.as_str();
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .map_err(|e| RuntimeError::Config(format!("Invalid log level {}: {}", log_level, e)))?;

    let layer = fmt::layer()
        .with_span_events(FmtSpan::CLOSE)
        .with_target(true)
        .with_thread_ids(true);

    let console_layer = match config.format.as_str() {
        "json" => layer.json().boxed(),
        "pretty" => layer.pretty().boxed(),
        _ => layer.compact().boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .try_init()
        .map_err(|e| RuntimeError::Config(format!("Tracing already initialized: {}", e)))?;

    info!(
        log_level = log_level,
        format = %config.format,
        "Tracing initialized"
    );
    Ok(())
}

/// Span for one HTTP request
pub fn create_request_span(method: &str, path: &str, request_id: &str) -> tracing::Span {
    tracing::info_span!(
        "http_request",
        method = method,
        path = path,
        request_id = request_id,
        status_code = tracing::field::Empty,
        response_time_ms = tracing::field::Empty,
    )
}

/// Span for one health probe
pub fn create_health_check_span(integration_id: &str, integration_name: &str) -> tracing::Span {
    tracing::info_span!(
        "health_check",
        integration_id = integration_id,
        integration_name = integration_name,
        status = tracing::field::Empty,
        response_time_ms = tracing::field::Empty,
    )
}

/// Span for one tool invocation
pub fn create_execution_span(integration_id: &str, tool: &str) -> tracing::Span {
    tracing::debug_span!(
        "tool_execution",
        integration_id = integration_id,
        tool = tool,
        success = tracing::field::Empty,
        duration_ms = tracing::field::Empty,
    )
}

/// Span for one batch run
pub fn create_batch_span(operation_id: &str, batch_type: &str, items: usize) -> tracing::Span {
    tracing::info_span!(
        "batch_operation",
        operation_id = operation_id,
        batch_type = batch_type,
        items = items,
        status = tracing::field::Empty,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_span_creation() {
        let span = create_request_span("GET", "/health", "test-request-id");
        if let Some(metadata) = span.metadata() {
            assert_eq!(metadata.name(), "http_request");
        }

        let span = create_health_check_span("integration-id", "notes");
        if let Some(metadata) = span.metadata() {
            assert_eq!(metadata.name(), "health_check");
        }

        let span = create_batch_span("op", "execute", 3);
        if let Some(metadata) = span.metadata() {
            assert_eq!(metadata.name(), "batch_operation");
        }
    }
}
