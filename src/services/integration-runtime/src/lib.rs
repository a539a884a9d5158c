//! Integration Runtime Library
//!
//! This library loads third-party integrations (plugins exposing callable tools),
//! executes their tools on behalf of a host application, and protects the host
//! from malicious or buggy plugin code.
//!
//! # Features
//!
//! - **Integration Store**: Durable registry of integrations and their manifests
//! - **Security Manager**: Manifest validation, signatures, domain policy and sandboxing
//! - **Request Dispatcher**: Rate limiting, schema validation and tool dispatch
//! - **Batch Engine**: Bounded-concurrency execution with snapshot/rollback
//! - **Health Monitor**: Periodic probing, status derivation, alerts and escalation
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐    ┌─────────────────┐    ┌─────────────────┐
//! │  Host / HTTP /  │────│  Runtime Server │────│   Dispatcher    │
//! │   WebSocket     │    │     Facade      │    │                 │
//! └─────────────────┘    └─────────────────┘    └─────────────────┘
//!                          │      │      │              │
//!                 ┌────────┘      │      └────────┐     │
//!          ┌─────────────┐ ┌─────────────┐ ┌─────────────┐
//!          │ Batch Engine│ │Health Monitor│ │  Security   │
//!          └─────────────┘ └─────────────┘ │   Manager   │
//!                                          └─────────────┘
//!                          ┌─────────────────┐
//!                          │Integration Store│
//!                          └─────────────────┘
//! ```

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Integration runtime error types
#[derive(Error, Debug)]
pub enum RuntimeError {
    /// Input or schema validation failure
    #[error("Validation error: {message}")]
    Validation {
        field: Option<String>,
        message: String,
    },

    /// Manifest is missing mandatory fields or is malformed
    #[error("Invalid manifest: {0}")]
    InvalidManifest(String),

    /// Version is not MAJOR.MINOR.PATCH
    #[error("Invalid version '{0}': expected MAJOR.MINOR.PATCH")]
    InvalidVersion(String),

    /// Integration declares no tools
    #[error("Integration '{0}' declares no tools")]
    NoTools(String),

    /// Permission outside of the closed vocabulary
    #[error("Invalid permission: {0}")]
    InvalidPermission(String),

    /// Deployment policy requires a signature and none was supplied
    #[error("Integration '{0}' must be signed")]
    SignatureRequired(String),

    /// Signature is not trusted
    #[error("Invalid signature for integration '{0}'")]
    InvalidSignature(String),

    /// Entity not found
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// Another live integration already uses this name
    #[error("Integration with name '{0}' already exists")]
    DuplicateName(String),

    /// Policy violation
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Fixed-window rate limit exhausted
    #[error("Rate limit exceeded, retry after {retry_after_secs}s")]
    RateLimitExceeded { retry_after_secs: u64 },

    /// Tool execution failure
    #[error("Execution error: {0}")]
    Execution(String),

    /// Tool execution exceeded its wall-clock budget
    #[error("Execution timed out after {0}ms")]
    ExecutionTimeout(u64),

    /// Isolated worker exited without producing a result
    #[error("Worker crashed: {0}")]
    WorkerCrashed(String),

    /// Durable storage failure
    #[error("Storage error: {0}")]
    Storage(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Generic error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Type alias for Result with RuntimeError
pub type Result<T> = std::result::Result<T, RuntimeError>;

impl RuntimeError {
    /// Build a validation error bound to a field
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            field: Some(field.into()),
            message: message.into(),
        }
    }

    /// Build a not-found error
    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    /// Stable machine-readable error code
    pub fn error_code(&self) -> &'static str {
        match self {
            RuntimeError::Validation { .. } => "VALIDATION_ERROR",
            RuntimeError::InvalidManifest(_) => "INVALID_MANIFEST",
            RuntimeError::InvalidVersion(_) => "INVALID_VERSION",
            RuntimeError::NoTools(_) => "NO_TOOLS",
            RuntimeError::InvalidPermission(_) => "INVALID_PERMISSION",
            RuntimeError::SignatureRequired(_) => "SIGNATURE_REQUIRED",
            RuntimeError::InvalidSignature(_) => "INVALID_SIGNATURE",
            RuntimeError::NotFound { .. } => "NOT_FOUND",
            RuntimeError::DuplicateName(_) => "DUPLICATE_NAME",
            RuntimeError::PermissionDenied(_) => "PERMISSION_DENIED",
            RuntimeError::RateLimitExceeded { .. } => "RATE_LIMIT_EXCEEDED",
            RuntimeError::Execution(_) => "EXECUTION_ERROR",
            RuntimeError::ExecutionTimeout(_) => "EXECUTION_TIMEOUT",
            RuntimeError::WorkerCrashed(_) => "WORKER_CRASHED",
            RuntimeError::Storage(_) => "STORAGE_ERROR",
            RuntimeError::Config(_) => "CONFIG_ERROR",
            RuntimeError::Io(_) => "IO_ERROR",
            RuntimeError::Serialization(_) => "SERIALIZATION_ERROR",
            RuntimeError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// HTTP status that should be returned for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            RuntimeError::Validation { .. }
            | RuntimeError::InvalidManifest(_)
            | RuntimeError::InvalidVersion(_)
            | RuntimeError::NoTools(_)
            | RuntimeError::InvalidPermission(_)
            | RuntimeError::SignatureRequired(_)
            | RuntimeError::InvalidSignature(_)
            | RuntimeError::Serialization(_) => StatusCode::BAD_REQUEST,
            RuntimeError::NotFound { .. } => StatusCode::NOT_FOUND,
            RuntimeError::DuplicateName(_) => StatusCode::CONFLICT,
            RuntimeError::PermissionDenied(_) => StatusCode::FORBIDDEN,
            RuntimeError::RateLimitExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            RuntimeError::Execution(_) | RuntimeError::WorkerCrashed(_) => StatusCode::BAD_GATEWAY,
            RuntimeError::ExecutionTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            RuntimeError::Storage(_)
            | RuntimeError::Config(_)
            | RuntimeError::Io(_)
            | RuntimeError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether a caller may retry the same request
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RuntimeError::RateLimitExceeded { .. }
                | RuntimeError::Execution(_)
                | RuntimeError::ExecutionTimeout(_)
                | RuntimeError::WorkerCrashed(_)
        )
    }

    /// Seconds the caller should wait before retrying, if known
    pub fn retry_after(&self) -> Option<u64> {
        match self {
            RuntimeError::RateLimitExceeded { retry_after_secs } => Some(*retry_after_secs),
            _ => None,
        }
    }
}

impl IntoResponse for RuntimeError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let mut error = json!({
            "code": self.error_code(),
            "message": self.to_string(),
        });
        if let RuntimeError::Validation {
            field: Some(field), ..
        } = &self
        {
            error["field"] = json!(field);
        }
        if let Some(retry_after) = self.retry_after() {
            error["retry_after"] = json!(retry_after);
        }
        (status, Json(json!({ "error": error }))).into_response()
    }
}

// Public modules
pub mod alerts;
pub mod batch;
pub mod config;
pub mod dispatcher;
pub mod events;
pub mod handlers;
pub mod health;
pub mod middleware;
pub mod models;
pub mod rate_limit;
pub mod schema;
pub mod security;
pub mod server;
pub mod store;
pub mod telemetry;
pub mod websocket;

// Re-exports for convenience
pub use alerts::AlertManager;
pub use batch::BatchEngine;
pub use config::Config;
pub use dispatcher::{RequestDispatcher, ToolHandler};
pub use events::EventBus;
pub use health::HealthMonitor;
pub use models::{
    BatchConfig, BatchItem, BatchOperation, BatchStatus, BatchType, Category, ExecutionResult,
    Integration, IntegrationHealth, HealthStatus, Permission, Tool,
};
pub use security::SecurityManager;
pub use server::{AppState, IntegrationRuntime};
pub use store::IntegrationStore;
