//! HTTP Request Handlers Module
//!
//! Handlers are grouped by area. Every failure is returned as a structured
//! `RuntimeError` response; nothing panics across the API boundary.

use crate::RuntimeError;
use axum::extract::{rejection::JsonRejection, FromRequest};

pub mod alerts;
pub mod batch;
pub mod config;
pub mod execute;
pub mod health;
pub mod integrations;

/// JSON body extractor that rejects malformed bodies with the runtime's
/// own error envelope instead of axum's plain-text response
#[derive(Debug, FromRequest)]
#[from_request(via(axum::Json), rejection(RuntimeError))]
pub struct ApiJson<T>(pub T);

impl From<JsonRejection> for RuntimeError {
    fn from(rejection: JsonRejection) -> Self {
        RuntimeError::validation("body", rejection.body_text())
    }
}
