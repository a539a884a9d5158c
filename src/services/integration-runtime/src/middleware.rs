//! Middleware Module
//!
//! HTTP middleware for cross-cutting concerns of the runtime API.

pub mod request_logging;

pub use request_logging::*;
