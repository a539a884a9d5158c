//! Request Dispatcher
//!
//! Resolves the target tool, applies rate limiting, input validation and
//! permission checks, then routes the call to a custom handler, a worker
//! process or the default executor. Every failure is folded into an
//! [`ExecutionResult`]; nothing escapes as an error.

use crate::{
    models::{
        ExecuteRequest, ExecutionFailure, ExecutionMetrics, ExecutionResult, Integration, Tool,
    },
    rate_limit::RateLimiter,
    security::{SecurityManager, WorkerContext, WorkerRequest},
    store::IntegrationStore,
    Result, RuntimeError,
};
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// In-process implementation of an integration's tools
#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn handle(&self, integration: &Integration, tool: &Tool, params: Value) -> Result<Value>;
}

/// Per-integration call counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchCounters {
    pub calls: u64,
    pub failures: u64,
}

/// Request dispatcher
pub struct RequestDispatcher {
    store: Arc<IntegrationStore>,
    security: Arc<SecurityManager>,
    rate_limiter: RateLimiter,
    /// Custom handlers keyed by integration name
    handlers: DashMap<String, Arc<dyn ToolHandler>>,
    counters: DashMap<String, DispatchCounters>,
}

impl std::fmt::Debug for RequestDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestDispatcher")
            .field("handlers", &self.handlers.len())
            .field("rate_limit_windows", &self.rate_limiter.len())
            .finish()
    }
}

impl RequestDispatcher {
    pub fn new(store: Arc<IntegrationStore>, security: Arc<SecurityManager>) -> Self {
        Self {
            store,
            security,
            rate_limiter: RateLimiter::new(),
            handlers: DashMap::new(),
            counters: DashMap::new(),
        }
    }

    /// Register a handler that takes precedence for every tool of `integration_name`
    pub fn register_handler(&self, integration_name: impl Into<String>, handler: Arc<dyn ToolHandler>) {
        let name = integration_name.into();
        info!(integration_name = %name, "Custom tool handler registered");
        self.handlers.insert(name, handler);
    }

    pub fn remove_handler(&self, integration_name: &str) -> bool {
        self.handlers.remove(integration_name).is_some()
    }

    /// Invoke a tool with no declared capabilities
    pub async fn execute_tool(&self, integration_id: &str, tool: &str, params: Value) -> ExecutionResult {
        self.execute(ExecuteRequest {
            integration_id: integration_id.to_string(),
            tool: tool.to_string(),
            params,
            permissions: Vec::new(),
        })
        .await
    }

    /// Invoke a tool; always returns a structured result
    pub async fn execute(&self, request: ExecuteRequest) -> ExecutionResult {
        let start_time = Utc::now();
        let started = Instant::now();

        let outcome = self.try_execute(&request).await;

        let duration_ms = started.elapsed().as_millis() as u64;
        let metrics = ExecutionMetrics {
            start_time,
            end_time: Utc::now(),
            duration_ms,
        };

        match outcome {
            Ok(data) => {
                debug!(
                    integration_id = %request.integration_id,
                    tool = %request.tool,
                    duration_ms,
                    "Tool executed"
                );
                ExecutionResult {
                    success: true,
                    data: Some(data),
                    error: None,
                    metrics,
                }
            }
            Err(error) => {
                debug!(
                    integration_id = %request.integration_id,
                    tool = %request.tool,
                    error = %error,
                    "Tool execution failed"
                );
                ExecutionResult {
                    success: false,
                    data: None,
                    error: Some(failure_of(&error)),
                    metrics,
                }
            }
        }
    }

    /// Invoke a tool and keep the typed error, so callers can tell
    /// retryable failures from terminal ones
    pub async fn try_execute(&self, request: &ExecuteRequest) -> Result<Value> {
        let outcome = self.dispatch(request).await;

        // Unknown ids never get a counter entry; only registered integrations are tracked.
        if self.store.contains(&request.integration_id) {
            let mut counters = self
                .counters
                .entry(request.integration_id.clone())
                .or_default();
            counters.calls += 1;
            if outcome.is_err() {
                counters.failures += 1;
            }
        }

        outcome
    }

    async fn dispatch(&self, request: &ExecuteRequest) -> Result<Value> {
        let integration = self
            .store
            .get(&request.integration_id)
            .ok_or_else(|| RuntimeError::not_found("Integration", &request.integration_id))?;
        if !self.store.is_enabled(&integration.id) {
            return Err(RuntimeError::PermissionDenied(format!(
                "integration '{}' is disabled",
                integration.name
            )));
        }
        let tool = integration.tool(&request.tool).ok_or_else(|| {
            RuntimeError::not_found("Tool", format!("{}/{}", integration.name, request.tool))
        })?;

        if let Some(limit) = &tool.rate_limit {
            self.rate_limiter.check(&integration.id, &tool.name, limit)?;
        }

        tool.input_schema.validate(&request.params)?;

        for permission in request.permissions.iter().chain(tool.permissions.iter()) {
            self.security.require_permission(&integration, permission)?;
        }

        let data = self.route(&integration, tool, request.params.clone()).await?;

        if let Some(schema) = &tool.output_schema {
            if let Err(error) = schema.validate(&data) {
                warn!(
                    integration_id = %integration.id,
                    tool = %tool.name,
                    error = %error,
                    "Tool output does not match its schema"
                );
            }
        }

        Ok(data)
    }

    async fn route(&self, integration: &Integration, tool: &Tool, params: Value) -> Result<Value> {
        let handler = self
            .handlers
            .get(&integration.name)
            .map(|entry| Arc::clone(entry.value()));
        if let Some(handler) = handler {
            return handler.handle(integration, tool, params).await;
        }

        if let Some(entrypoint) = &tool.entrypoint {
            let request = WorkerRequest {
                tool: tool.name.clone(),
                params,
                context: WorkerContext {
                    integration_id: integration.id.clone(),
                    integration_name: integration.name.clone(),
                    request_id: Uuid::new_v4().to_string(),
                    config: integration.config.clone(),
                },
            };

            return match &integration.sandbox_config {
                Some(sandbox) => {
                    self.security
                        .execute_isolated(entrypoint, &request, sandbox)
                        .await
                }
                None if self.security.sandbox_enabled() => {
                    let sandbox = self.security.sandbox_config_for(integration);
                    self.security
                        .execute_isolated(entrypoint, &request, &sandbox)
                        .await
                }
                None => self.security.execute_unconfined(entrypoint, &request).await,
            };
        }

        Ok(default_execution(tool, params))
    }

    /// Call counters for one integration
    pub fn counters(&self, integration_id: &str) -> DispatchCounters {
        self.counters
            .get(integration_id)
            .map(|entry| *entry)
            .unwrap_or_default()
    }

    /// Drop per-integration state after unregistration
    pub fn forget(&self, integration_id: &str) {
        self.counters.remove(integration_id);
        self.rate_limiter.reset(integration_id);
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.rate_limiter
    }
}

fn default_execution(tool: &Tool, params: Value) -> Value {
    json!({
        "tool": tool.name,
        "echo": params,
        "executed_at": Utc::now(),
    })
}

fn failure_of(error: &RuntimeError) -> ExecutionFailure {
    let field = match error {
        RuntimeError::Validation { field, .. } => field.clone(),
        _ => None,
    };
    ExecutionFailure {
        code: error.error_code().to_string(),
        message: error.to_string(),
        field,
        retry_after: error.retry_after(),
    }
}
