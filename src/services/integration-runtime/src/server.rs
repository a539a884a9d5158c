//! Integration Runtime Server Module
//!
//! Composes every runtime component once, exposes the registration
//! lifecycle that spans several of them, and serves the HTTP and WebSocket
//! surfaces.

use crate::{
    alerts::AlertManager,
    batch::BatchEngine,
    config::Config,
    dispatcher::{RequestDispatcher, ToolHandler},
    events::EventBus,
    handlers,
    health::HealthMonitor,
    middleware,
    models::{ExecuteRequest, ExecutionResult, Integration, IntegrationPatch, RegisterResponse},
    security::SecurityManager,
    store::IntegrationStore,
    websocket::{self, WebSocketHub},
    Result, RuntimeError,
};
use axum::{
    extract::DefaultBodyLimit,
    http::{
        header::{AUTHORIZATION, CONTENT_TYPE},
        HeaderValue, Method,
    },
    middleware as axum_middleware,
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::{
    compression::CompressionLayer,
    cors::{Any, CorsLayer},
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    trace::TraceLayer,
};
use tracing::{error, info, warn};
use uuid::Uuid;

/// The runtime: owns every component and the event channels between them
#[derive(Debug)]
pub struct IntegrationRuntime {
    config: Config,
    events: EventBus,
    store: Arc<IntegrationStore>,
    security: Arc<SecurityManager>,
    dispatcher: Arc<RequestDispatcher>,
    alerts: Arc<AlertManager>,
    health: Arc<HealthMonitor>,
    batch: Arc<BatchEngine>,
    started_at: Instant,
}

/// Application state shared across handlers
#[derive(Debug, Clone)]
pub struct AppState {
    pub runtime: Arc<IntegrationRuntime>,
    pub hub: Arc<WebSocketHub>,
}

impl IntegrationRuntime {
    /// Build every component and load persisted integrations.
    ///
    /// An unreadable storage root aborts construction.
    pub async fn new(config: Config) -> Result<Self> {
        config
            .check()
            .map_err(|e| RuntimeError::Config(format!("{:#}", e)))?;

        let sandbox_enabled = config.sandbox_enabled();
        info!(
            environment = %config.environment,
            sandbox_enabled,
            storage_root = %config.storage.root.display(),
            "Initializing integration runtime"
        );
        if !sandbox_enabled {
            warn!("Sandbox disabled: tool entrypoints run without isolation");
        }

        let events = EventBus::new();
        let store = Arc::new(IntegrationStore::open(&config.storage.root, events.clone()).await?);
        let security = Arc::new(SecurityManager::new(config.security.clone(), sandbox_enabled));
        let dispatcher = Arc::new(RequestDispatcher::new(
            Arc::clone(&store),
            Arc::clone(&security),
        ));
        let alerts = Arc::new(
            AlertManager::new(&config.health, events.clone()).with_security(Arc::clone(&security)),
        );
        let health = Arc::new(HealthMonitor::new(
            Arc::clone(&store),
            Arc::clone(&dispatcher),
            Arc::clone(&alerts),
            events.clone(),
            config.health.clone(),
        ));
        let batch = Arc::new(BatchEngine::new(
            Arc::clone(&store),
            Arc::clone(&security),
            Arc::clone(&dispatcher),
            events.clone(),
            config.batch.clone(),
        ));

        let runtime = Self {
            config,
            events,
            store,
            security,
            dispatcher,
            alerts,
            health,
            batch,
            started_at: Instant::now(),
        };

        if runtime.config.health.enabled {
            for integration in runtime.store.list() {
                runtime.health.start_monitoring(&integration.id)?;
            }
        }

        info!(
            integrations = runtime.store.len(),
            "Integration runtime initialized"
        );
        Ok(runtime)
    }

    /// Validate, sandbox and persist an integration, then start monitoring it
    pub async fn register(&self, mut integration: Integration) -> Result<RegisterResponse> {
        if integration.id.is_empty() {
            integration.id = Uuid::new_v4().to_string();
        }
        let report = self.security.validate(&integration)?;
        let integration = self.security.sandbox(integration);
        let id = self.store.register(integration).await?;

        if self.config.health.enabled {
            self.health.start_monitoring(&id)?;
        }

        Ok(RegisterResponse {
            id,
            status: "registered".to_string(),
            warnings: report.warnings,
        })
    }

    /// Apply a partial update; the result is validated and re-sandboxed
    pub async fn update(&self, id: &str, patch: &IntegrationPatch) -> Result<Integration> {
        let mut integration = self
            .store
            .get(id)
            .ok_or_else(|| RuntimeError::not_found("Integration", id))?;
        patch.apply_to(&mut integration);

        self.security.validate(&integration)?;
        let integration = self.security.sandbox(integration);
        let updated = self.store.replace(id, integration).await?;

        if let Some(enabled) = patch.enabled {
            self.store.set_enabled(id, enabled).await?;
        }
        Ok(updated)
    }

    /// Remove an integration and every piece of state kept for it
    pub async fn unregister(&self, id: &str) -> Result<Integration> {
        let integration = self.store.unregister(id).await?;
        self.health.forget(id);
        self.dispatcher.forget(id);
        Ok(integration)
    }

    pub async fn execute(&self, request: ExecuteRequest) -> ExecutionResult {
        self.dispatcher.execute(request).await
    }

    /// Route calls for `integration_name` to an in-process handler
    pub fn register_handler(&self, integration_name: impl Into<String>, handler: Arc<dyn ToolHandler>) {
        self.dispatcher.register_handler(integration_name, handler);
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn store(&self) -> &Arc<IntegrationStore> {
        &self.store
    }

    pub fn security(&self) -> &Arc<SecurityManager> {
        &self.security
    }

    pub fn dispatcher(&self) -> &Arc<RequestDispatcher> {
        &self.dispatcher
    }

    pub fn alerts(&self) -> &Arc<AlertManager> {
        &self.alerts
    }

    pub fn health(&self) -> &Arc<HealthMonitor> {
        &self.health
    }

    pub fn batch(&self) -> &Arc<BatchEngine> {
        &self.batch
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    /// Stop timers, escalations and running batches
    pub fn shutdown(&self) {
        info!("Shutting down integration runtime");
        self.health.shutdown();
        self.alerts.shutdown();
        self.batch.shutdown();
    }

    /// Serve the HTTP API and, when configured, the monitor WebSocket until a shutdown signal
    pub async fn serve(self: Arc<Self>) -> Result<()> {
        let state = AppState::new(Arc::clone(&self));
        let shutdown = CancellationToken::new();

        let listener = TcpListener::bind(self.config.server_address())
            .await
            .map_err(|e| RuntimeError::Internal(format!("Failed to bind to address: {}", e)))?;
        info!(address = %self.config.server_address(), "Integration runtime listening");

        let monitor = match self.config.monitor_address() {
            Some(address) => {
                let listener = TcpListener::bind(&address).await.map_err(|e| {
                    RuntimeError::Internal(format!("Failed to bind monitor address: {}", e))
                })?;
                info!(address = %address, "Monitor WebSocket listening");
                let app = create_monitor_router(state.clone());
                let token = shutdown.clone();
                Some(tokio::spawn(async move {
                    axum::serve(listener, app)
                        .with_graceful_shutdown(token.cancelled_owned())
                        .await
                }))
            }
            None => None,
        };

        let signal_token = shutdown.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            signal_token.cancel();
        });

        let app = create_router(state);
        let served = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown.clone().cancelled_owned())
            .await;

        shutdown.cancel();
        if let Some(handle) = monitor {
            match handle.await {
                Ok(Err(e)) => error!(error = %e, "Monitor listener failed"),
                Err(e) => error!(error = %e, "Monitor listener task panicked"),
                Ok(Ok(())) => {}
            }
        }
        self.shutdown();

        served.map_err(|e| RuntimeError::Internal(format!("Server error: {}", e)))
    }
}

impl AppState {
    pub fn new(runtime: Arc<IntegrationRuntime>) -> Self {
        Self {
            runtime,
            hub: Arc::new(WebSocketHub::new()),
        }
    }

    pub fn runtime(&self) -> &Arc<IntegrationRuntime> {
        &self.runtime
    }

    pub fn is_development(&self) -> bool {
        self.runtime.config().is_development()
    }
}

/// Build the HTTP router with all routes and middleware
pub fn create_router(state: AppState) -> Router {
    let max_body = state.runtime.config().server.max_body_bytes;
    let cors = cors_layer(&state.runtime.config().server.cors_origins);

    Router::new()
        // Health and status
        .route("/health", get(handlers::health::health_check))
        .route("/health/integrations", get(handlers::health::all_integration_health))
        .route("/config", get(handlers::config::get_config))
        // Integrations
        .route("/integrations", get(handlers::integrations::list_integrations))
        .route(
            "/integrations/register",
            post(handlers::integrations::register_integration),
        )
        .route(
            "/integrations/search",
            get(handlers::integrations::search_integrations),
        )
        .route(
            "/integrations/:id",
            get(handlers::integrations::get_integration)
                .put(handlers::integrations::update_integration)
                .delete(handlers::integrations::unregister_integration),
        )
        .route(
            "/integrations/:id/health",
            get(handlers::health::integration_health).post(handlers::health::check_integration_health),
        )
        // Execution
        .route("/execute", post(handlers::execute::execute_tool))
        // Batches
        .route(
            "/batch",
            get(handlers::batch::list_batches).post(handlers::batch::create_batch),
        )
        .route(
            "/batch/:id",
            get(handlers::batch::get_batch).delete(handlers::batch::delete_batch),
        )
        .route("/batch/:id/run", post(handlers::batch::run_batch))
        .route("/batch/:id/cancel", post(handlers::batch::cancel_batch))
        .route("/batch/:id/rollback", post(handlers::batch::rollback_batch))
        // Alerts
        .route("/alerts", get(handlers::alerts::list_alerts))
        .route(
            "/alerts/:id/acknowledge",
            post(handlers::alerts::acknowledge_alert),
        )
        // Real-time channel
        .route("/ws", get(websocket::websocket_handler))
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
                .layer(PropagateRequestIdLayer::x_request_id())
                .layer(TraceLayer::new_for_http())
                .layer(CompressionLayer::new())
                .layer(cors)
                .layer(DefaultBodyLimit::max(max_body))
                .layer(axum_middleware::from_fn_with_state(
                    state.clone(),
                    middleware::request_logging::request_logging_middleware,
                )),
        )
        .with_state(state)
}

/// Router served on the monitor port: health and the event WebSocket only
pub fn create_monitor_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(websocket::websocket_handler))
        .route("/ws", get(websocket::websocket_handler))
        .route("/health", get(handlers::health::health_check))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let layer = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
        .allow_headers([AUTHORIZATION, CONTENT_TYPE]);

    if origins.is_empty() || origins.iter().any(|origin| origin == "*") {
        return layer.allow_origin(Any);
    }

    let allowed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match origin.parse() {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(origin = %origin, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();
    layer.allow_origin(allowed)
}

/// Wait for shutdown signal
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        },
        _ = terminate => {
            info!("Received terminate signal");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Tool;
    use serde_json::json;
    use tempfile::TempDir;

    async fn create_test_runtime(dir: &TempDir) -> IntegrationRuntime {
        let mut config = Config::default();
        config.environment = "development".to_string();
        config.storage.root = dir.path().to_path_buf();
        config.security.sandbox_enabled = Some(false);
        IntegrationRuntime::new(config).await.unwrap()
    }

    #[tokio::test]
    async fn test_register_starts_monitoring_and_unregister_stops_it() {
        let dir = TempDir::new().unwrap();
        let runtime = create_test_runtime(&dir).await;

        let integration = Integration::new("notes", "1.0.0", "acme", vec![Tool::new("create", "")]);
        let response = runtime.register(integration).await.unwrap();
        assert_eq!(response.status, "registered");
        assert!(runtime.health().is_monitoring(&response.id));

        let result = runtime
            .execute(ExecuteRequest {
                integration_id: response.id.clone(),
                tool: "create".to_string(),
                params: json!({ "title": "hi" }),
                permissions: Vec::new(),
            })
            .await;
        assert!(result.success);
        assert_eq!(runtime.dispatcher().counters(&response.id).calls, 1);

        runtime.unregister(&response.id).await.unwrap();
        assert!(!runtime.health().is_monitoring(&response.id));
        assert_eq!(runtime.dispatcher().counters(&response.id).calls, 0);
        assert!(runtime.store().get(&response.id).is_none());
        runtime.shutdown();
    }

    #[tokio::test]
    async fn test_update_revalidates() {
        let dir = TempDir::new().unwrap();
        let runtime = create_test_runtime(&dir).await;

        let integration = Integration::new("notes", "1.0.0", "acme", vec![Tool::new("create", "")]);
        let id = runtime.register(integration).await.unwrap().id;

        let bad = IntegrationPatch {
            version: Some("one".to_string()),
            ..Default::default()
        };
        assert!(matches!(
            runtime.update(&id, &bad).await,
            Err(RuntimeError::InvalidVersion(_))
        ));

        let good = IntegrationPatch {
            version: Some("1.1.0".to_string()),
            enabled: Some(false),
            ..Default::default()
        };
        let updated = runtime.update(&id, &good).await.unwrap();
        assert_eq!(updated.version, "1.1.0");
        assert!(!runtime.store().is_enabled(&id));
        runtime.shutdown();
    }

    #[tokio::test]
    async fn test_loaded_integrations_are_monitored() {
        let dir = TempDir::new().unwrap();
        let id = {
            let runtime = create_test_runtime(&dir).await;
            let integration = Integration::new("notes", "1.0.0", "acme", vec![Tool::new("create", "")]);
            let id = runtime.register(integration).await.unwrap().id;
            runtime.shutdown();
            id
        };

        let runtime = create_test_runtime(&dir).await;
        assert!(runtime.store().contains(&id));
        assert!(runtime.health().is_monitoring(&id));
        runtime.shutdown();
    }

    #[tokio::test]
    async fn test_production_refuses_disabled_sandbox() {
        let dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.environment = "production".to_string();
        config.storage.root = dir.path().to_path_buf();
        config.security.sandbox_enabled = Some(false);

        assert!(matches!(
            IntegrationRuntime::new(config).await,
            Err(RuntimeError::Config(_))
        ));
    }

    #[test]
    fn test_cors_layer_accepts_origin_lists() {
        let _ = cors_layer(&[]);
        let _ = cors_layer(&["https://app.example.com".to_string(), "not a header\n".to_string()]);
    }
}
