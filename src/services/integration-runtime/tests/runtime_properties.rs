//! End-to-end behaviour of the runtime through its public facade

use async_trait::async_trait;
use integration_runtime::{
    config::{Config, SecurityConfig},
    models::{
        BatchConfig, BatchItem, BatchStatus, BatchType, ExecuteRequest, HealthStatus, Integration,
        IntegrationPatch, ItemStatus, Tool,
    },
    schema::Schema,
    IntegrationRuntime, Result, RuntimeError, SecurityManager, ToolHandler,
};
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

async fn create_runtime(dir: &TempDir) -> IntegrationRuntime {
    let mut config = Config::default();
    config.environment = "development".to_string();
    config.storage.root = dir.path().to_path_buf();
    config.security.sandbox_enabled = Some(false);
    config.health.enabled = false;
    config.health.check_timeout_seconds = 2;
    IntegrationRuntime::new(config).await.unwrap()
}

fn request(id: &str, tool: &str, params: Value) -> ExecuteRequest {
    ExecuteRequest {
        integration_id: id.to_string(),
        tool: tool.to_string(),
        params,
        permissions: Vec::new(),
    }
}

/// Fails while the switch is on
#[derive(Default)]
struct Flaky {
    failing: AtomicBool,
}

#[async_trait]
impl ToolHandler for Flaky {
    async fn handle(&self, _integration: &Integration, tool: &Tool, params: Value) -> Result<Value> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(RuntimeError::Execution(format!("{} is down", tool.name)));
        }
        Ok(json!({ "ok": true, "params": params }))
    }
}

#[tokio::test]
async fn test_duplicate_names_rejected_regardless_of_payload() {
    let dir = TempDir::new().unwrap();
    let runtime = create_runtime(&dir).await;

    let first = Integration::new("calendar", "1.0.0", "acme", vec![Tool::new("list", "")]);
    runtime.register(first).await.unwrap();

    let mut second = Integration::new("calendar", "9.9.9", "someone-else", vec![Tool::new("other", "")]);
    second.description = "entirely different".to_string();
    assert!(matches!(
        runtime.register(second).await,
        Err(RuntimeError::DuplicateName(name)) if name == "calendar"
    ));
    assert_eq!(runtime.store().len(), 1);
}

#[tokio::test]
async fn test_fixed_window_rate_limit() {
    let dir = TempDir::new().unwrap();
    let runtime = create_runtime(&dir).await;

    let tool = Tool::new("send", "").with_rate_limit(2, 60);
    let id = runtime
        .register(Integration::new("mailer", "1.0.0", "acme", vec![tool]))
        .await
        .unwrap()
        .id;

    tokio::time::pause();
    assert!(runtime.execute(request(&id, "send", json!({}))).await.success);
    assert!(runtime.execute(request(&id, "send", json!({}))).await.success);
    let third = runtime.execute(request(&id, "send", json!({}))).await;
    assert!(third.is_rate_limited());
    assert!(third.error.unwrap().retry_after.unwrap() <= 60);

    tokio::time::advance(Duration::from_secs(61)).await;
    assert!(runtime.execute(request(&id, "send", json!({}))).await.success);
    assert_eq!(
        runtime.dispatcher().rate_limiter().current_count(&id, "send"),
        Some(1)
    );
}

#[tokio::test]
async fn test_schema_validation_names_the_field() {
    let dir = TempDir::new().unwrap();
    let runtime = create_runtime(&dir).await;

    let tool = Tool::new("create", "").with_input_schema(Schema::object(
        [("title", Schema::string())],
        &["title"],
    ));
    let id = runtime
        .register(Integration::new("notes", "1.0.0", "acme", vec![tool]))
        .await
        .unwrap()
        .id;

    let missing = runtime.execute(request(&id, "create", json!({}))).await;
    let error = missing.error.unwrap();
    assert_eq!(error.code, "VALIDATION_ERROR");
    assert_eq!(error.field.as_deref(), Some("title"));
    assert!(error.message.contains("Missing required field: title"));

    let mistyped = runtime.execute(request(&id, "create", json!({ "title": 42 }))).await;
    assert!(mistyped
        .error
        .unwrap()
        .message
        .contains("Expected string, got number"));
}

#[tokio::test]
async fn test_batch_continue_on_error() {
    let dir = TempDir::new().unwrap();
    let runtime = Arc::new(create_runtime(&dir).await);

    let tool = Tool::new("process", "").with_input_schema(Schema::object(
        [("n", Schema::number())],
        &["n"],
    ));
    let id = runtime
        .register(Integration::new("pipeline", "1.0.0", "acme", vec![tool]))
        .await
        .unwrap()
        .id;

    struct FailsOnFive;
    #[async_trait]
    impl ToolHandler for FailsOnFive {
        async fn handle(&self, _: &Integration, _: &Tool, params: Value) -> Result<Value> {
            if params["n"] == json!(5) {
                return Err(RuntimeError::Execution("five".to_string()));
            }
            Ok(params)
        }
    }
    runtime.register_handler("pipeline", Arc::new(FailsOnFive));

    let items = (1..=10)
        .map(|n| BatchItem::execute(&id, "process", json!({ "n": n })))
        .collect();
    let batch = runtime.batch();
    let operation = batch
        .create(
            BatchType::Execute,
            items,
            Some(BatchConfig {
                concurrency: 3,
                continue_on_error: true,
                ..BatchConfig::default()
            }),
        )
        .unwrap();
    let finished = batch.run(&operation.id).await.unwrap();

    assert_eq!(finished.status, BatchStatus::Completed);
    let statuses: Vec<ItemStatus> = finished.results.iter().map(|r| r.status).collect();
    assert_eq!(statuses.iter().filter(|s| **s == ItemStatus::Success).count(), 9);
    assert_eq!(statuses.iter().filter(|s| **s == ItemStatus::Failed).count(), 1);
}

#[tokio::test]
async fn test_health_state_machine_recomputes_after_recovery() {
    let dir = TempDir::new().unwrap();
    let runtime = create_runtime(&dir).await;

    let flaky = Arc::new(Flaky::default());
    runtime.register_handler("probe", flaky.clone());
    let id = runtime
        .register(Integration::new("probe", "1.0.0", "acme", vec![Tool::new("ping", "")]))
        .await
        .unwrap()
        .id;

    flaky.failing.store(true, Ordering::SeqCst);
    let mut last = None;
    for _ in 0..3 {
        last = Some(runtime.health().check(&id).await.unwrap());
    }
    let unhealthy = last.unwrap();
    assert_eq!(unhealthy.status, HealthStatus::Unhealthy);
    assert_eq!(unhealthy.consecutive_failures, 3);

    flaky.failing.store(false, Ordering::SeqCst);
    let recovered = runtime.health().check(&id).await.unwrap();
    assert_eq!(recovered.consecutive_failures, 0);
    // error rate is still 3/4
    assert_eq!(recovered.status, HealthStatus::Degraded);
    runtime.shutdown();
}

#[tokio::test]
async fn test_update_batch_rollback_restores_config() {
    let dir = TempDir::new().unwrap();
    let runtime = create_runtime(&dir).await;

    let mut integration = Integration::new("settings", "1.0.0", "acme", vec![Tool::new("read", "")]);
    integration.config = Some(json!({ "foo": 1 }));
    let id = runtime.register(integration).await.unwrap().id;

    let batch = runtime.batch();
    let operation = batch
        .create(
            BatchType::Update,
            vec![
                BatchItem::update(
                    &id,
                    IntegrationPatch {
                        config: Some(json!({ "foo": 2 })),
                        ..Default::default()
                    },
                ),
                BatchItem::update(
                    "missing-integration",
                    IntegrationPatch {
                        config: Some(json!({ "foo": 3 })),
                        ..Default::default()
                    },
                ),
            ],
            Some(BatchConfig {
                concurrency: 1,
                continue_on_error: false,
                ..BatchConfig::default()
            }),
        )
        .unwrap();

    let finished = batch.run(&operation.id).await.unwrap();
    assert_eq!(finished.status, BatchStatus::Failed);
    assert_eq!(
        runtime.store().get(&id).unwrap().config,
        Some(json!({ "foo": 2 }))
    );

    let restored = batch.rollback(&operation.id).await.unwrap();
    assert_eq!(restored, 1);
    assert_eq!(
        runtime.store().get(&id).unwrap().config,
        Some(json!({ "foo": 1 }))
    );
}

#[test]
fn test_signature_round_trip_and_tamper_detection() {
    let key = b"publisher-key";
    let security = SecurityManager::new(
        SecurityConfig {
            signing_key: Some("publisher-key".to_string()),
            ..SecurityConfig::default()
        },
        true,
    );

    let mut integration = Integration::new("signed", "1.0.0", "acme", vec![Tool::new("run", "")]);
    integration.signature = Some(security.sign(&integration, key).unwrap());
    assert!(!security.verify(&integration));

    security.trust(&integration).unwrap();
    assert!(security.verify(&integration));

    let mut tampered = integration.clone();
    tampered.version = "1.0.1".to_string();
    assert!(!security.verify(&tampered));
}
