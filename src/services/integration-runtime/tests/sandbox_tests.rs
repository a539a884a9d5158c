//! Process sandbox tests
//!
//! Run the reference `integration-worker` binary through the full dispatch
//! path, both confined and in development mode.

use integration_runtime::{
    config::Config,
    models::{ExecuteRequest, ExecutionResult, Integration, Tool},
    server::IntegrationRuntime,
};
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use std::time::{Duration, Instant};
use tempfile::TempDir;

const WORKER: &str = env!("CARGO_BIN_EXE_integration-worker");

fn worker_tool(name: &str) -> Tool {
    Tool::new(name, format!("worker tool {}", name)).with_entrypoint(WORKER, Vec::<String>::new())
}

fn worker_integration() -> Integration {
    Integration::new(
        "worker-tools",
        "1.0.0",
        "acme",
        ["echo", "env", "fail", "crash", "garbage", "sleep"]
            .into_iter()
            .map(worker_tool)
            .collect(),
    )
}

async fn runtime(dir: &TempDir, sandboxed: bool) -> IntegrationRuntime {
    let mut config = Config::default();
    config.environment = if sandboxed { "staging" } else { "development" }.to_string();
    config.storage.root = dir.path().to_path_buf();
    config.security.sandbox_enabled = Some(sandboxed);
    config.security.max_execution_ms = 2_000;
    config.security.max_memory_mb = 1024;
    config.health.enabled = false;
    IntegrationRuntime::new(config).await.unwrap()
}

async fn call(runtime: &IntegrationRuntime, id: &str, tool: &str, params: Value) -> ExecutionResult {
    runtime
        .execute(ExecuteRequest {
            integration_id: id.to_string(),
            tool: tool.to_string(),
            params,
            permissions: Vec::new(),
        })
        .await
}

#[tokio::test]
async fn test_sandboxed_worker_round_trip() {
    let dir = TempDir::new().unwrap();
    let runtime = runtime(&dir, true).await;
    let id = runtime.register(worker_integration()).await.unwrap().id;

    let stored = runtime.store().get(&id).unwrap();
    assert!(stored.sandbox_config.is_some());

    let result = call(&runtime, &id, "echo", json!({ "message": "hi" })).await;
    assert!(result.success, "{:?}", result.error);
    let data = result.data.unwrap();
    assert_eq!(data["echo"], json!({ "message": "hi" }));
    assert_eq!(data["integration"], "worker-tools");
}

#[tokio::test]
async fn test_sandbox_environment_is_cleared() {
    let dir = TempDir::new().unwrap();
    let runtime = runtime(&dir, true).await;
    let id = runtime.register(worker_integration()).await.unwrap().id;

    let result = call(&runtime, &id, "env", json!({})).await;
    assert!(result.success, "{:?}", result.error);
    let vars = result.data.unwrap();
    assert_eq!(vars["SANDBOXED"], "1");
    assert_eq!(vars["INTEGRATION_ID"], id.as_str());
    assert_eq!(vars["INTEGRATION_NAME"], "worker-tools");
    assert!(vars.get("HOME").is_none());
    assert!(vars.get("PATH").is_some());
}

#[tokio::test]
async fn test_domain_policy_reaches_the_worker() {
    let dir = TempDir::new().unwrap();
    let mut config = Config::default();
    config.environment = "staging".to_string();
    config.storage.root = dir.path().to_path_buf();
    config.security.blocked_domains = vec!["*.internal".to_string(), "169.254.169.254".to_string()];
    config.security.max_memory_mb = 1024;
    config.health.enabled = false;
    let runtime = IntegrationRuntime::new(config).await.unwrap();
    let id = runtime.register(worker_integration()).await.unwrap().id;

    let result = call(&runtime, &id, "env", json!({})).await;
    assert!(result.success, "{:?}", result.error);
    let vars = result.data.unwrap();
    assert_eq!(vars["SANDBOX_BLOCKED_HOSTS"], "*.internal,169.254.169.254");
    // no network permission, so nothing is allowed
    assert!(vars.get("SANDBOX_ALLOWED_HOSTS").is_none());
}

#[tokio::test]
async fn test_worker_failures_are_classified() {
    let dir = TempDir::new().unwrap();
    let runtime = runtime(&dir, true).await;
    let id = runtime.register(worker_integration()).await.unwrap().id;

    let result = call(&runtime, &id, "fail", json!({ "message": "boom" })).await;
    assert!(!result.success);
    assert_eq!(result.error_code(), Some("EXECUTION_ERROR"));
    assert!(result.error.unwrap().message.contains("boom"));

    let result = call(&runtime, &id, "crash", json!({})).await;
    assert_eq!(result.error_code(), Some("WORKER_CRASHED"));

    let result = call(&runtime, &id, "garbage", json!({})).await;
    assert_eq!(result.error_code(), Some("WORKER_CRASHED"));
}

#[tokio::test]
async fn test_overrunning_worker_is_killed() {
    let dir = TempDir::new().unwrap();
    let runtime = runtime(&dir, true).await;
    let id = runtime.register(worker_integration()).await.unwrap().id;

    let started = Instant::now();
    let result = call(&runtime, &id, "sleep", json!({ "ms": 20_000 })).await;
    assert_eq!(result.error_code(), Some("EXECUTION_TIMEOUT"));
    assert!(started.elapsed() < Duration::from_secs(10));
}

#[tokio::test]
async fn test_development_mode_runs_unconfined() {
    let dir = TempDir::new().unwrap();
    let runtime = runtime(&dir, false).await;
    let id = runtime.register(worker_integration()).await.unwrap().id;

    assert!(runtime.store().get(&id).unwrap().sandbox_config.is_none());

    let result = call(&runtime, &id, "env", json!({})).await;
    assert!(result.success, "{:?}", result.error);
    assert!(result.data.unwrap().get("SANDBOXED").is_none());

    let events = runtime.security().security_events();
    assert!(!events.is_empty());
}
