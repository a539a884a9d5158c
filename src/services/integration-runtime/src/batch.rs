//! Batch Engine
//!
//! Runs many items under one policy. Items are split into chunks of
//! `concurrency`; chunks run strictly in order while the items of a chunk run
//! concurrently. Cancellation and memory pressure are checked at chunk
//! boundaries. Snapshots of every touched integration are kept so that
//! state-changing batches can be rolled back.

use crate::{
    config::BatchSettings,
    dispatcher::RequestDispatcher,
    events::{BatchEvent, EventBus},
    models::{
        BatchConfig, BatchItem, BatchOperation, BatchProgress, BatchResult, BatchStatus,
        BatchType, ExecuteRequest, Integration, IntegrationPatch, ItemStatus, Snapshot,
        SnapshotPhase,
    },
    security::SecurityManager,
    store::IntegrationStore,
    telemetry::create_batch_span,
    Result, RuntimeError,
};
use chrono::Utc;
use dashmap::DashMap;
use futures::future::join_all;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use sysinfo::{Pid, System};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};
use uuid::Uuid;
use validator::Validate;

/// Batch engine
#[derive(Debug)]
pub struct BatchEngine {
    store: Arc<IntegrationStore>,
    security: Arc<SecurityManager>,
    dispatcher: Arc<RequestDispatcher>,
    events: EventBus,
    settings: BatchSettings,
    operations: DashMap<String, BatchOperation>,
    snapshots: DashMap<String, Vec<Snapshot>>,
    cancellations: DashMap<String, CancellationToken>,
    system: Mutex<System>,
}

impl BatchEngine {
    pub fn new(
        store: Arc<IntegrationStore>,
        security: Arc<SecurityManager>,
        dispatcher: Arc<RequestDispatcher>,
        events: EventBus,
        settings: BatchSettings,
    ) -> Self {
        Self {
            store,
            security,
            dispatcher,
            events,
            settings,
            operations: DashMap::new(),
            snapshots: DashMap::new(),
            cancellations: DashMap::new(),
            system: Mutex::new(System::new()),
        }
    }

    /// Create a pending operation and capture the pre-run snapshot
    pub fn create(
        &self,
        batch_type: BatchType,
        mut items: Vec<BatchItem>,
        config: Option<BatchConfig>,
    ) -> Result<BatchOperation> {
        let config = config.unwrap_or_else(|| BatchConfig {
            concurrency: self.settings.default_concurrency,
            ..BatchConfig::default()
        });
        config
            .validate()
            .map_err(|e| RuntimeError::validation("config", e.to_string()))?;

        if items.is_empty() {
            return Err(RuntimeError::validation("items", "Batch has no items"));
        }
        if self.operations.len() >= self.settings.max_operations {
            return Err(RuntimeError::validation(
                "operations",
                format!(
                    "At most {} operations are retained; clean up finished ones first",
                    self.settings.max_operations
                ),
            ));
        }

        let mut seen = BTreeSet::new();
        for (index, item) in items.iter_mut().enumerate() {
            if item.id.is_empty() {
                item.id = format!("item-{}", index + 1);
            }
            if !seen.insert(item.id.clone()) {
                return Err(RuntimeError::validation(
                    "items",
                    format!("Duplicate item id '{}'", item.id),
                ));
            }
            if matches!(batch_type, BatchType::Execute) && item.tool.is_none() {
                return Err(RuntimeError::validation(
                    "items",
                    format!("Item '{}' names no tool", item.id),
                ));
            }
            if matches!(batch_type, BatchType::Update) && item.update.is_none() {
                return Err(RuntimeError::validation(
                    "items",
                    format!("Item '{}' carries no update", item.id),
                ));
            }
        }

        let operation = BatchOperation {
            id: Uuid::new_v4().to_string(),
            batch_type,
            progress: BatchProgress {
                total: items.len(),
                ..BatchProgress::default()
            },
            items,
            config,
            status: BatchStatus::Pending,
            results: Vec::new(),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            error: None,
            rolled_back: false,
        };

        let snapshot = self.capture(&operation, SnapshotPhase::Before);
        self.snapshots
            .insert(operation.id.clone(), vec![snapshot]);
        self.operations
            .insert(operation.id.clone(), operation.clone());

        info!(
            operation_id = %operation.id,
            batch_type = ?operation.batch_type,
            items = operation.items.len(),
            concurrency = operation.config.concurrency,
            "Batch operation created"
        );
        self.events.publish_batch(BatchEvent::Created {
            operation_id: operation.id.clone(),
        });
        Ok(operation)
    }

    /// Run an operation in the background
    pub fn spawn_run(self: &Arc<Self>, operation_id: &str) -> Result<()> {
        self.ensure_pending(operation_id)?;
        let engine = Arc::clone(self);
        let id = operation_id.to_string();
        tokio::spawn(async move {
            if let Err(e) = engine.run(&id).await {
                warn!(operation_id = %id, error = %e, "Batch run failed to start");
            }
        });
        Ok(())
    }

    /// Run an operation to completion
    pub async fn run(self: &Arc<Self>, operation_id: &str) -> Result<BatchOperation> {
        let operation = self.start(operation_id)?;
        let span = create_batch_span(
            &operation.id,
            &format!("{:?}", operation.batch_type).to_lowercase(),
            operation.items.len(),
        );
        let finished = self.drive(operation).instrument(span.clone()).await;
        span.record("status", tracing::field::debug(finished.status));
        Ok(finished)
    }

    fn ensure_pending(&self, operation_id: &str) -> Result<()> {
        let operation = self
            .operations
            .get(operation_id)
            .ok_or_else(|| RuntimeError::not_found("Batch operation", operation_id))?;
        if operation.status != BatchStatus::Pending {
            return Err(RuntimeError::validation(
                "status",
                format!("Operation is {:?}, not pending", operation.status),
            ));
        }
        Ok(())
    }

    /// Move a pending operation to processing
    fn start(&self, operation_id: &str) -> Result<BatchOperation> {
        let mut operation = self
            .operations
            .get_mut(operation_id)
            .ok_or_else(|| RuntimeError::not_found("Batch operation", operation_id))?;
        if operation.status != BatchStatus::Pending {
            return Err(RuntimeError::validation(
                "status",
                format!("Operation is {:?}, not pending", operation.status),
            ));
        }
        operation.status = BatchStatus::Processing;
        operation.started_at = Some(Utc::now());
        self.cancellations
            .insert(operation_id.to_string(), CancellationToken::new());
        self.events.publish_batch(BatchEvent::Started {
            operation_id: operation_id.to_string(),
        });
        Ok(operation.clone())
    }

    async fn drive(self: &Arc<Self>, operation: BatchOperation) -> BatchOperation {
        let id = operation.id.clone();
        let config = operation.config.clone();
        let batch_type = operation.batch_type;
        let started = Instant::now();
        let cancel = self
            .cancellations
            .get(&id)
            .map(|token| token.clone())
            .unwrap_or_default();

        let reporter = self.spawn_progress_reporter(&id, started);
        info!(operation_id = %id, "Batch operation started");

        let mut outcome: Option<(BatchStatus, Option<String>)> = None;
        for (index, chunk) in operation.items.chunks(config.concurrency).enumerate() {
            if cancel.is_cancelled() {
                outcome = Some((BatchStatus::Cancelled, None));
                break;
            }

            if let Some(limit) = config.memory_limit_mb {
                if let Some(used) = self.resident_memory_mb() {
                    if used > limit {
                        if !config.continue_on_error {
                            outcome = Some((
                                BatchStatus::Failed,
                                Some(format!(
                                    "Memory limit exceeded: {}MB used, {}MB allowed",
                                    used, limit
                                )),
                            ));
                            break;
                        }
                        warn!(
                            operation_id = %id,
                            used_mb = used,
                            limit_mb = limit,
                            "Memory above batch limit, yielding before next chunk"
                        );
                        tokio::task::yield_now().await;
                    }
                }
            }

            debug!(operation_id = %id, chunk = index, size = chunk.len(), "Processing chunk");
            let results = join_all(
                chunk
                    .iter()
                    .map(|item| self.process_item(batch_type, item, &config)),
            )
            .await;

            let first_failure = results
                .iter()
                .find(|result| result.status == ItemStatus::Failed)
                .map(|result| {
                    format!(
                        "Item '{}' failed: {}",
                        result.item_id,
                        result.error.as_deref().unwrap_or("unknown error")
                    )
                });

            if let Some(mut entry) = self.operations.get_mut(&id) {
                entry.results.extend(results);
                entry.progress = compute_progress(&entry, started.elapsed());
            }

            if let Some(failure) = first_failure {
                if !config.continue_on_error {
                    outcome = Some((BatchStatus::Failed, Some(failure)));
                    break;
                }
            }
        }

        reporter.cancel();
        let (status, error) = outcome.unwrap_or((BatchStatus::Completed, None));
        let finished = self.finish(&id, status, error, started.elapsed());

        if finished.status == BatchStatus::Failed
            && finished.config.rollback_on_failure
            && finished.batch_type.supports_rollback()
        {
            match self.rollback(&id).await {
                Ok(restored) => {
                    info!(operation_id = %id, restored, "Automatic rollback completed");
                }
                Err(e) => warn!(operation_id = %id, error = %e, "Automatic rollback failed"),
            }
            return self.get(&id).unwrap_or(finished);
        }
        finished
    }

    fn finish(
        &self,
        id: &str,
        status: BatchStatus,
        error: Option<String>,
        elapsed: Duration,
    ) -> BatchOperation {
        self.cancellations.remove(id);

        let finished = match self.operations.get_mut(id) {
            Some(mut operation) => {
                operation.status = status;
                operation.error = error.clone();
                operation.completed_at = Some(Utc::now());
                operation.progress = compute_progress(&operation, elapsed);
                operation.clone()
            }
            None => {
                // removed while running; nothing to report
                return BatchOperation {
                    status,
                    error,
                    ..self.placeholder(id)
                };
            }
        };

        let snapshot = self.capture(&finished, SnapshotPhase::After);
        self.snapshots
            .entry(id.to_string())
            .or_default()
            .push(snapshot);

        let progress = finished.progress.clone();
        let event = match status {
            BatchStatus::Completed => {
                info!(
                    operation_id = %id,
                    completed = progress.completed,
                    failed = progress.failed,
                    "Batch operation completed"
                );
                BatchEvent::Completed {
                    operation_id: id.to_string(),
                    progress: progress.clone(),
                }
            }
            BatchStatus::Cancelled => {
                info!(operation_id = %id, "Batch operation cancelled");
                BatchEvent::Cancelled {
                    operation_id: id.to_string(),
                }
            }
            _ => {
                let error = error.unwrap_or_else(|| "batch failed".to_string());
                warn!(operation_id = %id, error = %error, "Batch operation aborted");
                BatchEvent::Failed {
                    operation_id: id.to_string(),
                    error,
                }
            }
        };
        self.events.publish_batch(BatchEvent::Progress {
            operation_id: id.to_string(),
            progress,
        });
        self.events.publish_batch(event);
        finished
    }

    fn placeholder(&self, id: &str) -> BatchOperation {
        BatchOperation {
            id: id.to_string(),
            batch_type: BatchType::Execute,
            items: Vec::new(),
            config: BatchConfig::default(),
            status: BatchStatus::Pending,
            progress: BatchProgress::default(),
            results: Vec::new(),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            error: None,
            rolled_back: false,
        }
    }

    fn spawn_progress_reporter(self: &Arc<Self>, id: &str, started: Instant) -> CancellationToken {
        let stop = CancellationToken::new();
        let engine: Weak<Self> = Arc::downgrade(self);
        let id = id.to_string();
        let period = Duration::from_millis(self.settings.progress_interval_ms);
        let token = stop.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let Some(engine) = engine.upgrade() else {
                    break;
                };
                let progress = match engine.operations.get_mut(&id) {
                    Some(mut operation) => {
                        operation.progress = compute_progress(&operation, started.elapsed());
                        operation.progress.clone()
                    }
                    None => break,
                };
                engine.events.publish_batch(BatchEvent::Progress {
                    operation_id: id.clone(),
                    progress,
                });
            }
        });
        stop
    }

    /// Retry loop around one item; attempt `n` waits `n * retry_delay_ms` before retrying
    async fn process_item(&self, batch_type: BatchType, item: &BatchItem, config: &BatchConfig) -> BatchResult {
        let started = Instant::now();
        let limit = Duration::from_millis(config.timeout_ms);
        let mut attempts = 0;

        loop {
            attempts += 1;
            let outcome = match tokio::time::timeout(limit, self.execute_item(batch_type, item)).await {
                Ok(outcome) => outcome,
                Err(_) => Err(RuntimeError::ExecutionTimeout(config.timeout_ms)),
            };

            match outcome {
                Ok(data) => {
                    return BatchResult {
                        item_id: item.id.clone(),
                        integration_id: item.integration_id.clone(),
                        status: ItemStatus::Success,
                        data: Some(data),
                        error: None,
                        attempts,
                        duration_ms: started.elapsed().as_millis() as u64,
                    };
                }
                Err(error) if error.is_retryable() && attempts <= config.retry_attempts => {
                    let delay = Duration::from_millis(config.retry_delay_ms * attempts as u64);
                    debug!(
                        item_id = %item.id,
                        attempt = attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "Retrying batch item"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(error) => {
                    warn!(item_id = %item.id, attempts, error = %error, "Batch item failed");
                    let message = match error {
                        RuntimeError::Execution(message) => message,
                        other => other.to_string(),
                    };
                    return BatchResult {
                        item_id: item.id.clone(),
                        integration_id: item.integration_id.clone(),
                        status: ItemStatus::Failed,
                        data: None,
                        error: Some(message),
                        attempts,
                        duration_ms: started.elapsed().as_millis() as u64,
                    };
                }
            }
        }
    }

    async fn execute_item(&self, batch_type: BatchType, item: &BatchItem) -> Result<Value> {
        match batch_type {
            BatchType::Execute | BatchType::Test => {
                let tool = match &item.tool {
                    Some(tool) => tool.clone(),
                    None => self
                        .store
                        .get(&item.integration_id)
                        .ok_or_else(|| RuntimeError::not_found("Integration", &item.integration_id))?
                        .tools
                        .first()
                        .map(|tool| tool.name.clone())
                        .ok_or_else(|| RuntimeError::NoTools(item.integration_id.clone()))?,
                };
                self.dispatcher
                    .try_execute(&ExecuteRequest {
                        integration_id: item.integration_id.clone(),
                        tool,
                        params: item.params.clone(),
                        permissions: Vec::new(),
                    })
                    .await
            }
            BatchType::Validate => {
                let integration = self
                    .store
                    .get(&item.integration_id)
                    .ok_or_else(|| RuntimeError::not_found("Integration", &item.integration_id))?;
                let report = self.security.validate(&integration)?;
                Ok(json!({ "valid": true, "warnings": report.warnings }))
            }
            BatchType::Update => {
                let patch = item
                    .update
                    .as_ref()
                    .ok_or_else(|| RuntimeError::validation("update", "Item carries no update"))?;
                let updated = self.apply_checked(&item.integration_id, Some(patch)).await?;
                if let Some(enabled) = patch.enabled {
                    self.store.set_enabled(&item.integration_id, enabled).await?;
                }
                Ok(json!({ "id": updated.id, "version": updated.version }))
            }
            BatchType::Deploy => {
                let deployed = self
                    .apply_checked(&item.integration_id, item.update.as_ref())
                    .await?;
                Ok(json!({
                    "id": deployed.id,
                    "version": deployed.version,
                    "sandboxed": deployed.sandbox_config.is_some(),
                }))
            }
        }
    }

    /// Patch, validate and re-sandbox an integration before persisting it;
    /// a patch that fails validation leaves the store untouched
    async fn apply_checked(
        &self,
        integration_id: &str,
        patch: Option<&IntegrationPatch>,
    ) -> Result<Integration> {
        let mut integration = self
            .store
            .get(integration_id)
            .ok_or_else(|| RuntimeError::not_found("Integration", integration_id))?;
        if let Some(patch) = patch {
            patch.apply_to(&mut integration);
        }
        self.security.validate(&integration)?;
        let integration = self.security.sandbox(integration);
        self.store.replace(integration_id, integration).await
    }

    /// Request cooperative cancellation; takes effect at the next chunk boundary
    pub fn cancel(&self, operation_id: &str) -> Result<BatchOperation> {
        let mut operation = self
            .operations
            .get_mut(operation_id)
            .ok_or_else(|| RuntimeError::not_found("Batch operation", operation_id))?;

        match operation.status {
            BatchStatus::Pending => {
                operation.status = BatchStatus::Cancelled;
                operation.completed_at = Some(Utc::now());
                self.events.publish_batch(BatchEvent::Cancelled {
                    operation_id: operation_id.to_string(),
                });
                info!(operation_id = %operation_id, "Pending batch operation cancelled");
            }
            BatchStatus::Processing => {
                if let Some(token) = self.cancellations.get(operation_id) {
                    token.cancel();
                }
                info!(operation_id = %operation_id, "Batch cancellation requested");
            }
            status => {
                return Err(RuntimeError::validation(
                    "status",
                    format!("Operation already {:?}", status),
                ));
            }
        }
        Ok(operation.clone())
    }

    /// Restore the pre-run state of every integration whose item succeeded
    pub async fn rollback(&self, operation_id: &str) -> Result<usize> {
        let operation = self
            .get(operation_id)
            .ok_or_else(|| RuntimeError::not_found("Batch operation", operation_id))?;
        if !operation.status.is_terminal() || operation.started_at.is_none() {
            return Err(RuntimeError::validation(
                "status",
                "Only finished operations can be rolled back",
            ));
        }
        if !operation.batch_type.supports_rollback() {
            info!(
                operation_id = %operation_id,
                batch_type = ?operation.batch_type,
                "Batch type has no rollback action"
            );
            return Ok(0);
        }

        let before = self
            .snapshots
            .get(operation_id)
            .and_then(|snapshots| {
                snapshots
                    .iter()
                    .find(|snapshot| snapshot.phase == SnapshotPhase::Before)
                    .cloned()
            })
            .ok_or_else(|| RuntimeError::not_found("Snapshot", operation_id))?;

        let touched: BTreeSet<String> = operation
            .results
            .iter()
            .filter(|result| result.status == ItemStatus::Success)
            .map(|result| result.integration_id.clone())
            .collect();

        let mut restored = 0;
        for integration_id in touched {
            match before.integrations.get(&integration_id) {
                Some(Some(previous)) => {
                    self.store
                        .replace(&integration_id, previous.clone())
                        .await?;
                    restored += 1;
                    debug!(operation_id = %operation_id, integration_id = %integration_id, "Integration restored");
                }
                _ => {
                    debug!(
                        operation_id = %operation_id,
                        integration_id = %integration_id,
                        "No prior state to restore"
                    );
                }
            }
        }

        if let Some(mut entry) = self.operations.get_mut(operation_id) {
            entry.rolled_back = true;
        }
        info!(operation_id = %operation_id, restored, "Batch operation rolled back");
        self.events.publish_batch(BatchEvent::RolledBack {
            operation_id: operation_id.to_string(),
            restored,
        });
        Ok(restored)
    }

    pub fn get(&self, operation_id: &str) -> Option<BatchOperation> {
        self.operations
            .get(operation_id)
            .map(|entry| entry.clone())
    }

    /// Operations newest first
    pub fn list(&self) -> Vec<BatchOperation> {
        let mut operations: Vec<BatchOperation> = self
            .operations
            .iter()
            .map(|entry| entry.clone())
            .collect();
        operations.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        operations
    }

    pub fn snapshots(&self, operation_id: &str) -> Vec<Snapshot> {
        self.snapshots
            .get(operation_id)
            .map(|entry| entry.clone())
            .unwrap_or_default()
    }

    /// Drop an operation and its snapshots
    pub fn cleanup(&self, operation_id: &str) -> Result<()> {
        let status = self
            .operations
            .get(operation_id)
            .map(|entry| entry.status)
            .ok_or_else(|| RuntimeError::not_found("Batch operation", operation_id))?;
        if status == BatchStatus::Processing {
            return Err(RuntimeError::validation(
                "status",
                "Cannot clean up an operation while it is processing",
            ));
        }
        self.operations.remove(operation_id);
        self.snapshots.remove(operation_id);
        debug!(operation_id = %operation_id, "Batch operation cleaned up");
        Ok(())
    }

    /// Cancel every running operation
    pub fn shutdown(&self) {
        for entry in self.cancellations.iter() {
            entry.value().cancel();
        }
    }

    fn capture(&self, operation: &BatchOperation, phase: SnapshotPhase) -> Snapshot {
        let integrations: BTreeMap<String, _> = operation
            .items
            .iter()
            .map(|item| item.integration_id.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .map(|id| {
                let state = self.store.get(&id);
                (id, state)
            })
            .collect();

        Snapshot {
            operation_id: operation.id.clone(),
            phase,
            captured_at: Utc::now(),
            integrations,
        }
    }

    fn resident_memory_mb(&self) -> Option<u64> {
        let pid: Pid = sysinfo::get_current_pid().ok()?;
        let mut system = self.system.lock();
        system.refresh_process(pid);
        system
            .process(pid)
            .map(|process| process.memory() / (1024 * 1024))
    }
}

fn compute_progress(operation: &BatchOperation, elapsed: Duration) -> BatchProgress {
    let total = operation.items.len();
    let completed = operation
        .results
        .iter()
        .filter(|result| result.status == ItemStatus::Success)
        .count();
    let failed = operation.results.len() - completed;
    let processed = completed + failed;

    let percentage = if total == 0 {
        100.0
    } else {
        processed as f64 / total as f64 * 100.0
    };
    let seconds = elapsed.as_secs_f64();
    let throughput = if seconds > 0.0 {
        processed as f64 / seconds
    } else {
        0.0
    };
    let remaining = total.saturating_sub(processed);
    let eta_seconds = if remaining == 0 {
        Some(0)
    } else if throughput > 0.0 {
        Some((remaining as f64 / throughput).ceil() as u64)
    } else {
        None
    };

    BatchProgress {
        total,
        completed,
        failed,
        percentage,
        throughput,
        eta_seconds,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SecurityConfig;
    use crate::dispatcher::ToolHandler;
    use crate::models::Tool;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tempfile::TempDir;

    /// Fails for `n == 5`, counts calls
    #[derive(Default)]
    struct FailsOnFive {
        calls: AtomicU32,
    }

    #[async_trait]
    impl ToolHandler for FailsOnFive {
        async fn handle(&self, _integration: &Integration, _tool: &Tool, params: Value) -> Result<Value> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match params["n"].as_u64() {
                Some(5) => Err(RuntimeError::Execution("item five always fails".to_string())),
                n => Ok(json!({ "n": n })),
            }
        }
    }

    /// Sleeps before echoing, so a run can be interrupted mid-way
    struct Slow;

    #[async_trait]
    impl ToolHandler for Slow {
        async fn handle(&self, _integration: &Integration, _tool: &Tool, params: Value) -> Result<Value> {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok(params)
        }
    }

    struct Fixture {
        _dir: TempDir,
        store: Arc<IntegrationStore>,
        handler: Arc<FailsOnFive>,
        dispatcher: Arc<RequestDispatcher>,
        engine: Arc<BatchEngine>,
        events: EventBus,
    }

    async fn fixture() -> Fixture {
        fixture_with(false).await
    }

    async fn fixture_with(sandbox_enabled: bool) -> Fixture {
        let dir = TempDir::new().unwrap();
        let events = EventBus::new();
        let store = Arc::new(
            IntegrationStore::open(dir.path(), events.clone())
                .await
                .unwrap(),
        );
        let security = Arc::new(SecurityManager::new(SecurityConfig::default(), sandbox_enabled));
        let dispatcher = Arc::new(RequestDispatcher::new(Arc::clone(&store), Arc::clone(&security)));
        let handler = Arc::new(FailsOnFive::default());
        dispatcher.register_handler("worker", handler.clone());
        dispatcher.register_handler("slow", Arc::new(Slow));
        let engine = Arc::new(BatchEngine::new(
            Arc::clone(&store),
            security,
            Arc::clone(&dispatcher),
            events.clone(),
            BatchSettings {
                progress_interval_ms: 10,
                ..BatchSettings::default()
            },
        ));
        Fixture {
            _dir: dir,
            store,
            handler,
            dispatcher,
            engine,
            events,
        }
    }

    async fn register(store: &IntegrationStore, name: &str, config: Value) -> String {
        let mut integration = Integration::new(name, "1.0.0", "acme", vec![Tool::new("run", "")]);
        integration.config = Some(config);
        store.register(integration).await.unwrap()
    }

    fn numbered_items(id: &str, count: u64) -> Vec<BatchItem> {
        (1..=count)
            .map(|n| BatchItem::execute(id, "run", json!({ "n": n })))
            .collect()
    }

    #[tokio::test]
    async fn test_continue_on_error_completes() {
        let fx = fixture().await;
        let id = register(&fx.store, "worker", json!({})).await;

        let operation = fx
            .engine
            .create(
                BatchType::Execute,
                numbered_items(&id, 10),
                Some(BatchConfig {
                    concurrency: 3,
                    continue_on_error: true,
                    ..BatchConfig::default()
                }),
            )
            .unwrap();
        let finished = fx.engine.run(&operation.id).await.unwrap();

        assert_eq!(finished.status, BatchStatus::Completed);
        assert_eq!(finished.results.len(), 10);
        let succeeded = finished
            .results
            .iter()
            .filter(|r| r.status == ItemStatus::Success)
            .count();
        assert_eq!(succeeded, 9);
        let failed: Vec<_> = finished
            .results
            .iter()
            .filter(|r| r.status == ItemStatus::Failed)
            .collect();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].item_id, "item-5");
        assert_eq!(finished.progress.completed, 9);
        assert_eq!(finished.progress.failed, 1);
        assert!((finished.progress.percentage - 100.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_abort_on_first_failed_chunk() {
        let fx = fixture().await;
        let id = register(&fx.store, "worker", json!({})).await;

        let operation = fx
            .engine
            .create(
                BatchType::Execute,
                numbered_items(&id, 10),
                Some(BatchConfig {
                    concurrency: 3,
                    continue_on_error: false,
                    ..BatchConfig::default()
                }),
            )
            .unwrap();
        let finished = fx.engine.run(&operation.id).await.unwrap();

        assert_eq!(finished.status, BatchStatus::Failed);
        // chunks [1,2,3] and [4,5,6] ran; the chunk holding item 5 aborts the run
        assert_eq!(finished.results.len(), 6);
        assert!(finished.error.unwrap().contains("item-5"));
        assert_eq!(fx.handler.calls.load(Ordering::SeqCst), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_use_linear_backoff() {
        let fx = fixture().await;
        let id = register(&fx.store, "worker", json!({})).await;

        let operation = fx
            .engine
            .create(
                BatchType::Execute,
                vec![BatchItem::execute(&id, "run", json!({ "n": 5 }))],
                Some(BatchConfig {
                    retry_attempts: 2,
                    retry_delay_ms: 1000,
                    ..BatchConfig::default()
                }),
            )
            .unwrap();

        let started = tokio::time::Instant::now();
        let finished = fx.engine.run(&operation.id).await.unwrap();

        assert_eq!(finished.results[0].attempts, 3);
        assert_eq!(fx.handler.calls.load(Ordering::SeqCst), 3);
        // 1s after the first failure, 2s after the second
        assert!(started.elapsed() >= Duration::from_millis(3000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_validation_failures_are_not_retried() {
        let fx = fixture().await;
        let tool = Tool::new("run", "")
            .with_input_schema(crate::schema::Schema::object(
                [("title", crate::schema::Schema::string())],
                &["title"],
            ));
        let id = fx
            .store
            .register(Integration::new("worker", "1.0.0", "acme", vec![tool]))
            .await
            .unwrap();

        let operation = fx
            .engine
            .create(
                BatchType::Execute,
                vec![BatchItem::execute(&id, "run", json!({}))],
                Some(BatchConfig {
                    retry_attempts: 3,
                    retry_delay_ms: 1000,
                    ..BatchConfig::default()
                }),
            )
            .unwrap();

        let started = tokio::time::Instant::now();
        let finished = fx.engine.run(&operation.id).await.unwrap();

        let result = &finished.results[0];
        assert_eq!(result.status, ItemStatus::Failed);
        assert_eq!(result.attempts, 1);
        assert!(result.error.as_deref().unwrap().contains("Missing required field: title"));
        assert_eq!(fx.handler.calls.load(Ordering::SeqCst), 0);
        assert_eq!(fx.dispatcher.counters(&id).calls, 1);
        assert!(started.elapsed() < Duration::from_millis(1000));
    }

    #[tokio::test]
    async fn test_invalid_update_leaves_store_untouched() {
        let fx = fixture().await;
        let id = register(&fx.store, "settings", json!({ "foo": 1 })).await;
        let original = fx.store.get(&id).unwrap();

        let patches = [
            IntegrationPatch {
                version: Some("banana".to_string()),
                ..Default::default()
            },
            IntegrationPatch {
                tools: Some(Vec::new()),
                ..Default::default()
            },
            IntegrationPatch {
                author: Some(String::new()),
                ..Default::default()
            },
        ];
        let items = patches
            .into_iter()
            .map(|patch| BatchItem::update(&id, patch))
            .collect();
        let operation = fx
            .engine
            .create(
                BatchType::Update,
                items,
                Some(BatchConfig {
                    concurrency: 1,
                    continue_on_error: true,
                    retry_attempts: 2,
                    ..BatchConfig::default()
                }),
            )
            .unwrap();
        let finished = fx.engine.run(&operation.id).await.unwrap();

        assert_eq!(finished.status, BatchStatus::Completed);
        assert_eq!(finished.results.len(), 3);
        for result in &finished.results {
            assert_eq!(result.status, ItemStatus::Failed);
            assert_eq!(result.attempts, 1);
        }
        assert!(finished.results[0].error.as_deref().unwrap().contains("banana"));
        assert_eq!(fx.store.get(&id).unwrap(), original);
    }

    #[tokio::test]
    async fn test_update_applies_enabled_flag() {
        let fx = fixture().await;
        let id = register(&fx.store, "settings", json!({})).await;

        let operation = fx
            .engine
            .create(
                BatchType::Update,
                vec![BatchItem::update(
                    &id,
                    IntegrationPatch {
                        version: Some("1.1.0".to_string()),
                        enabled: Some(false),
                        ..Default::default()
                    },
                )],
                None,
            )
            .unwrap();
        let finished = fx.engine.run(&operation.id).await.unwrap();

        assert_eq!(finished.results[0].status, ItemStatus::Success);
        assert_eq!(fx.store.get(&id).unwrap().version, "1.1.0");
        assert!(!fx.store.is_enabled(&id));
    }

    #[tokio::test]
    async fn test_deploy_sandboxes_then_rolls_back() {
        let fx = fixture_with(true).await;
        let id = register(&fx.store, "settings", json!({ "foo": 1 })).await;
        let original = fx.store.get(&id).unwrap();
        assert!(original.sandbox_config.is_none());

        let operation = fx
            .engine
            .create(
                BatchType::Deploy,
                vec![BatchItem::update(
                    &id,
                    IntegrationPatch {
                        version: Some("2.0.0".to_string()),
                        ..Default::default()
                    },
                )],
                None,
            )
            .unwrap();
        let finished = fx.engine.run(&operation.id).await.unwrap();

        assert_eq!(finished.status, BatchStatus::Completed);
        let data = finished.results[0].data.clone().unwrap();
        assert_eq!(data["version"], "2.0.0");
        assert_eq!(data["sandboxed"], true);
        let deployed = fx.store.get(&id).unwrap();
        assert!(deployed.sandbox_config.is_some());
        assert!(deployed.tools[0].rate_limit.is_some());

        assert_eq!(fx.engine.rollback(&operation.id).await.unwrap(), 1);
        assert_eq!(fx.store.get(&id).unwrap(), original);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_while_processing_stops_at_chunk_boundary() {
        let fx = fixture().await;
        let id = register(&fx.store, "slow", json!({})).await;

        let operation = fx
            .engine
            .create(
                BatchType::Execute,
                numbered_items(&id, 6),
                Some(BatchConfig {
                    concurrency: 1,
                    ..BatchConfig::default()
                }),
            )
            .unwrap();
        fx.engine.spawn_run(&operation.id).unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        let requested = fx.engine.cancel(&operation.id).unwrap();
        assert_eq!(requested.status, BatchStatus::Processing);

        let finished = loop {
            let current = fx.engine.get(&operation.id).unwrap();
            if current.status.is_terminal() {
                break current;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        };
        assert_eq!(finished.status, BatchStatus::Cancelled);
        assert!(!finished.results.is_empty());
        assert!(finished.results.len() < 6);
        assert!(finished.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_memory_limit_aborts_without_continue_on_error() {
        let fx = fixture().await;
        let id = register(&fx.store, "worker", json!({})).await;

        let operation = fx
            .engine
            .create(
                BatchType::Execute,
                numbered_items(&id, 3),
                Some(BatchConfig {
                    memory_limit_mb: Some(0),
                    continue_on_error: false,
                    ..BatchConfig::default()
                }),
            )
            .unwrap();
        let finished = fx.engine.run(&operation.id).await.unwrap();

        assert_eq!(finished.status, BatchStatus::Failed);
        assert!(finished.results.is_empty());
        assert!(finished.error.unwrap().contains("Memory limit exceeded"));
        assert_eq!(fx.handler.calls.load(Ordering::SeqCst), 0);

        let tolerant = fx
            .engine
            .create(
                BatchType::Execute,
                numbered_items(&id, 3),
                Some(BatchConfig {
                    memory_limit_mb: Some(0),
                    continue_on_error: true,
                    ..BatchConfig::default()
                }),
            )
            .unwrap();
        let finished = fx.engine.run(&tolerant.id).await.unwrap();
        assert_eq!(finished.status, BatchStatus::Completed);
        assert_eq!(finished.results.len(), 3);
    }

    #[tokio::test]
    async fn test_rollback_restores_pre_run_state() {
        let fx = fixture().await;
        let id = register(&fx.store, "settings", json!({ "foo": 1 })).await;

        let items = vec![
            BatchItem::update(
                &id,
                IntegrationPatch {
                    config: Some(json!({ "foo": 2 })),
                    ..Default::default()
                },
            ),
            BatchItem::update(
                "does-not-exist",
                IntegrationPatch {
                    config: Some(json!({ "foo": 3 })),
                    ..Default::default()
                },
            ),
        ];
        let operation = fx
            .engine
            .create(
                BatchType::Update,
                items,
                Some(BatchConfig {
                    concurrency: 1,
                    continue_on_error: false,
                    rollback_on_failure: true,
                    ..BatchConfig::default()
                }),
            )
            .unwrap();

        let finished = fx.engine.run(&operation.id).await.unwrap();
        assert_eq!(finished.status, BatchStatus::Failed);
        assert!(finished.rolled_back);
        assert_eq!(fx.store.get(&id).unwrap().config, Some(json!({ "foo": 1 })));

        let snapshots = fx.engine.snapshots(&operation.id);
        assert_eq!(snapshots.len(), 2);
        assert_eq!(snapshots[0].phase, SnapshotPhase::Before);
        assert_eq!(snapshots[1].phase, SnapshotPhase::After);
        assert_eq!(snapshots[0].integrations.get("does-not-exist"), Some(&None));
    }

    #[tokio::test]
    async fn test_manual_rollback_and_read_only_types() {
        let fx = fixture().await;
        let id = register(&fx.store, "settings", json!({ "foo": 1 })).await;

        let update = fx
            .engine
            .create(
                BatchType::Update,
                vec![BatchItem::update(
                    &id,
                    IntegrationPatch {
                        config: Some(json!({ "foo": 2 })),
                        ..Default::default()
                    },
                )],
                None,
            )
            .unwrap();
        fx.engine.run(&update.id).await.unwrap();
        assert_eq!(fx.store.get(&id).unwrap().config, Some(json!({ "foo": 2 })));

        assert_eq!(fx.engine.rollback(&update.id).await.unwrap(), 1);
        assert_eq!(fx.store.get(&id).unwrap().config, Some(json!({ "foo": 1 })));

        let validate = fx
            .engine
            .create(BatchType::Validate, vec![BatchItem::update(&id, IntegrationPatch::default())], None)
            .unwrap();
        let finished = fx.engine.run(&validate.id).await.unwrap();
        assert_eq!(finished.results[0].status, ItemStatus::Success);
        assert_eq!(fx.engine.rollback(&validate.id).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_cancel_and_cleanup() {
        let fx = fixture().await;
        let id = register(&fx.store, "worker", json!({})).await;

        let pending = fx
            .engine
            .create(BatchType::Execute, numbered_items(&id, 2), None)
            .unwrap();
        let cancelled = fx.engine.cancel(&pending.id).unwrap();
        assert_eq!(cancelled.status, BatchStatus::Cancelled);
        assert!(fx.engine.run(&pending.id).await.is_err());
        assert!(fx.engine.cancel(&pending.id).is_err());

        fx.engine.cleanup(&pending.id).unwrap();
        assert!(fx.engine.get(&pending.id).is_none());
        assert!(fx.engine.snapshots(&pending.id).is_empty());
        assert!(fx.engine.cleanup(&pending.id).is_err());
    }

    #[tokio::test]
    async fn test_events_emitted() {
        let fx = fixture().await;
        let id = register(&fx.store, "worker", json!({})).await;
        let mut rx = fx.events.subscribe_batches();

        let operation = fx
            .engine
            .create(BatchType::Test, vec![BatchItem::update(&id, IntegrationPatch::default())], None)
            .unwrap();
        fx.engine.run(&operation.id).await.unwrap();

        let mut seen = Vec::new();
        while let Ok(event) = rx.try_recv() {
            seen.push(event);
        }
        assert!(matches!(seen.first(), Some(BatchEvent::Created { .. })));
        assert!(seen.iter().any(|e| matches!(e, BatchEvent::Started { .. })));
        assert!(seen.iter().any(|e| matches!(e, BatchEvent::Progress { .. })));
        assert!(matches!(seen.last(), Some(BatchEvent::Completed { .. })));
    }

    #[tokio::test]
    async fn test_create_validation() {
        let fx = fixture().await;

        assert!(fx.engine.create(BatchType::Execute, Vec::new(), None).is_err());
        assert!(fx
            .engine
            .create(
                BatchType::Execute,
                vec![BatchItem::update("x", IntegrationPatch::default())],
                None
            )
            .is_err());
        assert!(fx
            .engine
            .create(
                BatchType::Execute,
                numbered_items("x", 1),
                Some(BatchConfig {
                    concurrency: 0,
                    ..BatchConfig::default()
                })
            )
            .is_err());
    }

    #[test]
    fn test_progress_math() {
        let mut operation = BatchOperation {
            id: "op".to_string(),
            batch_type: BatchType::Execute,
            items: numbered_items("x", 4),
            config: BatchConfig::default(),
            status: BatchStatus::Processing,
            progress: BatchProgress::default(),
            results: Vec::new(),
            created_at: Utc::now(),
            started_at: Some(Utc::now()),
            completed_at: None,
            error: None,
            rolled_back: false,
        };
        for (index, status) in [ItemStatus::Success, ItemStatus::Failed].into_iter().enumerate() {
            operation.results.push(BatchResult {
                item_id: format!("item-{}", index + 1),
                integration_id: "x".to_string(),
                status,
                data: None,
                error: None,
                attempts: 1,
                duration_ms: 1,
            });
        }

        let progress = compute_progress(&operation, Duration::from_secs(2));
        assert_eq!(progress.completed, 1);
        assert_eq!(progress.failed, 1);
        assert!((progress.percentage - 50.0).abs() < f64::EPSILON);
        assert!((progress.throughput - 1.0).abs() < f64::EPSILON);
        assert_eq!(progress.eta_seconds, Some(2));
    }
}
