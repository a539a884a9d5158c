//! Data models for the Integration Runtime
//!
//! This module defines the data structures shared by every runtime component:
//! integrations and their tools, persisted manifests, execution results, batch
//! operations and health snapshots, plus the API request/response types.

use crate::schema::Schema;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use validator::Validate;

/// A registered plugin exposing one or more tools
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Integration {
    /// Unique identifier, assigned at registration when empty
    #[serde(default)]
    pub id: String,

    /// Integration name, unique among live integrations
    #[serde(default)]
    pub name: String,

    /// Semantic version (MAJOR.MINOR.PATCH)
    #[serde(default)]
    pub version: String,

    /// Human readable description
    #[serde(default)]
    pub description: String,

    /// Author or publisher
    #[serde(default)]
    pub author: String,

    /// Marketplace category
    #[serde(default)]
    pub category: Category,

    /// Callable tools, in declaration order
    #[serde(default)]
    pub tools: Vec<Tool>,

    /// Capabilities granted to the integration
    #[serde(default)]
    pub permissions: BTreeSet<Permission>,

    /// Integration specific configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<Value>,

    /// Detached signature over the canonical manifest fields
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,

    /// Sandbox limits attached by the security manager
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sandbox_config: Option<SandboxConfig>,

    /// Free-form tags used by search
    #[serde(default)]
    pub tags: Vec<String>,
}

/// A single callable operation with typed input/output schema
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tool {
    /// Tool name, unique within its integration
    pub name: String,

    /// Tool description
    #[serde(default)]
    pub description: String,

    /// Schema the call parameters must satisfy
    #[serde(default)]
    pub input_schema: Schema,

    /// Schema the result is expected to satisfy (checked leniently)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_schema: Option<Schema>,

    /// Fixed-window rate limit
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<RateLimit>,

    /// Capabilities every call to this tool needs
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub permissions: Vec<Permission>,

    /// Worker process implementing the tool
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entrypoint: Option<Entrypoint>,

    /// Example invocations
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub examples: Vec<ToolExample>,
}

/// Rate limit for one tool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimit {
    /// Calls permitted per window
    pub requests: u32,

    /// Window length in seconds
    #[serde(alias = "window")]
    pub window_seconds: u64,
}

/// Example invocation of a tool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolExample {
    #[serde(default)]
    pub description: String,
    pub input: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
}

/// Executable implementing a tool out of process
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entrypoint {
    /// Program to spawn
    pub command: String,

    /// Program arguments
    #[serde(default)]
    pub args: Vec<String>,
}

/// Resource and time limits applied to isolated execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxConfig {
    /// Address-space ceiling for the worker in megabytes
    pub memory_limit_mb: u64,

    /// Share of one CPU the worker may consume (0.0 - 1.0)
    pub cpu_share: f64,

    /// Hard wall-clock timeout in milliseconds
    pub timeout_ms: u64,

    /// Hosts the worker may contact
    pub allowed_hosts: Vec<String>,

    /// Hosts the worker must never contact, even when allowed above
    #[serde(default)]
    pub blocked_hosts: Vec<String>,

    /// Environment passed to the worker
    pub environment: BTreeMap<String, String>,
}

/// Closed vocabulary of capabilities an integration may hold
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Permission {
    Network,
    Filesystem,
    Process,
    System,
    Clipboard,
    Notification,
    Camera,
    Microphone,
    Location,
    /// Anything outside the vocabulary; rejected by validation
    Unrecognized(String),
}

impl Permission {
    /// Every recognised permission
    pub const ALL: [Permission; 9] = [
        Permission::Network,
        Permission::Filesystem,
        Permission::Process,
        Permission::System,
        Permission::Clipboard,
        Permission::Notification,
        Permission::Camera,
        Permission::Microphone,
        Permission::Location,
    ];

    pub fn as_str(&self) -> &str {
        match self {
            Permission::Network => "network",
            Permission::Filesystem => "filesystem",
            Permission::Process => "process",
            Permission::System => "system",
            Permission::Clipboard => "clipboard",
            Permission::Notification => "notification",
            Permission::Camera => "camera",
            Permission::Microphone => "microphone",
            Permission::Location => "location",
            Permission::Unrecognized(other) => other,
        }
    }

    pub fn is_recognized(&self) -> bool {
        !matches!(self, Permission::Unrecognized(_))
    }
}

impl From<String> for Permission {
    fn from(value: String) -> Self {
        match value.as_str() {
            "network" => Permission::Network,
            "filesystem" => Permission::Filesystem,
            "process" => Permission::Process,
            "system" => Permission::System,
            "clipboard" => Permission::Clipboard,
            "notification" => Permission::Notification,
            "camera" => Permission::Camera,
            "microphone" => Permission::Microphone,
            "location" => Permission::Location,
            _ => Permission::Unrecognized(value),
        }
    }
}

impl From<&str> for Permission {
    fn from(value: &str) -> Self {
        Permission::from(value.to_string())
    }
}

impl From<Permission> for String {
    fn from(value: Permission) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Marketplace category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Productivity,
    Development,
    Communication,
    Data,
    Ai,
    Automation,
    Security,
    #[default]
    Utility,
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Category::Productivity => "productivity",
            Category::Development => "development",
            Category::Communication => "communication",
            Category::Data => "data",
            Category::Ai => "ai",
            Category::Automation => "automation",
            Category::Security => "security",
            Category::Utility => "utility",
        };
        f.write_str(name)
    }
}

/// Persisted record combining an integration with installation metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub integration: Integration,
    pub install: InstallMetadata,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub marketplace: Option<MarketplaceMetadata>,
}

/// Installation metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstallMetadata {
    pub installed_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Where the integration came from (api, marketplace, local)
    pub source: String,
    pub enabled: bool,
}

impl InstallMetadata {
    pub fn new(source: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            installed_at: now,
            updated_at: now,
            source: source.into(),
            enabled: true,
        }
    }
}

/// Optional marketplace metadata
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarketplaceMetadata {
    pub publisher: Option<String>,
    pub rating: Option<f64>,
    pub downloads: Option<u64>,
    pub homepage: Option<String>,
}

/// Partial update of an integration's mutable fields
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntegrationPatch {
    pub name: Option<String>,
    pub version: Option<String>,
    pub description: Option<String>,
    pub author: Option<String>,
    pub category: Option<Category>,
    pub tools: Option<Vec<Tool>>,
    pub permissions: Option<BTreeSet<Permission>>,
    pub config: Option<Value>,
    pub signature: Option<String>,
    pub tags: Option<Vec<String>>,
    /// Install flag; lives on the manifest, not the integration
    pub enabled: Option<bool>,
}

impl IntegrationPatch {
    /// Apply the patch on top of an integration; the id is never touched
    pub fn apply_to(&self, integration: &mut Integration) {
        if let Some(name) = &self.name {
            integration.name = name.clone();
        }
        if let Some(version) = &self.version {
            integration.version = version.clone();
        }
        if let Some(description) = &self.description {
            integration.description = description.clone();
        }
        if let Some(author) = &self.author {
            integration.author = author.clone();
        }
        if let Some(category) = self.category {
            integration.category = category;
        }
        if let Some(tools) = &self.tools {
            integration.tools = tools.clone();
        }
        if let Some(permissions) = &self.permissions {
            integration.permissions = permissions.clone();
        }
        if let Some(config) = &self.config {
            integration.config = Some(config.clone());
        }
        if let Some(signature) = &self.signature {
            integration.signature = Some(signature.clone());
        }
        if let Some(tags) = &self.tags {
            integration.tags = tags.clone();
        }
    }
}

impl Integration {
    /// Create an integration with the mandatory manifest fields
    pub fn new(
        name: impl Into<String>,
        version: impl Into<String>,
        author: impl Into<String>,
        tools: Vec<Tool>,
    ) -> Self {
        Self {
            id: String::new(),
            name: name.into(),
            version: version.into(),
            description: String::new(),
            author: author.into(),
            category: Category::default(),
            tools,
            permissions: BTreeSet::new(),
            config: None,
            signature: None,
            sandbox_config: None,
            tags: Vec::new(),
        }
    }

    /// Look up a tool by name
    pub fn tool(&self, name: &str) -> Option<&Tool> {
        self.tools.iter().find(|tool| tool.name == name)
    }

    /// Whether the integration holds a capability
    pub fn has_permission(&self, permission: &Permission) -> bool {
        self.permissions.contains(permission)
    }
}

impl Tool {
    /// Create a tool accepting any object
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            input_schema: Schema::default(),
            output_schema: None,
            rate_limit: None,
            permissions: Vec::new(),
            entrypoint: None,
            examples: Vec::new(),
        }
    }

    pub fn with_input_schema(mut self, schema: Schema) -> Self {
        self.input_schema = schema;
        self
    }

    pub fn with_output_schema(mut self, schema: Schema) -> Self {
        self.output_schema = Some(schema);
        self
    }

    pub fn with_rate_limit(mut self, requests: u32, window_seconds: u64) -> Self {
        self.rate_limit = Some(RateLimit {
            requests,
            window_seconds,
        });
        self
    }

    pub fn with_entrypoint(mut self, command: impl Into<String>, args: Vec<String>) -> Self {
        self.entrypoint = Some(Entrypoint {
            command: command.into(),
            args,
        });
        self
    }
}

/// Tool invocation request
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteRequest {
    /// Target integration
    #[validate(length(min = 1))]
    pub integration_id: String,

    /// Tool name
    #[validate(length(min = 1))]
    pub tool: String,

    /// Tool parameters
    #[serde(default = "empty_object")]
    pub params: Value,

    /// Capabilities the caller declares the call needs
    #[serde(default)]
    pub permissions: Vec<Permission>,
}

fn empty_object() -> Value {
    Value::Object(Default::default())
}

/// Structured outcome of one tool invocation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ExecutionFailure>,
    pub metrics: ExecutionMetrics,
}

/// Error half of an execution result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionFailure {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
}

/// Timing of one invocation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionMetrics {
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub duration_ms: u64,
}

impl ExecutionResult {
    pub fn is_rate_limited(&self) -> bool {
        self.error
            .as_ref()
            .map(|error| error.code == "RATE_LIMIT_EXCEEDED")
            .unwrap_or(false)
    }

    pub fn error_code(&self) -> Option<&str> {
        self.error.as_ref().map(|error| error.code.as_str())
    }
}

/// Registration response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterResponse {
    pub id: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

/// Kind of batch operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchType {
    Test,
    Deploy,
    Update,
    Validate,
    Execute,
}

impl BatchType {
    /// Whether items of this type change integration state and can be rolled back
    pub fn supports_rollback(&self) -> bool {
        matches!(self, BatchType::Update | BatchType::Deploy)
    }
}

/// One unit of work in a batch
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchItem {
    #[serde(default)]
    pub id: String,
    pub integration_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool: Option<String>,
    #[serde(default = "empty_object")]
    pub params: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update: Option<IntegrationPatch>,
}

impl BatchItem {
    pub fn execute(integration_id: impl Into<String>, tool: impl Into<String>, params: Value) -> Self {
        Self {
            id: String::new(),
            integration_id: integration_id.into(),
            tool: Some(tool.into()),
            params,
            update: None,
        }
    }

    pub fn update(integration_id: impl Into<String>, patch: IntegrationPatch) -> Self {
        Self {
            id: String::new(),
            integration_id: integration_id.into(),
            tool: None,
            params: empty_object(),
            update: Some(patch),
        }
    }
}

/// Execution policy of a batch
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase", default)]
pub struct BatchConfig {
    /// Items dispatched concurrently per chunk
    #[validate(range(min = 1, max = 256))]
    pub concurrency: usize,

    /// Retries after the first failed attempt
    #[validate(range(max = 10))]
    pub retry_attempts: u32,

    /// Base retry delay; attempt `n` waits `n * retry_delay_ms`
    pub retry_delay_ms: u64,

    /// Per-attempt timeout
    #[validate(range(min = 1))]
    pub timeout_ms: u64,

    pub continue_on_error: bool,

    pub rollback_on_failure: bool,

    /// Resident memory ceiling sampled before each chunk
    pub memory_limit_mb: Option<u64>,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            concurrency: 5,
            retry_attempts: 0,
            retry_delay_ms: 1000,
            timeout_ms: 30_000,
            continue_on_error: true,
            rollback_on_failure: false,
            memory_limit_mb: None,
        }
    }
}

/// Batch lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl BatchStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BatchStatus::Completed | BatchStatus::Failed | BatchStatus::Cancelled
        )
    }
}

/// Mid-flight progress of a batch
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchProgress {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub percentage: f64,
    /// Items per second since the run started
    pub throughput: f64,
    pub eta_seconds: Option<u64>,
}

/// Result status of one batch item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Success,
    Failed,
}

/// Result of one batch item
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchResult {
    pub item_id: String,
    pub integration_id: String,
    pub status: ItemStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub attempts: u32,
    pub duration_ms: u64,
}

/// A batch of tool invocations executed under one policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchOperation {
    pub id: String,
    #[serde(rename = "type")]
    pub batch_type: BatchType,
    pub items: Vec<BatchItem>,
    pub config: BatchConfig,
    pub status: BatchStatus,
    pub progress: BatchProgress,
    pub results: Vec<BatchResult>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub rolled_back: bool,
}

/// Which side of the run a snapshot was captured on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotPhase {
    Before,
    After,
}

/// Captured state of every integration touched by a batch
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub operation_id: String,
    pub phase: SnapshotPhase,
    pub captured_at: DateTime<Utc>,
    /// Integration state keyed by id; `None` when the integration did not exist
    pub integrations: BTreeMap<String, Option<Integration>>,
}

/// Derived operational classification of an integration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    #[default]
    Healthy,
    Degraded,
    Unhealthy,
    Offline,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Unhealthy => "unhealthy",
            HealthStatus::Offline => "offline",
        };
        f.write_str(name)
    }
}

/// Requests observed during one minute
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MinuteBucket {
    pub minute: DateTime<Utc>,
    pub requests: u64,
    pub failures: u64,
}

/// Rolling health metrics
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthMetrics {
    pub total_requests: u64,
    pub successful_requests: u64,
    /// Failed / total, 0.0 - 1.0
    pub error_rate: f64,
    /// Successful / total, 0.0 - 1.0
    pub uptime: f64,
    pub avg_response_time_ms: f64,
    pub p95_response_time_ms: u64,
    pub p99_response_time_ms: u64,
    pub last_response_time_ms: u64,
    pub minute_buckets: Vec<MinuteBucket>,
}

/// Health snapshot of one integration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntegrationHealth {
    pub integration_id: String,
    pub integration_name: String,
    pub status: HealthStatus,
    pub metrics: HealthMetrics,
    pub consecutive_failures: u32,
    pub last_check: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl IntegrationHealth {
    pub fn new(integration_id: impl Into<String>, integration_name: impl Into<String>) -> Self {
        Self {
            integration_id: integration_id.into(),
            integration_name: integration_name.into(),
            status: HealthStatus::Healthy,
            metrics: HealthMetrics::default(),
            consecutive_failures: 0,
            last_check: None,
            last_error: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_permission_vocabulary() {
        let parsed: BTreeSet<Permission> =
            serde_json::from_value(json!(["network", "filesystem", "teleport"])).unwrap();

        assert!(parsed.contains(&Permission::Network));
        assert!(parsed.contains(&Permission::Filesystem));
        assert!(parsed.contains(&Permission::Unrecognized("teleport".to_string())));
        assert_eq!(Permission::ALL.len(), 9);
        assert!(Permission::ALL.iter().all(Permission::is_recognized));
    }

    #[test]
    fn test_integration_from_camel_case_manifest() {
        let integration: Integration = serde_json::from_value(json!({
            "name": "notes",
            "version": "1.2.3",
            "author": "acme",
            "category": "productivity",
            "tools": [{
                "name": "create_note",
                "inputSchema": {
                    "type": "object",
                    "properties": { "title": { "type": "string" } },
                    "required": ["title"]
                },
                "rateLimit": { "requests": 2, "windowSeconds": 60 }
            }],
            "permissions": ["network"]
        }))
        .unwrap();

        assert!(integration.id.is_empty());
        assert_eq!(integration.category, Category::Productivity);
        let tool = integration.tool("create_note").unwrap();
        assert_eq!(
            tool.rate_limit,
            Some(RateLimit {
                requests: 2,
                window_seconds: 60
            })
        );
        assert!(integration.has_permission(&Permission::Network));
    }

    #[test]
    fn test_patch_preserves_id() {
        let mut integration = Integration::new("notes", "1.0.0", "acme", vec![Tool::new("a", "")]);
        integration.id = "fixed".to_string();

        let patch = IntegrationPatch {
            version: Some("1.1.0".to_string()),
            config: Some(json!({ "foo": 2 })),
            ..Default::default()
        };
        patch.apply_to(&mut integration);

        assert_eq!(integration.id, "fixed");
        assert_eq!(integration.version, "1.1.0");
        assert_eq!(integration.config, Some(json!({ "foo": 2 })));
    }

    #[test]
    fn test_batch_type_rollback_support() {
        assert!(BatchType::Update.supports_rollback());
        assert!(BatchType::Deploy.supports_rollback());
        assert!(!BatchType::Execute.supports_rollback());
        assert!(!BatchType::Validate.supports_rollback());
    }
}
