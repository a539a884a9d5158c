//! Configuration module for the Integration Runtime
//!
//! Configuration is layered: defaults, then an optional YAML file, then
//! `RUNTIME_*` environment variables, then command line flags.

use crate::models::RateLimit;
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;
use validator::{Validate, ValidationError};

/// Main configuration structure for the Integration Runtime
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct Config {
    /// Environment (development, staging, production)
    #[validate(custom = "validate_environment")]
    pub environment: String,

    /// Server configuration
    #[validate]
    pub server: ServerConfig,

    /// Manifest storage
    #[validate]
    pub storage: StorageConfig,

    /// Sandbox and trust policy
    #[validate]
    pub security: SecurityConfig,

    /// Health monitoring configuration
    #[validate]
    pub health: HealthConfig,

    /// Batch engine configuration
    #[validate]
    pub batch: BatchSettings,

    /// Logging configuration
    #[validate]
    pub logging: LoggingConfig,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct ServerConfig {
    /// Server host
    #[validate(length(min = 1))]
    pub host: String,

    /// HTTP port
    #[validate(range(min = 1, max = 65535))]
    pub port: u16,

    /// Dedicated monitoring WebSocket port (disabled when absent)
    pub monitor_port: Option<u16>,

    /// Request timeout in seconds
    #[validate(range(min = 1, max = 3600))]
    pub timeout_seconds: u64,

    /// Maximum request body size
    #[validate(range(min = 1024))]
    pub max_body_bytes: usize,

    /// Allowed CORS origins; empty allows any
    pub cors_origins: Vec<String>,
}

/// Manifest storage configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory holding one manifest per integration
    pub root: PathBuf,
}

/// Security configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct SecurityConfig {
    /// Explicit sandbox switch; derived from the environment when absent
    pub sandbox_enabled: Option<bool>,

    /// Reject unsigned or untrusted integrations
    pub require_signatures: bool,

    /// Signatures trusted at startup
    pub trusted_signatures: Vec<String>,

    /// HMAC key for signing and tamper checks
    pub signing_key: Option<String>,

    /// Hosts integrations may reach; empty allows every non-blocked host
    pub allowed_domains: Vec<String>,

    /// Hosts integrations may never reach
    pub blocked_domains: Vec<String>,

    /// Hard wall-clock limit for one tool call
    #[validate(range(min = 10, max = 3_600_000))]
    pub max_execution_ms: u64,

    /// Address-space ceiling for worker processes
    #[validate(range(min = 16))]
    pub max_memory_mb: u64,

    /// Share of one CPU a worker may use
    #[validate(range(min = 0.01, max = 1.0))]
    pub cpu_share: f64,

    /// Limit applied to tools that declare none
    pub default_rate_limit: RateLimit,

    /// Extra environment passed to sandboxed workers
    pub environment: BTreeMap<String, String>,
}

/// Escalation channel for unacknowledged alerts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EscalationChannel {
    Log,
    Webhook { url: String },
}

/// Health monitoring configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct HealthConfig {
    /// Start monitoring integrations automatically
    pub enabled: bool,

    /// Probe interval in seconds
    #[validate(range(min = 1, max = 86400))]
    pub check_interval_seconds: u64,

    /// Probe timeout in seconds
    #[validate(range(min = 1, max = 600))]
    pub check_timeout_seconds: u64,

    /// Consecutive failures that mark an integration unhealthy
    #[validate(range(min = 1, max = 100))]
    pub unhealthy_threshold: u32,

    /// Error rate (0-1) at which an integration is degraded
    #[validate(range(min = 0.0, max = 1.0))]
    pub degraded_error_rate: f64,

    /// Response time above which an integration is degraded
    #[validate(range(min = 1))]
    pub response_time_threshold_ms: u64,

    /// Response times kept for percentile computation
    #[validate(range(min = 1, max = 100000))]
    pub history_size: usize,

    /// Delay before an unacknowledged alert escalates
    #[validate(range(min = 1))]
    pub escalation_delay_seconds: u64,

    /// Channels notified on escalation
    pub escalation_channels: Vec<EscalationChannel>,
}

/// Batch engine configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct BatchSettings {
    /// Concurrency used when a batch does not set one
    #[validate(range(min = 1, max = 256))]
    pub default_concurrency: usize,

    /// Interval between progress events
    #[validate(range(min = 10))]
    pub progress_interval_ms: u64,

    /// Operations retained before creation is refused
    #[validate(range(min = 1))]
    pub max_operations: usize,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level
    #[validate(custom = "validate_log_level")]
    pub level: String,

    /// Log format (json, pretty, compact)
    #[validate(custom = "validate_log_format")]
    pub format: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            environment: "development".to_string(),
            server: ServerConfig::default(),
            storage: StorageConfig::default(),
            security: SecurityConfig::default(),
            health: HealthConfig::default(),
            batch: BatchSettings::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from file
    pub async fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = tokio::fs::read_to_string(path.as_ref())
            .await
            .with_context(|| format!("Failed to read config file: {:?}", path.as_ref()))?;

        let config: Config =
            serde_yaml::from_str(&content).with_context(|| "Failed to parse configuration YAML")?;

        config
            .validate()
            .with_context(|| "Configuration validation failed")?;

        Ok(config)
    }

    /// Defaults or file, then environment overrides, then policy checks
    pub async fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path).await?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.check()?;
        Ok(config)
    }

    /// Apply `RUNTIME_*` overrides using `lookup` to read variables
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup("RUNTIME_ENV") {
            self.environment = value;
        }
        if let Some(value) = lookup("RUNTIME_HOST") {
            self.server.host = value;
        }
        if let Some(value) = lookup("RUNTIME_PORT") {
            self.server.port = value.parse().context("RUNTIME_PORT must be a port number")?;
        }
        if let Some(value) = lookup("RUNTIME_MONITOR_PORT") {
            let port: u16 = value
                .parse()
                .context("RUNTIME_MONITOR_PORT must be a port number")?;
            self.server.monitor_port = (port != 0).then_some(port);
        }
        if let Some(value) = lookup("RUNTIME_SANDBOX_ENABLED") {
            self.security.sandbox_enabled = Some(parse_bool(&value).with_context(|| {
                format!("RUNTIME_SANDBOX_ENABLED has invalid value '{}'", value)
            })?);
        }
        if let Some(value) = lookup("RUNTIME_ALLOWED_DOMAINS") {
            self.security.allowed_domains = split_list(&value);
        }
        if let Some(value) = lookup("RUNTIME_BLOCKED_DOMAINS") {
            self.security.blocked_domains = split_list(&value);
        }
        if let Some(value) = lookup("RUNTIME_MAX_EXECUTION_MS") {
            self.security.max_execution_ms = value
                .parse()
                .context("RUNTIME_MAX_EXECUTION_MS must be a number")?;
        }
        if let Some(value) = lookup("RUNTIME_STORAGE_ROOT") {
            self.storage.root = PathBuf::from(value);
        }
        if let Some(value) = lookup("RUNTIME_REQUIRE_SIGNATURES") {
            self.security.require_signatures = parse_bool(&value).with_context(|| {
                format!("RUNTIME_REQUIRE_SIGNATURES has invalid value '{}'", value)
            })?;
        }
        if let Some(value) = lookup("RUNTIME_LOG_LEVEL") {
            self.logging.level = value;
        }
        Ok(())
    }

    /// Field validation plus cross-field policy
    pub fn check(&self) -> Result<()> {
        self.validate()
            .with_context(|| "Configuration validation failed")?;

        if !self.is_development() && self.security.sandbox_enabled == Some(false) {
            bail!(
                "The sandbox can only be disabled in development (environment is '{}')",
                self.environment
            );
        }
        if Some(self.server.port) == self.server.monitor_port {
            bail!("Monitor port must differ from the HTTP port");
        }
        for channel in &self.health.escalation_channels {
            if let EscalationChannel::Webhook { url } = channel {
                Url::parse(url).with_context(|| format!("Invalid escalation webhook URL: {}", url))?;
            }
        }
        Ok(())
    }

    /// Whether tool workers run sandboxed; only development may opt out
    pub fn sandbox_enabled(&self) -> bool {
        match self.security.sandbox_enabled {
            Some(enabled) if self.is_development() => enabled,
            Some(_) => true,
            None => !self.is_development(),
        }
    }

    /// Get server address
    pub fn server_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    /// Get monitor address, if the monitor listener is enabled
    pub fn monitor_address(&self) -> Option<String> {
        self.server
            .monitor_port
            .map(|port| format!("{}:{}", self.server.host, port))
    }

    /// Get request timeout
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.server.timeout_seconds)
    }

    /// Check if running in development mode
    pub fn is_development(&self) -> bool {
        self.environment == "development"
    }

    /// Check if running in production mode
    pub fn is_production(&self) -> bool {
        self.environment == "production"
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8765,
            monitor_port: Some(8766),
            timeout_seconds: 60,
            max_body_bytes: 2 * 1024 * 1024,
            cors_origins: Vec::new(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("data/integrations"),
        }
    }
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            sandbox_enabled: None,
            require_signatures: false,
            trusted_signatures: Vec::new(),
            signing_key: None,
            allowed_domains: Vec::new(),
            blocked_domains: Vec::new(),
            max_execution_ms: 30_000,
            max_memory_mb: 512,
            cpu_share: 0.5,
            default_rate_limit: RateLimit {
                requests: 100,
                window_seconds: 60,
            },
            environment: BTreeMap::new(),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            check_interval_seconds: 60,
            check_timeout_seconds: 10,
            unhealthy_threshold: 3,
            degraded_error_rate: 0.1,
            response_time_threshold_ms: 5000,
            history_size: 100,
            escalation_delay_seconds: 300,
            escalation_channels: vec![EscalationChannel::Log],
        }
    }
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            default_concurrency: 5,
            progress_interval_ms: 1000,
            max_operations: 1000,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "json".to_string(),
        }
    }
}

fn parse_bool(value: &str) -> Result<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => bail!("expected a boolean, got '{}'", other),
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}

// Validation functions
fn validate_environment(environment: &str) -> Result<(), ValidationError> {
    match environment {
        "development" | "staging" | "production" | "test" => Ok(()),
        _ => Err(ValidationError::new("Invalid environment")),
    }
}

fn validate_log_level(level: &str) -> Result<(), ValidationError> {
    match level.to_lowercase().as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
        _ => Err(ValidationError::new("Invalid log level")),
    }
}

fn validate_log_format(format: &str) -> Result<(), ValidationError> {
    match format.to_lowercase().as_str() {
        "json" | "pretty" | "compact" => Ok(()),
        _ => Err(ValidationError::new("Invalid log format")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::NamedTempFile;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[tokio::test]
    async fn test_default_config() {
        let config = Config::default();
        assert!(config.check().is_ok());
        assert!(!config.sandbox_enabled());
    }

    #[tokio::test]
    async fn test_config_from_file() {
        let yaml_content = r#"
environment: "staging"
server:
  host: "0.0.0.0"
  port: 9000
  monitor_port: 9001
storage:
  root: "/var/lib/runtime"
security:
  allowed_domains: ["api.example.com"]
  max_execution_ms: 5000
health:
  unhealthy_threshold: 5
  escalation_channels:
    - type: log
    - type: webhook
      url: "https://hooks.example.com/alerts"
logging:
  level: "debug"
  format: "pretty"
"#;

        let file = NamedTempFile::new().unwrap();
        tokio::fs::write(file.path(), yaml_content).await.unwrap();

        let config = Config::from_file(file.path()).await.unwrap();
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.monitor_address().as_deref(), Some("0.0.0.0:9001"));
        assert_eq!(config.storage.root, PathBuf::from("/var/lib/runtime"));
        assert_eq!(config.security.max_execution_ms, 5000);
        assert_eq!(config.health.unhealthy_threshold, 5);
        assert_eq!(config.health.escalation_channels.len(), 2);
        // omitted fields keep their defaults
        assert_eq!(config.health.check_interval_seconds, 60);
        assert!(config.sandbox_enabled());
        assert!(config.check().is_ok());
    }

    #[test]
    fn test_env_overrides() {
        let mut config = Config::default();
        config
            .apply_env(env(&[
                ("RUNTIME_PORT", "9100"),
                ("RUNTIME_MONITOR_PORT", "0"),
                ("RUNTIME_ALLOWED_DOMAINS", "a.com, b.com,"),
                ("RUNTIME_SANDBOX_ENABLED", "true"),
                ("RUNTIME_STORAGE_ROOT", "/tmp/store"),
                ("RUNTIME_MAX_EXECUTION_MS", "1500"),
            ]))
            .unwrap();

        assert_eq!(config.server.port, 9100);
        assert_eq!(config.server.monitor_port, None);
        assert_eq!(config.security.allowed_domains, vec!["a.com", "b.com"]);
        assert!(config.sandbox_enabled());
        assert_eq!(config.storage.root, PathBuf::from("/tmp/store"));
        assert_eq!(config.security.max_execution_ms, 1500);

        assert!(config.apply_env(env(&[("RUNTIME_PORT", "abc")])).is_err());
    }

    #[test]
    fn test_production_never_runs_unsandboxed() {
        let mut config = Config::default();
        config.environment = "production".to_string();
        assert!(config.sandbox_enabled());

        config.security.sandbox_enabled = Some(false);
        assert!(config.check().is_err());
        assert!(config.sandbox_enabled());
    }

    #[test]
    fn test_only_development_runs_unsandboxed() {
        for environment in ["staging", "test", "production"] {
            let mut config = Config::default();
            config.environment = environment.to_string();
            config.security.sandbox_enabled = Some(false);
            assert!(config.sandbox_enabled(), "{environment} must stay sandboxed");
            let error = config.check().unwrap_err();
            assert!(error.to_string().contains("only be disabled in development"));
        }

        let mut config = Config::default();
        config.environment = "development".to_string();
        config.security.sandbox_enabled = Some(false);
        assert!(config.check().is_ok());
        assert!(!config.sandbox_enabled());
    }

    #[test]
    fn test_validation_functions() {
        assert!(validate_log_level("info").is_ok());
        assert!(validate_log_level("verbose").is_err());
        assert!(validate_log_format("compact").is_ok());
        assert!(validate_log_format("xml").is_err());
        assert!(validate_environment("production").is_ok());
        assert!(validate_environment("prod").is_err());
        assert!(parse_bool("off").is_ok());
        assert!(parse_bool("maybe").is_err());
    }
}
