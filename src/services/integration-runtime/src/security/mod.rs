//! Security Manager
//!
//! Validates integration manifests, derives sandbox configuration, checks
//! signatures and domain policy, and runs tool workers in isolation.

pub mod sandbox;
pub mod signature;

use crate::{
    config::SecurityConfig,
    models::{Entrypoint, Integration, Permission, RateLimit, SandboxConfig},
    Result, RuntimeError,
};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::Arc;
use tracing::{info, warn};

pub use sandbox::{Isolation, WorkerContext, WorkerRequest, WorkerResponse};
pub use signature::{SignatureVerifier, TrustedSignatureSet};

/// Substrings flagged when found anywhere in a manifest
const RISK_PATTERNS: &[&str] = &[
    "eval(",
    "new Function",
    "child_process",
    "exec(",
    "spawn(",
    "rm -rf",
    "unlink",
    "fs.rmSync",
    "process.exit",
    "std::process::Command",
    "__proto__",
];

/// Recent security events kept in memory
const MAX_SECURITY_EVENTS: usize = 256;

/// Outcome of a successful validation
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub warnings: Vec<String>,
}

/// Kind of recorded security event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurityEventKind {
    PermissionDenied,
    SignatureRejected,
    RiskPattern,
    DomainBlocked,
    UnconfinedExecution,
}

/// Security relevant event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityEvent {
    pub timestamp: DateTime<Utc>,
    pub kind: SecurityEventKind,
    pub integration_id: Option<String>,
    pub detail: String,
}

/// Security manager
#[derive(Debug)]
pub struct SecurityManager {
    config: SecurityConfig,
    sandbox_enabled: bool,
    verifier: Arc<dyn SignatureVerifier>,
    events: Mutex<VecDeque<SecurityEvent>>,
}

impl SecurityManager {
    /// Create a manager using the in-memory trusted set seeded from `config`
    pub fn new(config: SecurityConfig, sandbox_enabled: bool) -> Self {
        let verifier = Arc::new(TrustedSignatureSet::new(
            config.trusted_signatures.iter().cloned(),
        ));
        Self::with_verifier(config, sandbox_enabled, verifier)
    }

    pub fn with_verifier(
        config: SecurityConfig,
        sandbox_enabled: bool,
        verifier: Arc<dyn SignatureVerifier>,
    ) -> Self {
        if !sandbox_enabled {
            warn!("Sandbox disabled: integration workers run without isolation");
        }
        Self {
            config,
            sandbox_enabled,
            verifier,
            events: Mutex::new(VecDeque::new()),
        }
    }

    pub fn sandbox_enabled(&self) -> bool {
        self.sandbox_enabled
    }

    pub fn config(&self) -> &SecurityConfig {
        &self.config
    }

    /// Validate a manifest. Hard failures are errors; risky content is a warning.
    pub fn validate(&self, integration: &Integration) -> Result<ValidationReport> {
        let mut report = ValidationReport::default();

        for (field, value) in [
            ("name", &integration.name),
            ("version", &integration.version),
            ("author", &integration.author),
        ] {
            if value.trim().is_empty() {
                return Err(RuntimeError::InvalidManifest(format!(
                    "missing required field '{}'",
                    field
                )));
            }
        }

        if semver::Version::parse(&integration.version).is_err() {
            return Err(RuntimeError::InvalidVersion(integration.version.clone()));
        }

        if integration.tools.is_empty() {
            return Err(RuntimeError::NoTools(integration.name.clone()));
        }

        let mut tool_names = HashSet::new();
        for tool in &integration.tools {
            if tool.name.trim().is_empty() {
                return Err(RuntimeError::InvalidManifest(
                    "tool with empty name".to_string(),
                ));
            }
            if !tool_names.insert(tool.name.as_str()) {
                return Err(RuntimeError::InvalidManifest(format!(
                    "duplicate tool name '{}'",
                    tool.name
                )));
            }
            tool.input_schema.check()?;
            if let Some(output) = &tool.output_schema {
                output.check()?;
            }
            if let Some(limit) = &tool.rate_limit {
                if limit.requests == 0 || limit.window_seconds == 0 {
                    return Err(RuntimeError::InvalidManifest(format!(
                        "tool '{}' has an empty rate limit",
                        tool.name
                    )));
                }
            }
            if let Some(permission) = tool.permissions.iter().find(|p| !p.is_recognized()) {
                return Err(RuntimeError::InvalidPermission(permission.to_string()));
            }
        }

        if let Some(permission) = integration.permissions.iter().find(|p| !p.is_recognized()) {
            return Err(RuntimeError::InvalidPermission(permission.to_string()));
        }

        match &integration.signature {
            None if self.config.require_signatures => {
                return Err(RuntimeError::SignatureRequired(integration.name.clone()));
            }
            Some(_) if !self.verify(integration) => {
                if self.config.require_signatures {
                    self.record(
                        SecurityEventKind::SignatureRejected,
                        Some(&integration.id),
                        format!("untrusted signature on '{}'", integration.name),
                    );
                    return Err(RuntimeError::InvalidSignature(integration.name.clone()));
                }
                report
                    .warnings
                    .push("Signature is not trusted".to_string());
            }
            _ => {}
        }

        let body = serde_json::to_string(integration)?;
        for pattern in RISK_PATTERNS {
            if body.contains(pattern) {
                report
                    .warnings
                    .push(format!("High-risk pattern '{}' found in manifest", pattern));
                self.record(
                    SecurityEventKind::RiskPattern,
                    Some(&integration.id),
                    format!("'{}' in manifest of '{}'", pattern, integration.name),
                );
            }
        }

        if !report.warnings.is_empty() {
            warn!(
                integration_name = %integration.name,
                warnings = ?report.warnings,
                "Integration validated with warnings"
            );
        }
        Ok(report)
    }

    /// Attach sandbox configuration and backfill tool rate limits
    pub fn sandbox(&self, mut integration: Integration) -> Integration {
        if !self.sandbox_enabled {
            return integration;
        }

        integration.sandbox_config = Some(self.sandbox_config_for(&integration));
        let default_limit = self.default_rate_limit();
        for tool in integration.tools.iter_mut() {
            if tool.rate_limit.is_none() {
                tool.rate_limit = Some(default_limit);
            }
        }
        integration
    }

    /// Sandbox configuration derived from policy for one integration
    pub fn sandbox_config_for(&self, integration: &Integration) -> SandboxConfig {
        let allowed_hosts = if integration.has_permission(&Permission::Network) {
            self.config.allowed_domains.clone()
        } else {
            Vec::new()
        };

        let mut environment: BTreeMap<String, String> = self.config.environment.clone();
        environment.insert("INTEGRATION_ID".to_string(), integration.id.clone());
        environment.insert("INTEGRATION_NAME".to_string(), integration.name.clone());
        environment.insert("SANDBOXED".to_string(), "1".to_string());

        SandboxConfig {
            memory_limit_mb: self.config.max_memory_mb,
            cpu_share: self.config.cpu_share,
            timeout_ms: self.config.max_execution_ms,
            allowed_hosts,
            blocked_hosts: self.config.blocked_domains.clone(),
            environment,
        }
    }

    pub fn default_rate_limit(&self) -> RateLimit {
        self.config.default_rate_limit
    }

    /// Run a worker under the given sandbox configuration
    pub async fn execute_isolated(
        &self,
        entrypoint: &Entrypoint,
        request: &WorkerRequest,
        sandbox: &SandboxConfig,
    ) -> Result<Value> {
        let result = sandbox::run_worker(entrypoint, request, Isolation::Sandboxed(sandbox)).await;
        if let Err(error) = &result {
            warn!(
                integration_id = %request.context.integration_id,
                tool = %request.tool,
                error = %error,
                "Isolated execution failed"
            );
        }
        result
    }

    /// Run a worker with no isolation. Refused while the sandbox is enabled.
    pub async fn execute_unconfined(
        &self,
        entrypoint: &Entrypoint,
        request: &WorkerRequest,
    ) -> Result<Value> {
        if self.sandbox_enabled {
            return Err(RuntimeError::PermissionDenied(
                "unconfined execution is unavailable while the sandbox is enabled".to_string(),
            ));
        }

        warn!(
            integration_id = %request.context.integration_id,
            tool = %request.tool,
            "Executing tool without isolation (development mode)"
        );
        self.record(
            SecurityEventKind::UnconfinedExecution,
            Some(&request.context.integration_id),
            format!("tool '{}' ran without isolation", request.tool),
        );
        sandbox::run_worker(
            entrypoint,
            request,
            Isolation::Unconfined {
                timeout_ms: self.config.max_execution_ms,
            },
        )
        .await
    }

    pub fn check_permission(&self, integration: &Integration, permission: &Permission) -> bool {
        integration.has_permission(permission)
    }

    /// Like [`check_permission`](Self::check_permission) but records denials
    pub fn require_permission(&self, integration: &Integration, permission: &Permission) -> Result<()> {
        if self.check_permission(integration, permission) {
            return Ok(());
        }

        warn!(
            security_event = true,
            integration_id = %integration.id,
            permission = %permission,
            "Permission denied"
        );
        self.record(
            SecurityEventKind::PermissionDenied,
            Some(&integration.id),
            format!("'{}' lacks permission '{}'", integration.name, permission),
        );
        Err(RuntimeError::PermissionDenied(format!(
            "integration '{}' lacks permission '{}'",
            integration.name, permission
        )))
    }

    /// Host policy: never blocked, and allowed when the allow-list is empty or matches
    pub fn is_allowed_domain(&self, host: &str) -> bool {
        let host = normalize_host(host);
        if host.is_empty() {
            return false;
        }

        if self
            .config
            .blocked_domains
            .iter()
            .any(|pattern| domain_matches(&host, pattern))
        {
            self.record(
                SecurityEventKind::DomainBlocked,
                None,
                format!("blocked host '{}'", host),
            );
            return false;
        }

        self.config.allowed_domains.is_empty()
            || self
                .config
                .allowed_domains
                .iter()
                .any(|pattern| domain_matches(&host, pattern))
    }

    /// Check a URL's host against domain policy
    pub fn is_allowed_url(&self, raw: &str) -> bool {
        match url::Url::parse(raw) {
            Ok(parsed) => parsed
                .host_str()
                .map(|host| self.is_allowed_domain(host))
                .unwrap_or(false),
            Err(_) => false,
        }
    }

    /// Sign with an explicit key
    pub fn sign(&self, integration: &Integration, key: &[u8]) -> Result<String> {
        signature::sign(integration, key)
    }

    /// Sign with the configured key
    pub fn sign_with_configured_key(&self, integration: &Integration) -> Result<String> {
        let key = self
            .config
            .signing_key
            .as_deref()
            .ok_or_else(|| RuntimeError::Config("no signing key configured".to_string()))?;
        signature::sign(integration, key.as_bytes())
    }

    /// Trust the integration's signature for its current content
    pub fn trust(&self, integration: &Integration) -> Result<()> {
        let signature = integration
            .signature
            .clone()
            .ok_or_else(|| RuntimeError::SignatureRequired(integration.name.clone()))?;
        let digest = signature::content_digest(integration)?;
        self.verifier.trust(signature, Some(digest));
        info!(integration_name = %integration.name, "Signature trusted");
        Ok(())
    }

    /// The signature must be trusted and, with a signing key configured, match the content
    pub fn verify(&self, integration: &Integration) -> bool {
        let Some(signature) = &integration.signature else {
            return false;
        };
        let Ok(digest) = signature::content_digest(integration) else {
            return false;
        };
        if !self.verifier.is_trusted(signature, &digest) {
            return false;
        }
        match &self.config.signing_key {
            Some(key) => signature::verify_with_key(integration, signature, key.as_bytes()),
            None => true,
        }
    }

    /// Most recent security events, oldest first
    pub fn security_events(&self) -> Vec<SecurityEvent> {
        self.events.lock().iter().cloned().collect()
    }

    fn record(&self, kind: SecurityEventKind, integration_id: Option<&str>, detail: String) {
        let mut events = self.events.lock();
        if events.len() >= MAX_SECURITY_EVENTS {
            events.pop_front();
        }
        events.push_back(SecurityEvent {
            timestamp: Utc::now(),
            kind,
            integration_id: integration_id.filter(|id| !id.is_empty()).map(str::to_string),
            detail,
        });
    }
}

fn normalize_host(host: &str) -> String {
    host.trim().trim_end_matches('.').to_ascii_lowercase()
}

/// `example.com` matches itself and its subdomains; `*.example.com` only subdomains
fn domain_matches(host: &str, pattern: &str) -> bool {
    let pattern = normalize_host(pattern);
    if pattern.is_empty() {
        return false;
    }
    if let Some(suffix) = pattern.strip_prefix("*.") {
        return host.ends_with(&format!(".{}", suffix));
    }
    let suffix = pattern.trim_start_matches('.');
    host == suffix || host.ends_with(&format!(".{}", suffix))
}
