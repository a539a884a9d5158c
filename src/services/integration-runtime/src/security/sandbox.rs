//! Isolated tool execution
//!
//! Tools with an entrypoint run in a separate worker process. The worker gets
//! one JSON request line on stdin and answers with one JSON response line on
//! stdout. A worker that overruns its wall-clock budget is killed.

use crate::{
    models::{Entrypoint, SandboxConfig},
    Result, RuntimeError,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, warn};

/// Bytes of worker stderr kept for crash reports
const STDERR_LIMIT: usize = 4096;

/// Request sent to a worker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRequest {
    pub tool: String,
    pub params: Value,
    pub context: WorkerContext,
}

/// Execution context handed to a worker
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkerContext {
    pub integration_id: String,
    pub integration_name: String,
    pub request_id: String,
    #[serde(default)]
    pub config: Option<Value>,
}

/// Response produced by a worker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerResponse {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl WorkerResponse {
    pub fn success(data: Value) -> Self {
        Self {
            ok: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(error.into()),
        }
    }
}

/// How a worker process is confined
#[derive(Debug, Clone)]
pub enum Isolation<'a> {
    /// Cleared environment plus resource limits
    Sandboxed(&'a SandboxConfig),
    /// Host environment, no limits; development only
    Unconfined { timeout_ms: u64 },
}

impl Isolation<'_> {
    fn timeout_ms(&self) -> u64 {
        match self {
            Isolation::Sandboxed(config) => config.timeout_ms,
            Isolation::Unconfined { timeout_ms } => *timeout_ms,
        }
    }
}

/// Run one request through a worker process
pub async fn run_worker(
    entrypoint: &Entrypoint,
    request: &WorkerRequest,
    isolation: Isolation<'_>,
) -> Result<Value> {
    let timeout_ms = isolation.timeout_ms();
    let mut child = spawn(entrypoint, &isolation)?;
    debug!(
        command = %entrypoint.command,
        tool = %request.tool,
        pid = ?child.id(),
        "Worker spawned"
    );

    let mut line = serde_json::to_vec(request)?;
    line.push(b'\n');

    let stdin = child.stdin.take();
    let stdout = child.stdout.take();
    let stderr = child.stderr.take().map(|stderr| tokio::spawn(read_limited(stderr)));

    let exchange = exchange(&mut child, stdin, stdout, line);
    let outcome = tokio::time::timeout(Duration::from_millis(timeout_ms), exchange).await;

    let (response, status) = match outcome {
        Ok(result) => result,
        Err(_) => {
            if let Err(e) = child.kill().await {
                warn!(error = %e, "Failed to kill timed out worker");
            }
            warn!(command = %entrypoint.command, timeout_ms, "Worker timed out");
            return Err(RuntimeError::ExecutionTimeout(timeout_ms));
        }
    };

    let stderr = match stderr {
        Some(task) => task.await.unwrap_or_default(),
        None => String::new(),
    };

    let Some(response) = response else {
        let status = status
            .map(|status| status.to_string())
            .unwrap_or_else(|| "unknown status".to_string());
        return Err(RuntimeError::WorkerCrashed(format!(
            "worker exited ({}) without a response{}",
            status,
            stderr_suffix(&stderr)
        )));
    };

    let response: WorkerResponse = serde_json::from_str(&response).map_err(|e| {
        RuntimeError::WorkerCrashed(format!("invalid worker response: {}", e))
    })?;

    if response.ok {
        Ok(response.data.unwrap_or(Value::Null))
    } else {
        Err(RuntimeError::Execution(
            response
                .error
                .unwrap_or_else(|| "worker reported failure".to_string()),
        ))
    }
}

fn spawn(entrypoint: &Entrypoint, isolation: &Isolation<'_>) -> Result<Child> {
    let mut command = std::process::Command::new(&entrypoint.command);
    command
        .args(&entrypoint.args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    if let Isolation::Sandboxed(config) = isolation {
        command.env_clear().envs(&config.environment);
        if let Some(path) = std::env::var_os("PATH") {
            command.env("PATH", path);
        }
        if !config.allowed_hosts.is_empty() {
            command.env("SANDBOX_ALLOWED_HOSTS", config.allowed_hosts.join(","));
        }
        if !config.blocked_hosts.is_empty() {
            command.env("SANDBOX_BLOCKED_HOSTS", config.blocked_hosts.join(","));
        }
        apply_limits(&mut command, config);
    }

    let mut command = Command::from(command);
    command.kill_on_drop(true);
    command.spawn().map_err(|e| {
        RuntimeError::WorkerCrashed(format!(
            "failed to spawn worker '{}': {}",
            entrypoint.command, e
        ))
    })
}

#[cfg(unix)]
fn apply_limits(command: &mut std::process::Command, config: &SandboxConfig) {
    use nix::sys::resource::{setrlimit, Resource};
    use std::os::unix::process::CommandExt;

    let memory_bytes = config.memory_limit_mb.saturating_mul(1024 * 1024);
    let cpu_seconds = cpu_budget_seconds(config);

    // SAFETY: only async-signal-safe setrlimit calls run between fork and exec.
    unsafe {
        command.pre_exec(move || {
            setrlimit(
                Resource::RLIMIT_AS,
                memory_bytes as nix::libc::rlim_t,
                memory_bytes as nix::libc::rlim_t,
            )
            .map_err(std::io::Error::from)?;
            setrlimit(
                Resource::RLIMIT_CPU,
                cpu_seconds as nix::libc::rlim_t,
                cpu_seconds as nix::libc::rlim_t,
            )
            .map_err(std::io::Error::from)?;
            Ok(())
        });
    }
}

#[cfg(not(unix))]
fn apply_limits(_command: &mut std::process::Command, config: &SandboxConfig) {
    debug!(
        memory_limit_mb = config.memory_limit_mb,
        "Resource limits are not enforced on this platform"
    );
}

/// CPU seconds allowed: the timeout scaled by the CPU share, at least one
pub fn cpu_budget_seconds(config: &SandboxConfig) -> u64 {
    let seconds = (config.timeout_ms as f64 / 1000.0) * config.cpu_share.clamp(0.0, 1.0);
    (seconds.ceil() as u64).max(1)
}

async fn exchange(
    child: &mut Child,
    stdin: Option<tokio::process::ChildStdin>,
    stdout: Option<tokio::process::ChildStdout>,
    line: Vec<u8>,
) -> (Option<String>, Option<ExitStatus>) {
    if let Some(mut stdin) = stdin {
        // A worker that exits before reading shows up as a missing response.
        if let Err(e) = stdin.write_all(&line).await {
            debug!(error = %e, "Worker closed stdin early");
        }
        drop(stdin);
    }

    let response = match stdout {
        Some(stdout) => {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) if line.trim().is_empty() => continue,
                    Ok(Some(line)) => break Some(line),
                    Ok(None) => break None,
                    Err(e) => {
                        debug!(error = %e, "Failed to read worker stdout");
                        break None;
                    }
                }
            }
        }
        None => None,
    };

    if response.is_some() {
        if let Ok(None) = child.try_wait() {
            let _ = child.start_kill();
        }
        return (response, None);
    }

    (None, child.wait().await.ok())
}

async fn read_limited<R: AsyncRead + Unpin>(reader: R) -> String {
    let mut buffer = Vec::new();
    let mut limited = reader.take(STDERR_LIMIT as u64);
    if limited.read_to_end(&mut buffer).await.is_err() {
        return String::new();
    }
    String::from_utf8_lossy(&buffer).trim().to_string()
}

fn stderr_suffix(stderr: &str) -> String {
    if stderr.is_empty() {
        String::new()
    } else {
        format!(": {}", stderr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn config(timeout_ms: u64, cpu_share: f64) -> SandboxConfig {
        SandboxConfig {
            memory_limit_mb: 512,
            cpu_share,
            timeout_ms,
            allowed_hosts: Vec::new(),
            blocked_hosts: Vec::new(),
            environment: BTreeMap::new(),
        }
    }

    #[test]
    fn test_cpu_budget() {
        assert_eq!(cpu_budget_seconds(&config(30_000, 0.5)), 15);
        assert_eq!(cpu_budget_seconds(&config(100, 0.5)), 1);
        assert_eq!(cpu_budget_seconds(&config(2_500, 1.0)), 3);
    }

    #[test]
    fn test_worker_response_wire_format() {
        let response: WorkerResponse =
            serde_json::from_str(r#"{"ok":false,"error":"boom"}"#).unwrap();
        assert!(!response.ok);
        assert_eq!(response.error.as_deref(), Some("boom"));

        let encoded = serde_json::to_string(&WorkerResponse::success(serde_json::json!(1))).unwrap();
        assert_eq!(encoded, r#"{"ok":true,"data":1}"#);
    }

    #[tokio::test]
    async fn test_missing_command_is_a_crash() {
        let entrypoint = Entrypoint {
            command: "/nonexistent/integration-worker".to_string(),
            args: Vec::new(),
        };
        let request = WorkerRequest {
            tool: "echo".to_string(),
            params: serde_json::json!({}),
            context: WorkerContext::default(),
        };

        let error = run_worker(&entrypoint, &request, Isolation::Unconfined { timeout_ms: 1000 })
            .await
            .unwrap_err();
        assert_eq!(error.error_code(), "WORKER_CRASHED");
    }
}
