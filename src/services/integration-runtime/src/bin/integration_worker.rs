//! Reference integration worker
//!
//! Speaks the sandbox worker protocol: one JSON request line on stdin, one
//! JSON response line on stdout. Its tools exercise each outcome the runtime
//! distinguishes (success, tool failure, crash, timeout, garbage output).

use integration_runtime::security::{WorkerRequest, WorkerResponse};
use serde_json::{json, Map, Value};
use std::io::{self, BufRead, Write};
use std::time::Duration;

/// Variables reported by the `env` tool
const REPORTED_VARS: [&str; 7] = [
    "SANDBOXED",
    "INTEGRATION_ID",
    "INTEGRATION_NAME",
    "SANDBOX_ALLOWED_HOSTS",
    "SANDBOX_BLOCKED_HOSTS",
    "HOME",
    "PATH",
];

fn handle(request: WorkerRequest) -> Option<WorkerResponse> {
    let params = request.params;
    let response = match request.tool.as_str() {
        "echo" => WorkerResponse::success(json!({
            "echo": params,
            "integration": request.context.integration_name,
            "requestId": request.context.request_id,
        })),
        "sum" => match params["numbers"].as_array() {
            Some(numbers) => {
                let values: Option<Vec<f64>> = numbers.iter().map(Value::as_f64).collect();
                match values {
                    Some(values) => WorkerResponse::success(json!({ "sum": values.iter().sum::<f64>() })),
                    None => WorkerResponse::failure("numbers must all be numeric"),
                }
            }
            None => WorkerResponse::failure("numbers is required"),
        },
        "fail" => WorkerResponse::failure(
            params["message"]
                .as_str()
                .unwrap_or("requested failure")
                .to_string(),
        ),
        "sleep" => {
            let ms = params["ms"].as_u64().unwrap_or(1000);
            std::thread::sleep(Duration::from_millis(ms));
            WorkerResponse::success(json!({ "slept_ms": ms }))
        }
        "env" => {
            let vars: Map<String, Value> = REPORTED_VARS
                .iter()
                .filter_map(|name| {
                    std::env::var(name)
                        .ok()
                        .map(|value| (name.to_string(), Value::String(value)))
                })
                .collect();
            WorkerResponse::success(Value::Object(vars))
        }
        "crash" => std::process::exit(3),
        "garbage" => {
            println!("this is not json");
            return None;
        }
        other => WorkerResponse::failure(format!("unknown tool '{}'", other)),
    };
    Some(response)
}

fn main() {
    let mut line = String::new();
    if let Err(e) = io::stdin().lock().read_line(&mut line) {
        eprintln!("failed to read request: {}", e);
        std::process::exit(2);
    }

    let response = match serde_json::from_str::<WorkerRequest>(line.trim()) {
        Ok(request) => handle(request),
        Err(e) => Some(WorkerResponse::failure(format!("invalid request: {}", e))),
    };

    if let Some(response) = response {
        let mut stdout = io::stdout().lock();
        match serde_json::to_string(&response) {
            Ok(encoded) => {
                let _ = writeln!(stdout, "{}", encoded);
                let _ = stdout.flush();
            }
            Err(e) => {
                eprintln!("failed to encode response: {}", e);
                std::process::exit(2);
            }
        }
    }
}
