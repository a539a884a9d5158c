//! Integration Runtime - Main Entry Point
//!
//! Loads configuration, initializes tracing, builds the runtime and serves
//! the HTTP API plus the monitor WebSocket until SIGINT/SIGTERM.

use anyhow::Context;
use clap::Parser;
use dotenvy::dotenv;
use integration_runtime::{config::Config, server::IntegrationRuntime, telemetry::init_tracing};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(
    name = "integration-runtime",
    about = "Sandboxed execution runtime for third-party tool integrations",
    version = env!("CARGO_PKG_VERSION")
)]
struct Args {
    /// Configuration file path
    #[arg(short, long, env = "RUNTIME_CONFIG")]
    config: Option<PathBuf>,

    /// Service port (overrides config and environment)
    #[arg(short, long)]
    port: Option<u16>,

    /// Monitor WebSocket port (overrides config and environment)
    #[arg(long)]
    monitor_port: Option<u16>,

    /// Storage root (overrides config and environment)
    #[arg(long)]
    storage_root: Option<PathBuf>,

    /// Log level (overrides config and environment)
    #[arg(short, long)]
    log_level: Option<String>,

    /// Enable development mode
    #[arg(long)]
    dev: bool,

    /// Validate configuration and exit
    #[arg(long)]
    validate_config: bool,
}

async fn load_config(args: &Args) -> anyhow::Result<Config> {
    let mut config = match &args.config {
        Some(path) => Config::from_file(path).await?,
        None => Config::default(),
    };
    config.apply_env(|key| std::env::var(key).ok())?;

    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(port) = args.monitor_port {
        config.server.monitor_port = (port != 0).then_some(port);
    }
    if let Some(root) = &args.storage_root {
        config.storage.root = root.clone();
    }
    if let Some(level) = &args.log_level {
        config.logging.level = level.clone();
    }
    if args.dev {
        config.environment = "development".to_string();
        config.logging.level = "debug".to_string();
        config.logging.format = "pretty".to_string();
    }

    config.check().context("Invalid configuration")?;
    Ok(config)
}

#[tokio::main]
async fn main() {
    dotenv().ok();
    let args = Args::parse();

    let config = match load_config(&args).await {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration: {:#}", e);
            std::process::exit(1);
        }
    };

    if args.validate_config {
        println!("Configuration is valid");
        return;
    }

    if let Err(e) = init_tracing(&config.logging) {
        eprintln!("Failed to initialize tracing: {}", e);
        std::process::exit(1);
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        environment = %config.environment,
        "Starting integration runtime"
    );

    let runtime = match IntegrationRuntime::new(config).await {
        Ok(runtime) => Arc::new(runtime),
        Err(e) => {
            error!(error = %e, "Failed to start integration runtime");
            std::process::exit(1);
        }
    };

    if let Err(e) = runtime.serve().await {
        error!(error = %e, "Integration runtime stopped with error");
        std::process::exit(1);
    }
    info!("Integration runtime stopped");
}
