//! livestate server
//!
//! Serves one shared state object over WebSocket and HTTP.

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use livestate::api::{self, ApiState};
use livestate::config::{AppConfig, DEFAULT_CONFIG_PATH};
use livestate::{Store, SyncBridge};

/// Log output format
#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

/// livestate - shared reactive state replicated to WebSocket clients
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, env = "LIVESTATE_CONFIG")]
    config: Option<String>,

    /// Override the bind host
    #[arg(long, env = "LIVESTATE_HOST")]
    host: Option<String>,

    /// Override the bind port
    #[arg(short, long, env = "LIVESTATE_PORT")]
    port: Option<u16>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Log output format
    #[arg(long, value_enum, default_value = "text")]
    log_format: LogFormat,

    /// Print the effective configuration and exit
    #[arg(long)]
    print_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let args = Args::parse();

    init_logging(&args.log_level, args.log_format)?;

    info!("Starting livestate v{}...", env!("CARGO_PKG_VERSION"));

    let mut config = load_config(args.config.as_deref()).await?;
    if let Some(host) = args.host {
        config.server.host = host;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }

    if args.print_config {
        print!("{}", serde_yaml::to_string(&config)?);
        return Ok(());
    }

    let store = Store::new(config.initial_snapshot());
    for key in store.keys() {
        if let Some(kind) = store.kind_of(&key) {
            info!("State field '{}' ({})", key, kind);
        }
    }
    if store.keys().is_empty() {
        warn!("initial_state is empty: clients have nothing to synchronize");
    }

    let bridge = SyncBridge::attach(store, config.sync_options());
    let state = Arc::new(ApiState::new(bridge.clone()));

    api::start_server(
        state,
        &config.server.host,
        config.server.port,
        &config.server.ws_path,
        shutdown_signal(),
    )
    .await?;

    bridge.detach();
    info!("livestate shutdown complete");
    Ok(())
}

/// Explicit paths must exist; the default path falls back to built-in defaults
async fn load_config(path: Option<&str>) -> Result<AppConfig> {
    match path {
        Some(path) => {
            let config = AppConfig::load(path)
                .await
                .with_context(|| format!("Failed to load config {}", path))?;
            info!("Configuration file: {}", path);
            Ok(config)
        }
        None if Path::new(DEFAULT_CONFIG_PATH).exists() => {
            let config = AppConfig::load(DEFAULT_CONFIG_PATH)
                .await
                .context("Failed to load default config")?;
            info!("Configuration file: {}", DEFAULT_CONFIG_PATH);
            Ok(config)
        }
        None => {
            warn!(
                "No configuration file found ({}), using defaults",
                DEFAULT_CONFIG_PATH
            );
            Ok(AppConfig::default())
        }
    }
}

fn init_logging(level: &str, format: LogFormat) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    let registry = tracing_subscriber::registry().with(filter);

    match format {
        LogFormat::Text => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(false)
                    .with_thread_ids(false)
                    .with_thread_names(false),
            )
            .try_init(),
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json())
            .try_init(),
    }
    .context("Failed to initialize logging")?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to install CTRL+C signal handler: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
