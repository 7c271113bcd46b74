//! Embercast Server - standalone headless streaming media server.
//!
//! This binary wires the core engine to a configuration file and the
//! process environment: CLI parsing, logging, signal handling. Everything
//! else lives in `embercast-core`.

mod config;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use embercast_core::{bootstrap, NoTlsProvider};
use tokio::signal;

use crate::config::ServerConfig;

/// Embercast Server - headless streaming media server.
#[derive(Parser, Debug)]
#[command(name = "embercast-server")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file (YAML).
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace).
    #[arg(short, long, default_value = "info", env = "EMBERCAST_LOG_LEVEL")]
    log_level: log::LevelFilter,

    /// Bind port for the first listen socket (overrides config file).
    #[arg(short = 'p', long, env = "EMBERCAST_BIND_PORT")]
    port: Option<u16>,

    /// Web root directory for static files (overrides config file).
    #[arg(short = 'w', long, env = "EMBERCAST_WEBROOT_DIR")]
    webroot: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    env_logger::Builder::new()
        .filter_level(args.log_level)
        .format_timestamp_millis()
        .init();

    log::info!("Embercast Server v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let mut config =
        ServerConfig::load(args.config.as_deref()).context("Failed to load configuration")?;

    // Apply CLI overrides
    if let Some(port) = args.port {
        if let Some(first) = config.core.listen.first_mut() {
            first.port = port;
        }
    }
    if let Some(webroot) = args.webroot {
        config.core.webroot = Some(webroot);
    }

    log::info!(
        "Configuration: {} listener(s), {} mount definition(s), {} relay(s)",
        config.core.listen.len(),
        config.core.mounts.len(),
        config.core.relays.len()
    );

    // Bootstrap and start the engine. TLS stays off unless a provider is
    // wired in; listeners demanding TLS will refuse clients with 426.
    let mut server =
        bootstrap(config.core, Arc::new(NoTlsProvider)).map_err(anyhow::Error::msg)?;
    server.start();

    log::info!("Server started");

    // Wait for shutdown signal
    shutdown_signal().await;

    log::info!("Shutdown signal received, cleaning up...");

    // Graceful shutdown: drains sources and the task set.
    server.shutdown().await;

    log::info!("Shutdown complete");
    Ok(())
}

/// Waits for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
