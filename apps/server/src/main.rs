//! Ace Proxy Server - standalone binary for the AceStream live-stream
//! multiplexing proxy.
//!
//! Bootstraps the core library's services from a YAML config file (engine
//! list plus tunables), starts the HTTP surface, and shuts down gracefully
//! on Ctrl+C or SIGTERM.

mod config;

use std::net::SocketAddr;
use std::path::PathBuf;

use ace_proxy_core::{bootstrap_services, start_server, AppState};
use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;

use crate::config::ServerConfig;

/// Ace Proxy Server - AceStream live-stream multiplexing proxy.
#[derive(Parser, Debug)]
#[command(name = "ace-proxy-server")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file (YAML).
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace).
    #[arg(short, long, default_value = "info", env = "ACE_PROXY_LOG_LEVEL")]
    log_level: log::LevelFilter,

    /// Bind port (overrides config file).
    #[arg(short = 'p', long, env = "ACE_PROXY_BIND_PORT")]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    env_logger::Builder::new()
        .filter_level(args.log_level)
        .format_timestamp_millis()
        .init();

    log::info!("ace-proxy-server v{}", env!("CARGO_PKG_VERSION"));

    let mut config =
        ServerConfig::load(args.config.as_deref()).context("failed to load configuration")?;

    if let Some(port) = args.port {
        config.bind_port = port;
    }

    if config.engines.is_empty() {
        log::warn!("no engines configured; every stream request will fail with no_engine_available until engines are added");
    } else {
        log::info!(
            "configuration: bind={}:{}, {} engine(s)",
            config.bind_host,
            config.bind_port,
            config.engines.len()
        );
    }

    let proxy_config = config.to_core_config();
    let engines = config.to_engine_descriptors();
    let services =
        bootstrap_services(proxy_config, engines).context("failed to bootstrap services")?;

    log::info!("services bootstrapped successfully");

    let sweeper_services = services.clone();
    let sweeper_cancel = services.cancel_token.clone();
    let sweeper_handle = tokio::spawn(async move {
        sweeper_services
            .proxy_server
            .run_cleanup_sweeper(sweeper_cancel)
            .await;
    });

    let app_state = AppState::from_services(&services);
    let bind_addr = SocketAddr::new(config.bind_host, config.bind_port);
    let server_cancel = services.cancel_token.clone();

    let server_handle = tokio::spawn(async move {
        if let Err(err) = start_server(app_state, bind_addr, server_cancel).await {
            log::error!("server error: {err}");
        }
    });

    shutdown_signal().await;
    log::info!("shutdown signal received, cleaning up...");

    services.shutdown().await;
    let _ = tokio::join!(server_handle, sweeper_handle);

    log::info!("shutdown complete");
    Ok(())
}

/// Waits for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
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
