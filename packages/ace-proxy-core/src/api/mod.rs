//! HTTP API layer.
//!
//! This module contains thin handlers that delegate to [`crate::proxy_server`].
//! It provides the router construction and server startup functionality.

use std::net::SocketAddr;
use std::sync::Arc;

use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::bootstrap::BootstrappedServices;
use crate::collaborators::InMemoryMetricsSink;
use crate::config::ProxyConfig;
use crate::proxy_server::ProxyServer;

pub mod http;
mod stream;

/// Errors that can occur when starting the server.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Failed to bind to a TCP port.
    #[error("failed to bind to {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// The server's accept loop returned an error.
    #[error("server error: {0}")]
    Serve(std::io::Error),
}

/// Shared application state for the API layer.
///
/// A thin wrapper around the services [`crate::bootstrap::bootstrap_services`]
/// wired: all business logic lives in [`ProxyServer`] and its collaborators.
#[derive(Clone)]
pub struct AppState {
    /// The top-level content-id map and admission policy.
    pub proxy_server: Arc<ProxyServer>,
    /// Counters backing the `/metrics` endpoint.
    pub metrics_snapshot: Arc<InMemoryMetricsSink>,
    /// Validated configuration snapshot, consulted for per-request tunables
    /// (e.g. the slow-client bounded wait).
    pub config: Arc<ProxyConfig>,
}

impl AppState {
    /// Builds the API layer's state from a fully wired [`BootstrappedServices`].
    pub fn from_services(services: &BootstrappedServices) -> Self {
        Self {
            proxy_server: Arc::clone(&services.proxy_server),
            metrics_snapshot: Arc::clone(&services.metrics_snapshot),
            config: Arc::clone(&services.config),
        }
    }
}

/// Starts the HTTP server on `bind_addr`, serving until `cancel` fires.
///
/// Uses `into_make_service_with_connect_info` so handlers can extract the
/// client's `SocketAddr` for the client registry's `remote_addr` field.
pub async fn start_server(
    state: AppState,
    bind_addr: SocketAddr,
    cancel: CancellationToken,
) -> Result<(), ServerError> {
    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .map_err(|source| ServerError::Bind {
            addr: bind_addr,
            source,
        })?;

    log::info!("ace-proxy listening on http://{bind_addr}");
    let app = http::create_router(state);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move { cancel.cancelled().await })
    .await
    .map_err(ServerError::Serve)
}
