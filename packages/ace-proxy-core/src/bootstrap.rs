//! Application bootstrap and dependency wiring.
//!
//! This module contains the composition root - the single place where all
//! services are instantiated and wired together. This pattern provides:
//!
//! - **Clarity**: All dependency relationships are visible in one place
//! - **Testability**: Easy to swap implementations for testing
//! - **Maintainability**: Service creation logic is isolated from usage

use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;
use tokio_util::sync::CancellationToken;

use crate::collaborators::{
    CompositeMetricsSink, InMemoryMetricsSink, LoggingMetricsSink, LoopDetector, MetricsSink,
    NoopLoopDetector,
};
use crate::config::ProxyConfig;
use crate::engine::{EngineDescriptor, EngineRegistry, InMemoryEngineRegistry};
use crate::error::{ProxyError, ProxyResult};
use crate::protocol_constants::APP_NAME;
use crate::proxy_server::ProxyServer;
use crate::runtime::TokioSpawner;

/// Container for all bootstrapped services.
///
/// Holds everything wired during bootstrap. Consumed by `AppState` to build
/// the final application state.
#[derive(Clone)]
pub struct BootstrappedServices {
    /// The proxy server: CID→manager map, admission policy, cleanup sweeper.
    pub proxy_server: Arc<ProxyServer>,
    /// Known engines and their current load.
    pub engine_registry: Arc<dyn EngineRegistry>,
    /// Stop-loop refusal policy.
    pub loop_detector: Arc<dyn LoopDetector>,
    /// Operational counters, fanned out to the log and to `metrics_snapshot`.
    pub metrics: Arc<dyn MetricsSink>,
    /// In-memory counters backing the `/metrics` endpoint. The same
    /// counters `metrics` feeds, held concretely so the HTTP layer can read
    /// a snapshot without downcasting the trait object.
    pub metrics_snapshot: Arc<InMemoryMetricsSink>,
    /// Validated configuration snapshot.
    pub config: Arc<ProxyConfig>,
    /// Shared HTTP client for connection pooling, used for both engine
    /// handshakes and playback bodies.
    http_client: Client,
    /// Task spawner for background operations.
    pub spawner: TokioSpawner,
    /// Cancellation token for graceful shutdown.
    pub cancel_token: CancellationToken,
}

impl BootstrappedServices {
    /// Returns the shared HTTP client.
    pub fn http_client(&self) -> &Client {
        &self.http_client
    }

    /// Initiates graceful shutdown of all services: stops background tasks,
    /// then stops every active stream manager (which in turn tells its
    /// engine to stop).
    pub async fn shutdown(&self) {
        log::info!("beginning graceful shutdown");
        self.cancel_token.cancel();
        self.proxy_server.stop_all().await;
        log::info!("shutdown complete");
    }
}

/// Creates the shared HTTP client used for engine handshakes and playback
/// bodies.
///
/// No compression feature is enabled on this client: engine playback bodies
/// are raw MPEG-TS, and this build deliberately omits reqwest's gzip/brotli
/// decoders rather than pay for decoders a transport-stream body never uses.
fn create_http_client(config: &ProxyConfig) -> Client {
    Client::builder()
        .connect_timeout(Duration::from_secs(config.connection_timeout_secs))
        .user_agent(config.user_agent.clone())
        .build()
        .expect("failed to build HTTP client")
}

/// Bootstraps all application services with their dependencies.
///
/// This is the composition root where all services are instantiated and
/// wired together, in dependency order:
///
/// 1. Validate configuration.
/// 2. Shared infrastructure: HTTP client, task spawner, cancellation token.
/// 3. Engine registry (from the configured engine list).
/// 4. Loop detector and metrics sink.
/// 5. The proxy server itself, wired from the above.
///
/// # Errors
///
/// Returns an error if the configuration fails validation.
pub fn bootstrap_services(
    config: ProxyConfig,
    engines: Vec<EngineDescriptor>,
) -> ProxyResult<BootstrappedServices> {
    let config = Arc::new(
        config
            .new_validated()
            .map_err(ProxyError::Internal)?,
    );

    let spawner = TokioSpawner::current();
    let http_client = create_http_client(&config);
    let cancel_token = CancellationToken::new();

    log::info!("{APP_NAME} bootstrapping with {} configured engine(s)", engines.len());

    let engine_registry: Arc<dyn EngineRegistry> = Arc::new(InMemoryEngineRegistry::new(engines));
    let loop_detector: Arc<dyn LoopDetector> = Arc::new(NoopLoopDetector);
    let metrics_snapshot = Arc::new(InMemoryMetricsSink::default());
    let metrics: Arc<dyn MetricsSink> = Arc::new(CompositeMetricsSink::new(vec![
        Arc::new(LoggingMetricsSink),
        metrics_snapshot.clone(),
    ]));

    let proxy_server = Arc::new(ProxyServer::new(
        Arc::clone(&config),
        http_client.clone(),
        Arc::clone(&engine_registry),
        Arc::clone(&loop_detector),
        Arc::clone(&metrics),
        Arc::new(spawner.clone()),
    ));

    Ok(BootstrappedServices {
        proxy_server,
        engine_registry,
        loop_detector,
        metrics,
        metrics_snapshot,
        config,
        http_client,
        spawner,
        cancel_token,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_client_builds_with_configured_timeout() {
        let config = ProxyConfig::default();
        let client = create_http_client(&config);
        assert!(client.get("http://example.com").build().is_ok());
    }

    #[tokio::test]
    async fn bootstrap_wires_services_with_configured_engines() {
        let services = bootstrap_services(
            ProxyConfig::default(),
            vec![EngineDescriptor::new("engine-a", "http://127.0.0.1:6878")],
        )
        .expect("bootstrap should succeed with valid config");
        assert_eq!(services.engine_registry.list().len(), 1);
        assert_eq!(services.proxy_server.active_cid_count(), 0);
    }

    #[tokio::test]
    async fn bootstrap_rejects_invalid_config() {
        let mut config = ProxyConfig::default();
        config.max_streams_per_engine = 0;
        let result = bootstrap_services(config, vec![]);
        assert!(result.is_err());
    }
}
