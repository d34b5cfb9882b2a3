//! The proxy server: the top-level CID→manager map, single-flight manager
//! creation, and the cleanup sweeper (§4.8).
//!
//! Grounded on the desktop build's `api/mod.rs` + `api/stream.rs` router and
//! handler shapes, and on its use of `DashMap` as the concurrent seam
//! elsewhere in the crate (`playback_session_store.rs`). Single-flight
//! creation — many concurrent requests for an unseen content id collapsing
//! into one handshake — follows the lazy-once-per-key idiom also used by
//! the m3u-proxy reference example's `collapsing.rs`: the first caller to
//! insert the slot runs the handshake, everyone else awaits its result
//! instead of racing a duplicate one.

use std::sync::Arc;

use dashmap::DashMap;
use reqwest::Client;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;

use crate::collaborators::{LoopDetector, MetricsSink};
use crate::config::ProxyConfig;
use crate::engine::EngineRegistry;
use crate::error::{ProxyError, ProxyResult};
use crate::runtime::TaskSpawner;
use crate::stream::{ManagerState, StreamManager, Subscription};

/// A single-flight slot: the first caller for a content id races to insert
/// this, then every caller (including the one that inserted it) awaits its
/// `OnceCell`, which runs the handshake exactly once regardless of how many
/// callers are waiting on it.
type ManagerSlot = Arc<OnceCell<StreamManager>>;

/// Owns every active [`StreamManager`], keyed by content id, and the
/// background sweeper that stops idle ones.
pub struct ProxyServer {
    managers: DashMap<String, ManagerSlot>,
    config: Arc<ProxyConfig>,
    http_client: Client,
    engine_registry: Arc<dyn EngineRegistry>,
    loop_detector: Arc<dyn LoopDetector>,
    metrics: Arc<dyn MetricsSink>,
    spawner: Arc<dyn TaskSpawner>,
}

impl ProxyServer {
    pub fn new(
        config: Arc<ProxyConfig>,
        http_client: Client,
        engine_registry: Arc<dyn EngineRegistry>,
        loop_detector: Arc<dyn LoopDetector>,
        metrics: Arc<dyn MetricsSink>,
        spawner: Arc<dyn TaskSpawner>,
    ) -> Self {
        Self {
            managers: DashMap::new(),
            config,
            http_client,
            engine_registry,
            loop_detector,
            metrics,
            spawner,
        }
    }

    /// Returns the manager for `cid`, starting it if this is the first
    /// request to see it. Concurrent callers for the same unseen `cid`
    /// collapse into a single handshake; all of them observe its outcome.
    /// On handshake failure the slot is evicted so a later request can try
    /// again rather than being stuck behind a permanently failed attempt.
    pub async fn get_or_start_manager(&self, cid: &str) -> ProxyResult<StreamManager> {
        let slot = self
            .managers
            .entry(cid.to_string())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone();

        let config = self.config.clone();
        let http_client = self.http_client.clone();
        let engine_registry = self.engine_registry.clone();
        let loop_detector = self.loop_detector.clone();
        let metrics = self.metrics.clone();
        let spawner = self.spawner.clone();
        let cid_owned = cid.to_string();

        let result = slot
            .get_or_try_init(|| async move {
                StreamManager::start(
                    cid_owned,
                    http_client,
                    config,
                    engine_registry,
                    loop_detector,
                    metrics,
                    spawner,
                )
                .await
            })
            .await
            .map(|m| m.clone());

        if result.is_err() {
            self.managers.remove(cid);
        }

        result
    }

    /// Subscribes a client to `cid`, starting the manager if necessary.
    ///
    /// Re-checks the loop detector even when the manager already exists
    /// (§4.8 step 1 applies to every request, not just the one that created
    /// the manager), so a content id flagged looping after its manager
    /// started stops admitting new clients without waiting for the manager
    /// to drain on its own.
    pub async fn subscribe(
        &self,
        cid: &str,
        remote_addr: String,
    ) -> ProxyResult<(StreamManager, Subscription)> {
        if self.loop_detector.is_looping(cid) {
            return Err(ProxyError::CidLooping(cid.to_string()));
        }

        let manager = self.get_or_start_manager(cid).await?;
        let subscription = manager.subscribe(remote_addr).await?;
        Ok((manager, subscription))
    }

    /// Looks up an already-started manager without creating one.
    pub fn find_manager(&self, cid: &str) -> Option<StreamManager> {
        self.managers.get(cid)?.get().cloned()
    }

    /// Current number of tracked content ids (ready or still starting).
    pub fn active_cid_count(&self) -> usize {
        self.managers.len()
    }

    /// Runs forever (until `cancel` fires), periodically sweeping stale
    /// clients from every manager and stopping managers that have finished
    /// draining. Interval is `channel_shutdown_delay`, matching the desktop
    /// build's reuse of the same duration for both the drain grace period
    /// and its own housekeeping cadence.
    pub async fn run_cleanup_sweeper(&self, cancel: CancellationToken) {
        let interval = self.config.channel_shutdown_delay();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(interval) => {}
            }
            self.sweep_once().await;
        }
    }

    /// One sweep pass: sweeps stale clients per manager, then stops (and
    /// evicts) any manager that is ready to stop or already stopped.
    pub async fn sweep_once(&self) {
        let cids: Vec<String> = self.managers.iter().map(|e| e.key().clone()).collect();
        for cid in cids {
            let Some(manager) = self.find_manager(&cid) else {
                continue;
            };

            manager.sweep_stale_clients().await;

            if manager.is_ready_to_stop().await {
                manager.stop(&self.http_client).await;
            }

            if manager.state().await == ManagerState::Stopped {
                self.loop_detector.record_stop(&cid);
                self.managers.remove(&cid);
            }
        }
    }

    /// Stops every tracked manager. Used during graceful shutdown.
    pub async fn stop_all(&self) {
        let cids: Vec<String> = self.managers.iter().map(|e| e.key().clone()).collect();
        for cid in cids {
            if let Some(manager) = self.find_manager(&cid) {
                manager.stop(&self.http_client).await;
            }
        }
        self.managers.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{LoggingMetricsSink, NoopLoopDetector};
    use crate::engine::{EngineDescriptor, InMemoryEngineRegistry};
    use crate::runtime::TokioSpawner;

    fn test_server() -> ProxyServer {
        let config = Arc::new(ProxyConfig::default());
        let http_client = Client::new();
        let engine_registry: Arc<dyn EngineRegistry> = Arc::new(InMemoryEngineRegistry::new(vec![
            EngineDescriptor::new("engine-a", "http://127.0.0.1:6878"),
        ]));
        ProxyServer::new(
            config,
            http_client,
            engine_registry,
            Arc::new(NoopLoopDetector),
            Arc::new(LoggingMetricsSink),
            Arc::new(TokioSpawner::current()),
        )
    }

    #[tokio::test]
    async fn find_manager_absent_returns_none() {
        let server = test_server();
        assert!(server.find_manager("unknown").is_none());
        assert_eq!(server.active_cid_count(), 0);
    }

    #[tokio::test]
    async fn get_or_start_manager_fails_without_reachable_engine() {
        let server = test_server();
        let result = server.get_or_start_manager("deadbeef").await;
        assert!(result.is_err());
        // A failed attempt evicts its slot so a later request can retry.
        assert_eq!(server.active_cid_count(), 0);
    }
}
