//! The stream manager: one instance per content id, owning its ring buffer,
//! client registry, and upstream reader task, and driving the
//! initializing/serving/draining/stopped state machine (§4.7).
//!
//! Grounded on the desktop build's `stream_coordinator.rs`: a thin façade
//! wrapping a registry of per-id state, exposing `subscribe`/`unsubscribe`
//! operations rather than letting callers reach into the buffer or reader
//! directly. The per-id buffer-plus-broadcast pair itself is grounded on
//! `stream/manager.rs`'s `StreamState` (`push_frame`/`subscribe`), now split
//! into [`super::buffer::RingBuffer`] for the data and this module for
//! lifecycle.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use reqwest::Client;
use tokio::sync::{broadcast, RwLock};
use tokio_util::sync::CancellationToken;

use crate::collaborators::{LoopDetector, MetricsSink};
use crate::config::ProxyConfig;
use crate::engine::{EngineDescriptor, EngineRegistry, EngineSelector};
use crate::error::{ProxyError, ProxyResult};
use crate::runtime::TaskSpawner;

use super::buffer::{Chunk, RingBuffer};
use super::client_registry::ClientRegistry;
use super::reader::{self, PlaybackSession};

/// Maximum total engine attempts for one content id before giving up with
/// `StreamUnavailable`: one initial selection plus two reselections (§4.7).
/// The reference implementation's threshold is undocumented; this fixes it
/// per the open question in §9, preserving the "never reselect after first
/// byte" invariant.
const MAX_ENGINE_ATTEMPTS: u32 = 3;

/// Lifecycle state of a stream manager, per §4.7.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerState {
    /// Handshake issued, reader started, waiting for the first chunk.
    Initializing,
    /// At least one chunk has arrived; clients may subscribe and receive
    /// data immediately.
    Serving,
    /// Last client disconnected; waiting out `channel_shutdown_delay` before
    /// stopping the reader, in case a client reconnects.
    Draining,
    /// Reader stopped, engine told to stop, buffer closed. Terminal.
    Stopped,
}

struct ManagerInner {
    state: RwLock<ManagerState>,
    buffer: RingBuffer,
    clients: ClientRegistry,
    engine: RwLock<EngineDescriptor>,
    session: RwLock<Option<PlaybackSession>>,
    draining_since: RwLock<Option<Instant>>,
    reader_cancel: CancellationToken,
    stop_reason: RwLock<Option<String>>,
}

/// Handle to one content id's streaming session.
///
/// Cheaply cloneable: internal state lives behind an `Arc`.
#[derive(Clone)]
pub struct StreamManager {
    cid: String,
    inner: Arc<ManagerInner>,
    config: Arc<ProxyConfig>,
    metrics: Arc<dyn MetricsSink>,
    engine_registry: Arc<dyn EngineRegistry>,
}

/// What a newly subscribed client receives: chunks already in the buffer,
/// followed by everything appended from now on.
pub struct Subscription {
    pub client_id: String,
    pub backlog: Vec<Chunk>,
    pub receiver: broadcast::Receiver<Chunk>,
}

impl StreamManager {
    /// Starts a new manager for `cid`: selects an engine and spawns the task
    /// that performs the handshake, reselects on transient pre-first-chunk
    /// failure (§4.7), and runs the reader. Returns as soon as the first
    /// engine has been chosen; `NoEngineAvailable` and `CidLooping` are the
    /// only failures that prevent a manager from being created at all — they
    /// surface synchronously so the caller never registers background state
    /// for a request that was refused outright (§7).
    pub async fn start(
        cid: String,
        http_client: Client,
        config: Arc<ProxyConfig>,
        engine_registry: Arc<dyn EngineRegistry>,
        loop_detector: Arc<dyn LoopDetector>,
        metrics: Arc<dyn MetricsSink>,
        spawner: Arc<dyn TaskSpawner>,
    ) -> ProxyResult<Self> {
        if loop_detector.is_looping(&cid) {
            return Err(ProxyError::CidLooping(cid));
        }

        let selector = EngineSelector::new(engine_registry.clone(), config.max_streams_per_engine);
        let engine = selector.select(&cid, &HashSet::new())?;
        engine_registry.record_acquired(&engine.id);
        metrics.stream_started(&cid, &engine.id);
        metrics.engine_selected(&engine.id);

        let inner = Arc::new(ManagerInner {
            state: RwLock::new(ManagerState::Initializing),
            buffer: RingBuffer::new(
                config.buffer_max_chunks,
                config.buffer_ttl(),
                config.buffer_max_chunks,
            ),
            clients: ClientRegistry::new(),
            engine: RwLock::new(engine.clone()),
            session: RwLock::new(None),
            draining_since: RwLock::new(None),
            reader_cancel: CancellationToken::new(),
            stop_reason: RwLock::new(None),
        });

        let manager = Self {
            cid: cid.clone(),
            inner,
            config,
            metrics,
            engine_registry,
        };

        manager.spawn_stream_task(&spawner, http_client, engine);
        Ok(manager)
    }

    /// Drives the content id's entire upstream lifecycle: handshake, reader,
    /// and — while no chunk has yet reached the buffer — reselection onto a
    /// different engine after `UpstreamUnreachable`/`UpstreamStalled` (§4.7).
    fn spawn_stream_task(
        &self,
        spawner: &Arc<dyn TaskSpawner>,
        http_client: Client,
        first_engine: EngineDescriptor,
    ) {
        let inner = self.inner.clone();
        let cid = self.cid.clone();
        let config = self.config.clone();
        let metrics = self.metrics.clone();
        let engine_registry = self.engine_registry.clone();
        let cancel = inner.reader_cancel.clone();
        let manager_handle = self.clone();

        spawner.spawn(async move {
            let mut current_engine = first_engine;
            let mut excluded: HashSet<String> = HashSet::new();
            let mut attempt: u32 = 1;

            let outcome = loop {
                let pid = uuid::Uuid::new_v4().to_string();
                let attempt_result: ProxyResult<()> = async {
                    let session = reader::handshake(
                        &http_client,
                        &current_engine,
                        &cid,
                        &pid,
                        config.connection_timeout(),
                    )
                    .await?;
                    *inner.session.write().await = Some(session.clone());
                    reader::run(
                        &http_client,
                        &session,
                        &inner.buffer,
                        &config.user_agent,
                        config.connection_timeout(),
                        config.stall_threshold(),
                        config.chunk_size_bytes,
                        cancel.clone(),
                        &cid,
                        &metrics,
                    )
                    .await
                }
                .await;

                match attempt_result {
                    Ok(()) => break Ok(()),
                    Err(err) => {
                        let pre_first_chunk = inner.buffer.is_empty();
                        let retryable = matches!(
                            err,
                            ProxyError::UpstreamUnreachable(_) | ProxyError::UpstreamStalled(_)
                        );

                        if pre_first_chunk && retryable && attempt < MAX_ENGINE_ATTEMPTS {
                            log::warn!(
                                "cid {cid}: engine {} failed before first chunk ({err}); reselecting (attempt {attempt}/{MAX_ENGINE_ATTEMPTS})",
                                current_engine.id
                            );
                            engine_registry.record_released(&current_engine.id);
                            excluded.insert(current_engine.id.clone());
                            attempt += 1;

                            let selector = EngineSelector::new(
                                engine_registry.clone(),
                                config.max_streams_per_engine,
                            );
                            match selector.select(&cid, &excluded) {
                                Ok(next) => {
                                    engine_registry.record_acquired(&next.id);
                                    metrics.engine_selected(&next.id);
                                    *inner.engine.write().await = next.clone();
                                    current_engine = next;
                                    continue;
                                }
                                Err(_) => break Err(ProxyError::StreamUnavailable(cid.clone())),
                            }
                        }

                        if pre_first_chunk && retryable {
                            break Err(ProxyError::StreamUnavailable(cid.clone()));
                        }
                        break Err(err);
                    }
                }
            };

            match outcome {
                Ok(()) => {
                    log::info!("upstream reader for cid {cid} ended cleanly");
                }
                Err(err) => {
                    log::warn!("upstream reader for cid {cid} ended with error: {err}");
                    metrics.stream_error(&cid, &err);
                    metrics.upstream_error(err.code());
                    *inner.stop_reason.write().await = Some(err.to_string());
                }
            }

            engine_registry.record_released(&current_engine.id);
            manager_handle.stop(&http_client).await;
        });
    }

    /// Waits until the buffer has produced its first chunk, fails with
    /// `StreamUnavailable` if the manager stopped before that happened (every
    /// reselection attempt exhausted), or fails with `InitialDataTimeout`
    /// once `initial_data_wait_timeout` elapses first.
    pub async fn wait_for_first_chunk(&self) -> ProxyResult<()> {
        let deadline = Instant::now() + self.config.initial_data_wait_timeout();
        loop {
            if !self.inner.buffer.is_empty() {
                let mut state = self.inner.state.write().await;
                if *state == ManagerState::Initializing {
                    *state = ManagerState::Serving;
                }
            }

            match *self.inner.state.read().await {
                ManagerState::Serving | ManagerState::Draining => return Ok(()),
                ManagerState::Stopped => {
                    let reason = self.inner.stop_reason.read().await.clone();
                    return Err(reason
                        .map(ProxyError::StreamUnavailable)
                        .unwrap_or_else(|| ProxyError::StreamUnavailable(self.cid.clone())));
                }
                ManagerState::Initializing => {}
            }

            if Instant::now() >= deadline {
                self.metrics.initial_data_wait_exceeded();
                return Err(ProxyError::InitialDataTimeout(self.cid.clone()));
            }
            tokio::time::sleep(self.config.initial_data_check_interval()).await;
        }
    }

    pub fn cid(&self) -> &str {
        &self.cid
    }

    pub async fn state(&self) -> ManagerState {
        *self.inner.state.read().await
    }

    pub fn client_count(&self) -> usize {
        self.inner.clients.len()
    }

    /// Admits a new client, subject to `max_clients_per_cid`.
    pub async fn subscribe(&self, remote_addr: String) -> ProxyResult<Subscription> {
        if let Some(max) = self.config.max_clients_per_cid {
            if self.inner.clients.len() >= max {
                return Err(ProxyError::TooManyClients(self.cid.clone()));
            }
        }

        self.wait_for_first_chunk().await?;

        let client_id = self.inner.clients.add(remote_addr);
        let (backlog, receiver) = self.inner.buffer.snapshot_and_subscribe();

        // Rejoining clients cancel a pending drain.
        *self.inner.draining_since.write().await = None;
        {
            let mut state = self.inner.state.write().await;
            if *state == ManagerState::Draining {
                *state = ManagerState::Serving;
            }
        }

        self.metrics.client_connected(&self.cid, &client_id);
        Ok(Subscription {
            client_id,
            backlog,
            receiver,
        })
    }

    /// Removes a client, e.g. on disconnect. If this was the last client,
    /// begins draining.
    pub async fn unsubscribe(&self, client_id: &str) {
        self.inner.clients.remove(client_id);
        self.metrics.client_disconnected(&self.cid, client_id);

        if self.inner.clients.is_empty() {
            let mut state = self.inner.state.write().await;
            if *state == ManagerState::Serving {
                *state = ManagerState::Draining;
                *self.inner.draining_since.write().await = Some(Instant::now());
            }
        }
    }

    pub fn heartbeat(&self, client_id: &str) -> bool {
        self.inner.clients.heartbeat(client_id)
    }

    /// Removes stale clients per `client_stale_after`. Returns the number
    /// swept.
    pub async fn sweep_stale_clients(&self) -> usize {
        let swept = self.inner.clients.sweep_stale(self.config.client_stale_after());
        if !swept.is_empty() && self.inner.clients.is_empty() {
            let mut state = self.inner.state.write().await;
            if *state == ManagerState::Serving {
                *state = ManagerState::Draining;
                *self.inner.draining_since.write().await = Some(Instant::now());
            }
        }
        swept.len()
    }

    /// Whether this manager has been draining for at least
    /// `channel_shutdown_delay` and should now be stopped.
    pub async fn is_ready_to_stop(&self) -> bool {
        if *self.inner.state.read().await != ManagerState::Draining {
            return false;
        }
        match *self.inner.draining_since.read().await {
            Some(since) => since.elapsed() >= self.config.channel_shutdown_delay(),
            None => false,
        }
    }

    /// Stops the reader, tells the engine to stop, closes the buffer, and
    /// releases the engine slot. Idempotent.
    pub async fn stop(&self, http_client: &Client) {
        {
            let mut state = self.inner.state.write().await;
            if *state == ManagerState::Stopped {
                return;
            }
            *state = ManagerState::Stopped;
        }

        self.inner.reader_cancel.cancel();
        self.inner.buffer.close();

        if let Some(session) = self.inner.session.read().await.clone() {
            reader::send_stop(http_client, &session).await;
        }

        self.metrics.stream_stopped(&self.cid);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manager_states_compare_by_value() {
        assert_eq!(ManagerState::Initializing, ManagerState::Initializing);
        assert_ne!(ManagerState::Initializing, ManagerState::Serving);
    }
}
