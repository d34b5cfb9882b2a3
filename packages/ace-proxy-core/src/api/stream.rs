//! The client-facing streaming handler: `GET /ace/getstream?id={cid}`.
//!
//! Grounded on the desktop build's `stream_audio` handler (`api/stream.rs`):
//! admit, subscribe to a live channel, wrap it in a bounded forwarding loop,
//! and hand the result to `Body::from_stream`. The cadence/crossfade
//! machinery that handler needed for PCM playback has no counterpart here —
//! MPEG-TS clients read whatever arrives, whenever it arrives — so this
//! handler is considerably thinner: admission, backpressure, and cleanup are
//! the entire job.

use std::net::SocketAddr;
use std::time::Duration;

use axum::extract::connect_info::ConnectInfo;
use axum::extract::{Query, State};
use axum::http::header;
use axum::response::{IntoResponse, Response};
use axum::{body::Body, Json};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::{broadcast, mpsc};
use tokio_stream::wrappers::ReceiverStream;

use crate::api::AppState;
use crate::collaborators::MetricsSink;
use crate::error::ProxyError;
use crate::protocol_constants::MPEGTS_CONTENT_TYPE;
use crate::stream::StreamManager;

/// Depth of the per-client outgoing channel. Small on purpose: the point of
/// the bounded wait in [`forward`] is to detect a slow reader quickly, not
/// to let a deep queue mask one.
const CLIENT_CHANNEL_CAPACITY: usize = 8;

#[derive(Debug, Deserialize)]
pub(super) struct GetStreamQuery {
    id: String,
}

/// Admits a client for `id`, starting its manager if necessary, and streams
/// MPEG-TS chunks back until the client disconnects, the stream ends, or the
/// client falls behind past the configured bounded wait (§4.6).
pub(super) async fn getstream(
    Query(query): Query<GetStreamQuery>,
    State(state): State<AppState>,
    ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
) -> Result<Response, ProxyError> {
    let cid = query.id;
    let (manager, subscription) = state
        .proxy_server
        .subscribe(&cid, remote_addr.to_string())
        .await?;

    log::info!(
        "client {} ({}) admitted to cid {cid}",
        subscription.client_id,
        remote_addr
    );

    let (tx, rx) = mpsc::channel(CLIENT_CHANNEL_CAPACITY);
    let bounded_wait = state.config.client_send_bounded_wait();
    let client_id = subscription.client_id.clone();

    tokio::spawn(forward(
        manager,
        client_id,
        cid,
        subscription.backlog,
        subscription.receiver,
        tx,
        bounded_wait,
        state.metrics_snapshot.clone() as std::sync::Arc<dyn MetricsSink>,
    ));

    let body = Body::from_stream(ReceiverStream::new(rx));

    Ok(Response::builder()
        .header(header::CONTENT_TYPE, MPEGTS_CONTENT_TYPE)
        .header(header::CACHE_CONTROL, "no-cache")
        .header(header::CONNECTION, "keep-alive")
        .body(body)
        .expect("response with a streaming body is always constructible"))
}

/// Drains a client's backlog, then its live channel, into `tx`, dropping the
/// client once a single enqueue exceeds `bounded_wait` (§4.6 step 4: a slow
/// client must never stall the others behind it) or the sender side closes
/// (the client disconnected). Always unsubscribes on exit, however it ends.
async fn forward(
    manager: StreamManager,
    client_id: String,
    cid: String,
    backlog: Vec<crate::stream::Chunk>,
    mut receiver: broadcast::Receiver<crate::stream::Chunk>,
    tx: mpsc::Sender<Result<bytes::Bytes, std::io::Error>>,
    bounded_wait: Duration,
    metrics: std::sync::Arc<dyn MetricsSink>,
) {
    for chunk in backlog {
        if !send_bounded(&tx, chunk.payload, bounded_wait).await {
            log::debug!("client {client_id} dropped while draining backlog (slow or gone)");
            metrics.slow_client_dropped(&cid);
            manager.unsubscribe(&client_id).await;
            return;
        }
        manager.heartbeat(&client_id);
    }

    loop {
        match receiver.recv().await {
            Ok(chunk) => {
                if !send_bounded(&tx, chunk.payload, bounded_wait).await {
                    log::debug!("client {client_id} dropped (slow or gone)");
                    metrics.slow_client_dropped(&cid);
                    break;
                }
                manager.heartbeat(&client_id);
            }
            Err(broadcast::error::RecvError::Lagged(n)) => {
                log::warn!("client {client_id} lagged by {n} chunks, resuming from live tail");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => {
                log::debug!("stream ended for client {client_id}");
                break;
            }
        }
    }

    manager.unsubscribe(&client_id).await;
}

/// Enqueues one chunk, giving the client at most `bounded_wait` to accept it.
/// Returns `false` if the wait elapsed or the receiving end is gone.
async fn send_bounded(
    tx: &mpsc::Sender<Result<bytes::Bytes, std::io::Error>>,
    payload: bytes::Bytes,
    bounded_wait: Duration,
) -> bool {
    matches!(
        tokio::time::timeout(bounded_wait, tx.send(Ok(payload))).await,
        Ok(Ok(()))
    )
}

/// Liveness probe: the process is up and accepting connections.
pub(super) async fn healthz() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

/// Operational counters in Prometheus text exposition format. No exporter is
/// wired (that's a real metrics backend's job); this just lets an operator
/// `curl` the same counters `CompositeMetricsSink` feeds to the log.
pub(super) async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    let snap = state.metrics_snapshot.snapshot();
    let body = format!(
        "# TYPE ace_proxy_streams_started counter\n\
         ace_proxy_streams_started {}\n\
         # TYPE ace_proxy_streams_stopped counter\n\
         ace_proxy_streams_stopped {}\n\
         # TYPE ace_proxy_stream_errors counter\n\
         ace_proxy_stream_errors {}\n\
         # TYPE ace_proxy_clients_connected counter\n\
         ace_proxy_clients_connected {}\n\
         # TYPE ace_proxy_clients_disconnected counter\n\
         ace_proxy_clients_disconnected {}\n\
         # TYPE ace_proxy_chunks_produced counter\n\
         ace_proxy_chunks_produced {}\n\
         # TYPE ace_proxy_buffer_evictions counter\n\
         ace_proxy_buffer_evictions {}\n\
         # TYPE ace_proxy_chunks_dropped_slow_client counter\n\
         ace_proxy_chunks_dropped_slow_client {}\n\
         # TYPE ace_proxy_engine_selections counter\n\
         ace_proxy_engine_selections {}\n\
         # TYPE ace_proxy_upstream_errors counter\n\
         ace_proxy_upstream_errors {}\n\
         # TYPE ace_proxy_initial_data_wait_exceeded counter\n\
         ace_proxy_initial_data_wait_exceeded {}\n",
        snap.streams_started,
        snap.streams_stopped,
        snap.stream_errors,
        snap.clients_connected,
        snap.clients_disconnected,
        snap.chunks_produced,
        snap.buffer_evictions,
        snap.slow_client_drops,
        snap.engine_selections,
        snap.upstream_errors,
        snap.initial_data_wait_exceeded,
    );
    ([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::sync::Arc;
    use std::time::Instant;

    use crate::collaborators::{InMemoryMetricsSink, NoopLoopDetector};
    use crate::config::ProxyConfig;
    use crate::engine::{EngineDescriptor, EngineRegistry, InMemoryEngineRegistry};
    use crate::runtime::TokioSpawner;

    /// A client whose outgoing channel never drains must be dropped, not
    /// allowed to stall every other subscriber on the same content id (§4.6
    /// step 4). The manager's own reader never gets far here — the engine
    /// registry points nowhere reachable — but `forward` only needs a
    /// manager to call `heartbeat`/`unsubscribe` on, not a live upstream.
    #[tokio::test]
    async fn forward_drops_client_that_falls_behind() {
        let config = Arc::new(ProxyConfig::default());
        let http_client = reqwest::Client::new();
        let engine_registry: Arc<dyn EngineRegistry> = Arc::new(InMemoryEngineRegistry::new(
            vec![EngineDescriptor::new("engine-a", "http://127.0.0.1:1")],
        ));
        let metrics = Arc::new(InMemoryMetricsSink::default());

        let manager = StreamManager::start(
            "cid-e4".to_string(),
            http_client,
            config,
            engine_registry,
            Arc::new(NoopLoopDetector),
            metrics.clone() as std::sync::Arc<dyn MetricsSink>,
            Arc::new(TokioSpawner::current()),
        )
        .await
        .expect("manager starts with at least one engine available");

        let (_keep_alive_tx, brx) = broadcast::channel(4);
        let (tx, rx) = mpsc::channel::<Result<Bytes, std::io::Error>>(1);
        drop(rx);

        let backlog = vec![crate::stream::Chunk {
            sequence: 0,
            payload: Bytes::from_static(b"x"),
            received_at: Instant::now(),
        }];

        forward(
            manager,
            "client-e4".to_string(),
            "cid-e4".to_string(),
            backlog,
            brx,
            tx,
            Duration::from_millis(20),
            metrics.clone() as std::sync::Arc<dyn MetricsSink>,
        )
        .await;

        assert_eq!(metrics.snapshot().slow_client_drops, 1);
    }

    #[tokio::test]
    async fn send_bounded_succeeds_when_capacity_available() {
        let (tx, mut rx) = mpsc::channel(1);
        assert!(send_bounded(&tx, Bytes::from_static(b"x"), Duration::from_millis(50)).await);
        assert!(rx.recv().await.is_some());
    }

    #[tokio::test]
    async fn send_bounded_fails_when_receiver_dropped() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        assert!(!send_bounded(&tx, Bytes::from_static(b"x"), Duration::from_millis(50)).await);
    }

    #[tokio::test]
    async fn send_bounded_fails_when_channel_stays_full() {
        let (tx, _rx) = mpsc::channel(1);
        tx.try_send(Ok(Bytes::from_static(b"fill"))).unwrap();
        assert!(!send_bounded(&tx, Bytes::from_static(b"x"), Duration::from_millis(20)).await);
    }
}
