//! In-process stand-in for an AceStream engine, used by the end-to-end
//! scenario tests in `tests/e2e.rs`. Speaks exactly the handshake/playback/
//! stop protocol `stream::reader` expects (§4.3, §6) so the tests exercise
//! the real HTTP client code path rather than mocking the reader itself.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{body::Body, Json, Router};
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

type PlaybackChunk = std::io::Result<bytes::Bytes>;

#[derive(Clone, Default)]
struct EngineState {
    base_url: Arc<Mutex<String>>,
    channels: Arc<Mutex<HashMap<String, mpsc::Receiver<PlaybackChunk>>>>,
    handshakes: Arc<AtomicUsize>,
    stop_commands: Arc<AtomicUsize>,
}

/// A running mock engine bound to an ephemeral loopback port.
pub struct MockEngine {
    pub base_url: String,
    state: EngineState,
    cancel: CancellationToken,
}

#[derive(Deserialize)]
struct HandshakeQuery {
    id: String,
}

#[derive(Deserialize)]
struct CommandQuery {
    event: Option<String>,
}

async fn handshake(
    Query(q): Query<HandshakeQuery>,
    State(state): State<EngineState>,
) -> impl IntoResponse {
    state.handshakes.fetch_add(1, Ordering::SeqCst);
    let base = state.base_url.lock().clone();
    Json(json!({
        "response": {
            "playback_url": format!("{base}/playback/{}", q.id),
            "command_url": format!("{base}/command"),
            "stat_url": null,
            "playback_session_id": uuid::Uuid::new_v4().to_string(),
        },
        "error": null,
    }))
}

async fn playback(Path(cid): Path<String>, State(state): State<EngineState>) -> Response {
    let rx = state.channels.lock().remove(&cid);
    match rx {
        Some(rx) => Response::new(Body::from_stream(ReceiverStream::new(rx))),
        None => (StatusCode::NOT_FOUND, "unregistered cid").into_response(),
    }
}

async fn command(
    Query(q): Query<CommandQuery>,
    State(state): State<EngineState>,
) -> impl IntoResponse {
    if q.event.as_deref() == Some("stop") {
        state.stop_commands.fetch_add(1, Ordering::SeqCst);
    }
    StatusCode::OK
}

impl MockEngine {
    /// Starts the mock engine on an ephemeral port and returns a handle once
    /// it is ready to accept connections.
    pub async fn start() -> Self {
        let state = EngineState::default();
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind mock engine listener");
        let addr = listener.local_addr().expect("listener has a local addr");
        let base_url = format!("http://{addr}");
        *state.base_url.lock() = base_url.clone();

        let app = Router::new()
            .route("/ace/getstream", get(handshake))
            .route("/playback/{cid}", get(playback))
            .route("/command", get(command))
            .with_state(state.clone());

        let cancel = CancellationToken::new();
        let serve_cancel = cancel.clone();
        tokio::spawn(async move {
            axum::serve(listener, app.into_make_service())
                .with_graceful_shutdown(async move { serve_cancel.cancelled().await })
                .await
                .ok();
        });

        Self {
            base_url,
            state,
            cancel,
        }
    }

    /// Registers a playback body for `cid` and returns the sender used to
    /// push chunks into it. Dropping the sender (or calling `close`) ends
    /// the body cleanly, as AceStream does on EOF.
    pub fn register_stream(&self, cid: &str) -> mpsc::Sender<PlaybackChunk> {
        let (tx, rx) = mpsc::channel(64);
        self.state.channels.lock().insert(cid.to_string(), rx);
        tx
    }

    /// Registers a playback body for `cid` that never produces a byte and
    /// never closes, for stall/initial-data-timeout scenarios. The returned
    /// sender must be kept alive by the caller for the body to stay open.
    pub fn register_silent_stream(&self, cid: &str) -> mpsc::Sender<PlaybackChunk> {
        self.register_stream(cid)
    }

    /// Number of `getstream` handshakes this engine has served so far. Used
    /// to assert that concurrent subscribers to the same content id collapse
    /// into a single handshake (single-flight, §4.8).
    pub fn handshake_count(&self) -> usize {
        self.state.handshakes.load(Ordering::SeqCst)
    }

    /// Number of `event=stop` commands this engine has received so far. Used
    /// to assert that the proxy tells the engine to stop once a stream ends,
    /// not just when a client disconnects or the server shuts down.
    pub fn stop_command_count(&self) -> usize {
        self.state.stop_commands.load(Ordering::SeqCst)
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

impl Drop for MockEngine {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
