//! HTTP route table.
//!
//! All handlers are thin - they delegate to [`crate::proxy_server::ProxyServer`]
//! for business logic.

use axum::routing::get;
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use super::stream::{getstream, healthz, metrics};
use super::AppState;

/// Creates the Axum router with all routes.
///
/// `TraceLayer` logs one span per request at the level the desktop build
/// configures via `RUST_LOG`; `CorsLayer::permissive()` matches the desktop
/// build's stance for its own local HTTP API, appropriate here too since
/// clients are players on the operator's own network, not third-party pages.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/ace/getstream", get(getstream))
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
