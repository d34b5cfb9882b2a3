//! Centralized error types for the proxy core.
//!
//! This module provides a unified error handling system that:
//! - Defines structured error types using `thiserror`
//! - Maps errors to the HTTP status codes specified for the streaming endpoint
//! - Implements `IntoResponse` for automatic JSON error responses

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

/// Trait for error types that provide machine-readable error codes.
///
/// Implement this trait to provide consistent error codes across different
/// error conversion paths.
pub trait ErrorCode {
    /// Returns a machine-readable error code for API responses.
    fn code(&self) -> &'static str;
}

/// Application-wide error type for the proxy.
///
/// Variants are grouped by the taxonomy: admission errors (no session
/// created), startup errors (session created, no bytes delivered yet), and
/// internal invariant violations. Mid-stream failures
/// (`UpstreamStalled`/`UpstreamClosed`/`UpstreamReset`) are deliberately not
/// represented here: once bytes have been delivered the response is already
/// `200 OK` and streaming, so those are surfaced by ending the body, not by
/// an HTTP error: the reader's own failures reuse these same variants.
#[derive(Debug, Error, Serialize)]
#[serde(tag = "type", content = "details")]
pub enum ProxyError {
    /// The content id has been marked as looping by the loop detector.
    #[error("content id is marked as looping: {0}")]
    CidLooping(String),

    /// The engine selector could not find a usable engine.
    #[error("no engine available for content id {0}")]
    NoEngineAvailable(String),

    /// The per-CID soft client cap has been reached.
    #[error("too many clients for content id {0}")]
    TooManyClients(String),

    /// Could not connect to the engine's handshake or playback endpoint.
    #[error("upstream unreachable: {0}")]
    UpstreamUnreachable(String),

    /// The engine responded with a non-2xx status at handshake or playback.
    #[error("upstream rejected request with status {status}: {detail}")]
    UpstreamRejected { status: u16, detail: String },

    /// No bytes arrived from upstream for the configured stall window.
    /// Pre-first-chunk, this is a reselection trigger (§4.7); once any chunk
    /// has reached a client it instead ends the manager's drain.
    #[error("upstream stalled: {0}")]
    UpstreamStalled(String),

    /// No chunk was appended to the buffer within `initial_data_wait_timeout`.
    #[error("timed out waiting for initial data for content id {0}")]
    InitialDataTimeout(String),

    /// Every engine reselection attempt (§4.7, up to two) failed before any
    /// chunk was produced.
    #[error("no engine could serve content id {0} after reselection")]
    StreamUnavailable(String),

    /// An internal invariant was violated; fatal to the affected manager only.
    #[error("internal error: {0}")]
    Internal(String),

    /// The requested content id has no active or creatable stream manager.
    #[error("content id not found: {0}")]
    CidNotFound(String),
}

impl ProxyError {
    /// Returns a machine-readable error code for API responses.
    pub fn code(&self) -> &'static str {
        match self {
            Self::CidLooping(_) => "cid_looping",
            Self::NoEngineAvailable(_) => "no_engine_available",
            Self::TooManyClients(_) => "too_many_clients",
            Self::UpstreamUnreachable(_) => "upstream_unreachable",
            Self::UpstreamRejected { .. } => "upstream_rejected",
            Self::UpstreamStalled(_) => "upstream_stalled",
            Self::InitialDataTimeout(_) => "initial_data_timeout",
            Self::StreamUnavailable(_) => "stream_unavailable",
            Self::Internal(_) => "internal_error",
            Self::CidNotFound(_) => "cid_not_found",
        }
    }

    /// Maps the error to the HTTP status code specified in §6/§7.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::CidLooping(_) => StatusCode::CONFLICT,
            Self::NoEngineAvailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::TooManyClients(_) => StatusCode::TOO_MANY_REQUESTS,
            Self::UpstreamUnreachable(_) | Self::UpstreamRejected { .. } | Self::UpstreamStalled(_) => {
                StatusCode::BAD_GATEWAY
            }
            Self::InitialDataTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Self::StreamUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::CidNotFound(_) => StatusCode::NOT_FOUND,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Convenient Result alias for application-wide operations.
pub type ProxyResult<T> = Result<T, ProxyError>;

/// JSON response body for error responses.
#[derive(Serialize)]
struct ErrorResponse {
    error: &'static str,
    message: String,
    status: u16,
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ErrorResponse {
            error: self.code(),
            message: self.to_string(),
            status: status.as_u16(),
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cid_looping_returns_conflict() {
        let err = ProxyError::CidLooping("abc".into());
        assert_eq!(err.code(), "cid_looping");
        assert_eq!(err.status_code(), StatusCode::CONFLICT);
    }

    #[test]
    fn no_engine_available_returns_service_unavailable() {
        let err = ProxyError::NoEngineAvailable("abc".into());
        assert_eq!(err.status_code(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn too_many_clients_returns_too_many_requests() {
        let err = ProxyError::TooManyClients("abc".into());
        assert_eq!(err.status_code(), StatusCode::TOO_MANY_REQUESTS);
    }

    #[test]
    fn initial_data_timeout_returns_gateway_timeout() {
        let err = ProxyError::InitialDataTimeout("abc".into());
        assert_eq!(err.status_code(), StatusCode::GATEWAY_TIMEOUT);
    }

    #[test]
    fn upstream_rejected_returns_bad_gateway() {
        let err = ProxyError::UpstreamRejected {
            status: 403,
            detail: "forbidden".into(),
        };
        assert_eq!(err.status_code(), StatusCode::BAD_GATEWAY);
    }
}
