//! The upstream reader: speaks the AceStream engine's handshake and playback
//! protocol and feeds chunks into a [`RingBuffer`] (§4.3).
//!
//! Grounded on the desktop build's HTTP client conventions (explicit
//! `connect_timeout`, disabled response compression) carried over from its
//! Sonos SOAP client, combined with `reqwest::Response::bytes_stream()` for
//! the playback body — the same shape the m3u-proxy reference example uses
//! for its own upstream fetch.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use reqwest::Client;
use serde::Deserialize;

use crate::collaborators::MetricsSink;
use crate::engine::EngineDescriptor;
use crate::error::{ProxyError, ProxyResult};
use crate::protocol_constants::{ENGINE_STOP_EVENT, MPEGTS_PACKET_SIZE};
use crate::utils::largest_multiple_at_most;

use super::buffer::{Chunk, RingBuffer};

/// Engine handshake response envelope.
///
/// AceStream engines reply to `getstream` with `{"response": {...}, "error": ...}`;
/// `error` is non-null on failure, in which case `response` is absent.
#[derive(Debug, Deserialize)]
struct GetStreamEnvelope {
    response: Option<GetStreamResponse>,
    error: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
struct GetStreamResponse {
    playback_url: String,
    #[serde(default)]
    command_url: Option<String>,
    #[serde(default)]
    stat_url: Option<String>,
    #[serde(default)]
    playback_session_id: Option<String>,
}

/// Result of a successful handshake: everything the reader needs to start
/// pulling the playback body and, later, to tell the engine to stop.
#[derive(Debug, Clone)]
pub struct PlaybackSession {
    pub playback_url: String,
    pub command_url: Option<String>,
    pub stat_url: Option<String>,
    /// The engine's opaque `playback_session_id`, if it sent one.
    pub session_token: Option<String>,
}

/// Performs the `getstream` handshake against the given engine for the
/// given content id, returning the playback session on success.
pub async fn handshake(
    client: &Client,
    engine: &EngineDescriptor,
    cid: &str,
    pid: &str,
    connection_timeout: Duration,
) -> ProxyResult<PlaybackSession> {
    let url = engine.getstream_url(cid, pid);
    let resp = client
        .get(&url)
        .timeout(connection_timeout)
        .send()
        .await
        .map_err(|e| ProxyError::UpstreamUnreachable(e.to_string()))?;

    let status = resp.status();
    if !status.is_success() {
        return Err(ProxyError::UpstreamRejected {
            status: status.as_u16(),
            detail: format!("getstream handshake failed for cid {cid}"),
        });
    }

    let envelope: GetStreamEnvelope = resp
        .json()
        .await
        .map_err(|e| ProxyError::UpstreamRejected {
            status: status.as_u16(),
            detail: format!("malformed getstream response: {e}"),
        })?;

    if let Some(err) = envelope.error {
        return Err(ProxyError::UpstreamRejected {
            status: status.as_u16(),
            detail: err,
        });
    }

    let response = envelope.response.ok_or_else(|| ProxyError::UpstreamRejected {
        status: status.as_u16(),
        detail: "getstream response missing both response and error".to_string(),
    })?;

    Ok(PlaybackSession {
        playback_url: response.playback_url,
        command_url: response.command_url,
        stat_url: response.stat_url,
        session_token: response.playback_session_id,
    })
}

/// Tells the engine to stop producing this content id. Best-effort: a
/// failure here is logged by the caller and otherwise ignored, since the
/// stream is ending regardless.
pub async fn send_stop(client: &Client, session: &PlaybackSession) {
    let Some(command_url) = &session.command_url else {
        return;
    };
    let url = format!(
        "{command_url}{sep}event={event}",
        sep = if command_url.contains('?') { "&" } else { "?" },
        event = ENGINE_STOP_EVENT,
    );
    if let Err(err) = client.get(&url).send().await {
        log::warn!("failed to send stop command to {command_url}: {err}");
    }
}

/// Pulls the playback body from upstream and appends chunks to `buffer`
/// until the body ends, the reader stalls past the configured threshold, or
/// `cancel` fires.
///
/// Chunks are sized toward `chunk_size_bytes` (§4.1): bytes accumulate in a
/// carry buffer across reads and are only flushed once at least one
/// preferred-size, packet-aligned chunk is available, so chunk boundaries
/// don't just mirror whatever size the OS happened to hand back from one
/// `read()`. Any remainder below that size is carried forward onto the next
/// read, except for the final chunk before the body ends, which is flushed
/// as-is regardless of size or alignment.
pub async fn run(
    client: &Client,
    session: &PlaybackSession,
    buffer: &RingBuffer,
    user_agent: &str,
    connection_timeout: Duration,
    stall_threshold: Duration,
    chunk_size_bytes: usize,
    cancel: tokio_util::sync::CancellationToken,
    cid: &str,
    metrics: &Arc<dyn MetricsSink>,
) -> ProxyResult<()> {
    let resp = client
        .get(&session.playback_url)
        .header("Accept-Encoding", "identity")
        .header("User-Agent", user_agent)
        .timeout(connection_timeout)
        .send()
        .await
        .map_err(|e| ProxyError::UpstreamUnreachable(e.to_string()))?;

    if !resp.status().is_success() {
        return Err(ProxyError::UpstreamRejected {
            status: resp.status().as_u16(),
            detail: "playback request rejected by upstream".to_string(),
        });
    }

    // The largest multiple of the packet size not exceeding the configured
    // preferred chunk size; emitted chunks target this length.
    let preferred_len = largest_multiple_at_most(chunk_size_bytes, MPEGTS_PACKET_SIZE)
        .max(MPEGTS_PACKET_SIZE);

    let mut body = resp.bytes_stream();
    let mut carry = bytes::BytesMut::new();
    let mut sequence: u64 = 0;
    let mut last_data_at = Instant::now();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                return Ok(());
            }
            next = body.next() => {
                match next {
                    Some(Ok(bytes)) => {
                        last_data_at = Instant::now();
                        carry.extend_from_slice(&bytes);
                        while carry.len() >= preferred_len {
                            let payload = carry.split_to(preferred_len).freeze();
                            let outcome = buffer.append(Chunk {
                                sequence,
                                payload,
                                received_at: Instant::now(),
                            });
                            metrics.chunk_produced(cid);
                            for _ in 0..outcome.evicted {
                                metrics.buffer_eviction(cid);
                            }
                            sequence += 1;
                        }
                    }
                    Some(Err(e)) => {
                        return Err(ProxyError::UpstreamUnreachable(e.to_string()));
                    }
                    None => {
                        if !carry.is_empty() {
                            let outcome = buffer.append(Chunk {
                                sequence,
                                payload: carry.split().freeze(),
                                received_at: Instant::now(),
                            });
                            metrics.chunk_produced(cid);
                            for _ in 0..outcome.evicted {
                                metrics.buffer_eviction(cid);
                            }
                        }
                        buffer.close();
                        return Ok(());
                    }
                }
            }
            () = tokio::time::sleep(stall_threshold.saturating_sub(last_data_at.elapsed())) => {
                if last_data_at.elapsed() >= stall_threshold {
                    return Err(ProxyError::UpstreamStalled(format!(
                        "no data received from upstream for {:?}",
                        last_data_at.elapsed()
                    )));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn getstream_envelope_parses_success_response() {
        let json = r#"{"response": {"playback_url": "http://x/1", "command_url": "http://x/cmd", "stat_url": null}, "error": null}"#;
        let envelope: GetStreamEnvelope = serde_json::from_str(json).unwrap();
        assert!(envelope.error.is_none());
        assert_eq!(envelope.response.unwrap().playback_url, "http://x/1");
    }

    #[test]
    fn getstream_envelope_parses_error_response() {
        let json = r#"{"response": null, "error": "unknown content id"}"#;
        let envelope: GetStreamEnvelope = serde_json::from_str(json).unwrap();
        assert_eq!(envelope.error.as_deref(), Some("unknown content id"));
    }
}
