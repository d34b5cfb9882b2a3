//! Fixed protocol constants that should NOT be changed.
//!
//! These values are defined by the MPEG-TS and AceStream engine protocols;
//! changing them would break compatibility, unlike the tunables in
//! [`crate::config`].

// ─────────────────────────────────────────────────────────────────────────────
// MPEG-TS
// ─────────────────────────────────────────────────────────────────────────────

/// Size of a single MPEG-TS transport packet, in bytes.
///
/// Chunk payloads emitted by the reader are the largest multiple of this
/// value not exceeding the configured `chunk_size_bytes`, except possibly
/// the final chunk before shutdown.
pub const MPEGTS_PACKET_SIZE: usize = 188;

/// MIME type for the streaming endpoint's response body.
pub const MPEGTS_CONTENT_TYPE: &str = "video/mp2t";

// ─────────────────────────────────────────────────────────────────────────────
// Engine protocol
// ─────────────────────────────────────────────────────────────────────────────

/// Path of the engine's handshake endpoint.
pub const ENGINE_GETSTREAM_PATH: &str = "/ace/getstream";

/// Query parameter carrying the content id on both the handshake request and
/// the proxy's own streaming endpoint.
pub const ENGINE_CID_PARAM: &str = "id";

/// Query value requesting JSON output from the engine's handshake endpoint.
pub const ENGINE_FORMAT_JSON: &str = "json";

/// Query parameter carrying a per-request random id, forwarded to the engine
/// so it can distinguish concurrent handshakes for the same content id.
pub const ENGINE_PID_PARAM: &str = "pid";

/// Event name used to signal stream stop on `command_url`.
pub const ENGINE_STOP_EVENT: &str = "stop";

// ─────────────────────────────────────────────────────────────────────────────
// Application identity
// ─────────────────────────────────────────────────────────────────────────────

/// Application name used for the default User-Agent and service identification.
pub const APP_NAME: &str = "ace-proxy";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packet_size_matches_mpeg_ts_spec() {
        assert_eq!(MPEGTS_PACKET_SIZE, 188);
    }
}
