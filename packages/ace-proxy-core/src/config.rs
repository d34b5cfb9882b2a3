//! Configuration view for the proxy core.
//!
//! [`ProxyConfig`] is the read-only snapshot of tunables consulted whenever a
//! stream manager starts (§4.1). It is validated at construction rather than
//! at use, the same discipline the desktop build applies to its own
//! streaming parameters: reject nonsensical values once, up front, instead of
//! guarding every call site.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Read-only snapshot of tunable settings consulted at stream start.
///
/// Mid-stream changes to a freshly loaded `ProxyConfig` apply only to streams
/// started afterward; an already-running stream manager keeps the snapshot
/// it was built with.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Maximum time a newly joined client waits for the buffer to contain
    /// any chunk before failing with `InitialDataTimeout` (seconds).
    pub initial_data_wait_timeout_secs: f64,

    /// Polling cadence while awaiting the first chunk (seconds).
    pub initial_data_check_interval_secs: f64,

    /// Number of consecutive stalled checks before the reader fails with
    /// `UpstreamStalled`. The stall threshold is this value times
    /// `no_data_check_interval_secs`.
    pub no_data_timeout_checks: u32,

    /// Interval between stall checks once the stream is serving (seconds).
    pub no_data_check_interval_secs: f64,

    /// Upstream HTTP connect timeout (seconds).
    pub connection_timeout_secs: u64,

    /// Overall idle timeout for a manager with no connected clients
    /// (seconds). Currently advisory; enforced via the draining state
    /// machine rather than a separate timer.
    pub stream_timeout_secs: u64,

    /// Grace period between "last client left" and stopping the reader
    /// (seconds). Also the cleanup sweeper's run interval.
    pub channel_shutdown_delay_secs: u64,

    /// Admission threshold consulted by the engine selector.
    pub max_streams_per_engine: u32,

    /// Preferred read size from upstream, in bytes. Actual chunk sizes may
    /// be smaller due to MPEG-TS packet alignment.
    pub chunk_size_bytes: usize,

    /// Ring buffer TTL (seconds); chunks older than this are evicted.
    pub buffer_ttl_seconds: u64,

    /// Ring buffer capacity, in chunks.
    pub buffer_max_chunks: usize,

    /// Expected interval between client heartbeats (seconds).
    pub client_heartbeat_interval_secs: u64,

    /// A client is considered stale (and swept) after this many seconds
    /// without a heartbeat.
    pub client_stale_after_secs: u64,

    /// Optional soft cap on clients per content id; `None` means unlimited.
    pub max_clients_per_cid: Option<usize>,

    /// User-Agent sent on the upstream playback request.
    pub user_agent: String,

    /// Bounded wait, in milliseconds, a per-client delivery task allows a
    /// single enqueue to take before treating the client as `SlowClient` and
    /// dropping it (§4.6 step 4). Approximates "one chunk time": long enough
    /// that a client reading at a normal rate never trips it, short enough
    /// that one stalled client can't stall the others behind it.
    pub client_send_bounded_wait_ms: u64,
}

impl ProxyConfig {
    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns a description of the first invalid field encountered.
    pub fn validate(&self) -> Result<(), String> {
        if !(1.0..=60.0).contains(&self.initial_data_wait_timeout_secs) {
            return Err("initial_data_wait_timeout_secs must be in 1..=60".to_string());
        }
        if !(0.1..=2.0).contains(&self.initial_data_check_interval_secs) {
            return Err("initial_data_check_interval_secs must be in 0.1..=2.0".to_string());
        }
        if self.no_data_timeout_checks == 0 {
            return Err("no_data_timeout_checks must be >= 1".to_string());
        }
        if self.no_data_check_interval_secs <= 0.0 {
            return Err("no_data_check_interval_secs must be > 0".to_string());
        }
        if self.connection_timeout_secs == 0 {
            return Err("connection_timeout_secs must be >= 1".to_string());
        }
        if !(1..=20).contains(&self.max_streams_per_engine) {
            return Err("max_streams_per_engine must be in 1..=20".to_string());
        }
        if self.chunk_size_bytes < MPEGTS_PACKET_SIZE {
            return Err("chunk_size_bytes must be at least one MPEG-TS packet".to_string());
        }
        if self.buffer_max_chunks == 0 {
            return Err("buffer_max_chunks must be >= 1".to_string());
        }
        if self.client_stale_after_secs == 0 {
            return Err("client_stale_after_secs must be >= 1".to_string());
        }
        if self.client_send_bounded_wait_ms == 0 {
            return Err("client_send_bounded_wait_ms must be >= 1".to_string());
        }
        Ok(())
    }

    /// Builds a validated config, returning an error instead of panicking on
    /// bad values.
    pub fn new_validated(self) -> Result<Self, String> {
        self.validate()?;
        Ok(self)
    }

    /// Convenience accessor as a [`Duration`].
    pub fn initial_data_wait_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.initial_data_wait_timeout_secs)
    }

    /// Convenience accessor as a [`Duration`].
    pub fn initial_data_check_interval(&self) -> Duration {
        Duration::from_secs_f64(self.initial_data_check_interval_secs)
    }

    /// Convenience accessor as a [`Duration`].
    pub fn no_data_check_interval(&self) -> Duration {
        Duration::from_secs_f64(self.no_data_check_interval_secs)
    }

    /// The "reader is stalled" threshold: `no_data_timeout_checks` ×
    /// `no_data_check_interval_secs`.
    pub fn stall_threshold(&self) -> Duration {
        self.no_data_check_interval() * self.no_data_timeout_checks
    }

    /// Convenience accessor as a [`Duration`].
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout_secs)
    }

    /// Convenience accessor as a [`Duration`].
    pub fn channel_shutdown_delay(&self) -> Duration {
        Duration::from_secs(self.channel_shutdown_delay_secs)
    }

    /// Convenience accessor as a [`Duration`].
    pub fn buffer_ttl(&self) -> Duration {
        Duration::from_secs(self.buffer_ttl_seconds)
    }

    /// Convenience accessor as a [`Duration`].
    pub fn client_heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.client_heartbeat_interval_secs)
    }

    /// Convenience accessor as a [`Duration`].
    pub fn client_stale_after(&self) -> Duration {
        Duration::from_secs(self.client_stale_after_secs)
    }

    /// Convenience accessor as a [`Duration`].
    pub fn client_send_bounded_wait(&self) -> Duration {
        Duration::from_millis(self.client_send_bounded_wait_ms)
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            initial_data_wait_timeout_secs: 10.0,
            initial_data_check_interval_secs: 0.2,
            no_data_timeout_checks: 60,
            no_data_check_interval_secs: 1.0,
            connection_timeout_secs: 10,
            stream_timeout_secs: 60,
            channel_shutdown_delay_secs: 5,
            max_streams_per_engine: 3,
            chunk_size_bytes: 1024 * 1024,
            buffer_ttl_seconds: 60,
            buffer_max_chunks: 100,
            client_heartbeat_interval_secs: 10,
            client_stale_after_secs: 60,
            max_clients_per_cid: None,
            user_agent: "ace-proxy/1".to_string(),
            client_send_bounded_wait_ms: 2_000,
        }
    }
}

use crate::protocol_constants::MPEGTS_PACKET_SIZE;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(ProxyConfig::default().validate().is_ok());
    }

    #[test]
    fn rejects_zero_no_data_timeout_checks() {
        let mut cfg = ProxyConfig::default();
        cfg.no_data_timeout_checks = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_chunk_size_below_one_packet() {
        let mut cfg = ProxyConfig::default();
        cfg.chunk_size_bytes = 10;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_out_of_range_max_streams_per_engine() {
        let mut cfg = ProxyConfig::default();
        cfg.max_streams_per_engine = 0;
        assert!(cfg.validate().is_err());
        cfg.max_streams_per_engine = 21;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn stall_threshold_is_product_of_checks_and_interval() {
        let cfg = ProxyConfig::default();
        assert_eq!(cfg.stall_threshold(), Duration::from_secs(60));
    }
}
