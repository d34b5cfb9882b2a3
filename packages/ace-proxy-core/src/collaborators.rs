//! Narrow traits for collaborators named by the spec but outside its scope
//! (loop detection, metrics), plus in-process stand-ins good enough to run
//! the proxy standalone.
//!
//! Grounded on the desktop build's pattern for its own out-of-band
//! collaborators (`EventEmitter`, `IpDetector` in `context.rs`): a small
//! trait the core depends on, a default implementation with no external
//! dependencies, and room for a real implementation to be substituted at
//! the composition root in `bootstrap.rs`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;

use crate::error::ProxyError;

/// Detects content ids currently in a stop/restart loop, so a manager can
/// refuse to (re)start them rather than hammering a misbehaving upstream.
///
/// The spec leaves the detection heuristic unspecified; this crate only
/// commits to the interface and ships a permissive default.
pub trait LoopDetector: Send + Sync {
    /// Whether `cid` should currently be refused.
    fn is_looping(&self, cid: &str) -> bool;

    /// Records that a manager for `cid` just stopped, for heuristics that
    /// key off stop frequency.
    fn record_stop(&self, cid: &str);
}

/// Detector that never refuses anything. The safe default for a
/// single-operator deployment that doesn't need loop protection.
#[derive(Default)]
pub struct NoopLoopDetector;

impl LoopDetector for NoopLoopDetector {
    fn is_looping(&self, _cid: &str) -> bool {
        false
    }

    fn record_stop(&self, _cid: &str) {}
}

/// Detector that refuses a content id once it has been stopped more than
/// `threshold` times within `window`. Counts are kept per-cid and reset
/// once the window elapses since the first recorded stop.
pub struct WindowedLoopDetector {
    threshold: u32,
    window: std::time::Duration,
    stops: DashMap<String, (std::time::Instant, u32)>,
}

impl WindowedLoopDetector {
    pub fn new(threshold: u32, window: std::time::Duration) -> Self {
        Self {
            threshold,
            window,
            stops: DashMap::new(),
        }
    }
}

impl LoopDetector for WindowedLoopDetector {
    fn is_looping(&self, cid: &str) -> bool {
        match self.stops.get(cid) {
            Some(entry) => {
                let (first_seen, count) = *entry;
                first_seen.elapsed() < self.window && count >= self.threshold
            }
            None => false,
        }
    }

    fn record_stop(&self, cid: &str) {
        let now = std::time::Instant::now();
        self.stops
            .entry(cid.to_string())
            .and_modify(|(first_seen, count)| {
                if first_seen.elapsed() >= self.window {
                    *first_seen = now;
                    *count = 1;
                } else {
                    *count += 1;
                }
            })
            .or_insert((now, 1));
    }
}

/// Sink for operational counters. The spec's Non-goals exclude a metrics
/// *exporter*, but the ambient stack still wants an interface so the rest
/// of the crate can emit counters without caring where they end up. Method
/// names map directly onto the counters/gauges named in §6:
/// `streams_active`/`clients_connected{cid}` are read on demand from
/// `ProxyServer`/`StreamManager` rather than pushed here (they're always
/// derivable from live state); everything that is genuinely an *event* gets
/// its own method.
pub trait MetricsSink: Send + Sync {
    fn stream_started(&self, cid: &str, engine_id: &str);
    fn stream_stopped(&self, cid: &str);
    fn stream_error(&self, cid: &str, error: &ProxyError);
    fn client_connected(&self, cid: &str, client_id: &str);
    fn client_disconnected(&self, cid: &str, client_id: &str);
    /// `chunks_produced_total{cid}` — one call per chunk the reader appends.
    fn chunk_produced(&self, cid: &str);
    /// `buffer_evictions_total{cid}` — one call per chunk the ring buffer
    /// evicts, whether by count or by TTL.
    fn buffer_eviction(&self, cid: &str);
    /// `chunks_dropped_slow_client_total{cid}` — one call per client dropped
    /// for falling behind past the bounded wait (§4.6 step 4).
    fn slow_client_dropped(&self, cid: &str);
    /// `engine_selections_total{engine_id}` — one call per successful
    /// selection, including reselections.
    fn engine_selected(&self, engine_id: &str);
    /// `upstream_errors_total{kind}` — one call per reader failure, keyed by
    /// the error's `code()`.
    fn upstream_error(&self, kind: &str);
    /// `initial_data_wait_exceeded_total` — one call per subscriber that
    /// timed out waiting for the first chunk.
    fn initial_data_wait_exceeded(&self);
}

/// Sink that writes counters to the `log`/`tracing` facade at debug level.
/// The default wired by `bootstrap.rs` in the absence of a real metrics
/// backend.
#[derive(Default)]
pub struct LoggingMetricsSink;

impl MetricsSink for LoggingMetricsSink {
    fn stream_started(&self, cid: &str, engine_id: &str) {
        log::info!("stream started cid={cid} engine={engine_id}");
    }

    fn stream_stopped(&self, cid: &str) {
        log::info!("stream stopped cid={cid}");
    }

    fn stream_error(&self, cid: &str, error: &ProxyError) {
        log::warn!("stream error cid={cid}: {error}");
    }

    fn client_connected(&self, cid: &str, client_id: &str) {
        log::debug!("client connected cid={cid} client={client_id}");
    }

    fn client_disconnected(&self, cid: &str, client_id: &str) {
        log::debug!("client disconnected cid={cid} client={client_id}");
    }

    fn chunk_produced(&self, cid: &str) {
        log::trace!("chunk produced cid={cid}");
    }

    fn buffer_eviction(&self, cid: &str) {
        log::trace!("buffer eviction cid={cid}");
    }

    fn slow_client_dropped(&self, cid: &str) {
        log::warn!("slow client dropped cid={cid}");
    }

    fn engine_selected(&self, engine_id: &str) {
        log::debug!("engine selected engine={engine_id}");
    }

    fn upstream_error(&self, kind: &str) {
        log::warn!("upstream error kind={kind}");
    }

    fn initial_data_wait_exceeded(&self) {
        log::warn!("initial data wait exceeded");
    }
}

/// Fans every call out to a fixed list of sinks, in order. Lets the
/// composition root wire both a human-readable log sink and the in-memory
/// counters the `/metrics` endpoint reads, without either implementation
/// knowing about the other.
#[derive(Default)]
pub struct CompositeMetricsSink {
    sinks: Vec<Arc<dyn MetricsSink>>,
}

impl CompositeMetricsSink {
    pub fn new(sinks: Vec<Arc<dyn MetricsSink>>) -> Self {
        Self { sinks }
    }
}

impl MetricsSink for CompositeMetricsSink {
    fn stream_started(&self, cid: &str, engine_id: &str) {
        for sink in &self.sinks {
            sink.stream_started(cid, engine_id);
        }
    }

    fn stream_stopped(&self, cid: &str) {
        for sink in &self.sinks {
            sink.stream_stopped(cid);
        }
    }

    fn stream_error(&self, cid: &str, error: &ProxyError) {
        for sink in &self.sinks {
            sink.stream_error(cid, error);
        }
    }

    fn client_connected(&self, cid: &str, client_id: &str) {
        for sink in &self.sinks {
            sink.client_connected(cid, client_id);
        }
    }

    fn client_disconnected(&self, cid: &str, client_id: &str) {
        for sink in &self.sinks {
            sink.client_disconnected(cid, client_id);
        }
    }

    fn chunk_produced(&self, cid: &str) {
        for sink in &self.sinks {
            sink.chunk_produced(cid);
        }
    }

    fn buffer_eviction(&self, cid: &str) {
        for sink in &self.sinks {
            sink.buffer_eviction(cid);
        }
    }

    fn slow_client_dropped(&self, cid: &str) {
        for sink in &self.sinks {
            sink.slow_client_dropped(cid);
        }
    }

    fn engine_selected(&self, engine_id: &str) {
        for sink in &self.sinks {
            sink.engine_selected(engine_id);
        }
    }

    fn upstream_error(&self, kind: &str) {
        for sink in &self.sinks {
            sink.upstream_error(kind);
        }
    }

    fn initial_data_wait_exceeded(&self) {
        for sink in &self.sinks {
            sink.initial_data_wait_exceeded();
        }
    }
}

/// In-memory counters, useful for tests and for serving `/metrics` without
/// a full metrics backend.
#[derive(Default)]
pub struct InMemoryMetricsSink {
    streams_started: AtomicU64,
    streams_stopped: AtomicU64,
    stream_errors: AtomicU64,
    clients_connected: AtomicU64,
    clients_disconnected: AtomicU64,
    chunks_produced: AtomicU64,
    buffer_evictions: AtomicU64,
    slow_client_drops: AtomicU64,
    engine_selections: AtomicU64,
    upstream_errors: AtomicU64,
    initial_data_wait_exceeded: AtomicU64,
}

impl InMemoryMetricsSink {
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            streams_started: self.streams_started.load(Ordering::Relaxed),
            streams_stopped: self.streams_stopped.load(Ordering::Relaxed),
            stream_errors: self.stream_errors.load(Ordering::Relaxed),
            clients_connected: self.clients_connected.load(Ordering::Relaxed),
            clients_disconnected: self.clients_disconnected.load(Ordering::Relaxed),
            chunks_produced: self.chunks_produced.load(Ordering::Relaxed),
            buffer_evictions: self.buffer_evictions.load(Ordering::Relaxed),
            slow_client_drops: self.slow_client_drops.load(Ordering::Relaxed),
            engine_selections: self.engine_selections.load(Ordering::Relaxed),
            upstream_errors: self.upstream_errors.load(Ordering::Relaxed),
            initial_data_wait_exceeded: self.initial_data_wait_exceeded.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`InMemoryMetricsSink`]'s counters.
#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct MetricsSnapshot {
    pub streams_started: u64,
    pub streams_stopped: u64,
    pub stream_errors: u64,
    pub clients_connected: u64,
    pub clients_disconnected: u64,
    pub chunks_produced: u64,
    pub buffer_evictions: u64,
    pub slow_client_drops: u64,
    pub engine_selections: u64,
    pub upstream_errors: u64,
    pub initial_data_wait_exceeded: u64,
}

impl MetricsSink for InMemoryMetricsSink {
    fn stream_started(&self, _cid: &str, _engine_id: &str) {
        self.streams_started.fetch_add(1, Ordering::Relaxed);
    }

    fn stream_stopped(&self, _cid: &str) {
        self.streams_stopped.fetch_add(1, Ordering::Relaxed);
    }

    fn stream_error(&self, _cid: &str, _error: &ProxyError) {
        self.stream_errors.fetch_add(1, Ordering::Relaxed);
    }

    fn client_connected(&self, _cid: &str, _client_id: &str) {
        self.clients_connected.fetch_add(1, Ordering::Relaxed);
    }

    fn client_disconnected(&self, _cid: &str, _client_id: &str) {
        self.clients_disconnected.fetch_add(1, Ordering::Relaxed);
    }

    fn chunk_produced(&self, _cid: &str) {
        self.chunks_produced.fetch_add(1, Ordering::Relaxed);
    }

    fn buffer_eviction(&self, _cid: &str) {
        self.buffer_evictions.fetch_add(1, Ordering::Relaxed);
    }

    fn slow_client_dropped(&self, _cid: &str) {
        self.slow_client_drops.fetch_add(1, Ordering::Relaxed);
    }

    fn engine_selected(&self, _engine_id: &str) {
        self.engine_selections.fetch_add(1, Ordering::Relaxed);
    }

    fn upstream_error(&self, _kind: &str) {
        self.upstream_errors.fetch_add(1, Ordering::Relaxed);
    }

    fn initial_data_wait_exceeded(&self) {
        self.initial_data_wait_exceeded.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn noop_loop_detector_never_refuses() {
        let detector = NoopLoopDetector;
        assert!(!detector.is_looping("cid"));
        detector.record_stop("cid");
        assert!(!detector.is_looping("cid"));
    }

    #[test]
    fn windowed_loop_detector_trips_after_threshold() {
        let detector = WindowedLoopDetector::new(2, std::time::Duration::from_secs(60));
        assert!(!detector.is_looping("cid"));
        detector.record_stop("cid");
        assert!(!detector.is_looping("cid"));
        detector.record_stop("cid");
        assert!(detector.is_looping("cid"));
    }

    #[test]
    fn composite_sink_forwards_to_every_member() {
        let in_memory = Arc::new(InMemoryMetricsSink::default());
        let composite = CompositeMetricsSink::new(vec![
            Arc::new(LoggingMetricsSink),
            in_memory.clone(),
        ]);
        composite.stream_started("cid", "engine-a");
        composite.client_connected("cid", "client-a");
        assert_eq!(in_memory.snapshot().streams_started, 1);
        assert_eq!(in_memory.snapshot().clients_connected, 1);
    }

    #[test]
    fn in_memory_metrics_sink_counts_events() {
        let sink = InMemoryMetricsSink::default();
        sink.stream_started("cid", "engine-a");
        sink.client_connected("cid", "client-a");
        sink.client_disconnected("cid", "client-a");
        sink.stream_stopped("cid");
        let snap = sink.snapshot();
        assert_eq!(snap.streams_started, 1);
        assert_eq!(snap.streams_stopped, 1);
        assert_eq!(snap.clients_connected, 1);
        assert_eq!(snap.clients_disconnected, 1);
    }
}
