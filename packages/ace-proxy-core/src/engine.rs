//! Engine bookkeeping: descriptors, the registry of known engines, and the
//! selection policy that picks one for a new content id (§4.2).
//!
//! Grounded on the desktop build's `SonosClient` trait-with-default-impl
//! shape (`sonos/traits.rs`): a narrow trait the rest of the crate programs
//! against, plus an in-memory implementation suitable for a single-node
//! deployment. A networked registry (reading engine liveness from a
//! discovery service) can be slotted in later without touching callers.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use dashmap::DashMap;

use crate::error::{ProxyError, ProxyResult};

/// Liveness classification the registry reports for an engine (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineHealth {
    Healthy,
    Degraded,
    Unhealthy,
}

/// A single AceStream engine instance the proxy can route content ids to.
///
/// Owned and mutated by the registry, never by the core (§3): the selector
/// only reads a snapshot returned from [`EngineRegistry::list`].
#[derive(Debug, Clone)]
pub struct EngineDescriptor {
    /// Stable identifier for logs, metrics, and tie-breaking.
    pub id: String,
    /// Base URL of the engine's HTTP API, e.g. `http://127.0.0.1:6878`.
    pub base_url: String,
    /// Current liveness as last reported to the registry.
    pub health: EngineHealth,
    /// Whether this engine is port-forwarded (reachable from swarm peers),
    /// making it the preferred class in the selection policy.
    pub forwarded: bool,
    /// Current number of streams this engine is serving, as tracked by the
    /// registry.
    pub active_stream_count: u32,
    /// Free-form operator tags, carried through but not interpreted by the
    /// core.
    pub tags: Vec<String>,
}

impl EngineDescriptor {
    /// Builds a healthy, non-forwarded descriptor with no tags — the
    /// common case for a statically configured single-node deployment.
    pub fn new(id: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            base_url: base_url.into(),
            health: EngineHealth::Healthy,
            forwarded: false,
            active_stream_count: 0,
            tags: Vec::new(),
        }
    }

    /// Builder: marks this engine as port-forwarded.
    pub fn forwarded(mut self) -> Self {
        self.forwarded = true;
        self
    }

    /// Builder: attaches operator tags.
    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    /// URL for the getstream handshake, e.g.
    /// `http://127.0.0.1:6878/ace/getstream?format=json&id=<cid>&pid=<pid>`.
    pub fn getstream_url(&self, cid: &str, pid: &str) -> String {
        format!(
            "{}{}?format={}&{}={}&{}={}",
            self.base_url,
            crate::protocol_constants::ENGINE_GETSTREAM_PATH,
            crate::protocol_constants::ENGINE_FORMAT_JSON,
            crate::protocol_constants::ENGINE_CID_PARAM,
            cid,
            crate::protocol_constants::ENGINE_PID_PARAM,
            pid,
        )
    }
}

/// Per-engine live occupancy and health, tracked by the registry
/// independently of any individual stream manager's state.
struct EngineOccupancy {
    active_streams: AtomicU32,
    health: parking_lot::RwLock<EngineHealth>,
}

impl Default for EngineOccupancy {
    fn default() -> Self {
        Self {
            active_streams: AtomicU32::new(0),
            health: parking_lot::RwLock::new(EngineHealth::Healthy),
        }
    }
}

/// Read/write view of known engines and their current load.
///
/// Implementations must be cheap to call from the hot admission path: no
/// I/O, no blocking locks held across an await point.
pub trait EngineRegistry: Send + Sync {
    /// Lists all known engines with their current health and load.
    fn list(&self) -> Vec<EngineDescriptor>;

    /// Records that a stream manager has started using the given engine.
    fn record_acquired(&self, engine_id: &str);

    /// Records that a stream manager has stopped using the given engine.
    fn record_released(&self, engine_id: &str);

    /// Hints that the candidate pool for `cid` is running low on headroom
    /// (§4.2 step 5): the best available engine is near
    /// `max_streams_per_engine` and no port-forwarded alternative exists.
    /// The core never provisions engines itself; a real implementation
    /// forwards this to whatever collaborator manages the Docker-based
    /// engine pool. Selection still proceeds with the best available engine
    /// regardless of whether this fires.
    fn request_provisioning(&self, _cid: &str) {}
}

/// Static, in-memory registry suitable for a single-node deployment with a
/// fixed, admin-configured set of engines.
///
/// Health is mutable (`set_health`) to simulate the VPN/health-reporting
/// collaborator the distilled spec treats as external (§1); a production
/// deployment substitutes a registry backed by that collaborator instead.
pub struct InMemoryEngineRegistry {
    engines: Vec<EngineDescriptor>,
    occupancy: DashMap<String, Arc<EngineOccupancy>>,
    provisioning_requests: AtomicU32,
}

impl InMemoryEngineRegistry {
    pub fn new(engines: Vec<EngineDescriptor>) -> Self {
        let occupancy = DashMap::new();
        for engine in &engines {
            occupancy.insert(
                engine.id.clone(),
                Arc::new(EngineOccupancy {
                    active_streams: AtomicU32::new(0),
                    health: parking_lot::RwLock::new(engine.health),
                }),
            );
        }
        Self {
            engines,
            occupancy,
            provisioning_requests: AtomicU32::new(0),
        }
    }

    /// Updates an engine's reported health. A no-op if `engine_id` is
    /// unknown.
    pub fn set_health(&self, engine_id: &str, health: EngineHealth) {
        if let Some(o) = self.occupancy.get(engine_id) {
            *o.health.write() = health;
        }
    }

    /// Number of times `request_provisioning` has fired. Exposed for tests;
    /// a real deployment would instead forward each call to the Docker
    /// orchestration collaborator rather than counting them.
    pub fn provisioning_request_count(&self) -> u32 {
        self.provisioning_requests.load(Ordering::SeqCst)
    }
}

impl EngineRegistry for InMemoryEngineRegistry {
    fn list(&self) -> Vec<EngineDescriptor> {
        self.engines
            .iter()
            .map(|e| {
                let (active_stream_count, health) = self
                    .occupancy
                    .get(&e.id)
                    .map(|o| (o.active_streams.load(Ordering::SeqCst), *o.health.read()))
                    .unwrap_or((0, e.health));
                EngineDescriptor {
                    active_stream_count,
                    health,
                    ..e.clone()
                }
            })
            .collect()
    }

    fn record_acquired(&self, engine_id: &str) {
        if let Some(o) = self.occupancy.get(engine_id) {
            o.active_streams.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn record_released(&self, engine_id: &str) {
        if let Some(o) = self.occupancy.get(engine_id) {
            o.active_streams
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| {
                    Some(v.saturating_sub(1))
                })
                .ok();
        }
    }

    fn request_provisioning(&self, cid: &str) {
        self.provisioning_requests.fetch_add(1, Ordering::SeqCst);
        log::warn!(
            "engine pool running low on headroom while selecting for cid {cid}; \
             a provisioning collaborator would be notified here"
        );
    }
}

/// Stateless policy wrapping an [`EngineRegistry`]: picks the best engine
/// under `max_streams_per_engine`, per §4.2.
///
/// Selection steps, in order:
/// 1. Exclude engines whose health is `Unhealthy`.
/// 2. Exclude engines already at or above `max_streams_per_engine`.
/// 3. Exclude engines named in the caller's exclusion set (engines already
///    tried and failed for this content id's current reselection attempt).
/// 4. Prefer `forwarded` engines over non-forwarded ones.
/// 5. Within the preferred class, pick the fewest active streams, breaking
///    ties by engine id (stable, so selection is deterministic for a given
///    registry snapshot).
/// 6. If nothing qualifies, fail with `NoEngineAvailable`.
pub struct EngineSelector {
    registry: Arc<dyn EngineRegistry>,
    max_streams_per_engine: u32,
}

impl EngineSelector {
    pub fn new(registry: Arc<dyn EngineRegistry>, max_streams_per_engine: u32) -> Self {
        Self {
            registry,
            max_streams_per_engine,
        }
    }

    /// Selects an engine for the given content id, per the policy above.
    /// `excluded` names engines to skip (used by the stream manager's
    /// reselection-on-transient-failure path, §4.7).
    pub fn select(&self, cid: &str, excluded: &HashSet<String>) -> ProxyResult<EngineDescriptor> {
        let candidates: Vec<EngineDescriptor> = self
            .registry
            .list()
            .into_iter()
            .filter(|e| e.health != EngineHealth::Unhealthy)
            .filter(|e| e.active_stream_count < self.max_streams_per_engine)
            .filter(|e| !excluded.contains(&e.id))
            .collect();

        let forwarded_available = candidates.iter().any(|e| e.forwarded);
        let chosen = candidates
            .into_iter()
            .filter(|e| !forwarded_available || e.forwarded)
            .min_by(|a, b| {
                a.active_stream_count
                    .cmp(&b.active_stream_count)
                    .then_with(|| a.id.cmp(&b.id))
            })
            .ok_or_else(|| ProxyError::NoEngineAvailable(cid.to_string()))?;

        if !forwarded_available && chosen.active_stream_count + 1 >= self.max_streams_per_engine {
            self.registry.request_provisioning(cid);
        }

        Ok(chosen)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry_of(ids: &[&str]) -> InMemoryEngineRegistry {
        InMemoryEngineRegistry::new(
            ids.iter()
                .map(|id| EngineDescriptor::new(*id, format!("http://engine-{id}")))
                .collect(),
        )
    }

    #[test]
    fn selects_least_loaded_engine() {
        let registry = registry_of(&["a", "b"]);
        registry.record_acquired("a");
        let selector = EngineSelector::new(Arc::new(registry), 3);
        let chosen = selector.select("cid1", &HashSet::new()).unwrap();
        assert_eq!(chosen.id, "b");
    }

    #[test]
    fn excludes_engines_at_capacity() {
        let registry = registry_of(&["a"]);
        registry.record_acquired("a");
        registry.record_acquired("a");
        let selector = EngineSelector::new(Arc::new(registry), 2);
        let err = selector.select("cid1", &HashSet::new()).unwrap_err();
        assert!(matches!(err, ProxyError::NoEngineAvailable(_)));
    }

    #[test]
    fn no_engines_registered_fails() {
        let registry = registry_of(&[]);
        let selector = EngineSelector::new(Arc::new(registry), 3);
        assert!(selector.select("cid1", &HashSet::new()).is_err());
    }

    #[test]
    fn release_frees_capacity() {
        let registry = registry_of(&["a"]);
        registry.record_acquired("a");
        registry.record_released("a");
        assert_eq!(registry.list()[0].active_stream_count, 0);
    }

    #[test]
    fn excludes_unhealthy_engines() {
        let registry = registry_of(&["a", "b"]);
        registry.set_health("a", EngineHealth::Unhealthy);
        let selector = EngineSelector::new(Arc::new(registry), 3);
        let chosen = selector.select("cid1", &HashSet::new()).unwrap();
        assert_eq!(chosen.id, "b");
    }

    #[test]
    fn prefers_forwarded_engine_even_if_more_loaded() {
        let engines = vec![
            EngineDescriptor::new("a", "http://engine-a"),
            EngineDescriptor::new("b", "http://engine-b").forwarded(),
        ];
        let registry = InMemoryEngineRegistry::new(engines);
        registry.record_acquired("b");
        let selector = EngineSelector::new(Arc::new(registry), 3);
        let chosen = selector.select("cid1", &HashSet::new()).unwrap();
        assert_eq!(chosen.id, "b");
    }

    #[test]
    fn exclusion_set_skips_previously_tried_engines() {
        let registry = registry_of(&["a", "b"]);
        let selector = EngineSelector::new(Arc::new(registry), 3);
        let mut excluded = HashSet::new();
        excluded.insert("a".to_string());
        let chosen = selector.select("cid1", &excluded).unwrap();
        assert_eq!(chosen.id, "b");
    }

    #[test]
    fn signals_provisioning_needed_when_no_forwarded_alternative_near_capacity() {
        let registry = Arc::new(registry_of(&["a"]));
        registry.record_acquired("a");
        let selector = EngineSelector::new(registry.clone(), 2);
        selector.select("cid1", &HashSet::new()).unwrap();
        assert_eq!(registry.provisioning_request_count(), 1);
    }

    #[test]
    fn does_not_signal_provisioning_when_forwarded_alternative_exists() {
        let engines = vec![
            EngineDescriptor::new("a", "http://engine-a"),
            EngineDescriptor::new("b", "http://engine-b").forwarded(),
        ];
        let registry = Arc::new(InMemoryEngineRegistry::new(engines));
        registry.record_acquired("a");
        let selector = EngineSelector::new(registry.clone(), 2);
        selector.select("cid1", &HashSet::new()).unwrap();
        assert_eq!(registry.provisioning_request_count(), 0);
    }

    #[test]
    fn does_not_signal_provisioning_with_ample_headroom() {
        let registry = Arc::new(registry_of(&["a", "b"]));
        let selector = EngineSelector::new(registry.clone(), 5);
        selector.select("cid1", &HashSet::new()).unwrap();
        assert_eq!(registry.provisioning_request_count(), 0);
    }

    #[test]
    fn getstream_url_contains_required_params() {
        let engine = EngineDescriptor::new("a", "http://127.0.0.1:6878");
        let url = engine.getstream_url("deadbeef", "pid123");
        assert!(url.contains("id=deadbeef"));
        assert!(url.contains("pid=pid123"));
        assert!(url.contains("format=json"));
    }
}
