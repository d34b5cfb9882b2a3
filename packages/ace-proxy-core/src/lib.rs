//! Ace Proxy Core - shared library for the AceStream live-stream
//! multiplexing proxy.
//!
//! This crate implements the proxy's entire domain: per-content-id
//! streaming state, the engine selection policy, the upstream reader
//! protocol, and the HTTP surface clients connect to. It is designed to be
//! used by the standalone server binary in `apps/server`.
//!
//! # Architecture
//!
//! - [`runtime`]: Task spawning abstraction for async runtime independence
//! - [`config`]: Tunable configuration, validated at load time
//! - [`protocol_constants`]: Fixed MPEG-TS and engine protocol constants
//! - [`engine`]: Engine descriptors, registry, and selection policy
//! - [`stream`]: Ring buffer, client registry, upstream reader, and the
//!   per-content-id stream manager state machine
//! - [`collaborators`]: Narrow traits for loop detection and metrics, plus
//!   in-process default implementations
//! - [`proxy_server`]: The top-level content-id map, single-flight manager
//!   creation, and the cleanup sweeper
//! - [`bootstrap`]: Composition root wiring the above into a runnable set
//!   of services
//! - [`api`]: The axum HTTP surface: streaming endpoint, health/metrics
//! - [`error`]: Centralized error types and their HTTP mapping
//!
//! # Abstraction Traits
//!
//! The crate defines traits to decouple core logic from the choice of
//! runtime and from collaborators outside its own scope:
//!
//! - [`TaskSpawner`](runtime::TaskSpawner): spawning background tasks
//! - [`EngineRegistry`](engine::EngineRegistry): engine liveness and load
//! - [`LoopDetector`](collaborators::LoopDetector): stop-loop refusal
//! - [`MetricsSink`](collaborators::MetricsSink): operational counters
//!
//! Each trait ships a default implementation suitable for a single-node
//! deployment; a networked or external-backed implementation can be
//! substituted at the composition root in [`bootstrap`].

#![warn(clippy::all)]

pub mod api;
pub mod bootstrap;
pub mod collaborators;
pub mod config;
pub mod engine;
pub mod error;
pub mod protocol_constants;
pub mod proxy_server;
pub mod runtime;
pub mod stream;
pub mod utils;

pub use collaborators::{
    InMemoryMetricsSink, LoggingMetricsSink, LoopDetector, MetricsSink, MetricsSnapshot,
    NoopLoopDetector, WindowedLoopDetector,
};
pub use config::ProxyConfig;
pub use engine::{EngineDescriptor, EngineRegistry, EngineSelector, InMemoryEngineRegistry};
pub use error::{ErrorCode, ProxyError, ProxyResult};
pub use proxy_server::ProxyServer;
pub use runtime::{TaskSpawner, TokioSpawner};
pub use stream::{ClientRecord, ClientRegistry, ManagerState, RingBuffer, StreamManager};

pub use bootstrap::{bootstrap_services, BootstrappedServices};

pub use api::{start_server, AppState, ServerError};
