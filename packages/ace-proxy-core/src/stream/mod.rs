//! Per-content-id streaming: ring buffer, client registry, upstream reader,
//! and the state machine tying them together.

pub mod buffer;
pub mod client_registry;
pub mod manager;
pub mod reader;

pub use buffer::{AppendOutcome, Chunk, Lookup, RingBuffer};
pub use client_registry::{ClientRecord, ClientRegistry};
pub use manager::{ManagerState, StreamManager, Subscription};
