//! Domain types and models
//!
//! Value types shared by every layer: the request/response pair exchanged
//! with the transport, durable queue records, breaker states and the
//! notification payloads published on the event bus.

pub mod circuit;
pub mod events;
pub mod http;
pub mod queue;

pub use circuit::CircuitState;
pub use events::NetEvent;
pub use http::{HttpMethod, NetRequest, NetResponse};
pub use queue::{DurableEntry, EntryStatus, Priority};
