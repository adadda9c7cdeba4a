//! # Netguard Core
//!
//! Resilience pipeline - no infrastructure dependencies.
//!
//! This crate contains:
//! - Port interfaces (transport, durable store, error reporter, token source)
//! - The interceptor chain and the builtin interceptors (tracing, circuit
//!   breaker, retry, token refresh)
//! - The per-service circuit breaker registry
//! - The priority request queue and the batcher
//! - The durable offline queue
//! - [`ResilientClient`], which wires all of the above together
//!
//! ## Features
//! - `test-utils`: in-memory port fakes under `testing` for downstream test
//!   suites
//!
//! ## Architecture Principles
//! - Only depends on `netguard-common` and `netguard-domain`
//! - No database, HTTP, or platform code
//! - All external collaborators via traits
//! - Nothing global: every component is constructed and injected explicitly

pub mod breaker;
pub mod client;
pub mod connectivity;
pub mod events;
pub mod interceptor;
pub mod offline;
pub mod ports;
pub mod queue;
#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use breaker::{service_key, CircuitBreakerRegistry};
pub use client::{ClientBuilder, RequestOptions, ResilientClient};
pub use connectivity::{ConnectivityMonitor, ManualConnectivity};
pub use events::EventBus;
pub use interceptor::{
    CallContext, ErrorDisposition, ErrorOutcome, InterceptorChain, InterceptorHandle, Phase,
};
pub use offline::{
    EnqueueOptions, InMemoryOfflineStore, OfflineQueue, OfflineQueueBuilder, ProcessSummary,
};
pub use ports::{ErrorReporter, OfflineStore, StatusCounts, TokenProvider, Transport};
pub use queue::{
    BatchOutput, BatchResolver, Batcher, BatcherConfig, QueueOptions, QueueStats, RequestQueue,
};
