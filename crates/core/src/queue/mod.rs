//! Admission and scheduling in front of the transport.

mod batcher;
mod request_queue;

pub use batcher::{BatchOutput, BatchResolver, Batcher, BatcherConfig};
pub use request_queue::{QueueOptions, QueueStats, RequestQueue};
