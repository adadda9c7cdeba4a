//! Store-and-forward for requests made while offline.

mod memory;
mod queue;

pub use memory::InMemoryOfflineStore;
pub use queue::{EnqueueOptions, OfflineQueue, OfflineQueueBuilder, ProcessSummary};
