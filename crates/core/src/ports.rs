//! Port interfaces for the resilience pipeline
//!
//! Infrastructure adapters (HTTP client, SQLite store, log sink) implement
//! these; core logic only ever sees the traits.

use async_trait::async_trait;
use netguard_domain::{DurableEntry, EntryStatus, NetError, NetRequest, NetResponse, Result};
use serde::{Deserialize, Serialize};

/// Sends one request over the wire.
///
/// Implementations return `Ok` for statuses below 400 and `Err` otherwise,
/// classified with [`NetError::from_status`]. Network failures use status 0.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: NetRequest) -> std::result::Result<NetResponse, NetError>;
}

/// Entry counts per status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
    pub expired: usize,
}

impl StatusCounts {
    pub fn total(&self) -> usize {
        self.pending + self.processing + self.completed + self.failed + self.expired
    }

    pub fn add(&mut self, status: EntryStatus, n: usize) {
        match status {
            EntryStatus::Pending => self.pending += n,
            EntryStatus::Processing => self.processing += n,
            EntryStatus::Completed => self.completed += n,
            EntryStatus::Failed => self.failed += n,
            EntryStatus::Expired => self.expired += n,
        }
    }
}

/// Durable storage for offline entries.
///
/// The offline queue is the only writer. Listing methods return entries
/// ordered by priority (highest first), then `created_at` (oldest first).
#[async_trait]
pub trait OfflineStore: Send + Sync {
    async fn insert(&self, entry: &DurableEntry) -> Result<()>;

    /// Overwrite an existing entry.
    ///
    /// # Errors
    /// `NetguardError::NotFound` when no entry has this id.
    async fn update(&self, entry: &DurableEntry) -> Result<()>;

    async fn get(&self, id: &str) -> Result<Option<DurableEntry>>;

    /// Returns whether an entry was removed.
    async fn delete(&self, id: &str) -> Result<bool>;

    async fn count(&self) -> Result<usize>;

    async fn count_by_status(&self) -> Result<StatusCounts>;

    async fn list(&self) -> Result<Vec<DurableEntry>>;

    /// Pending, unexpired entries whose `next_attempt_at <= now_ms`.
    async fn fetch_ready(&self, now_ms: i64, limit: usize) -> Result<Vec<DurableEntry>>;

    /// Entries with `expires_at <= now_ms`, any status.
    async fn fetch_expired(&self, now_ms: i64) -> Result<Vec<DurableEntry>>;

    /// Move every `processing` entry back to `pending`. Returns how many moved.
    async fn requeue_processing(&self, now_ms: i64) -> Result<usize>;

    async fn delete_by_status(&self, status: EntryStatus) -> Result<usize>;

    /// Earliest `next_attempt_at` among pending entries.
    async fn next_attempt_at(&self) -> Result<Option<i64>>;
}

/// Sink for terminal failures that need a human.
pub trait ErrorReporter: Send + Sync {
    /// `entry` carries everything needed to replay the request by hand.
    fn report(&self, error: &NetError, entry: &DurableEntry);
}

/// Source of bearer tokens.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// Current token, possibly cached.
    async fn token(&self) -> std::result::Result<String, NetError>;

    /// Force a new token after the server rejected the current one.
    async fn refresh(&self) -> std::result::Result<String, NetError>;
}
