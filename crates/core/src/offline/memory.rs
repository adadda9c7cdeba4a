//! In-memory [`OfflineStore`]
//!
//! Used by tests and by hosts that accept losing the queue on restart.

use std::cmp::Reverse;
use std::collections::HashMap;

use async_trait::async_trait;
use netguard_domain::{DurableEntry, EntryStatus, NetguardError, Result};
use parking_lot::Mutex;

use crate::ports::{OfflineStore, StatusCounts};

#[derive(Debug, Default)]
pub struct InMemoryOfflineStore {
    entries: Mutex<HashMap<String, DurableEntry>>,
}

impl InMemoryOfflineStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn sorted<F>(&self, keep: F) -> Vec<DurableEntry>
    where
        F: Fn(&DurableEntry) -> bool,
    {
        let mut out: Vec<DurableEntry> =
            self.entries.lock().values().filter(|e| keep(e)).cloned().collect();
        out.sort_by_key(|e| (Reverse(e.priority), e.created_at));
        out
    }
}

#[async_trait]
impl OfflineStore for InMemoryOfflineStore {
    async fn insert(&self, entry: &DurableEntry) -> Result<()> {
        let mut entries = self.entries.lock();
        if entries.contains_key(&entry.id) {
            return Err(NetguardError::InvalidInput(format!("entry {} already exists", entry.id)));
        }
        entries.insert(entry.id.clone(), entry.clone());
        Ok(())
    }

    async fn update(&self, entry: &DurableEntry) -> Result<()> {
        match self.entries.lock().get_mut(&entry.id) {
            Some(slot) => {
                *slot = entry.clone();
                Ok(())
            }
            None => Err(NetguardError::NotFound(format!("offline entry {}", entry.id))),
        }
    }

    async fn get(&self, id: &str) -> Result<Option<DurableEntry>> {
        Ok(self.entries.lock().get(id).cloned())
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        Ok(self.entries.lock().remove(id).is_some())
    }

    async fn count(&self) -> Result<usize> {
        Ok(self.entries.lock().len())
    }

    async fn count_by_status(&self) -> Result<StatusCounts> {
        let mut counts = StatusCounts::default();
        for entry in self.entries.lock().values() {
            counts.add(entry.status, 1);
        }
        Ok(counts)
    }

    async fn list(&self) -> Result<Vec<DurableEntry>> {
        Ok(self.sorted(|_| true))
    }

    async fn fetch_ready(&self, now_ms: i64, limit: usize) -> Result<Vec<DurableEntry>> {
        let mut ready = self.sorted(|e| e.is_ready(now_ms));
        ready.truncate(limit);
        Ok(ready)
    }

    async fn fetch_expired(&self, now_ms: i64) -> Result<Vec<DurableEntry>> {
        Ok(self.sorted(|e| e.is_expired(now_ms)))
    }

    async fn requeue_processing(&self, now_ms: i64) -> Result<usize> {
        let mut moved = 0;
        for entry in self.entries.lock().values_mut() {
            if entry.status == EntryStatus::Processing {
                entry.status = EntryStatus::Pending;
                entry.updated_at = now_ms;
                moved += 1;
            }
        }
        Ok(moved)
    }

    async fn delete_by_status(&self, status: EntryStatus) -> Result<usize> {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, e| e.status != status);
        Ok(before - entries.len())
    }

    async fn next_attempt_at(&self) -> Result<Option<i64>> {
        Ok(self
            .entries
            .lock()
            .values()
            .filter(|e| e.status == EntryStatus::Pending)
            .map(|e| e.next_attempt_at)
            .min())
    }
}

#[cfg(test)]
mod tests {
    use netguard_domain::{NetRequest, Priority};

    use super::*;

    fn entry(url: &str, priority: Priority, now: i64) -> DurableEntry {
        DurableEntry::new(&NetRequest::post(url), priority, 60_000, 3, now)
    }

    /// Validates `InMemoryOfflineStore::fetch_ready` behavior for the replay
    /// ordering scenario.
    ///
    /// Assertions:
    /// - Confirms higher priority comes first, then older entries.
    /// - Ensures entries scheduled in the future are skipped.
    /// - Confirms the limit is honoured.
    #[tokio::test]
    async fn fetch_ready_orders_by_priority_then_age() {
        let store = InMemoryOfflineStore::new();
        let low = entry("https://h/low", Priority::Low, 1);
        let old_high = entry("https://h/old-high", Priority::High, 2);
        let new_high = entry("https://h/new-high", Priority::High, 3);
        let mut later = entry("https://h/later", Priority::Critical, 4);
        later.next_attempt_at = 10_000;
        for e in [&low, &old_high, &new_high, &later] {
            store.insert(e).await.unwrap();
        }

        let ready = store.fetch_ready(100, 10).await.unwrap();
        let urls: Vec<_> = ready.iter().map(|e| e.url.as_str()).collect();
        assert_eq!(urls, vec!["https://h/old-high", "https://h/new-high", "https://h/low"]);

        assert_eq!(store.fetch_ready(100, 1).await.unwrap().len(), 1);
        assert_eq!(store.next_attempt_at().await.unwrap(), Some(1));
    }

    #[tokio::test]
    async fn update_requires_existing_entry() {
        let store = InMemoryOfflineStore::new();
        let e = entry("https://h/a", Priority::Normal, 0);
        let err = store.update(&e).await.unwrap_err();
        assert!(matches!(err, NetguardError::NotFound(_)));
        store.insert(&e).await.unwrap();
        assert!(store.insert(&e).await.is_err());
    }

    #[tokio::test]
    async fn requeue_and_status_counts() {
        let store = InMemoryOfflineStore::new();
        let mut a = entry("https://h/a", Priority::Normal, 0);
        a.transition(EntryStatus::Processing, 1).unwrap();
        let b = entry("https://h/b", Priority::Normal, 0);
        store.insert(&a).await.unwrap();
        store.insert(&b).await.unwrap();

        assert_eq!(store.count_by_status().await.unwrap().processing, 1);
        assert_eq!(store.requeue_processing(5).await.unwrap(), 1);
        let counts = store.count_by_status().await.unwrap();
        assert_eq!(counts.pending, 2);
        assert_eq!(store.delete_by_status(EntryStatus::Pending).await.unwrap(), 2);
        assert_eq!(store.count().await.unwrap(), 0);
    }
}
