//! Durable offline queue
//!
//! Requests that could not be sent are persisted through an [`OfflineStore`]
//! and replayed verbatim once connectivity holds. A processing pass:
//!
//! 1. moves entries left in `processing` by an interrupted pass back to
//!    `pending`
//! 2. deletes expired entries, one `EntryExpired` notification each
//! 3. fetches a bounded batch of ready entries, highest priority first
//! 4. replays them one by one while still online
//!
//! 2xx deletes the entry, 4xx fails it for good, anything else consumes a
//! retry and pushes `next_attempt_at` out by an exponential backoff. Passes
//! never overlap. After each pass the queue re-triggers itself while a full
//! batch was found, or arms a single timer for the next scheduled attempt.
//!
//! [`OfflineQueue::start`] additionally watches the connectivity source and
//! starts a pass on every offline to online transition.

use std::cmp::Reverse;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use netguard_common::resilience::ExponentialBackoff;
use netguard_common::time::{Clock, SharedClock, SystemClock};
use netguard_domain::{
    DurableEntry, EntryStatus, NetError, NetEvent, NetRequest, NetguardError,
    OfflineQueueSettings, Priority, Result,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::connectivity::{ConnectivityMonitor, ManualConnectivity};
use crate::events::EventBus;
use crate::ports::{ErrorReporter, OfflineStore, StatusCounts, Transport};

const JOIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Per-entry overrides. Unset fields fall back to the queue settings.
#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    pub priority: Option<Priority>,
    pub ttl: Option<Duration>,
    pub max_retries: Option<u32>,
    pub metadata: BTreeMap<String, String>,
}

impl EnqueueOptions {
    #[must_use]
    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    #[must_use]
    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    #[must_use]
    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    #[must_use]
    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// What one processing pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessSummary {
    /// Interrupted `processing` entries moved back to `pending`.
    pub recovered: usize,
    pub expired: usize,
    pub fetched: usize,
    pub completed: usize,
    pub retried: usize,
    pub failed: usize,
    /// Replay stopped (or never started) because connectivity was down.
    pub offline: bool,
}

enum Replay {
    Completed,
    Retried,
    Failed,
}

struct Worker {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

struct Inner {
    store: Arc<dyn OfflineStore>,
    transport: Arc<dyn Transport>,
    connectivity: Arc<dyn ConnectivityMonitor>,
    reporter: Option<Arc<dyn ErrorReporter>>,
    events: Option<EventBus>,
    clock: SharedClock,
    settings: OfflineQueueSettings,
    backoff: ExponentialBackoff,
    pass_lock: tokio::sync::Mutex<()>,
    pass_scheduled: AtomicBool,
    timer: Mutex<Option<JoinHandle<()>>>,
    worker: Mutex<Option<Worker>>,
}

pub struct OfflineQueueBuilder {
    store: Arc<dyn OfflineStore>,
    transport: Arc<dyn Transport>,
    connectivity: Option<Arc<dyn ConnectivityMonitor>>,
    reporter: Option<Arc<dyn ErrorReporter>>,
    events: Option<EventBus>,
    clock: Option<SharedClock>,
    settings: OfflineQueueSettings,
}

impl OfflineQueueBuilder {
    #[must_use]
    pub fn connectivity(mut self, connectivity: Arc<dyn ConnectivityMonitor>) -> Self {
        self.connectivity = Some(connectivity);
        self
    }

    #[must_use]
    pub fn reporter(mut self, reporter: Arc<dyn ErrorReporter>) -> Self {
        self.reporter = Some(reporter);
        self
    }

    #[must_use]
    pub fn events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    #[must_use]
    pub fn clock(mut self, clock: SharedClock) -> Self {
        self.clock = Some(clock);
        self
    }

    #[must_use]
    pub fn settings(mut self, settings: OfflineQueueSettings) -> Self {
        self.settings = settings;
        self
    }

    /// # Errors
    /// `NetguardError::Config` when the retry delays are inconsistent.
    pub fn build(self) -> Result<OfflineQueue> {
        let backoff = ExponentialBackoff::new(
            self.settings.retry_base_delay(),
            self.settings.retry_max_delay(),
            2.0,
        )
        .map_err(|e| NetguardError::Config(format!("offline retry policy: {e}")))?
        .with_jitter(false);

        Ok(OfflineQueue {
            inner: Arc::new(Inner {
                store: self.store,
                transport: self.transport,
                connectivity: self
                    .connectivity
                    .unwrap_or_else(|| Arc::new(ManualConnectivity::online())),
                reporter: self.reporter,
                events: self.events,
                clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
                settings: self.settings,
                backoff,
                pass_lock: tokio::sync::Mutex::new(()),
                pass_scheduled: AtomicBool::new(false),
                timer: Mutex::new(None),
                worker: Mutex::new(None),
            }),
        })
    }
}

/// Durable store-and-forward queue. Clones share the same state.
#[derive(Clone)]
pub struct OfflineQueue {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for OfflineQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OfflineQueue")
            .field("settings", &self.inner.settings)
            .field("running", &self.is_running())
            .finish()
    }
}

impl OfflineQueue {
    pub fn builder(store: Arc<dyn OfflineStore>, transport: Arc<dyn Transport>) -> OfflineQueueBuilder {
        OfflineQueueBuilder {
            store,
            transport,
            connectivity: None,
            reporter: None,
            events: None,
            clock: None,
            settings: OfflineQueueSettings::default(),
        }
    }

    pub fn settings(&self) -> &OfflineQueueSettings {
        &self.inner.settings
    }

    /// Persist `request` for later replay.
    ///
    /// # Errors
    /// - `NetguardError::Config` when the queue is disabled
    /// - `NetguardError::CapacityExceeded` when `max_size` entries are stored
    /// - store errors
    #[instrument(skip(self, request, options), fields(url = %request.url))]
    pub async fn enqueue(&self, request: &NetRequest, options: EnqueueOptions) -> Result<DurableEntry> {
        let settings = &self.inner.settings;
        if !settings.enabled {
            return Err(NetguardError::Config("offline queue is disabled".to_string()));
        }
        let count = self.inner.store.count().await?;
        if count >= settings.max_size {
            warn!(count, max_size = settings.max_size, "Offline queue full");
            return Err(NetguardError::CapacityExceeded(format!(
                "offline queue holds {count} entries (max {})",
                settings.max_size
            )));
        }

        let ttl_ms = options
            .ttl
            .map_or(settings.default_ttl_ms, |ttl| u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX));
        let entry = DurableEntry::new(
            request,
            options.priority.unwrap_or_default(),
            ttl_ms,
            options.max_retries.unwrap_or(settings.max_retries),
            self.inner.clock.now_millis(),
        )
        .with_metadata(options.metadata);
        self.inner.store.insert(&entry).await?;

        info!(entry_id = %entry.id, priority = %entry.priority, "Request queued for offline replay");
        self.inner.publish(NetEvent::EntryEnqueued {
            id: entry.id.clone(),
            url: entry.url.clone(),
            priority: entry.priority,
        });

        if self.inner.connectivity.is_online() {
            self.inner.trigger();
        }
        Ok(entry)
    }

    /// Run one processing pass now and wait for it.
    ///
    /// # Errors
    /// Store errors; replay failures are recorded on the entries instead.
    pub async fn process_now(&self) -> Result<ProcessSummary> {
        self.inner.run_pass().await
    }

    /// Re-arm a failed entry with a fresh retry budget.
    ///
    /// # Errors
    /// `NotFound` for an unknown id, `InvalidInput` when the entry has not
    /// failed.
    pub async fn retry(&self, id: &str) -> Result<()> {
        let mut entry = self
            .inner
            .store
            .get(id)
            .await?
            .ok_or_else(|| NetguardError::NotFound(format!("offline entry {id}")))?;
        entry.rearm(self.inner.clock.now_millis())?;
        self.inner.store.update(&entry).await?;
        info!(entry_id = %id, "Failed entry re-armed");
        if self.inner.connectivity.is_online() {
            self.inner.trigger();
        }
        Ok(())
    }

    pub async fn remove(&self, id: &str) -> Result<bool> {
        self.inner.store.delete(id).await
    }

    pub async fn list(&self) -> Result<Vec<DurableEntry>> {
        self.inner.store.list().await
    }

    pub async fn get(&self, id: &str) -> Result<Option<DurableEntry>> {
        self.inner.store.get(id).await
    }

    pub async fn stats(&self) -> Result<StatusCounts> {
        self.inner.store.count_by_status().await
    }

    /// Drop every terminally failed entry. Returns how many were removed.
    pub async fn clear_failed(&self) -> Result<usize> {
        let removed = self.inner.store.delete_by_status(EntryStatus::Failed).await?;
        if removed > 0 {
            info!(removed, "Cleared failed offline entries");
        }
        Ok(removed)
    }

    /// Start watching connectivity. Does an initial pass when online.
    ///
    /// # Errors
    /// `NetguardError::Internal` when already running.
    #[instrument(skip(self))]
    pub fn start(&self) -> Result<()> {
        let mut worker = self.inner.worker.lock();
        if worker.is_some() {
            return Err(NetguardError::Internal("offline queue already running".to_string()));
        }

        let cancel = CancellationToken::new();
        let inner = Arc::clone(&self.inner);
        let token = cancel.clone();
        let handle = tokio::spawn(async move { inner.watch_connectivity(token).await });
        *worker = Some(Worker { cancel, handle });
        info!("Offline queue started");
        Ok(())
    }

    /// Stop watching connectivity and cancel the retry timer.
    ///
    /// # Errors
    /// `NetguardError::Internal` when not running, or when the watcher did
    /// not finish within the join timeout.
    #[instrument(skip(self))]
    pub async fn stop(&self) -> Result<()> {
        let worker = self.inner.worker.lock().take();
        let Some(worker) = worker else {
            return Err(NetguardError::Internal("offline queue not running".to_string()));
        };
        worker.cancel.cancel();
        self.inner.cancel_timer();

        match tokio::time::timeout(JOIN_TIMEOUT, worker.handle).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(error = %e, "Connectivity watcher panicked");
                return Err(NetguardError::Internal("connectivity watcher panicked".to_string()));
            }
            Err(_) => {
                warn!("Connectivity watcher did not complete within timeout");
                return Err(NetguardError::Internal("connectivity watcher timeout".to_string()));
            }
        }
        info!("Offline queue stopped");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.inner.worker.lock().is_some()
    }
}

impl Inner {
    fn publish(&self, event: NetEvent) {
        if let Some(events) = &self.events {
            events.publish(event);
        }
    }

    /// Schedule a background pass unless one is already waiting.
    fn trigger(self: &Arc<Self>) {
        if self.pass_scheduled.swap(true, Ordering::AcqRel) {
            return;
        }
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(err) = inner.run_pass().await {
                error!(error = %err, "Offline queue pass failed");
            }
        });
    }

    fn cancel_timer(&self) {
        if let Some(timer) = self.timer.lock().take() {
            timer.abort();
        }
    }

    async fn run_pass(self: &Arc<Self>) -> Result<ProcessSummary> {
        let _guard = self.pass_lock.lock().await;
        self.pass_scheduled.store(false, Ordering::Release);
        let summary = self.process_pass().await?;
        self.reschedule(&summary).await?;
        Ok(summary)
    }

    async fn process_pass(&self) -> Result<ProcessSummary> {
        let mut summary = ProcessSummary::default();
        let now = self.clock.now_millis();

        summary.recovered = self.store.requeue_processing(now).await?;
        if summary.recovered > 0 {
            info!(count = summary.recovered, "Recovered interrupted offline entries");
        }

        for entry in self.store.fetch_expired(now).await? {
            if self.store.delete(&entry.id).await? {
                debug!(entry_id = %entry.id, status = %entry.status, "Offline entry expired");
                summary.expired += 1;
                self.publish(NetEvent::EntryExpired { id: entry.id });
            }
        }

        if !self.connectivity.is_online() {
            debug!("Offline, skipping replay");
            summary.offline = true;
            return Ok(summary);
        }

        let mut batch = self.store.fetch_ready(now, self.settings.batch_size).await?;
        batch.sort_by_key(|e| (Reverse(e.priority), e.created_at));
        summary.fetched = batch.len();
        if !batch.is_empty() {
            info!(count = batch.len(), "Replaying offline batch");
        }

        for entry in batch {
            if !self.connectivity.is_online() {
                info!("Connectivity lost, pausing offline replay");
                summary.offline = true;
                break;
            }
            match self.replay(entry).await? {
                Replay::Completed => summary.completed += 1,
                Replay::Retried => summary.retried += 1,
                Replay::Failed => summary.failed += 1,
            }
        }

        debug!(
            completed = summary.completed,
            retried = summary.retried,
            failed = summary.failed,
            "Offline pass finished"
        );
        Ok(summary)
    }

    async fn replay(&self, mut entry: DurableEntry) -> Result<Replay> {
        entry.transition(EntryStatus::Processing, self.clock.now_millis())?;
        self.store.update(&entry).await?;
        self.publish(NetEvent::EntryProcessing { id: entry.id.clone(), attempt: entry.retry_count + 1 });

        let result = self.transport.send(entry.to_request()).await;
        let now = self.clock.now_millis();
        match result {
            Ok(response) => {
                entry.transition(EntryStatus::Completed, now)?;
                self.store.delete(&entry.id).await?;
                info!(entry_id = %entry.id, status = response.status, "Offline entry delivered");
                self.publish(NetEvent::EntryCompleted { id: entry.id, status: response.status });
                Ok(Replay::Completed)
            }
            Err(err) if err.is_client_error() => {
                self.fail(entry, &err, now).await?;
                Ok(Replay::Failed)
            }
            Err(err) if entry.can_retry() => {
                let delay = self.backoff.delay(entry.retry_count);
                let next = now.saturating_add(i64::try_from(delay.as_millis()).unwrap_or(i64::MAX));
                entry.schedule_retry(&err.to_string(), next, now)?;
                self.store.update(&entry).await?;
                warn!(
                    entry_id = %entry.id,
                    retry_count = entry.retry_count,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Offline replay failed, retry scheduled"
                );
                self.publish(NetEvent::EntryRetryScheduled {
                    id: entry.id,
                    retry_count: entry.retry_count,
                    next_attempt_at: next,
                });
                Ok(Replay::Retried)
            }
            Err(err) => {
                self.fail(entry, &err, now).await?;
                Ok(Replay::Failed)
            }
        }
    }

    async fn fail(&self, mut entry: DurableEntry, err: &NetError, now: i64) -> Result<()> {
        entry.mark_failed(&err.to_string(), now)?;
        self.store.update(&entry).await?;
        error!(
            entry_id = %entry.id,
            url = %entry.url,
            retry_count = entry.retry_count,
            error = %err,
            "Offline entry failed permanently"
        );
        if let Some(reporter) = &self.reporter {
            reporter.report(&err.clone().with_entry_id(entry.id.clone()), &entry);
        }
        self.publish(NetEvent::EntryFailed {
            id: entry.id,
            status: err.status,
            error: err.message.clone(),
        });
        Ok(())
    }

    async fn reschedule(self: &Arc<Self>, summary: &ProcessSummary) -> Result<()> {
        if summary.offline {
            return Ok(());
        }
        if summary.fetched > 0 && summary.fetched >= self.settings.batch_size {
            self.trigger();
            return Ok(());
        }

        let Some(at) = self.store.next_attempt_at().await? else {
            self.cancel_timer();
            return Ok(());
        };
        let wait_ms = at.saturating_sub(self.clock.now_millis());
        if wait_ms <= 0 {
            self.trigger();
            return Ok(());
        }

        let delay = Duration::from_millis(u64::try_from(wait_ms).unwrap_or(0));
        debug!(delay_ms = wait_ms, "Next offline attempt scheduled");
        let inner = Arc::clone(self);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if inner.connectivity.is_online() {
                inner.trigger();
            }
        });
        if let Some(previous) = self.timer.lock().replace(handle) {
            previous.abort();
        }
        Ok(())
    }

    async fn watch_connectivity(self: Arc<Self>, cancel: CancellationToken) {
        let mut rx = self.connectivity.subscribe();
        let mut online = *rx.borrow_and_update();
        if online {
            self.trigger();
        }
        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    debug!("Connectivity watcher cancelled");
                    break;
                }
                changed = rx.changed() => {
                    if changed.is_err() {
                        debug!("Connectivity source closed");
                        break;
                    }
                    let now_online = *rx.borrow_and_update();
                    if now_online && !online {
                        info!("Back online, replaying offline queue");
                        self.trigger();
                    }
                    online = now_online;
                }
            }
        }
    }
}
