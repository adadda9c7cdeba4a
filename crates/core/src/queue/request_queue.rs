//! Priority request queue
//!
//! Four FIFO tiers drained highest first, a semaphore bounding how many
//! thunks run at once, and a depth limit on what may wait. Items sharing a
//! dedup key collapse onto one execution whose result every submitter sees.
//! Each submitter cancels only its own wait; the shared execution stops once
//! no submitter is left waiting for it.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::{BoxFuture, FutureExt, Shared};
use netguard_common::resilience::ExponentialBackoff;
use netguard_common::ResilienceError;
use netguard_domain::{NetError, Priority, QueueSettings};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{oneshot, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

type Thunk<T> = Arc<dyn Fn() -> BoxFuture<'static, Result<T, NetError>> + Send + Sync>;
type SharedResult<T> = Shared<BoxFuture<'static, Result<T, NetError>>>;

/// Per-submission options. Unset fields fall back to the queue settings.
#[derive(Debug, Clone, Default)]
pub struct QueueOptions {
    pub priority: Option<Priority>,
    pub timeout: Option<Duration>,
    pub max_retries: Option<u32>,
    pub dedup_key: Option<String>,
    pub cancel: Option<CancellationToken>,
}

impl QueueOptions {
    #[must_use]
    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    #[must_use]
    pub fn dedup_key(mut self, key: impl Into<String>) -> Self {
        self.dedup_key = Some(key.into());
        self
    }

    #[must_use]
    pub fn cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub critical: usize,
    pub high: usize,
    pub normal: usize,
    pub low: usize,
    pub in_flight: usize,
    pub paused: bool,
}

impl QueueStats {
    pub fn queued(&self) -> usize {
        self.critical + self.high + self.normal + self.low
    }
}

struct Item<T> {
    thunk: Thunk<T>,
    priority: Priority,
    created_at: Instant,
    timeout: Duration,
    max_retries: u32,
    dedup_key: Option<String>,
    flight_id: u64,
    /// Fires once every waiter has gone.
    cancel: CancellationToken,
    result_tx: oneshot::Sender<Result<T, NetError>>,
}

/// An execution that later submitters with the same dedup key may join.
struct Flight<T> {
    id: u64,
    shared: SharedResult<T>,
    execution: CancellationToken,
    waiters: Arc<AtomicUsize>,
}

impl<T> Flight<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn new(id: u64, shared: SharedResult<T>) -> Self {
        Self { id, shared, execution: CancellationToken::new(), waiters: Arc::new(AtomicUsize::new(0)) }
    }

    /// Register one more waiter. `None` once every earlier waiter has left,
    /// since the execution is already being cancelled.
    fn join(&self) -> Option<Waiter<T>> {
        self.waiters
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n > 0).then_some(n + 1))
            .ok()?;
        Some(self.waiter())
    }

    fn first_waiter(&self) -> Waiter<T> {
        self.waiters.fetch_add(1, Ordering::AcqRel);
        self.waiter()
    }

    fn waiter(&self) -> Waiter<T> {
        Waiter {
            shared: self.shared.clone(),
            execution: self.execution.clone(),
            waiters: Arc::clone(&self.waiters),
        }
    }
}

/// One submitter's interest in an execution.
struct Waiter<T>
where
    T: Clone + Send + Sync + 'static,
{
    shared: SharedResult<T>,
    execution: CancellationToken,
    waiters: Arc<AtomicUsize>,
}

impl<T> Drop for Waiter<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn drop(&mut self) {
        let last = self.waiters.fetch_sub(1, Ordering::AcqRel) == 1;
        if last && self.shared.peek().is_none() {
            debug!("No submitter left waiting, cancelling execution");
            self.execution.cancel();
        }
    }
}

struct State<T> {
    tiers: [VecDeque<Item<T>>; 4],
    in_flight: usize,
    paused: bool,
    dedup: HashMap<String, Flight<T>>,
    next_flight: u64,
}

impl<T> State<T> {
    fn queued(&self) -> usize {
        self.tiers.iter().map(VecDeque::len).sum()
    }

    fn pop_next(&mut self) -> Option<Item<T>> {
        self.tiers.iter_mut().find_map(VecDeque::pop_front)
    }

    /// Forget the dedup entry for `item`, unless a newer flight replaced it.
    fn forget_flight(&mut self, item: &Item<T>) {
        if let Some(key) = &item.dedup_key {
            if self.dedup.get(key).is_some_and(|flight| flight.id == item.flight_id) {
                self.dedup.remove(key);
            }
        }
    }
}

struct Inner<T> {
    state: Mutex<State<T>>,
    semaphore: Arc<Semaphore>,
    settings: QueueSettings,
    backoff: ExponentialBackoff,
}

/// Priority queue in front of an async operation producing `T`.
pub struct RequestQueue<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for RequestQueue<T> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl<T> std::fmt::Debug for RequestQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("RequestQueue")
            .field("queued", &state.queued())
            .field("in_flight", &state.in_flight)
            .field("paused", &state.paused)
            .finish()
    }
}

impl<T> RequestQueue<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// # Errors
    /// `ResilienceError::InvalidConfiguration` when concurrency or depth is zero.
    pub fn new(settings: QueueSettings) -> Result<Self, ResilienceError> {
        if settings.concurrency == 0 || settings.max_depth == 0 {
            return Err(ResilienceError::InvalidConfiguration {
                message: "queue concurrency and max_depth must be at least 1".to_string(),
            });
        }
        let base = settings.retry_base_delay();
        let backoff = ExponentialBackoff::new(base, base.saturating_mul(32), 2.0)?;
        Ok(Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    tiers: Default::default(),
                    in_flight: 0,
                    paused: false,
                    dedup: HashMap::new(),
                    next_flight: 0,
                }),
                semaphore: Arc::new(Semaphore::new(settings.concurrency)),
                settings,
                backoff,
            }),
        })
    }

    pub fn settings(&self) -> &QueueSettings {
        &self.inner.settings
    }

    /// Run `thunk` once a slot is free, honouring priority and dedup.
    ///
    /// `thunk` is called again for each item-level retry.
    ///
    /// # Errors
    /// - `QueueFull` when `max_depth` items are already waiting
    /// - `Cancelled` when this submitter's token fires or the queue is
    ///   cleared first. Other submitters sharing the dedup key keep waiting.
    /// - `Timeout` or the thunk's own error once retries are spent
    pub async fn enqueue<F, Fut>(&self, thunk: F, options: QueueOptions) -> Result<T, NetError>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, NetError>> + Send + 'static,
    {
        let cancel = options.cancel.clone().unwrap_or_default();
        let mut waiter = self.submit(thunk, options)?;
        tokio::select! {
            result = &mut waiter.shared => result,
            () = cancel.cancelled() => Err(NetError::cancelled("request cancelled while queued")),
        }
    }

    fn submit<F, Fut>(&self, thunk: F, options: QueueOptions) -> Result<Waiter<T>, NetError>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, NetError>> + Send + 'static,
    {
        let settings = &self.inner.settings;
        let mut state = self.inner.state.lock();
        if let Some(key) = &options.dedup_key {
            if let Some(waiter) = state.dedup.get(key).and_then(Flight::join) {
                debug!(dedup_key = %key, "Joining in-flight request");
                return Ok(waiter);
            }
        }
        if state.queued() >= settings.max_depth {
            warn!(max_depth = settings.max_depth, "Request queue full");
            return Err(NetError::queue_full(settings.max_depth));
        }

        let (result_tx, result_rx) = oneshot::channel();
        let shared: SharedResult<T> = async move {
            result_rx
                .await
                .unwrap_or_else(|_| Err(NetError::cancelled("request queue dropped the item")))
        }
        .boxed()
        .shared();

        state.next_flight += 1;
        let flight = Flight::new(state.next_flight, shared);
        let waiter = flight.first_waiter();

        let priority = options.priority.unwrap_or(settings.default_priority);
        let item = Item {
            thunk: Arc::new(move || thunk().boxed()),
            priority,
            created_at: Instant::now(),
            timeout: options.timeout.unwrap_or_else(|| settings.default_timeout()),
            max_retries: options.max_retries.unwrap_or(settings.max_retries),
            dedup_key: options.dedup_key.clone(),
            flight_id: flight.id,
            cancel: flight.execution.clone(),
            result_tx,
        };
        if let Some(key) = options.dedup_key {
            // Replaces a flight every waiter has left
            state.dedup.insert(key, flight);
        }
        state.tiers[priority.tier_index()].push_back(item);
        trace!(priority = %priority, queued = state.queued(), "Item queued");
        drop(state);

        Inner::pump(&self.inner);
        Ok(waiter)
    }

    pub fn stats(&self) -> QueueStats {
        let state = self.inner.state.lock();
        let tier = |p: Priority| state.tiers[p.tier_index()].len();
        QueueStats {
            critical: tier(Priority::Critical),
            high: tier(Priority::High),
            normal: tier(Priority::Normal),
            low: tier(Priority::Low),
            in_flight: state.in_flight,
            paused: state.paused,
        }
    }

    /// Stop starting new items. Running items finish normally.
    pub fn pause(&self) {
        self.inner.state.lock().paused = true;
        info!("Request queue paused");
    }

    pub fn resume(&self) {
        self.inner.state.lock().paused = false;
        info!("Request queue resumed");
        Inner::pump(&self.inner);
    }

    /// Reject every waiting item with `Cancelled`. Returns how many.
    pub fn clear(&self) -> usize {
        let drained: Vec<Item<T>> = {
            let mut state = self.inner.state.lock();
            let drained: Vec<_> = state.tiers.iter_mut().flat_map(|tier| tier.drain(..)).collect();
            for item in &drained {
                state.forget_flight(item);
            }
            drained
        };
        let count = drained.len();
        for item in drained {
            let _ = item.result_tx.send(Err(NetError::cancelled("request queue cleared")));
        }
        info!(count, "Request queue cleared");
        count
    }
}

impl<T> Inner<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Start as many waiting items as there are free slots.
    fn pump(this: &Arc<Self>) {
        loop {
            let mut state = this.state.lock();
            if state.paused || state.queued() == 0 {
                return;
            }
            let Ok(permit) = Arc::clone(&this.semaphore).try_acquire_owned() else {
                return;
            };
            let Some(item) = state.pop_next() else {
                return;
            };
            state.in_flight += 1;
            drop(state);

            let inner = Arc::clone(this);
            tokio::spawn(async move {
                inner.run(item, permit).await;
            });
        }
    }

    async fn run(self: Arc<Self>, item: Item<T>, permit: OwnedSemaphorePermit) {
        let waited = item.created_at.elapsed();
        trace!(priority = %item.priority, waited_ms = waited.as_millis() as u64, "Item started");

        let result = self.execute(&item).await;

        {
            let mut state = self.state.lock();
            state.in_flight -= 1;
            state.forget_flight(&item);
        }
        let _ = item.result_tx.send(result);
        drop(permit);
        Self::pump(&self);
    }

    async fn execute(&self, item: &Item<T>) -> Result<T, NetError> {
        let mut attempt = 0;
        loop {
            if item.cancel.is_cancelled() {
                return Err(NetError::cancelled("request cancelled while queued"));
            }
            let result = tokio::select! {
                () = item.cancel.cancelled() => Err(NetError::cancelled("request cancelled")),
                outcome = tokio::time::timeout(item.timeout, (item.thunk)()) => {
                    outcome.unwrap_or_else(|_| Err(NetError::timeout(item.timeout)))
                }
            };

            match result {
                Err(err) if attempt < item.max_retries && err.is_retryable() => {
                    let delay = self.backoff.delay(attempt);
                    attempt += 1;
                    debug!(attempt, delay_ms = delay.as_millis() as u64, error = %err, "Retrying queued item");
                    tokio::select! {
                        () = item.cancel.cancelled() => {
                            return Err(NetError::cancelled("request cancelled during backoff"));
                        }
                        () = tokio::time::sleep(delay) => {}
                    }
                }
                other => return other,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use netguard_domain::ErrorKind;

    use super::*;

    fn queue(concurrency: usize, max_depth: usize) -> RequestQueue<u32> {
        RequestQueue::new(QueueSettings {
            concurrency,
            max_depth,
            default_timeout_ms: 1_000,
            retry_base_delay_ms: 10,
            ..QueueSettings::default()
        })
        .unwrap()
    }

    /// Validates `RequestQueue` ordering for the mixed-priority scenario.
    ///
    /// Assertions:
    /// - Confirms higher tiers start first once the slot frees.
    /// - Confirms FIFO order within one tier.
    #[tokio::test(start_paused = true)]
    async fn drains_highest_tier_first() {
        let q = queue(1, 100);
        let order = Arc::new(Mutex::new(Vec::new()));
        q.pause();

        let mut handles = Vec::new();
        for (label, priority) in [
            (1, Priority::Low),
            (2, Priority::Normal),
            (3, Priority::Critical),
            (4, Priority::Normal),
            (5, Priority::High),
        ] {
            let q = q.clone();
            let order = Arc::clone(&order);
            handles.push(tokio::spawn(async move {
                q.enqueue(
                    move || {
                        let order = Arc::clone(&order);
                        async move {
                            order.lock().push(label);
                            Ok(label)
                        }
                    },
                    QueueOptions::default().priority(priority),
                )
                .await
            }));
        }
        tokio::task::yield_now().await;
        while q.stats().queued() < 5 {
            tokio::task::yield_now().await;
        }
        q.resume();
        for h in handles {
            h.await.unwrap().unwrap();
        }
        assert_eq!(*order.lock(), vec![3, 5, 2, 4, 1]);
    }

    /// Validates dedup behavior for the concurrent identical request
    /// scenario.
    ///
    /// Assertions:
    /// - Confirms the thunk runs once.
    /// - Confirms every submitter sees the same result.
    #[tokio::test(start_paused = true)]
    async fn dedup_runs_thunk_once() {
        let q = queue(4, 100);
        let runs = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..3 {
            let q = q.clone();
            let runs = Arc::clone(&runs);
            handles.push(tokio::spawn(async move {
                q.enqueue(
                    move || {
                        let runs = Arc::clone(&runs);
                        async move {
                            runs.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(50)).await;
                            Ok(42)
                        }
                    },
                    QueueOptions::default().dedup_key("GET /users/1"),
                )
                .await
            }));
        }
        for h in handles {
            assert_eq!(h.await.unwrap().unwrap(), 42);
        }
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    /// Validates dedup behavior for the scenario where the first submitter
    /// cancels.
    ///
    /// Assertions:
    /// - Confirms the cancelling submitter gets `Cancelled`.
    /// - Confirms a joiner with its own token still gets the shared result
    ///   from a single run.
    #[tokio::test(start_paused = true)]
    async fn dedup_joiner_survives_first_submitter_cancel() {
        let q = queue(4, 100);
        let runs = Arc::new(AtomicUsize::new(0));
        let slow = {
            let runs = Arc::clone(&runs);
            move || {
                let runs = Arc::clone(&runs);
                async move {
                    runs.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    Ok(7)
                }
            }
        };
        let first_token = CancellationToken::new();

        let (q1, thunk, token) = (q.clone(), slow.clone(), first_token.clone());
        let first = tokio::spawn(async move {
            q1.enqueue(thunk, QueueOptions::default().dedup_key("GET /a").cancel(token)).await
        });
        while q.stats().in_flight < 1 {
            tokio::task::yield_now().await;
        }
        let q2 = q.clone();
        let joiner = tokio::spawn(async move {
            q2.enqueue(slow, QueueOptions::default().dedup_key("GET /a").cancel(CancellationToken::new())).await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        first_token.cancel();

        assert_eq!(first.await.unwrap().unwrap_err().kind, ErrorKind::Cancelled);
        assert_eq!(joiner.await.unwrap().unwrap(), 7);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    /// Validates dedup behavior once every submitter has cancelled.
    ///
    /// Assertions:
    /// - Confirms the shared execution stops instead of running to the end.
    /// - Confirms a later submitter with the same key starts a fresh run.
    #[tokio::test(start_paused = true)]
    async fn dedup_execution_stops_when_every_submitter_leaves() {
        let q = queue(4, 100);
        let finished = Arc::new(AtomicUsize::new(0));
        let runs = Arc::new(AtomicUsize::new(0));
        let slow = {
            let (finished, runs) = (Arc::clone(&finished), Arc::clone(&runs));
            move || {
                let (finished, runs) = (Arc::clone(&finished), Arc::clone(&runs));
                async move {
                    runs.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    finished.fetch_add(1, Ordering::SeqCst);
                    Ok(1)
                }
            }
        };

        let tokens = [CancellationToken::new(), CancellationToken::new()];
        let mut handles = Vec::new();
        for token in &tokens {
            let (q, thunk, token) = (q.clone(), slow.clone(), token.clone());
            handles.push(tokio::spawn(async move {
                q.enqueue(thunk, QueueOptions::default().dedup_key("GET /b").cancel(token)).await
            }));
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        for token in &tokens {
            token.cancel();
        }
        for h in handles {
            assert_eq!(h.await.unwrap().unwrap_err().kind, ErrorKind::Cancelled);
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(finished.load(Ordering::SeqCst), 0);
        assert_eq!(q.stats().in_flight, 0);

        let fresh = q.enqueue(slow, QueueOptions::default().dedup_key("GET /b")).await.unwrap();
        assert_eq!(fresh, 1);
        assert_eq!(runs.load(Ordering::SeqCst), 2);
        assert_eq!(finished.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn rejects_when_full() {
        let q = queue(1, 1);
        q.pause();
        let q1 = q.clone();
        let first = tokio::spawn(async move { q1.enqueue(|| async { Ok(1) }, QueueOptions::default()).await });
        while q.stats().queued() < 1 {
            tokio::task::yield_now().await;
        }
        let err = q.enqueue(|| async { Ok(2) }, QueueOptions::default()).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::QueueFull);

        q.resume();
        assert_eq!(first.await.unwrap().unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_is_retried_then_rejected() {
        let q = queue(1, 10);
        let attempts = Arc::new(AtomicUsize::new(0));
        let a = Arc::clone(&attempts);
        let err = q
            .enqueue(
                move || {
                    a.fetch_add(1, Ordering::SeqCst);
                    async {
                        tokio::time::sleep(Duration::from_secs(10)).await;
                        Ok(0)
                    }
                },
                QueueOptions::default().timeout(Duration::from_millis(100)).max_retries(2),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Timeout);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn client_errors_are_not_retried() {
        let q = queue(1, 10);
        let attempts = Arc::new(AtomicUsize::new(0));
        let a = Arc::clone(&attempts);
        let err = q
            .enqueue(
                move || {
                    a.fetch_add(1, Ordering::SeqCst);
                    async { Err::<u32, _>(NetError::from_status(400, "bad")) }
                },
                QueueOptions::default().max_retries(3),
            )
            .await
            .unwrap_err();
        assert_eq!(err.status, 400);
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_wait_never_runs_thunk() {
        let q = queue(1, 10);
        q.pause();
        let runs = Arc::new(AtomicUsize::new(0));
        let token = CancellationToken::new();

        let (q1, r, t) = (q.clone(), Arc::clone(&runs), token.clone());
        let waiter = tokio::spawn(async move {
            q1.enqueue(
                move || {
                    r.fetch_add(1, Ordering::SeqCst);
                    async { Ok(1) }
                },
                QueueOptions::default().cancel(t),
            )
            .await
        });
        while q.stats().queued() < 1 {
            tokio::task::yield_now().await;
        }
        token.cancel();
        let err = waiter.await.unwrap().unwrap_err();
        assert_eq!(err.kind, ErrorKind::Cancelled);

        q.resume();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn clear_rejects_waiting_items() {
        let q = queue(1, 10);
        q.pause();
        let q1 = q.clone();
        let waiter = tokio::spawn(async move { q1.enqueue(|| async { Ok(1) }, QueueOptions::default()).await });
        while q.stats().queued() < 1 {
            tokio::task::yield_now().await;
        }
        assert_eq!(q.clear(), 1);
        assert_eq!(waiter.await.unwrap().unwrap_err().kind, ErrorKind::Cancelled);
        assert_eq!(q.stats().queued(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrency_is_bounded() {
        let q = queue(2, 100);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for i in 0..6 {
            let (q, running, peak) = (q.clone(), Arc::clone(&running), Arc::clone(&peak));
            handles.push(tokio::spawn(async move {
                q.enqueue(
                    move || {
                        let (running, peak) = (Arc::clone(&running), Arc::clone(&peak));
                        async move {
                            let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                            peak.fetch_max(now, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(20)).await;
                            running.fetch_sub(1, Ordering::SeqCst);
                            Ok(i)
                        }
                    },
                    QueueOptions::default(),
                )
                .await
            }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }
        assert_eq!(peak.load(Ordering::SeqCst), 2);
        assert_eq!(q.stats().in_flight, 0);
    }
}
