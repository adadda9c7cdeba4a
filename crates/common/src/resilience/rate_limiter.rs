//! Sliding-window rate limiter
//!
//! Keeps a log of issuance instants and admits a call only while fewer than
//! `max_requests` of them fall inside the trailing `window`. What happens to a
//! call that arrives when the window is full depends on the strategy:
//!
//! - `reject`: fail immediately with the time until the oldest slot frees
//! - `queue`: wait in a bounded FIFO; a drain task grants slots in order
//! - `delay`: sleep until a slot frees, then try again
//!
//! Dropping an `acquire` future (e.g. on cancellation) abandons the wait; a
//! queued waiter that went away is skipped without consuming a slot.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use netguard_domain::{RateLimitSettings, RateLimitStrategy};
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, trace};

use super::{ResilienceError, ResilienceResult};
use crate::time::{Clock, SystemClock};

/// Configuration for the sliding-window limiter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimiterConfig {
    pub max_requests: u32,
    pub window: Duration,
    pub strategy: RateLimitStrategy,
    pub max_queue: usize,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self::from_settings(&RateLimitSettings::default())
    }
}

impl RateLimiterConfig {
    pub fn new(max_requests: u32, window: Duration, strategy: RateLimitStrategy) -> Self {
        Self { max_requests, window, strategy, ..Self::default() }
    }

    pub fn from_settings(settings: &RateLimitSettings) -> Self {
        Self {
            max_requests: settings.max_requests,
            window: settings.window(),
            strategy: settings.strategy,
            max_queue: settings.max_queue,
        }
    }

    #[must_use]
    pub fn with_max_queue(mut self, max_queue: usize) -> Self {
        self.max_queue = max_queue;
        self
    }

    pub fn validate(&self) -> ResilienceResult<()> {
        if self.max_requests == 0 {
            return Err(ResilienceError::invalid("max_requests must be greater than 0"));
        }
        if self.window.is_zero() {
            return Err(ResilienceError::invalid("window must be greater than zero"));
        }
        Ok(())
    }
}

/// Proof of admission.
///
/// Sliding-window slots free themselves as time passes, so there is nothing
/// to release.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RatePermit {
    pub granted_at: Instant,
    /// Time spent waiting for the slot.
    pub waited: Duration,
}

/// Point-in-time view of the limiter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimiterSnapshot {
    pub in_window: usize,
    pub queued: usize,
    pub max_requests: u32,
    pub window: Duration,
}

#[derive(Debug, Default)]
struct WindowState {
    log: VecDeque<Instant>,
    waiters: VecDeque<oneshot::Sender<Instant>>,
    draining: bool,
}

impl WindowState {
    fn prune(&mut self, now: Instant, window: Duration) {
        while let Some(&oldest) = self.log.front() {
            if now.saturating_duration_since(oldest) >= window {
                self.log.pop_front();
            } else {
                break;
            }
        }
    }

    /// Time until the oldest entry leaves the window.
    fn wait_time(&self, now: Instant, window: Duration) -> Duration {
        self.log
            .front()
            .map_or(Duration::ZERO, |&oldest| (oldest + window).saturating_duration_since(now))
    }
}

/// Sliding-window rate limiter.
///
/// Cheap to clone; clones share the same window.
pub struct SlidingWindowLimiter<C: Clock = SystemClock> {
    config: RateLimiterConfig,
    state: Arc<Mutex<WindowState>>,
    clock: Arc<C>,
}

impl<C: Clock> Clone for SlidingWindowLimiter<C> {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            state: Arc::clone(&self.state),
            clock: Arc::clone(&self.clock),
        }
    }
}

impl<C: Clock> std::fmt::Debug for SlidingWindowLimiter<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlidingWindowLimiter").field("config", &self.config).finish()
    }
}

impl SlidingWindowLimiter<SystemClock> {
    pub fn new(config: RateLimiterConfig) -> ResilienceResult<Self> {
        Self::with_clock(config, SystemClock)
    }
}

impl<C: Clock> SlidingWindowLimiter<C> {
    pub fn with_clock(config: RateLimiterConfig, clock: C) -> ResilienceResult<Self> {
        config.validate()?;
        Ok(Self { config, state: Arc::new(Mutex::new(WindowState::default())), clock: Arc::new(clock) })
    }

    pub fn config(&self) -> &RateLimiterConfig {
        &self.config
    }

    /// Take a slot if one is free right now. Never waits and never jumps
    /// ahead of queued waiters.
    pub fn try_acquire(&self) -> Option<RatePermit> {
        let now = self.clock.now();
        let mut state = self.state.lock();
        state.prune(now, self.config.window);
        if state.waiters.is_empty() && state.log.len() < self.capacity() {
            state.log.push_back(now);
            Some(RatePermit { granted_at: now, waited: Duration::ZERO })
        } else {
            None
        }
    }

    /// Acquire a slot according to the configured strategy.
    ///
    /// # Errors
    /// - `RateLimited` under `reject` when the window is full
    /// - `WaitQueueFull` under `queue` when `max_queue` callers already wait
    /// - `Closed` if the drain task went away
    pub async fn acquire(&self) -> ResilienceResult<RatePermit> {
        match self.config.strategy {
            RateLimitStrategy::Reject => self.acquire_or_reject(),
            RateLimitStrategy::Queue => self.acquire_queued().await,
            RateLimitStrategy::Delay => self.acquire_delayed().await,
        }
    }

    pub fn snapshot(&self) -> RateLimiterSnapshot {
        let now = self.clock.now();
        let mut state = self.state.lock();
        state.prune(now, self.config.window);
        state.waiters.retain(|w| !w.is_closed());
        RateLimiterSnapshot {
            in_window: state.log.len(),
            queued: state.waiters.len(),
            max_requests: self.config.max_requests,
            window: self.config.window,
        }
    }

    fn capacity(&self) -> usize {
        self.config.max_requests as usize
    }

    fn acquire_or_reject(&self) -> ResilienceResult<RatePermit> {
        let now = self.clock.now();
        let mut state = self.state.lock();
        state.prune(now, self.config.window);
        if state.log.len() < self.capacity() {
            state.log.push_back(now);
            return Ok(RatePermit { granted_at: now, waited: Duration::ZERO });
        }
        let retry_after = state.wait_time(now, self.config.window);
        debug!(retry_after_ms = retry_after.as_millis() as u64, "Rate limit exceeded, rejecting");
        Err(ResilienceError::RateLimited { retry_after })
    }

    async fn acquire_delayed(&self) -> ResilienceResult<RatePermit> {
        let started = self.clock.now();
        loop {
            let wait = {
                let now = self.clock.now();
                let mut state = self.state.lock();
                state.prune(now, self.config.window);
                if state.log.len() < self.capacity() {
                    state.log.push_back(now);
                    return Ok(RatePermit {
                        granted_at: now,
                        waited: now.saturating_duration_since(started),
                    });
                }
                state.wait_time(now, self.config.window)
            };
            trace!(wait_ms = wait.as_millis() as u64, "Rate limit reached, delaying");
            tokio::time::sleep(wait.max(Duration::from_millis(1))).await;
        }
    }

    async fn acquire_queued(&self) -> ResilienceResult<RatePermit> {
        let started = self.clock.now();
        let rx = {
            let now = started;
            let mut state = self.state.lock();
            state.prune(now, self.config.window);
            state.waiters.retain(|w| !w.is_closed());
            if state.waiters.is_empty() && state.log.len() < self.capacity() {
                state.log.push_back(now);
                return Ok(RatePermit { granted_at: now, waited: Duration::ZERO });
            }
            if state.waiters.len() >= self.config.max_queue {
                return Err(ResilienceError::WaitQueueFull {
                    capacity: self.config.max_queue,
                    retry_after: state.wait_time(now, self.config.window),
                });
            }
            let (tx, rx) = oneshot::channel();
            state.waiters.push_back(tx);
            if !state.draining {
                state.draining = true;
                self.spawn_drain();
            }
            rx
        };

        match rx.await {
            Ok(granted_at) => Ok(RatePermit {
                granted_at,
                waited: granted_at.saturating_duration_since(started),
            }),
            Err(_) => Err(ResilienceError::Closed),
        }
    }

    /// Grants queued waiters in FIFO order as slots free up; exits once the
    /// wait queue is empty.
    fn spawn_drain(&self) {
        let state = Arc::clone(&self.state);
        let clock = Arc::clone(&self.clock);
        let window = self.config.window;
        let capacity = self.capacity();
        tokio::spawn(async move {
            loop {
                let wait = {
                    let now = clock.now();
                    let mut guard = state.lock();
                    guard.prune(now, window);
                    while guard.log.len() < capacity {
                        let Some(waiter) = guard.waiters.pop_front() else { break };
                        if waiter.send(now).is_ok() {
                            guard.log.push_back(now);
                        }
                    }
                    guard.waiters.retain(|w| !w.is_closed());
                    if guard.waiters.is_empty() {
                        guard.draining = false;
                        return;
                    }
                    guard.wait_time(now, window)
                };
                tokio::time::sleep(wait.max(Duration::from_millis(1))).await;
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(strategy: RateLimitStrategy) -> SlidingWindowLimiter {
        SlidingWindowLimiter::new(
            RateLimiterConfig::new(2, Duration::from_millis(1_000), strategy).with_max_queue(2),
        )
        .unwrap()
    }

    #[test]
    fn config_validation() {
        assert!(RateLimiterConfig::new(0, Duration::from_secs(1), RateLimitStrategy::Reject)
            .validate()
            .is_err());
        assert!(RateLimiterConfig::new(1, Duration::ZERO, RateLimitStrategy::Reject)
            .validate()
            .is_err());
        let defaults = RateLimiterConfig::default();
        assert_eq!(defaults.max_requests, 50);
        assert_eq!(defaults.strategy, RateLimitStrategy::Queue);
    }

    /// Validates `SlidingWindowLimiter::acquire` behavior for the reject
    /// strategy scenario.
    ///
    /// Assertions:
    /// - Confirms the third call inside the window is rejected.
    /// - Ensures the advertised wait never exceeds the window.
    #[tokio::test(start_paused = true)]
    async fn reject_strategy_fails_fast_with_bounded_wait() {
        let limiter = limiter(RateLimitStrategy::Reject);
        limiter.acquire().await.unwrap();
        tokio::time::advance(Duration::from_millis(300)).await;
        limiter.acquire().await.unwrap();

        match limiter.acquire().await {
            Err(ResilienceError::RateLimited { retry_after }) => {
                assert!(retry_after <= Duration::from_millis(1_000));
                assert_eq!(retry_after, Duration::from_millis(700));
            }
            other => panic!("expected rejection, got {other:?}"),
        }

        tokio::time::advance(Duration::from_millis(700)).await;
        assert!(limiter.acquire().await.is_ok(), "oldest slot left the window");
    }

    #[tokio::test(start_paused = true)]
    async fn delay_strategy_waits_for_window() {
        let limiter = limiter(RateLimitStrategy::Delay);
        let start = tokio::time::Instant::now();
        limiter.acquire().await.unwrap();
        limiter.acquire().await.unwrap();

        let permit = limiter.acquire().await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(1_000));
        assert!(permit.waited >= Duration::from_millis(1_000));
    }

    /// Validates `SlidingWindowLimiter::acquire` behavior for the queue
    /// strategy scenario.
    ///
    /// Assertions:
    /// - Confirms queued callers are granted in FIFO order once slots free.
    /// - Ensures callers beyond `max_queue` are refused.
    #[tokio::test(start_paused = true)]
    async fn queue_strategy_grants_in_order() {
        let limiter = limiter(RateLimitStrategy::Queue);
        limiter.acquire().await.unwrap();
        limiter.acquire().await.unwrap();

        let order = Arc::new(Mutex::new(Vec::new()));
        let mut handles = Vec::new();
        for i in 0..2 {
            let l = limiter.clone();
            let o = Arc::clone(&order);
            handles.push(tokio::spawn(async move {
                l.acquire().await.unwrap();
                o.lock().push(i);
            }));
            tokio::task::yield_now().await;
        }

        assert_eq!(limiter.snapshot().queued, 2);
        assert!(matches!(
            limiter.acquire().await,
            Err(ResilienceError::WaitQueueFull { capacity: 2, .. })
        ));

        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(*order.lock(), vec![0, 1]);
        let snap = limiter.snapshot();
        assert_eq!(snap.queued, 0);
        assert_eq!(snap.in_window, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_waiter_does_not_consume_slot() {
        let limiter = limiter(RateLimitStrategy::Queue);
        limiter.acquire().await.unwrap();
        limiter.acquire().await.unwrap();

        let abandoned = tokio::time::timeout(Duration::from_millis(10), limiter.acquire()).await;
        assert!(abandoned.is_err());

        tokio::time::advance(Duration::from_millis(1_000)).await;
        let permit = limiter.acquire().await.unwrap();
        assert_eq!(permit.waited, Duration::ZERO);
        assert_eq!(limiter.snapshot().in_window, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn try_acquire_respects_capacity() {
        let limiter = limiter(RateLimitStrategy::Reject);
        assert!(limiter.try_acquire().is_some());
        assert!(limiter.try_acquire().is_some());
        assert!(limiter.try_acquire().is_none());
        assert_eq!(limiter.snapshot().in_window, 2);
    }
}
