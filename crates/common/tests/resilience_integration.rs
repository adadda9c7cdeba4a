//! Integration tests for resilience module
//!
//! Exercises the breaker, backoff and limiter together the way the client
//! pipeline uses them, with time driven by `MockClock` or paused tokio time.

#![cfg(feature = "runtime")]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use netguard_common::resilience::{
    CircuitBreaker, CircuitBreakerConfig, ExponentialBackoff, RateLimiterConfig, ResilienceError,
    SlidingWindowLimiter,
};
use netguard_common::time::{MockClock, SharedClock};
use netguard_common::ErrorClassification;
use netguard_domain::{CircuitState, RateLimitStrategy};

/// Validates the full breaker cycle against a flaky dependency.
///
/// # Test Steps
/// 1. Fail the dependency until the breaker opens
/// 2. Verify calls are rejected without reaching the dependency
/// 3. Advance past the reset timeout and let the probes succeed
/// 4. Confirm the breaker closes and calls flow again
#[test]
fn test_breaker_cycle_shields_dependency() {
    let clock = MockClock::new();
    let shared: SharedClock = Arc::new(clock.clone());
    let config = CircuitBreakerConfig::builder()
        .failure_threshold(5)
        .success_threshold(3)
        .reset_timeout(Duration::from_secs(30))
        .build()
        .expect("valid config");
    let breaker = CircuitBreaker::with_clock(config, shared).expect("breaker");

    let calls = AtomicU32::new(0);
    let call = |healthy: bool| -> Result<(), ResilienceError> {
        breaker.check()?;
        calls.fetch_add(1, Ordering::SeqCst);
        if healthy {
            breaker.record_success();
        } else {
            breaker.record_failure();
        }
        Ok(())
    };

    for _ in 0..5 {
        call(false).expect("admitted while closed");
    }
    assert_eq!(breaker.state(), CircuitState::Open);

    for _ in 0..10 {
        let err = call(true).expect_err("rejected while open");
        assert!(err.is_retryable());
        assert!(err.retry_after().expect("hint") <= Duration::from_secs(30));
    }
    assert_eq!(calls.load(Ordering::SeqCst), 5, "open breaker never reaches dependency");

    clock.advance(Duration::from_secs(30));
    for _ in 0..3 {
        call(true).expect("probe admitted");
    }
    assert_eq!(breaker.state(), CircuitState::Closed);
    assert_eq!(calls.load(Ordering::SeqCst), 8);
}

/// Validates that backoff delays for a retry budget stay in their jitter
/// band and never exceed the cap by more than the jitter.
///
/// # Test Steps
/// 1. Build a jittered backoff of 100ms base, factor 2, 400ms cap
/// 2. Sample each attempt many times
/// 3. Verify every sample lies within ±25% of the capped value
#[test]
fn test_backoff_schedule_with_jitter() {
    let backoff =
        ExponentialBackoff::new(Duration::from_millis(100), Duration::from_millis(400), 2.0)
            .expect("valid backoff");
    let expected = [100u128, 200, 400, 400];
    for (attempt, millis) in expected.iter().enumerate() {
        let attempt = u32::try_from(attempt).expect("small");
        for _ in 0..100 {
            let d = backoff.delay(attempt).as_millis();
            assert!(d >= millis * 3 / 4 - 1 && d <= millis * 5 / 4 + 1, "attempt {attempt}: {d}ms");
        }
    }
}

/// Validates the delay strategy spreads a burst across windows.
///
/// # Test Steps
/// 1. Configure 3 requests per 500ms with the delay strategy
/// 2. Fire 7 acquisitions concurrently
/// 3. Confirm the last permit is granted no earlier than two windows later
#[tokio::test(start_paused = true)]
async fn test_delay_strategy_spreads_burst() {
    let limiter = SlidingWindowLimiter::new(RateLimiterConfig::new(
        3,
        Duration::from_millis(500),
        RateLimitStrategy::Delay,
    ))
    .expect("limiter");
    let start = tokio::time::Instant::now();

    let mut handles = Vec::new();
    for _ in 0..7 {
        let l = limiter.clone();
        handles.push(tokio::spawn(async move { l.acquire().await.expect("permit") }));
    }
    let mut waits = Vec::new();
    for h in handles {
        waits.push(h.await.expect("join").waited);
    }
    waits.sort();

    assert_eq!(waits.iter().filter(|w| w.is_zero()).count(), 3);
    assert!(start.elapsed() >= Duration::from_millis(1_000));
    assert!(limiter.snapshot().in_window <= 3);
}

/// Validates the queue strategy under a burst larger than the window.
///
/// # Test Steps
/// 1. Configure 2 requests per second, queue of 10
/// 2. Fire 6 acquisitions
/// 3. Confirm all succeed and no more than 2 land in any one window
#[tokio::test(start_paused = true)]
async fn test_queue_strategy_respects_window() {
    let limiter = SlidingWindowLimiter::new(
        RateLimiterConfig::new(2, Duration::from_secs(1), RateLimitStrategy::Queue)
            .with_max_queue(10),
    )
    .expect("limiter");
    let start = tokio::time::Instant::now();

    let mut handles = Vec::new();
    for _ in 0..6 {
        let l = limiter.clone();
        handles.push(tokio::spawn(async move { l.acquire().await.expect("permit").granted_at }));
    }
    let mut grants = Vec::new();
    for h in handles {
        grants.push(h.await.expect("join"));
    }
    grants.sort();

    for pair in grants.windows(3) {
        assert!(
            pair[2].duration_since(pair[0]) >= Duration::from_secs(1),
            "three grants inside one window"
        );
    }
    assert!(start.elapsed() >= Duration::from_secs(2));
}
