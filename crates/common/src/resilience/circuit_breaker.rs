//! Circuit breaker state machine
//!
//! ```text
//!   closed --(failure_threshold consecutive failures)--> open
//!   open   --(first admission check at/after next_attempt)--> half-open
//!   half-open --(success_threshold consecutive successes)--> closed
//!   half-open --(any failure)--> open
//! ```
//!
//! All state lives behind one lock so every admission and every recorded
//! outcome is linearizable. Transition listeners run after the lock is
//! released.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use netguard_domain::{CircuitBreakerSettings, CircuitState};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::{ResilienceError, ResilienceResult};
use crate::time::{Clock, SystemClock};

/// Configuration for circuit breaker behavior
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before opening the circuit
    pub failure_threshold: u32,
    /// Consecutive successes needed to close the circuit from half-open
    pub success_threshold: u32,
    /// Time the circuit stays open before a probe is admitted
    pub reset_timeout: Duration,
    /// Probe calls admitted concurrently while half-open
    pub half_open_max_calls: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self::from_settings(&CircuitBreakerSettings::default())
    }
}

impl CircuitBreakerConfig {
    pub fn builder() -> CircuitBreakerConfigBuilder {
        CircuitBreakerConfigBuilder::new()
    }

    pub fn from_settings(settings: &CircuitBreakerSettings) -> Self {
        Self {
            failure_threshold: settings.failure_threshold,
            success_threshold: settings.success_threshold,
            reset_timeout: settings.reset_timeout(),
            half_open_max_calls: settings.half_open_max_calls,
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> ResilienceResult<()> {
        if self.failure_threshold == 0 {
            return Err(ResilienceError::invalid("failure_threshold must be greater than 0"));
        }
        if self.success_threshold == 0 {
            return Err(ResilienceError::invalid("success_threshold must be greater than 0"));
        }
        if self.half_open_max_calls == 0 {
            return Err(ResilienceError::invalid("half_open_max_calls must be greater than 0"));
        }
        Ok(())
    }
}

/// Builder for CircuitBreakerConfig
#[derive(Debug, Default)]
pub struct CircuitBreakerConfigBuilder {
    config: CircuitBreakerConfig,
}

impl CircuitBreakerConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failure_threshold(mut self, threshold: u32) -> Self {
        self.config.failure_threshold = threshold;
        self
    }

    pub fn success_threshold(mut self, threshold: u32) -> Self {
        self.config.success_threshold = threshold;
        self
    }

    pub fn reset_timeout(mut self, timeout: Duration) -> Self {
        self.config.reset_timeout = timeout;
        self
    }

    pub fn half_open_max_calls(mut self, max_calls: u32) -> Self {
        self.config.half_open_max_calls = max_calls;
        self
    }

    pub fn build(self) -> ResilienceResult<CircuitBreakerConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// A state change, as reported to listeners.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateTransition {
    pub from: CircuitState,
    pub to: CircuitState,
    /// Consecutive failures at the time of the change.
    pub failures: u32,
    /// Remaining open time; zero unless `to` is `Open`.
    pub retry_after: Duration,
}

pub type TransitionListener = Arc<dyn Fn(&StateTransition) + Send + Sync>;

/// Circuit breaker metrics for monitoring
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitBreakerMetrics {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub half_open_successes: u32,
    pub half_open_in_flight: u32,
    pub total_calls: u64,
    pub total_failures: u64,
    pub rejected_calls: u64,
    pub last_failure_time: Option<Instant>,
    pub next_attempt: Option<Instant>,
    pub state_change_time: Instant,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    half_open_successes: u32,
    half_open_in_flight: u32,
    last_failure_time: Option<Instant>,
    next_attempt: Option<Instant>,
    state_change_time: Instant,
    total_calls: u64,
    total_failures: u64,
    rejected_calls: u64,
}

impl BreakerState {
    fn new(now: Instant) -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            half_open_successes: 0,
            half_open_in_flight: 0,
            last_failure_time: None,
            next_attempt: None,
            state_change_time: now,
            total_calls: 0,
            total_failures: 0,
            rejected_calls: 0,
        }
    }

    fn move_to(&mut self, to: CircuitState, now: Instant, reset_timeout: Duration) -> StateTransition {
        let from = self.state;
        self.state = to;
        self.state_change_time = now;
        self.half_open_successes = 0;
        self.half_open_in_flight = 0;
        let retry_after = match to {
            CircuitState::Open => {
                self.next_attempt = Some(now + reset_timeout);
                reset_timeout
            }
            CircuitState::Closed => {
                self.consecutive_failures = 0;
                self.next_attempt = None;
                Duration::ZERO
            }
            CircuitState::HalfOpen => Duration::ZERO,
        };
        StateTransition { from, to, failures: self.consecutive_failures, retry_after }
    }
}

/// Circuit breaker for one service.
///
/// Callers ask [`check`](Self::check) before each call and report the outcome
/// with [`record_success`](Self::record_success),
/// [`record_failure`](Self::record_failure) or
/// [`record_ignored`](Self::record_ignored) (an admitted call that ended
/// without a verdict, e.g. cancelled).
pub struct CircuitBreaker<C: Clock = SystemClock> {
    config: CircuitBreakerConfig,
    inner: Arc<Mutex<BreakerState>>,
    listeners: Arc<Mutex<Vec<TransitionListener>>>,
    clock: Arc<C>,
}

impl<C: Clock> fmt::Debug for CircuitBreaker<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("CircuitBreaker")
            .field("config", &self.config)
            .field("state", &inner.state)
            .field("consecutive_failures", &inner.consecutive_failures)
            .finish()
    }
}

impl<C: Clock> Clone for CircuitBreaker<C> {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            inner: Arc::clone(&self.inner),
            listeners: Arc::clone(&self.listeners),
            clock: Arc::clone(&self.clock),
        }
    }
}

impl CircuitBreaker<SystemClock> {
    pub fn new(config: CircuitBreakerConfig) -> ResilienceResult<Self> {
        Self::with_clock(config, SystemClock)
    }
}

impl<C: Clock> CircuitBreaker<C> {
    /// Create a circuit breaker with a custom clock (useful for testing)
    pub fn with_clock(config: CircuitBreakerConfig, clock: C) -> ResilienceResult<Self> {
        config.validate()?;
        let now = clock.now();
        Ok(Self {
            config,
            inner: Arc::new(Mutex::new(BreakerState::new(now))),
            listeners: Arc::new(Mutex::new(Vec::new())),
            clock: Arc::new(clock),
        })
    }

    /// Independent closed breaker with the same config and clock.
    ///
    /// Shares neither state nor listeners with `self`.
    pub fn fresh(&self) -> Self {
        let now = self.clock.now();
        Self {
            config: self.config.clone(),
            inner: Arc::new(Mutex::new(BreakerState::new(now))),
            listeners: Arc::new(Mutex::new(Vec::new())),
            clock: Arc::clone(&self.clock),
        }
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Register a callback invoked on every state change.
    pub fn on_transition(&self, listener: TransitionListener) {
        self.listeners.lock().push(listener);
    }

    /// Admission check.
    ///
    /// Moves `open -> half-open` when `next_attempt` has passed. While
    /// half-open at most `half_open_max_calls` probes are in flight.
    ///
    /// # Errors
    /// Returns `ResilienceError::CircuitOpen` with the state and the time
    /// left before another attempt makes sense.
    pub fn check(&self) -> ResilienceResult<()> {
        let now = self.clock.now();
        let mut transition = None;
        let result = {
            let mut inner = self.inner.lock();
            if inner.state == CircuitState::Open {
                match inner.next_attempt {
                    Some(at) if now < at => {
                        inner.rejected_calls += 1;
                        return Err(ResilienceError::CircuitOpen {
                            state: CircuitState::Open,
                            retry_after: at - now,
                        });
                    }
                    _ => {
                        transition = Some(inner.move_to(
                            CircuitState::HalfOpen,
                            now,
                            self.config.reset_timeout,
                        ));
                    }
                }
            }

            match inner.state {
                CircuitState::HalfOpen if inner.half_open_in_flight >= self.config.half_open_max_calls => {
                    inner.rejected_calls += 1;
                    Err(ResilienceError::CircuitOpen {
                        state: CircuitState::HalfOpen,
                        retry_after: self.config.reset_timeout,
                    })
                }
                CircuitState::HalfOpen => {
                    inner.half_open_in_flight += 1;
                    inner.total_calls += 1;
                    Ok(())
                }
                _ => {
                    inner.total_calls += 1;
                    Ok(())
                }
            }
        };

        if let Some(t) = transition {
            info!(from = %t.from, to = %t.to, "Circuit breaker probing after reset timeout");
            self.notify(&t);
        }
        if let Err(ResilienceError::CircuitOpen { state, .. }) = &result {
            debug!(state = %state, "Circuit breaker rejecting call");
        }
        result
    }

    /// Record a successful call.
    pub fn record_success(&self) {
        let now = self.clock.now();
        let transition = {
            let mut inner = self.inner.lock();
            match inner.state {
                CircuitState::Closed => {
                    inner.consecutive_failures = 0;
                    None
                }
                CircuitState::HalfOpen => {
                    inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
                    inner.half_open_successes += 1;
                    if inner.half_open_successes >= self.config.success_threshold {
                        Some(inner.move_to(CircuitState::Closed, now, self.config.reset_timeout))
                    } else {
                        None
                    }
                }
                CircuitState::Open => None,
            }
        };

        if let Some(t) = transition {
            info!(successes = self.config.success_threshold, "Circuit breaker closed");
            self.notify(&t);
        }
    }

    /// Record a failed call.
    pub fn record_failure(&self) {
        let now = self.clock.now();
        let transition = {
            let mut inner = self.inner.lock();
            inner.total_failures += 1;
            inner.last_failure_time = Some(now);
            match inner.state {
                CircuitState::Closed => {
                    inner.consecutive_failures += 1;
                    if inner.consecutive_failures >= self.config.failure_threshold {
                        Some(inner.move_to(CircuitState::Open, now, self.config.reset_timeout))
                    } else {
                        None
                    }
                }
                CircuitState::HalfOpen => {
                    inner.consecutive_failures += 1;
                    Some(inner.move_to(CircuitState::Open, now, self.config.reset_timeout))
                }
                // Late result from a call admitted before the circuit opened
                CircuitState::Open => None,
            }
        };

        if let Some(t) = transition {
            warn!(
                from = %t.from,
                failures = t.failures,
                reset_timeout_ms = self.config.reset_timeout.as_millis() as u64,
                "Circuit breaker opened"
            );
            self.notify(&t);
        }
    }

    /// Release an admitted call that produced no verdict.
    pub fn record_ignored(&self) {
        let mut inner = self.inner.lock();
        if inner.state == CircuitState::HalfOpen {
            inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
        }
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    pub fn metrics(&self) -> CircuitBreakerMetrics {
        let inner = self.inner.lock();
        CircuitBreakerMetrics {
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            half_open_successes: inner.half_open_successes,
            half_open_in_flight: inner.half_open_in_flight,
            total_calls: inner.total_calls,
            total_failures: inner.total_failures,
            rejected_calls: inner.rejected_calls,
            last_failure_time: inner.last_failure_time,
            next_attempt: inner.next_attempt,
            state_change_time: inner.state_change_time,
        }
    }

    /// Force the circuit closed and clear counters.
    pub fn reset(&self) {
        let now = self.clock.now();
        let transition = {
            let mut inner = self.inner.lock();
            let previous = inner.state;
            *inner = BreakerState::new(now);
            (previous != CircuitState::Closed).then(|| StateTransition {
                from: previous,
                to: CircuitState::Closed,
                failures: 0,
                retry_after: Duration::ZERO,
            })
        };
        info!("Circuit breaker manually reset to closed state");
        if let Some(t) = transition {
            self.notify(&t);
        }
    }

    fn notify(&self, transition: &StateTransition) {
        let listeners = self.listeners.lock().clone();
        for listener in listeners {
            listener(transition);
        }
    }
}
