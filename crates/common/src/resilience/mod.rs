//! Resilience patterns for fault tolerance
//!
//! - **Circuit Breaker**: per-service state machine that stops calling a
//!   failing dependency and probes it again after a cool-down.
//! - **Backoff**: capped exponential delays with jitter, plus `Retry-After`
//!   parsing.
//! - **Rate Limiter**: sliding-window admission with reject, queue and delay
//!   strategies.
//!
//! All three read time through [`Clock`](crate::time::Clock) so they can be
//! driven deterministically in tests.

use std::time::Duration;

use netguard_domain::{CircuitState, NetError};
use thiserror::Error;

use crate::error::{ErrorClassification, ErrorSeverity};

pub mod backoff;
pub mod circuit_breaker;
pub mod rate_limiter;

pub use backoff::{apply_jitter, parse_retry_after, ExponentialBackoff};
pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerConfigBuilder, CircuitBreakerMetrics,
    StateTransition, TransitionListener,
};
pub use rate_limiter::{RateLimiterConfig, RateLimiterSnapshot, RatePermit, SlidingWindowLimiter};

/// Errors raised by the resilience primitives themselves
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResilienceError {
    /// Circuit breaker is rejecting calls
    #[error("Circuit breaker is {state}, retry after {retry_after:?}")]
    CircuitOpen { state: CircuitState, retry_after: Duration },

    /// Rate limiter window is full
    #[error("Rate limit exceeded, retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },

    /// Too many callers already waiting for a rate limiter slot
    #[error("Rate limiter wait queue is full ({capacity} waiters)")]
    WaitQueueFull { capacity: usize, retry_after: Duration },

    /// The primitive was dropped while a caller was waiting
    #[error("Rate limiter closed while waiting")]
    Closed,

    /// Configuration error
    #[error("Invalid configuration: {message}")]
    InvalidConfiguration { message: String },
}

impl ResilienceError {
    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidConfiguration { message: message.into() }
    }
}

/// Result type for resilience operations
pub type ResilienceResult<T> = Result<T, ResilienceError>;

impl ErrorClassification for ResilienceError {
    fn is_retryable(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. } | Self::RateLimited { .. } | Self::WaitQueueFull { .. })
    }

    fn severity(&self) -> ErrorSeverity {
        match self {
            Self::CircuitOpen { .. } | Self::RateLimited { .. } | Self::WaitQueueFull { .. } => {
                ErrorSeverity::Warning
            }
            Self::Closed => ErrorSeverity::Error,
            Self::InvalidConfiguration { .. } => ErrorSeverity::Critical,
        }
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::CircuitOpen { retry_after, .. }
            | Self::RateLimited { retry_after }
            | Self::WaitQueueFull { retry_after, .. } => Some(*retry_after),
            Self::Closed | Self::InvalidConfiguration { .. } => None,
        }
    }
}

impl From<ResilienceError> for NetError {
    fn from(err: ResilienceError) -> Self {
        match &err {
            ResilienceError::CircuitOpen { state, retry_after } => {
                NetError::circuit_open("service", *state, *retry_after)
            }
            ResilienceError::RateLimited { retry_after }
            | ResilienceError::WaitQueueFull { retry_after, .. } => {
                NetError::throttled(*retry_after).with_message(err.to_string())
            }
            ResilienceError::Closed => NetError::cancelled(err.to_string()),
            ResilienceError::InvalidConfiguration { .. } => {
                NetError::new(netguard_domain::ErrorKind::Interceptor, 0, err.to_string())
            }
        }
    }
}
