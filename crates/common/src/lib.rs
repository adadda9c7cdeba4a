//! Resilience primitives shared across netguard crates.
//!
//! # Feature Tiers
//!
//! Enable cargo features to opt into the tiers you need:
//! - `foundation`: clock abstraction, error classification
//! - `runtime`: async primitives (circuit breaker, backoff, rate limiter)
//! - `test-utils`: paused tokio time for downstream test suites
//! - `observability`: tracing (pulled in by `runtime`)

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms)]
#![warn(clippy::all, clippy::perf, clippy::complexity, clippy::suspicious)]

// Foundation tier
// -----------------------------------------------------------------
#[cfg(feature = "foundation")]
pub mod error;
#[cfg(feature = "foundation")]
pub mod time;

// Runtime tier
// --------------------------------------------------------------------
#[cfg(feature = "runtime")]
pub mod resilience;

// Re-export commonly used types and traits for convenience
// ------------------------
#[cfg(feature = "foundation")]
pub use error::{ErrorClassification, ErrorSeverity};
#[cfg(feature = "runtime")]
pub use resilience::{
    parse_retry_after, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerConfigBuilder,
    CircuitBreakerMetrics, ExponentialBackoff, RateLimiterConfig, RateLimiterSnapshot,
    RatePermit, ResilienceError, ResilienceResult, SlidingWindowLimiter, StateTransition,
};
#[cfg(feature = "foundation")]
pub use time::{Clock, MockClock, SharedClock, SystemClock};
