//! Builtin interceptors
//!
//! Each one registers itself under a fixed name in every phase it takes part
//! in, using the priorities below.

mod circuit_breaker;
mod retry;
mod token_refresh;
mod trace;

pub use circuit_breaker::CircuitBreakerInterceptor;
pub use retry::{ReplayTarget, RetryInterceptor};
pub use token_refresh::TokenRefreshInterceptor;
pub use trace::TracingInterceptor;

/// Execution priorities (lower runs earlier).
pub mod priority {
    pub const TRACING_REQUEST: i32 = 0;
    pub const TOKEN_REQUEST: i32 = 10;
    pub const BREAKER_REQUEST: i32 = 20;

    pub const BREAKER_RESPONSE: i32 = 0;
    pub const TRACING_RESPONSE: i32 = 10;

    // Breaker records the verdict of the dispatched attempt before anything
    // resubmits; tracing runs last so it sees the final error
    pub const BREAKER_ERROR: i32 = 0;
    pub const TOKEN_ERROR: i32 = 10;
    pub const RETRY_ERROR: i32 = 20;
    pub const TRACING_ERROR: i32 = 100;
}

pub const TRACING: &str = "tracing";
pub const CIRCUIT_BREAKER: &str = "circuit_breaker";
pub const RETRY: &str = "retry";
pub const TOKEN_REFRESH: &str = "token_refresh";
