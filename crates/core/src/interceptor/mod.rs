//! Interceptor pipeline
//!
//! - [`context`]: per-call state shared by all interceptors of one call
//! - [`chain`]: the three ordered interceptor lists and their execution
//! - [`builtin`]: tracing, circuit breaker, retry and token refresh

pub mod builtin;
pub mod chain;
pub mod context;

pub use chain::{
    ErrorDisposition, ErrorHandler, ErrorInterceptor, ErrorOutcome, FailureCallback, Interceptor,
    InterceptorChain, InterceptorHandle, Phase, RequestHandler, RequestInterceptor, ResponseHandler,
    ResponseInterceptor,
};
pub use context::CallContext;
