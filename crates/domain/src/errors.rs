//! Error types used throughout the workspace
//!
//! Two families live here:
//! - [`NetError`] travels along the call path (interceptors, queue, retry,
//!   breaker) and is what callers of the resilient client ultimately see.
//! - [`NetguardError`] covers infrastructure concerns (storage, configuration)
//!   that never reach the transport.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::impl_wire_conversions;
use crate::types::{CircuitState, NetRequest};

/// Category of a call-path failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Network-level failure, no HTTP status (status 0).
    Transport,
    /// 5xx response.
    Server,
    /// 4xx response other than 429.
    Client,
    /// 429 response from the server.
    RateLimited,
    /// Local rate limiter refused the call.
    Throttled,
    /// Circuit breaker rejected the call.
    CircuitOpen,
    /// Attempt exceeded its timeout.
    Timeout,
    /// Request queue reached its maximum depth.
    QueueFull,
    /// Caller cancelled, or the queue was cleared.
    Cancelled,
    /// Request was persisted to the durable queue instead of being sent.
    QueuedOffline,
    /// A request or response interceptor failed.
    Interceptor,
}

impl_wire_conversions!(ErrorKind {
    Transport => "transport",
    Server => "server",
    Client => "client",
    RateLimited => "rate_limited",
    Throttled => "throttled",
    CircuitOpen => "circuit_open",
    Timeout => "timeout",
    QueueFull => "queue_full",
    Cancelled => "cancelled",
    QueuedOffline => "queued_offline",
    Interceptor => "interceptor",
});

/// Call-path error.
///
/// Carries everything an interceptor or caller needs to decide what to do
/// next: the HTTP status (0 when no response was received), a retry hint,
/// the breaker state for rejections, and the request that produced it.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{kind} error (status {status}): {message}")]
pub struct NetError {
    pub kind: ErrorKind,
    pub status: u16,
    pub message: String,
    pub retry_after: Option<Duration>,
    pub circuit_state: Option<CircuitState>,
    pub trace_id: Option<String>,
    pub entry_id: Option<String>,
    pub headers: BTreeMap<String, String>,
    pub request: Option<Box<NetRequest>>,
}

impl NetError {
    /// Base constructor; prefer the kind-specific helpers below.
    pub fn new(kind: ErrorKind, status: u16, message: impl Into<String>) -> Self {
        Self {
            kind,
            status,
            message: message.into(),
            retry_after: None,
            circuit_state: None,
            trace_id: None,
            entry_id: None,
            headers: BTreeMap::new(),
            request: None,
        }
    }

    /// Classify an HTTP status into the error taxonomy.
    ///
    /// `0` maps to [`ErrorKind::Transport`], `429` to
    /// [`ErrorKind::RateLimited`], `5xx` to [`ErrorKind::Server`], anything
    /// else to [`ErrorKind::Client`].
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let kind = match status {
            0 => ErrorKind::Transport,
            429 => ErrorKind::RateLimited,
            500..=599 => ErrorKind::Server,
            _ => ErrorKind::Client,
        };
        Self::new(kind, status, message)
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transport, 0, message)
    }

    pub fn timeout(after: Duration) -> Self {
        Self::new(ErrorKind::Timeout, 0, format!("timed out after {}ms", after.as_millis()))
    }

    pub fn circuit_open(service: &str, state: CircuitState, retry_after: Duration) -> Self {
        Self::new(ErrorKind::CircuitOpen, 0, format!("circuit for {service} is {state}"))
            .with_circuit_state(state)
            .with_retry_after(retry_after)
    }

    pub fn throttled(retry_after: Duration) -> Self {
        Self::new(ErrorKind::Throttled, 0, "rate limit exceeded").with_retry_after(retry_after)
    }

    pub fn queue_full(max_depth: usize) -> Self {
        Self::new(ErrorKind::QueueFull, 0, format!("request queue is full ({max_depth} items)"))
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Cancelled, 0, message)
    }

    pub fn queued_offline(entry_id: impl Into<String>) -> Self {
        let entry_id = entry_id.into();
        Self::new(ErrorKind::QueuedOffline, 0, format!("offline, request queued as {entry_id}"))
            .with_entry_id(entry_id)
    }

    pub fn interceptor(name: &str, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Interceptor, 0, format!("interceptor '{name}' failed: {}", message.into()))
    }

    #[must_use]
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    #[must_use]
    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = Some(retry_after);
        self
    }

    #[must_use]
    pub fn with_circuit_state(mut self, state: CircuitState) -> Self {
        self.circuit_state = Some(state);
        self
    }

    #[must_use]
    pub fn with_trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = Some(trace_id.into());
        self
    }

    #[must_use]
    pub fn with_entry_id(mut self, entry_id: impl Into<String>) -> Self {
        self.entry_id = Some(entry_id.into());
        self
    }

    #[must_use]
    pub fn with_headers(mut self, headers: BTreeMap<String, String>) -> Self {
        self.headers = headers;
        self
    }

    #[must_use]
    pub fn with_request(mut self, request: NetRequest) -> Self {
        self.request = Some(Box::new(request));
        self
    }

    /// Response header lookup (keys are stored lowercased).
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    /// Transport, server, timeout and 429 failures may succeed on a later
    /// attempt. Local rejections never do.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind,
            ErrorKind::Transport | ErrorKind::Server | ErrorKind::Timeout | ErrorKind::RateLimited
        )
    }

    pub fn is_client_error(&self) -> bool {
        self.kind == ErrorKind::Client
    }

    pub fn is_server_error(&self) -> bool {
        self.kind == ErrorKind::Server
    }

    /// True for errors raised locally without reaching the transport.
    pub fn is_local_rejection(&self) -> bool {
        matches!(
            self.kind,
            ErrorKind::CircuitOpen
                | ErrorKind::QueueFull
                | ErrorKind::Throttled
                | ErrorKind::Cancelled
                | ErrorKind::QueuedOffline
        )
    }
}

/// Infrastructure error type (storage, configuration, wiring).
#[derive(Error, Debug, Serialize, Deserialize)]
#[serde(tag = "type", content = "message")]
pub enum NetguardError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Capacity exceeded: {0}")]
    CapacityExceeded(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for NetguardError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Result type alias for netguard infrastructure operations
pub type Result<T> = std::result::Result<T, NetguardError>;
