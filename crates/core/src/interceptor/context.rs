//! Per-call context shared by every interceptor of one logical request
//!
//! Created before the request phase and dropped after the response or error
//! phase. Retries reuse the same context, so the trace id stays stable across
//! attempts while `retry_count` advances.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use netguard_domain::NetRequest;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::breaker::service_key;

/// Skip the circuit breaker admission check for this call.
pub const META_SKIP_CIRCUIT_BREAKER: &str = "netguard.skip_circuit_breaker";
/// Per-call override of the retry budget (unsigned integer).
pub const META_MAX_RETRIES: &str = "netguard.max_retries";
/// Set once the token refresh interceptor has refreshed for this call.
pub const META_TOKEN_REFRESHED: &str = "netguard.token_refreshed";
/// Set while a breaker admission is outstanding for this call.
pub const META_BREAKER_ADMITTED: &str = "netguard.breaker_admitted";

#[derive(Debug, Clone)]
pub struct CallContext {
    /// 32 lowercase hex characters.
    pub trace_id: String,
    /// 16 lowercase hex characters.
    pub span_id: String,
    pub parent_span_id: Option<String>,
    pub started_at: Instant,
    /// Free-form values; the only channel between interceptors.
    pub metadata: HashMap<String, Value>,
    pub tags: Vec<String>,
    /// Resubmissions performed so far for this call.
    pub retry_count: u32,
    /// Request as the caller submitted it.
    pub original_request: NetRequest,
    /// Request as it left the request chain.
    pub dispatched_request: Option<NetRequest>,
    pub service_key: String,
    /// Limit for each individual transport attempt.
    pub attempt_timeout: Option<Duration>,
    pub cancel: CancellationToken,
}

impl CallContext {
    pub fn new(request: &NetRequest, started_at: Instant) -> Self {
        Self {
            trace_id: Uuid::new_v4().simple().to_string(),
            span_id: new_span_id(),
            parent_span_id: None,
            started_at,
            metadata: HashMap::new(),
            tags: Vec::new(),
            retry_count: 0,
            original_request: request.clone(),
            dispatched_request: None,
            service_key: service_key(&request.url),
            attempt_timeout: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Continue an existing trace as a child span.
    #[must_use]
    pub fn with_parent(mut self, trace_id: impl Into<String>, parent_span_id: impl Into<String>) -> Self {
        self.trace_id = trace_id.into();
        self.parent_span_id = Some(parent_span_id.into());
        self
    }

    #[must_use]
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    #[must_use]
    pub fn with_attempt_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.attempt_timeout = timeout;
        self
    }

    pub fn set_flag(&mut self, key: &str, value: bool) {
        self.metadata.insert(key.to_string(), Value::Bool(value));
    }

    pub fn flag(&self, key: &str) -> bool {
        self.metadata.get(key).and_then(Value::as_bool).unwrap_or(false)
    }

    /// Clear a flag, returning whether it was set.
    pub fn take_flag(&mut self, key: &str) -> bool {
        self.metadata.remove(key).and_then(|v| v.as_bool()).unwrap_or(false)
    }

    pub fn metadata_u32(&self, key: &str) -> Option<u32> {
        self.metadata.get(key).and_then(Value::as_u64).and_then(|v| u32::try_from(v).ok())
    }

    pub fn tag(&mut self, tag: impl Into<String>) {
        self.tags.push(tag.into());
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

fn new_span_id() -> String {
    let mut id = Uuid::new_v4().simple().to_string();
    id.truncate(16);
    id
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_have_w3c_lengths() {
        let ctx = CallContext::new(&NetRequest::get("https://api.example.com/x"), Instant::now());
        assert_eq!(ctx.trace_id.len(), 32);
        assert_eq!(ctx.span_id.len(), 16);
        assert!(ctx.trace_id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(ctx.service_key, "api.example.com");
        assert_eq!(ctx.retry_count, 0);
    }

    #[test]
    fn each_call_gets_its_own_trace() {
        let req = NetRequest::get("https://api.example.com/x");
        let a = CallContext::new(&req, Instant::now());
        let b = CallContext::new(&req, Instant::now());
        assert_ne!(a.trace_id, b.trace_id);
    }

    #[test]
    fn flags_and_overrides() {
        let mut ctx = CallContext::new(&NetRequest::get("http://h/"), Instant::now());
        assert!(!ctx.flag(META_SKIP_CIRCUIT_BREAKER));
        ctx.set_flag(META_BREAKER_ADMITTED, true);
        assert!(ctx.take_flag(META_BREAKER_ADMITTED));
        assert!(!ctx.take_flag(META_BREAKER_ADMITTED));

        ctx.metadata.insert(META_MAX_RETRIES.into(), Value::from(2));
        assert_eq!(ctx.metadata_u32(META_MAX_RETRIES), Some(2));
    }

    #[test]
    fn parent_span_is_carried() {
        let ctx = CallContext::new(&NetRequest::get("http://h/"), Instant::now())
            .with_parent("abc", "def");
        assert_eq!(ctx.trace_id, "abc");
        assert_eq!(ctx.parent_span_id.as_deref(), Some("def"));
    }
}
