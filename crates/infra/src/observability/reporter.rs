//! Error reporter that writes terminal offline failures to the log

use netguard_core::ErrorReporter;
use netguard_domain::{DurableEntry, NetError};
use serde_json::Value;
use tracing::error;

/// Logs each terminal failure at `error` level, with the full entry as JSON
/// so the request can be replayed by hand.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingErrorReporter;

impl TracingErrorReporter {
    pub fn new() -> Self {
        Self
    }
}

impl ErrorReporter for TracingErrorReporter {
    fn report(&self, err: &NetError, entry: &DurableEntry) {
        let trace_id = err
            .trace_id
            .as_deref()
            .or_else(|| entry.metadata.get("trace_id").map(String::as_str))
            .unwrap_or("-");

        error!(
            entry_id = %entry.id,
            method = %entry.method,
            url = %entry.url,
            kind = %err.kind,
            status = err.status,
            retry_count = entry.retry_count,
            trace_id,
            replay = %replay_payload(entry),
            "offline request failed permanently: {}",
            err.message
        );
    }
}

/// JSON form of the entry. The body is base64; a UTF-8 body is repeated as
/// `body_text`. Falls back to a minimal line if serialization fails.
pub fn replay_payload(entry: &DurableEntry) -> String {
    let mut value = match serde_json::to_value(entry) {
        Ok(value) => value,
        Err(_) => return format!("{{\"id\":\"{}\",\"url\":\"{}\"}}", entry.id, entry.url),
    };
    if let (Some(body), Some(fields)) = (entry.body.as_deref(), value.as_object_mut()) {
        if let Ok(text) = std::str::from_utf8(body) {
            fields.insert("body_text".to_string(), Value::String(text.to_string()));
        }
    }
    value.to_string()
}
