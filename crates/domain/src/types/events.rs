//! Notification payloads
//!
//! Published fire-and-forget on the event bus; nothing in the call path
//! waits for a subscriber.

use serde::{Deserialize, Serialize};

use crate::types::queue::Priority;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum NetEvent {
    CircuitOpened { service: String, failures: u32, retry_after_ms: u64 },
    CircuitHalfOpened { service: String },
    CircuitClosed { service: String },
    RetryAttempted { trace_id: String, url: String, attempt: u32, delay_ms: u64, status: u16 },
    SlowCall { trace_id: String, url: String, elapsed_ms: u64, threshold_ms: u64 },
    EntryEnqueued { id: String, url: String, priority: Priority },
    EntryProcessing { id: String, attempt: u32 },
    EntryCompleted { id: String, status: u16 },
    EntryRetryScheduled { id: String, retry_count: u32, next_attempt_at: i64 },
    EntryFailed { id: String, status: u16, error: String },
    EntryExpired { id: String },
}

impl NetEvent {
    /// Short stable name, used as a log field.
    pub const fn name(&self) -> &'static str {
        match self {
            Self::CircuitOpened { .. } => "circuit_opened",
            Self::CircuitHalfOpened { .. } => "circuit_half_opened",
            Self::CircuitClosed { .. } => "circuit_closed",
            Self::RetryAttempted { .. } => "retry_attempted",
            Self::SlowCall { .. } => "slow_call",
            Self::EntryEnqueued { .. } => "entry_enqueued",
            Self::EntryProcessing { .. } => "entry_processing",
            Self::EntryCompleted { .. } => "entry_completed",
            Self::EntryRetryScheduled { .. } => "entry_retry_scheduled",
            Self::EntryFailed { .. } => "entry_failed",
            Self::EntryExpired { .. } => "entry_expired",
        }
    }
}
