//! Queue priorities and durable queue records

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::constants::MAX_STORED_ERROR_LEN;
use crate::errors::{NetguardError, Result};
use crate::impl_wire_conversions;
use crate::serde_utils::base64_bytes_opt;
use crate::types::http::{HttpMethod, NetRequest};

/// Scheduling tier. Higher tiers are always served first.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low = 0,
    #[default]
    Normal = 1,
    High = 2,
    Critical = 3,
}

impl_wire_conversions!(Priority {
    Low => "low",
    Normal => "normal",
    High => "high",
    Critical => "critical",
});

impl Priority {
    /// All tiers, highest first.
    pub const ALL: [Self; 4] = [Self::Critical, Self::High, Self::Normal, Self::Low];

    /// Slot index for per-tier arrays (0 = critical).
    pub const fn tier_index(self) -> usize {
        3 - self as usize
    }

    pub const fn as_i64(self) -> i64 {
        self as i64
    }

    /// Out-of-range values clamp to the nearest tier.
    pub const fn from_i64(value: i64) -> Self {
        match value {
            i64::MIN..=0 => Self::Low,
            1 => Self::Normal,
            2 => Self::High,
            _ => Self::Critical,
        }
    }
}

/// Durable queue entry status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryStatus {
    #[default]
    Pending,
    Processing,
    Completed,
    Failed,
    Expired,
}

impl_wire_conversions!(EntryStatus {
    Pending => "pending",
    Processing => "processing",
    Completed => "completed",
    Failed => "failed",
    Expired => "expired",
});

impl EntryStatus {
    /// Automatic transitions. `Processing -> Pending` covers both a scheduled
    /// retry and recovery of an interrupted pass.
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Processing | Self::Expired)
                | (Self::Processing, Self::Completed | Self::Pending | Self::Failed | Self::Expired)
        )
    }

    /// Terminal for automatic processing.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Expired)
    }
}

/// A request persisted for replay once connectivity returns.
///
/// Timestamps are Unix epoch milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DurableEntry {
    pub id: String,
    pub url: String,
    pub method: HttpMethod,
    pub headers: BTreeMap<String, String>,
    #[serde(default, with = "base64_bytes_opt")]
    pub body: Option<Vec<u8>>,
    pub created_at: i64,
    pub updated_at: i64,
    pub expires_at: i64,
    pub next_attempt_at: i64,
    pub priority: Priority,
    pub retry_count: u32,
    pub max_retries: u32,
    pub status: EntryStatus,
    pub last_error: Option<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl DurableEntry {
    /// New pending entry with a random v4 id, ready immediately.
    pub fn new(
        request: &NetRequest,
        priority: Priority,
        ttl_ms: u64,
        max_retries: u32,
        now_ms: i64,
    ) -> Self {
        let ttl = i64::try_from(ttl_ms).unwrap_or(i64::MAX);
        Self {
            id: Uuid::new_v4().to_string(),
            url: request.url.clone(),
            method: request.method,
            headers: request.headers.clone(),
            body: request.body.clone(),
            created_at: now_ms,
            updated_at: now_ms,
            expires_at: now_ms.saturating_add(ttl),
            next_attempt_at: now_ms,
            priority,
            retry_count: 0,
            max_retries,
            status: EntryStatus::Pending,
            last_error: None,
            metadata: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_metadata(mut self, metadata: BTreeMap<String, String>) -> Self {
        self.metadata = metadata;
        self
    }

    /// Rebuild the request exactly as it was persisted.
    pub fn to_request(&self) -> NetRequest {
        NetRequest {
            url: self.url.clone(),
            method: self.method,
            headers: self.headers.clone(),
            body: self.body.clone(),
        }
    }

    pub fn is_expired(&self, now_ms: i64) -> bool {
        now_ms >= self.expires_at
    }

    pub fn is_ready(&self, now_ms: i64) -> bool {
        self.status == EntryStatus::Pending
            && self.next_attempt_at <= now_ms
            && !self.is_expired(now_ms)
    }

    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }

    /// Move along an automatic transition edge.
    pub fn transition(&mut self, next: EntryStatus, now_ms: i64) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(NetguardError::InvalidInput(format!(
                "entry {} cannot move from {} to {}",
                self.id, self.status, next
            )));
        }
        self.status = next;
        self.updated_at = now_ms;
        Ok(())
    }

    /// Back to pending with one more attempt consumed.
    pub fn schedule_retry(&mut self, error: &str, next_attempt_at: i64, now_ms: i64) -> Result<()> {
        self.transition(EntryStatus::Pending, now_ms)?;
        self.retry_count += 1;
        self.next_attempt_at = next_attempt_at;
        self.last_error = Some(truncate_error(error));
        Ok(())
    }

    pub fn mark_failed(&mut self, error: &str, now_ms: i64) -> Result<()> {
        self.transition(EntryStatus::Failed, now_ms)?;
        self.last_error = Some(truncate_error(error));
        Ok(())
    }

    /// Manual re-arm of a failed entry: pending, fresh retry budget.
    pub fn rearm(&mut self, now_ms: i64) -> Result<()> {
        if self.status != EntryStatus::Failed {
            return Err(NetguardError::InvalidInput(format!(
                "entry {} is {}, only failed entries can be retried",
                self.id, self.status
            )));
        }
        self.status = EntryStatus::Pending;
        self.retry_count = 0;
        self.next_attempt_at = now_ms;
        self.updated_at = now_ms;
        Ok(())
    }
}

fn truncate_error(error: &str) -> String {
    if error.len() <= MAX_STORED_ERROR_LEN {
        return error.to_string();
    }
    let mut end = MAX_STORED_ERROR_LEN;
    while !error.is_char_boundary(end) {
        end -= 1;
    }
    error[..end].to_string()
}
