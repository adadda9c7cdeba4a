//! Domain constants
//!
//! Header names, defaults and limits shared across the workspace.

// Tracing headers
pub const HEADER_TRACEPARENT: &str = "traceparent";
pub const HEADER_TRACE_ID: &str = "x-trace-id";
pub const HEADER_SPAN_ID: &str = "x-span-id";
pub const HEADER_PARENT_SPAN_ID: &str = "x-parent-span-id";
pub const HEADER_REQUEST_ID: &str = "x-request-id";

// Server hints
pub const HEADER_RETRY_AFTER: &str = "retry-after";
pub const HEADER_AUTHORIZATION: &str = "authorization";

// Circuit breaker defaults
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 5;
pub const DEFAULT_SUCCESS_THRESHOLD: u32 = 3;
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 30_000;

// Retry defaults
pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_RETRY_BASE_DELAY_MS: u64 = 1_000;
pub const DEFAULT_RETRY_MAX_DELAY_MS: u64 = 30_000;
pub const DEFAULT_BACKOFF_FACTOR: f64 = 2.0;
pub const DEFAULT_RETRYABLE_STATUSES: [u16; 6] = [408, 429, 500, 502, 503, 504];

// Jitter spread applied around the computed delay (±25%)
pub const JITTER_RATIO: f64 = 0.25;

// Durable queue defaults
pub const DEFAULT_OFFLINE_TTL_MS: u64 = 24 * 60 * 60 * 1_000;
pub const DEFAULT_OFFLINE_MAX_SIZE: usize = 1_000;
pub const DEFAULT_OFFLINE_BATCH_SIZE: usize = 25;
pub const DEFAULT_OFFLINE_MAX_RETRIES: u32 = 5;

// Stored error messages are truncated to keep rows small
pub const MAX_STORED_ERROR_LEN: usize = 512;
