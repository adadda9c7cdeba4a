//! Configuration management
//!
//! Every field has a documented default so partial files (or no file at all)
//! produce a usable configuration. Durations are stored as milliseconds to
//! keep the TOML/JSON surface flat; each section exposes `Duration` accessors.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constants::{
    DEFAULT_BACKOFF_FACTOR, DEFAULT_FAILURE_THRESHOLD, DEFAULT_MAX_RETRIES,
    DEFAULT_OFFLINE_BATCH_SIZE, DEFAULT_OFFLINE_MAX_RETRIES, DEFAULT_OFFLINE_MAX_SIZE,
    DEFAULT_OFFLINE_TTL_MS, DEFAULT_REQUEST_TIMEOUT_MS, DEFAULT_RETRYABLE_STATUSES,
    DEFAULT_RETRY_BASE_DELAY_MS, DEFAULT_RETRY_MAX_DELAY_MS, DEFAULT_SUCCESS_THRESHOLD,
};
use crate::errors::{NetguardError, Result};
use crate::types::Priority;

/// Application configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub circuit_breaker: CircuitBreakerSettings,
    pub retry: RetrySettings,
    pub rate_limit: RateLimitSettings,
    pub queue: QueueSettings,
    pub offline: OfflineQueueSettings,
    pub transport: TransportSettings,
    pub database: DatabaseSettings,
    pub logging: LoggingSettings,
}

impl Config {
    /// Reject values no component can work with.
    ///
    /// # Errors
    /// Returns `NetguardError::Config` naming the first offending field.
    pub fn validate(&self) -> Result<()> {
        self.circuit_breaker.validate()?;
        self.retry.validate()?;
        self.rate_limit.validate()?;
        self.queue.validate()?;
        self.offline.validate()?;
        if self.database.pool_size == 0 {
            return Err(invalid("database.pool_size must be at least 1"));
        }
        Ok(())
    }
}

fn invalid(msg: &str) -> NetguardError {
    NetguardError::Config(msg.to_string())
}

/// Circuit breaker configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerSettings {
    /// Consecutive failures that open the circuit.
    pub failure_threshold: u32,
    /// Consecutive half-open successes that close it again.
    pub success_threshold: u32,
    /// How long the circuit stays open before a probe is allowed.
    pub reset_timeout_ms: u64,
    /// Non-5xx statuses counted as failures.
    pub failure_statuses: Vec<u16>,
    /// Count every 5xx as a failure.
    pub treat_5xx_as_failure: bool,
    /// Probe calls admitted concurrently while half-open.
    pub half_open_max_calls: u32,
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            success_threshold: DEFAULT_SUCCESS_THRESHOLD,
            reset_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            failure_statuses: vec![429],
            treat_5xx_as_failure: true,
            half_open_max_calls: 1,
        }
    }
}

impl CircuitBreakerSettings {
    pub fn reset_timeout(&self) -> Duration {
        Duration::from_millis(self.reset_timeout_ms)
    }

    /// Status 0 (no response) always counts.
    pub fn is_failure_status(&self, status: u16) -> bool {
        status == 0
            || (self.treat_5xx_as_failure && (500..600).contains(&status))
            || self.failure_statuses.contains(&status)
    }

    fn validate(&self) -> Result<()> {
        if self.failure_threshold == 0 {
            return Err(invalid("circuit_breaker.failure_threshold must be at least 1"));
        }
        if self.success_threshold == 0 {
            return Err(invalid("circuit_breaker.success_threshold must be at least 1"));
        }
        if self.half_open_max_calls == 0 {
            return Err(invalid("circuit_breaker.half_open_max_calls must be at least 1"));
        }
        Ok(())
    }
}

/// Retry configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_factor: f64,
    pub jitter: bool,
    pub retryable_statuses: Vec<u16>,
    /// Let a parseable `Retry-After` header override the computed delay.
    pub respect_retry_after: bool,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            base_delay_ms: DEFAULT_RETRY_BASE_DELAY_MS,
            max_delay_ms: DEFAULT_RETRY_MAX_DELAY_MS,
            backoff_factor: DEFAULT_BACKOFF_FACTOR,
            jitter: true,
            retryable_statuses: DEFAULT_RETRYABLE_STATUSES.to_vec(),
            respect_retry_after: true,
        }
    }
}

impl RetrySettings {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    fn validate(&self) -> Result<()> {
        if !self.backoff_factor.is_finite() || self.backoff_factor < 1.0 {
            return Err(invalid("retry.backoff_factor must be a finite value >= 1.0"));
        }
        if self.max_delay_ms < self.base_delay_ms {
            return Err(invalid("retry.max_delay_ms must be >= retry.base_delay_ms"));
        }
        Ok(())
    }
}

/// What the rate limiter does when the window is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RateLimitStrategy {
    /// Fail fast with a throttle error.
    Reject,
    /// Wait in a bounded FIFO for a freed slot.
    #[default]
    Queue,
    /// Sleep until a slot frees, then try again.
    Delay,
}

/// Rate limiter configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitSettings {
    pub enabled: bool,
    pub max_requests: u32,
    pub window_ms: u64,
    pub strategy: RateLimitStrategy,
    /// Waiters allowed under the `queue` strategy.
    pub max_queue: usize,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            max_requests: 50,
            window_ms: 1_000,
            strategy: RateLimitStrategy::Queue,
            max_queue: 100,
        }
    }
}

impl RateLimitSettings {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    fn validate(&self) -> Result<()> {
        if self.max_requests == 0 {
            return Err(invalid("rate_limit.max_requests must be at least 1"));
        }
        if self.window_ms == 0 {
            return Err(invalid("rate_limit.window_ms must be greater than 0"));
        }
        Ok(())
    }
}

/// Request queue configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueSettings {
    pub concurrency: usize,
    pub max_depth: usize,
    pub default_priority: Priority,
    pub default_timeout_ms: u64,
    /// Attempts beyond the first for retryable failures of a queued item.
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            concurrency: 6,
            max_depth: 1_000,
            default_priority: Priority::Normal,
            default_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            max_retries: 0,
            retry_base_delay_ms: 500,
        }
    }
}

impl QueueSettings {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    fn validate(&self) -> Result<()> {
        if self.concurrency == 0 {
            return Err(invalid("queue.concurrency must be at least 1"));
        }
        if self.max_depth == 0 {
            return Err(invalid("queue.max_depth must be at least 1"));
        }
        Ok(())
    }
}

/// Durable offline queue configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OfflineQueueSettings {
    pub enabled: bool,
    pub default_ttl_ms: u64,
    pub max_size: usize,
    pub batch_size: usize,
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
}

impl Default for OfflineQueueSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            default_ttl_ms: DEFAULT_OFFLINE_TTL_MS,
            max_size: DEFAULT_OFFLINE_MAX_SIZE,
            batch_size: DEFAULT_OFFLINE_BATCH_SIZE,
            max_retries: DEFAULT_OFFLINE_MAX_RETRIES,
            retry_base_delay_ms: 5_000,
            retry_max_delay_ms: 300_000,
        }
    }
}

impl OfflineQueueSettings {
    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    pub fn retry_max_delay(&self) -> Duration {
        Duration::from_millis(self.retry_max_delay_ms)
    }

    fn validate(&self) -> Result<()> {
        if self.max_size == 0 {
            return Err(invalid("offline.max_size must be at least 1"));
        }
        if self.batch_size == 0 {
            return Err(invalid("offline.batch_size must be at least 1"));
        }
        if self.default_ttl_ms == 0 {
            return Err(invalid("offline.default_ttl_ms must be greater than 0"));
        }
        Ok(())
    }
}

/// HTTP transport configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportSettings {
    pub timeout_ms: u64,
    pub user_agent: String,
    /// Calls slower than this emit a slow-call notification.
    pub slow_call_threshold_ms: u64,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            user_agent: concat!("netguard/", env!("CARGO_PKG_VERSION")).to_string(),
            slow_call_threshold_ms: 3_000,
        }
    }
}

impl TransportSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn slow_call_threshold(&self) -> Duration {
        Duration::from_millis(self.slow_call_threshold_ms)
    }
}

/// Durable store configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseSettings {
    pub path: String,
    pub pool_size: u32,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self { path: "netguard.db".to_string(), pool_size: 4 }
    }
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Default `EnvFilter` directive; `RUST_LOG` takes precedence.
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self { level: "info".to_string(), format: LogFormat::Pretty }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Validates `Config::default` behavior for the documented defaults
    /// scenario.
    ///
    /// Assertions:
    /// - Confirms breaker, retry and queue defaults match the constants.
    /// - Confirms the default configuration validates.
    #[test]
    fn defaults_are_documented_values() {
        let config = Config::default();
        assert_eq!(config.circuit_breaker.failure_threshold, 5);
        assert_eq!(config.circuit_breaker.success_threshold, 3);
        assert_eq!(config.circuit_breaker.reset_timeout(), Duration::from_secs(30));
        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.retry.retryable_statuses, vec![408, 429, 500, 502, 503, 504]);
        assert_eq!(config.rate_limit.strategy, RateLimitStrategy::Queue);
        assert_eq!(config.queue.default_priority, Priority::Normal);
        assert_eq!(config.offline.max_size, 1_000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn breaker_failure_classification() {
        let settings = CircuitBreakerSettings::default();
        assert!(settings.is_failure_status(0));
        assert!(settings.is_failure_status(429));
        assert!(settings.is_failure_status(503));
        assert!(!settings.is_failure_status(404));

        let strict = CircuitBreakerSettings { treat_5xx_as_failure: false, ..settings };
        assert!(!strict.is_failure_status(500));
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let config: Config = toml::from_str(
            r#"
            [retry]
            max_retries = 7

            [rate_limit]
            strategy = "reject"
            "#,
        )
        .unwrap();
        assert_eq!(config.retry.max_retries, 7);
        assert_eq!(config.retry.base_delay_ms, 1_000);
        assert_eq!(config.rate_limit.strategy, RateLimitStrategy::Reject);
        assert_eq!(config.queue.concurrency, 6);
    }

    #[test]
    fn partial_json_fills_defaults() {
        let config: Config =
            serde_json::from_str(r#"{"queue": {"default_priority": "high"}}"#).unwrap();
        assert_eq!(config.queue.default_priority, Priority::High);
        assert_eq!(config.logging.format, LogFormat::Pretty);
    }

    #[test]
    fn validate_rejects_nonsense() {
        let mut config = Config::default();
        config.retry.backoff_factor = 0.5;
        assert!(matches!(config.validate(), Err(NetguardError::Config(_))));

        let mut config = Config::default();
        config.rate_limit.window_ms = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.queue.concurrency = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.retry.max_delay_ms = 10;
        assert!(config.validate().is_err());
    }
}
