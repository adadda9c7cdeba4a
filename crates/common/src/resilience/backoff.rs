//! Exponential backoff with jitter
//!
//! `delay(n) = min(base * factor^n, max)`, optionally spread uniformly over
//! `[0.75, 1.25] * delay(n)`. A server `Retry-After` hint (delta seconds or an
//! HTTP date) can override the computed value.

use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use netguard_domain::constants::JITTER_RATIO;
use netguard_domain::RetrySettings;
use rand::Rng;

use super::{ResilienceError, ResilienceResult};

/// Capped exponential backoff.
#[derive(Debug, Clone, PartialEq)]
pub struct ExponentialBackoff {
    base: Duration,
    max: Duration,
    factor: f64,
    jitter: bool,
}

impl ExponentialBackoff {
    /// # Errors
    /// Returns `ResilienceError::InvalidConfiguration` when `factor < 1.0`
    /// or `max < base`.
    pub fn new(base: Duration, max: Duration, factor: f64) -> ResilienceResult<Self> {
        if !factor.is_finite() || factor < 1.0 {
            return Err(ResilienceError::invalid("backoff factor must be a finite value >= 1.0"));
        }
        if max < base {
            return Err(ResilienceError::invalid("max delay must be >= base delay"));
        }
        Ok(Self { base, max, factor, jitter: true })
    }

    pub fn from_settings(settings: &RetrySettings) -> ResilienceResult<Self> {
        Ok(Self::new(settings.base_delay(), settings.max_delay(), settings.backoff_factor)?
            .with_jitter(settings.jitter))
    }

    #[must_use]
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn jitter_enabled(&self) -> bool {
        self.jitter
    }

    /// Deterministic delay for zero-based `attempt`, before jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exp = i32::try_from(attempt).unwrap_or(i32::MAX);
        let nanos = self.base.as_nanos() as f64 * self.factor.powi(exp);
        let max_nanos = self.max.as_nanos() as f64;
        if !nanos.is_finite() || nanos >= max_nanos {
            return self.max;
        }
        Duration::from_nanos(nanos.round() as u64)
    }

    /// Delay for `attempt`, jittered when enabled.
    pub fn delay(&self, attempt: u32) -> Duration {
        let delay = self.base_delay(attempt);
        if self.jitter {
            apply_jitter(delay, JITTER_RATIO)
        } else {
            delay
        }
    }
}

/// Spread `delay` uniformly over `[1 - ratio, 1 + ratio] * delay`.
pub fn apply_jitter(delay: Duration, ratio: f64) -> Duration {
    if delay.is_zero() || ratio <= 0.0 {
        return delay;
    }
    let ratio = ratio.min(1.0);
    let scale = rand::thread_rng().gen_range((1.0 - ratio)..=(1.0 + ratio));
    Duration::from_nanos((delay.as_nanos() as f64 * scale).round() as u64)
}

/// Parse a `Retry-After` value as delta seconds or an HTTP date.
///
/// Dates in the past yield `Duration::ZERO`; unparseable values yield `None`.
pub fn parse_retry_after(value: &str, now: SystemTime) -> Option<Duration> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    if let Ok(seconds) = value.parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }
    if let Ok(seconds) = value.parse::<f64>() {
        if seconds.is_finite() && seconds >= 0.0 {
            return Some(Duration::from_secs_f64(seconds));
        }
        return None;
    }
    let at = DateTime::parse_from_rfc2822(value).ok()?.with_timezone(&Utc);
    let now: DateTime<Utc> = now.into();
    Some((at - now).to_std().unwrap_or(Duration::ZERO))
}
