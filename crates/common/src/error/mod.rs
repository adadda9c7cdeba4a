//! Error classification shared by the resilience primitives
//!
//! [`ErrorClassification`] gives callers one way to ask any error whether it
//! is worth retrying, how loudly to log it, and whether the source suggested
//! a delay.

use std::fmt;
use std::time::Duration;

use netguard_domain::{ErrorKind, NetError};

/// Standard interface for classifying errors by their characteristics
pub trait ErrorClassification {
    /// Transient failures that may succeed on another attempt.
    fn is_retryable(&self) -> bool;

    /// Severity used for logging and reporting decisions.
    fn severity(&self) -> ErrorSeverity;

    /// Errors that indicate a broken invariant rather than a bad call.
    fn is_critical(&self) -> bool {
        self.severity() == ErrorSeverity::Critical
    }

    /// Suggested delay before retrying, if the source gave one.
    fn retry_after(&self) -> Option<Duration>;
}

/// Error severity levels for monitoring and alerting
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ErrorSeverity {
    /// Informational, typically for debugging
    Info,
    /// Warning, should be monitored but not critical
    Warning,
    /// Error, requires attention and action
    Error,
    /// Critical, immediate action required
    Critical,
}

impl fmt::Display for ErrorSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Info => write!(f, "INFO"),
            Self::Warning => write!(f, "WARN"),
            Self::Error => write!(f, "ERROR"),
            Self::Critical => write!(f, "CRITICAL"),
        }
    }
}

impl ErrorClassification for NetError {
    fn is_retryable(&self) -> bool {
        NetError::is_retryable(self)
    }

    fn severity(&self) -> ErrorSeverity {
        match self.kind {
            ErrorKind::QueuedOffline | ErrorKind::Cancelled => ErrorSeverity::Info,
            ErrorKind::Throttled
            | ErrorKind::RateLimited
            | ErrorKind::CircuitOpen
            | ErrorKind::QueueFull
            | ErrorKind::Timeout
            | ErrorKind::Client => ErrorSeverity::Warning,
            ErrorKind::Transport | ErrorKind::Server | ErrorKind::Interceptor => {
                ErrorSeverity::Error
            }
        }
    }

    fn retry_after(&self) -> Option<Duration> {
        self.retry_after
    }
}
