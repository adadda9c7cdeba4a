//! Time abstraction for testability
//!
//! Components read time through [`Clock`] so tests can control it.
//! [`SystemClock`] reads the tokio clock when the `runtime` feature is on, which
//! means `tokio::time::pause()` / `advance()` move it together with timers.
//!
//! # Examples
//!
//! ```
//! use std::time::Duration;
//!
//! use netguard_common::time::{Clock, MockClock};
//!
//! let mock = MockClock::new();
//! let start = mock.now();
//! mock.advance(Duration::from_secs(5));
//! assert_eq!(mock.now().duration_since(start), Duration::from_secs(5));
//! ```

use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

/// Trait for time operations to enable deterministic testing
pub trait Clock: Send + Sync + 'static {
    /// Monotonic instant, for measuring durations.
    fn now(&self) -> Instant;

    /// Wall clock time.
    fn system_time(&self) -> SystemTime;

    /// Milliseconds since the Unix epoch, as stored in durable rows.
    fn now_millis(&self) -> i64 {
        let millis = self.system_time().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis();
        i64::try_from(millis).unwrap_or(i64::MAX)
    }
}

/// Clock handle shared between components.
pub type SharedClock = Arc<dyn Clock>;

/// Real clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    #[cfg(feature = "runtime")]
    fn now(&self) -> Instant {
        tokio::time::Instant::now().into_std()
    }

    #[cfg(not(feature = "runtime"))]
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn system_time(&self) -> SystemTime {
        SystemTime::now()
    }
}

impl<T: Clock + ?Sized> Clock for Arc<T> {
    fn now(&self) -> Instant {
        (**self).now()
    }

    fn system_time(&self) -> SystemTime {
        (**self).system_time()
    }

    fn now_millis(&self) -> i64 {
        (**self).now_millis()
    }
}

/// Mock clock for deterministic testing
///
/// Both the monotonic and the wall clock advance only when told to. Clones
/// share the same elapsed time.
#[derive(Debug, Clone)]
pub struct MockClock {
    start: Instant,
    epoch: SystemTime,
    elapsed: Arc<Mutex<Duration>>,
}

impl MockClock {
    /// Starts at the current instant, wall clock at the Unix epoch.
    pub fn new() -> Self {
        Self::with_epoch_millis(0)
    }

    /// Wall clock starts `millis` after the Unix epoch.
    pub fn with_epoch_millis(millis: u64) -> Self {
        Self {
            start: Instant::now(),
            epoch: UNIX_EPOCH + Duration::from_millis(millis),
            elapsed: Arc::new(Mutex::new(Duration::ZERO)),
        }
    }

    pub fn advance(&self, duration: Duration) {
        *self.elapsed.lock() += duration;
    }

    pub fn advance_millis(&self, millis: u64) {
        self.advance(Duration::from_millis(millis));
    }

    pub fn set_elapsed(&self, duration: Duration) {
        *self.elapsed.lock() = duration;
    }

    pub fn elapsed(&self) -> Duration {
        *self.elapsed.lock()
    }
}

impl Default for MockClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MockClock {
    fn now(&self) -> Instant {
        self.start + self.elapsed()
    }

    fn system_time(&self) -> SystemTime {
        self.epoch + self.elapsed()
    }
}
