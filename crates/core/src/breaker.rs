//! Per-service circuit breakers
//!
//! One breaker per service key (`host[:port]` of the target URL), created on
//! first use and kept until removed or reset. Breakers never share state, so a
//! failing host cannot trip calls to a healthy one.

use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use dashmap::DashMap;
use netguard_common::resilience::{CircuitBreaker, CircuitBreakerConfig, StateTransition};
use netguard_common::time::{SharedClock, SystemClock};
use netguard_common::{CircuitBreakerMetrics, ResilienceError};
use netguard_domain::{CircuitBreakerSettings, CircuitState, ErrorKind, NetError, NetEvent};
use tracing::{debug, info};
use url::Url;

use crate::events::EventBus;
use crate::interceptor::context::{CallContext, META_BREAKER_ADMITTED};

/// Derive the breaker key for a URL: `host`, plus `:port` when explicit.
///
/// Unparseable URLs fall back to the raw string so they still get isolated.
pub fn service_key(url: &str) -> String {
    match Url::parse(url) {
        Ok(parsed) => match (parsed.host_str(), parsed.port()) {
            (Some(host), Some(port)) => format!("{host}:{port}"),
            (Some(host), None) => host.to_string(),
            (None, _) => url.to_string(),
        },
        Err(_) => url.to_string(),
    }
}

/// Lazily populated map of breakers, one per service key.
#[derive(Clone)]
pub struct CircuitBreakerRegistry {
    breakers: Arc<DashMap<String, CircuitBreaker<SharedClock>>>,
    settings: CircuitBreakerSettings,
    template: CircuitBreaker<SharedClock>,
    events: Option<EventBus>,
}

impl std::fmt::Debug for CircuitBreakerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreakerRegistry")
            .field("services", &self.breakers.len())
            .field("config", self.template.config())
            .finish()
    }
}

impl CircuitBreakerRegistry {
    /// # Errors
    /// Returns `ResilienceError::InvalidConfiguration` for invalid settings.
    pub fn new(settings: CircuitBreakerSettings) -> Result<Self, ResilienceError> {
        Self::with_clock(settings, Arc::new(SystemClock))
    }

    pub fn with_clock(
        settings: CircuitBreakerSettings,
        clock: SharedClock,
    ) -> Result<Self, ResilienceError> {
        let template =
            CircuitBreaker::with_clock(CircuitBreakerConfig::from_settings(&settings), clock)?;
        Ok(Self { breakers: Arc::new(DashMap::new()), settings, template, events: None })
    }

    /// Publish breaker transitions on `events`.
    #[must_use]
    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    pub fn settings(&self) -> &CircuitBreakerSettings {
        &self.settings
    }

    /// Breaker for `key`, created on first use.
    pub fn get(&self, key: &str) -> CircuitBreaker<SharedClock> {
        if let Some(existing) = self.breakers.get(key) {
            return existing.clone();
        }
        self.breakers
            .entry(key.to_string())
            .or_insert_with(|| self.create(key))
            .clone()
    }

    fn create(&self, key: &str) -> CircuitBreaker<SharedClock> {
        let breaker = self.template.fresh();
        if let Some(events) = &self.events {
            let events = events.clone();
            let service = key.to_string();
            breaker.on_transition(Arc::new(move |t: &StateTransition| {
                events.publish(transition_event(&service, t));
            }));
        }
        debug!(service = key, "Created circuit breaker");
        breaker
    }

    /// Admission check for `key`.
    ///
    /// # Errors
    /// `ErrorKind::CircuitOpen` with the breaker state and retry hint.
    pub fn admit(&self, key: &str) -> Result<(), NetError> {
        self.get(key).check().map_err(|err| match err {
            ResilienceError::CircuitOpen { state, retry_after } => {
                NetError::circuit_open(key, state, retry_after)
            }
            other => NetError::from(other),
        })
    }

    /// Whether an error counts against the breaker.
    ///
    /// Network failures and timeouts always do; responses count when their
    /// status is in the failure set. Local rejections never reach here as
    /// failures.
    pub fn is_failure(&self, error: &NetError) -> bool {
        match error.kind {
            ErrorKind::Transport | ErrorKind::Timeout => true,
            ErrorKind::Server | ErrorKind::RateLimited | ErrorKind::Client => {
                self.settings.is_failure_status(error.status)
            }
            _ => false,
        }
    }

    /// Record the verdict for an admitted call that ended in `error`.
    pub fn record_error(&self, key: &str, error: &NetError) {
        let breaker = self.get(key);
        if self.is_failure(error) {
            breaker.record_failure();
        } else if matches!(error.kind, ErrorKind::Client | ErrorKind::RateLimited | ErrorKind::Server) {
            // The service answered; it is healthy from the breaker's view
            breaker.record_success();
        } else {
            breaker.record_ignored();
        }
    }

    pub fn record_success(&self, key: &str) {
        self.get(key).record_success();
    }

    /// Release an admission recorded in `ctx` that never got a verdict.
    pub fn release(&self, ctx: &mut CallContext) {
        if ctx.take_flag(META_BREAKER_ADMITTED) {
            debug!(service = %ctx.service_key, "Releasing breaker admission without a verdict");
            self.get(&ctx.service_key).record_ignored();
        }
    }

    /// Bind `ctx` to this registry for the lifetime of one call.
    pub fn guard(&self, ctx: CallContext) -> AdmissionGuard<'_> {
        AdmissionGuard { registry: self, ctx }
    }

    pub fn state(&self, key: &str) -> CircuitState {
        self.breakers.get(key).map_or(CircuitState::Closed, |b| b.state())
    }

    pub fn metrics(&self, key: &str) -> Option<CircuitBreakerMetrics> {
        self.breakers.get(key).map(|b| b.metrics())
    }

    /// `(service, state)` for every known breaker, sorted by service.
    pub fn snapshot(&self) -> Vec<(String, CircuitState)> {
        let mut all: Vec<_> =
            self.breakers.iter().map(|e| (e.key().clone(), e.value().state())).collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }

    /// Returns false when no breaker exists for `key`.
    pub fn reset(&self, key: &str) -> bool {
        match self.breakers.get(key) {
            Some(breaker) => {
                breaker.reset();
                info!(service = key, "Circuit breaker reset");
                true
            }
            None => false,
        }
    }

    pub fn reset_all(&self) {
        for entry in self.breakers.iter() {
            entry.value().reset();
        }
        info!(services = self.breakers.len(), "All circuit breakers reset");
    }

    pub fn remove(&self, key: &str) -> bool {
        self.breakers.remove(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }
}

/// Owns a call's context and releases its breaker admission on drop.
///
/// A call abandoned mid-flight (its future dropped by a timeout or a
/// `select!`) never reaches the response or error chain, so nothing else
/// would free the half-open slot it holds.
pub struct AdmissionGuard<'a> {
    registry: &'a CircuitBreakerRegistry,
    ctx: CallContext,
}

impl AdmissionGuard<'_> {
    /// Release now instead of at drop. Idempotent.
    pub fn release(&mut self) {
        self.registry.release(&mut self.ctx);
    }
}

impl Deref for AdmissionGuard<'_> {
    type Target = CallContext;

    fn deref(&self) -> &CallContext {
        &self.ctx
    }
}

impl DerefMut for AdmissionGuard<'_> {
    fn deref_mut(&mut self) -> &mut CallContext {
        &mut self.ctx
    }
}

impl Drop for AdmissionGuard<'_> {
    fn drop(&mut self) {
        self.release();
    }
}

fn transition_event(service: &str, t: &StateTransition) -> NetEvent {
    let service = service.to_string();
    match t.to {
        CircuitState::Open => NetEvent::CircuitOpened {
            service,
            failures: t.failures,
            retry_after_ms: u64::try_from(t.retry_after.as_millis()).unwrap_or(u64::MAX),
        },
        CircuitState::HalfOpen => NetEvent::CircuitHalfOpened { service },
        CircuitState::Closed => NetEvent::CircuitClosed { service },
    }
}
