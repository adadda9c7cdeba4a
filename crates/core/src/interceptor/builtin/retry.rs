//! Retry with exponential backoff
//!
//! Registered as an error interceptor. It owns the whole retry loop for a
//! call: wait, resubmit straight to the transport, and re-evaluate, until a
//! resubmission succeeds or the budget in the call context is spent.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use netguard_common::resilience::{parse_retry_after, ExponentialBackoff};
use netguard_common::time::{Clock, SharedClock};
use netguard_common::ResilienceError;
use netguard_domain::constants::HEADER_RETRY_AFTER;
use netguard_domain::{ErrorKind, NetError, NetEvent, NetResponse, RetrySettings};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use super::{priority, RETRY};
use crate::breaker::CircuitBreakerRegistry;
use crate::events::EventBus;
use crate::interceptor::chain::{ErrorDisposition, ErrorHandler, ErrorInterceptor, InterceptorChain};
use crate::interceptor::context::{
    CallContext, META_BREAKER_ADMITTED, META_MAX_RETRIES, META_SKIP_CIRCUIT_BREAKER,
};
use crate::ports::Transport;

/// Which request a retry resubmits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplayTarget {
    /// The request as the caller submitted it, before any interceptor ran.
    #[default]
    Original,
    /// The request as it left the request chain (auth and trace headers included).
    Dispatched,
}

pub struct RetryInterceptor {
    transport: Arc<dyn Transport>,
    backoff: ExponentialBackoff,
    settings: RetrySettings,
    replay: ReplayTarget,
    clock: SharedClock,
    events: Option<EventBus>,
    breakers: Option<CircuitBreakerRegistry>,
}

impl RetryInterceptor {
    /// # Errors
    /// `ResilienceError::InvalidConfiguration` for an invalid backoff.
    pub fn new(
        transport: Arc<dyn Transport>,
        settings: RetrySettings,
        clock: SharedClock,
    ) -> Result<Self, ResilienceError> {
        Ok(Self {
            transport,
            backoff: ExponentialBackoff::from_settings(&settings)?,
            settings,
            replay: ReplayTarget::default(),
            clock,
            events: None,
            breakers: None,
        })
    }

    #[must_use]
    pub fn with_replay_target(mut self, replay: ReplayTarget) -> Self {
        self.replay = replay;
        self
    }

    #[must_use]
    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    /// Gate every resubmission on the service's breaker and record its outcome.
    #[must_use]
    pub fn with_breakers(mut self, breakers: CircuitBreakerRegistry) -> Self {
        self.breakers = Some(breakers);
        self
    }

    pub fn install(self: Arc<Self>, chain: &InterceptorChain) {
        chain.add_error_interceptor(ErrorInterceptor::from_arc(RETRY, priority::RETRY_ERROR, self));
    }

    /// Network failures, timeouts and configured statuses.
    pub fn is_retry_candidate(&self, error: &NetError) -> bool {
        match error.kind {
            ErrorKind::Transport | ErrorKind::Timeout => true,
            ErrorKind::Server | ErrorKind::RateLimited | ErrorKind::Client => {
                self.settings.retryable_statuses.contains(&error.status)
            }
            _ => false,
        }
    }

    /// Wait before resubmission number `attempt + 1`.
    ///
    /// A parseable `Retry-After` wins over the computed backoff, capped at
    /// the configured maximum delay.
    pub fn delay_for(&self, error: &NetError, attempt: u32) -> Duration {
        if self.settings.respect_retry_after {
            let hint = error.retry_after.or_else(|| {
                error
                    .header(HEADER_RETRY_AFTER)
                    .and_then(|v| parse_retry_after(v, self.clock.system_time()))
            });
            if let Some(hint) = hint {
                return hint.min(self.settings.max_delay());
            }
        }
        self.backoff.delay(attempt)
    }

    fn max_retries(&self, ctx: &CallContext) -> u32 {
        ctx.metadata_u32(META_MAX_RETRIES).unwrap_or(self.settings.max_retries)
    }

    async fn resubmit(&self, ctx: &CallContext) -> Result<NetResponse, NetError> {
        let request = match self.replay {
            ReplayTarget::Original => ctx.original_request.clone(),
            ReplayTarget::Dispatched => {
                ctx.dispatched_request.clone().unwrap_or_else(|| ctx.original_request.clone())
            }
        };
        let send = self.transport.send(request);
        let attempt = async {
            match ctx.attempt_timeout {
                Some(limit) => tokio::time::timeout(limit, send)
                    .await
                    .unwrap_or_else(|_| Err(NetError::timeout(limit))),
                None => send.await,
            }
        };
        tokio::select! {
            biased;
            () = ctx.cancel.cancelled() => {
                debug!("Retry cancelled during resubmission");
                Err(NetError::cancelled("cancelled during retry resubmission"))
            }
            result = attempt => result,
        }
    }
}

#[async_trait]
impl ErrorHandler for RetryInterceptor {
    fn can_handle(&self, error: &NetError) -> bool {
        self.is_retry_candidate(error)
    }

    #[instrument(skip_all, fields(trace_id = %ctx.trace_id, service = %ctx.service_key))]
    async fn handle(&self, error: NetError, ctx: &mut CallContext) -> Result<ErrorDisposition, NetError> {
        let max = self.max_retries(ctx);
        let gated = !ctx.flag(META_SKIP_CIRCUIT_BREAKER);
        let mut last = error;

        while ctx.retry_count < max && self.is_retry_candidate(&last) {
            let attempt = ctx.retry_count;
            let delay = self.delay_for(&last, attempt);
            let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
            info!(attempt = attempt + 1, max, delay_ms, status = last.status, "Retrying request");
            if let Some(events) = &self.events {
                events.publish(NetEvent::RetryAttempted {
                    trace_id: ctx.trace_id.clone(),
                    url: ctx.original_request.url.clone(),
                    attempt: attempt + 1,
                    delay_ms,
                    status: last.status,
                });
            }

            tokio::select! {
                () = ctx.cancel.cancelled() => {
                    debug!("Retry cancelled during backoff");
                    return Ok(ErrorDisposition::Continue(NetError::cancelled("cancelled during retry backoff")));
                }
                () = tokio::time::sleep(delay) => {}
            }
            ctx.retry_count += 1;

            let breakers = self.breakers.as_ref().filter(|_| gated);
            if let Some(breakers) = breakers {
                if let Err(rejection) = breakers.admit(&ctx.service_key) {
                    debug!(error = %rejection, "Breaker refused resubmission");
                    break;
                }
                ctx.set_flag(META_BREAKER_ADMITTED, true);
            }

            let outcome = self.resubmit(ctx).await;
            let breakers = breakers.filter(|_| ctx.take_flag(META_BREAKER_ADMITTED));
            match outcome {
                Ok(response) => {
                    if let Some(breakers) = breakers {
                        breakers.record_success(&ctx.service_key);
                    }
                    info!(attempts = ctx.retry_count, status = response.status, "Retry succeeded");
                    return Ok(ErrorDisposition::Recovered(response));
                }
                Err(err) => {
                    if let Some(breakers) = breakers {
                        breakers.record_error(&ctx.service_key, &err);
                    }
                    debug!(attempt = ctx.retry_count, kind = %err.kind, status = err.status, "Retry failed");
                    last = err;
                }
            }
        }

        Ok(ErrorDisposition::Continue(last))
    }
}
