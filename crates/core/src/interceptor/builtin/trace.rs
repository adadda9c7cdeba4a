//! Distributed tracing headers and call timing

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use netguard_common::time::{Clock, SharedClock};
use netguard_domain::constants::{
    HEADER_PARENT_SPAN_ID, HEADER_REQUEST_ID, HEADER_SPAN_ID, HEADER_TRACEPARENT, HEADER_TRACE_ID,
};
use netguard_domain::{NetError, NetEvent, NetRequest, NetResponse};
use tracing::{debug, warn};

use super::{priority, TRACING};
use crate::events::EventBus;
use crate::interceptor::chain::{
    ErrorDisposition, ErrorHandler, ErrorInterceptor, InterceptorChain, RequestHandler,
    RequestInterceptor, ResponseHandler, ResponseInterceptor,
};
use crate::interceptor::context::CallContext;

/// Stamps trace headers on outgoing requests, times responses and tags
/// errors with the trace id.
pub struct TracingInterceptor {
    clock: SharedClock,
    slow_call_threshold: Duration,
    events: Option<EventBus>,
}

impl TracingInterceptor {
    /// A zero `slow_call_threshold` disables slow-call reporting.
    pub fn new(clock: SharedClock, slow_call_threshold: Duration) -> Self {
        Self { clock, slow_call_threshold, events: None }
    }

    #[must_use]
    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    pub fn install(self: Arc<Self>, chain: &InterceptorChain) {
        chain.add_request_interceptor(RequestInterceptor::from_arc(
            TRACING,
            priority::TRACING_REQUEST,
            self.clone(),
        ));
        chain.add_response_interceptor(ResponseInterceptor::from_arc(
            TRACING,
            priority::TRACING_RESPONSE,
            self.clone(),
        ));
        chain.add_error_interceptor(ErrorInterceptor::from_arc(TRACING, priority::TRACING_ERROR, self));
    }
}

/// W3C `traceparent` value, sampled flag set.
pub fn traceparent(trace_id: &str, span_id: &str) -> String {
    format!("00-{trace_id}-{span_id}-01")
}

#[async_trait]
impl RequestHandler for TracingInterceptor {
    async fn handle(&self, mut request: NetRequest, ctx: &mut CallContext) -> Result<NetRequest, NetError> {
        request.set_header(HEADER_TRACEPARENT, traceparent(&ctx.trace_id, &ctx.span_id));
        request.set_header(HEADER_TRACE_ID, ctx.trace_id.clone());
        request.set_header(HEADER_SPAN_ID, ctx.span_id.clone());
        request.set_header(HEADER_REQUEST_ID, ctx.trace_id.clone());
        if let Some(parent) = &ctx.parent_span_id {
            request.set_header(HEADER_PARENT_SPAN_ID, parent.clone());
        }
        debug!(trace_id = %ctx.trace_id, method = %request.method, url = %request.url, "Dispatching request");
        Ok(request)
    }
}

#[async_trait]
impl ResponseHandler for TracingInterceptor {
    async fn handle(&self, response: NetResponse, ctx: &mut CallContext) -> Result<NetResponse, NetError> {
        let elapsed = self.clock.now().saturating_duration_since(ctx.started_at);
        let elapsed_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
        debug!(
            trace_id = %ctx.trace_id,
            status = response.status,
            elapsed_ms,
            retries = ctx.retry_count,
            "Request completed"
        );

        if !self.slow_call_threshold.is_zero() && elapsed > self.slow_call_threshold {
            let threshold_ms = u64::try_from(self.slow_call_threshold.as_millis()).unwrap_or(u64::MAX);
            warn!(trace_id = %ctx.trace_id, url = %ctx.original_request.url, elapsed_ms, threshold_ms, "Slow call");
            if let Some(events) = &self.events {
                events.publish(NetEvent::SlowCall {
                    trace_id: ctx.trace_id.clone(),
                    url: ctx.original_request.url.clone(),
                    elapsed_ms,
                    threshold_ms,
                });
            }
        }
        Ok(response)
    }
}

#[async_trait]
impl ErrorHandler for TracingInterceptor {
    async fn handle(&self, error: NetError, ctx: &mut CallContext) -> Result<ErrorDisposition, NetError> {
        debug!(trace_id = %ctx.trace_id, kind = %error.kind, status = error.status, "Request failed");
        let error = if error.trace_id.is_some() { error } else { error.with_trace_id(ctx.trace_id.clone()) };
        Ok(ErrorDisposition::Continue(error))
    }
}
