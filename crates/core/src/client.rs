//! Resilient client
//!
//! Wires the pieces into one call path:
//!
//! ```text
//! request chain -> [offline? queue durably] -> rate limiter -> request queue
//!     -> transport -> response chain | error chain (retry, token refresh)
//! ```
//!
//! The builtin interceptors are installed by [`ClientBuilder::build`];
//! callers may add their own through [`ResilientClient::chain`].

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use netguard_common::resilience::{RateLimiterConfig, SlidingWindowLimiter};
use netguard_common::time::{Clock, SharedClock, SystemClock};
use netguard_common::{RateLimiterSnapshot, ResilienceError};
use netguard_domain::{Config, ErrorKind, NetError, NetRequest, NetResponse, NetguardError, Priority};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::breaker::CircuitBreakerRegistry;
use crate::connectivity::{ConnectivityMonitor, ManualConnectivity};
use crate::events::EventBus;
use crate::interceptor::builtin::{
    CircuitBreakerInterceptor, ReplayTarget, RetryInterceptor, TokenRefreshInterceptor,
    TracingInterceptor,
};
use crate::interceptor::context::{META_MAX_RETRIES, META_SKIP_CIRCUIT_BREAKER};
use crate::interceptor::{CallContext, InterceptorChain};
use crate::offline::{EnqueueOptions, OfflineQueue};
use crate::ports::{ErrorReporter, OfflineStore, TokenProvider, Transport};
use crate::queue::{QueueOptions, QueueStats, RequestQueue};

/// Per-call options. Everything unset falls back to configuration.
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    pub priority: Option<Priority>,
    /// Limit for each transport attempt, including retries.
    pub timeout: Option<Duration>,
    /// Overrides the retry engine's `max_retries` for this call.
    pub max_retries: Option<u32>,
    pub dedup_key: Option<String>,
    pub skip_circuit_breaker: bool,
    /// Whether the call may be stored for offline replay. Defaults to true
    /// for writes and false for GET/HEAD/OPTIONS.
    pub offline_eligible: Option<bool>,
    pub cancel: Option<CancellationToken>,
    pub offline_ttl: Option<Duration>,
    /// Copied onto the durable entry when the call is queued offline.
    pub metadata: BTreeMap<String, String>,
}

impl RequestOptions {
    #[must_use]
    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    #[must_use]
    pub fn dedup_key(mut self, key: impl Into<String>) -> Self {
        self.dedup_key = Some(key.into());
        self
    }

    #[must_use]
    pub fn skip_circuit_breaker(mut self) -> Self {
        self.skip_circuit_breaker = true;
        self
    }

    #[must_use]
    pub fn offline_eligible(mut self, eligible: bool) -> Self {
        self.offline_eligible = Some(eligible);
        self
    }

    #[must_use]
    pub fn cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    #[must_use]
    pub fn offline_ttl(mut self, ttl: Duration) -> Self {
        self.offline_ttl = Some(ttl);
        self
    }

    #[must_use]
    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

pub struct ClientBuilder {
    transport: Arc<dyn Transport>,
    config: Config,
    clock: Option<SharedClock>,
    events: Option<EventBus>,
    connectivity: Option<Arc<dyn ConnectivityMonitor>>,
    offline_store: Option<Arc<dyn OfflineStore>>,
    token_provider: Option<Arc<dyn TokenProvider>>,
    error_reporter: Option<Arc<dyn ErrorReporter>>,
    replay_target: Option<ReplayTarget>,
}

impl ClientBuilder {
    #[must_use]
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn clock(mut self, clock: SharedClock) -> Self {
        self.clock = Some(clock);
        self
    }

    #[must_use]
    pub fn events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    #[must_use]
    pub fn connectivity(mut self, connectivity: Arc<dyn ConnectivityMonitor>) -> Self {
        self.connectivity = Some(connectivity);
        self
    }

    /// Enables the durable offline queue (unless `offline.enabled` is off).
    #[must_use]
    pub fn offline_store(mut self, store: Arc<dyn OfflineStore>) -> Self {
        self.offline_store = Some(store);
        self
    }

    #[must_use]
    pub fn token_provider(mut self, provider: Arc<dyn TokenProvider>) -> Self {
        self.token_provider = Some(provider);
        self
    }

    #[must_use]
    pub fn error_reporter(mut self, reporter: Arc<dyn ErrorReporter>) -> Self {
        self.error_reporter = Some(reporter);
        self
    }

    /// Which request the retry engine resends. Defaults to the caller's
    /// original request, or the dispatched one when a token provider is set
    /// so resends keep their credentials.
    #[must_use]
    pub fn replay_target(mut self, target: ReplayTarget) -> Self {
        self.replay_target = Some(target);
        self
    }

    /// # Errors
    /// `NetguardError::Config` when the configuration fails validation or a
    /// component rejects its settings.
    pub fn build(self) -> Result<ResilientClient, NetguardError> {
        self.config.validate()?;
        let config = self.config;
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let events = self.events.unwrap_or_default();
        let connectivity =
            self.connectivity.unwrap_or_else(|| Arc::new(ManualConnectivity::online()));
        let transport = self.transport;

        let breakers = CircuitBreakerRegistry::with_clock(config.circuit_breaker.clone(), clock.clone())
            .map_err(config_error)?
            .with_events(events.clone());

        let chain = Arc::new(InterceptorChain::new());
        Arc::new(
            TracingInterceptor::new(clock.clone(), config.transport.slow_call_threshold())
                .with_events(events.clone()),
        )
        .install(&chain);
        let replay_target = self.replay_target.unwrap_or(if self.token_provider.is_some() {
            ReplayTarget::Dispatched
        } else {
            ReplayTarget::Original
        });
        if let Some(provider) = self.token_provider {
            Arc::new(TokenRefreshInterceptor::new(provider, Arc::clone(&transport))).install(&chain);
        }
        Arc::new(CircuitBreakerInterceptor::new(breakers.clone())).install(&chain);
        Arc::new(
            RetryInterceptor::new(Arc::clone(&transport), config.retry.clone(), clock.clone())
                .map_err(config_error)?
                .with_replay_target(replay_target)
                .with_events(events.clone())
                .with_breakers(breakers.clone()),
        )
        .install(&chain);

        let queue = RequestQueue::new(config.queue.clone()).map_err(config_error)?;
        let limiter = if config.rate_limit.enabled {
            let limiter_config = RateLimiterConfig::from_settings(&config.rate_limit);
            Some(SlidingWindowLimiter::with_clock(limiter_config, clock.clone()).map_err(config_error)?)
        } else {
            None
        };

        let offline = match self.offline_store {
            Some(store) if config.offline.enabled => {
                let mut builder = OfflineQueue::builder(store, Arc::clone(&transport))
                    .connectivity(Arc::clone(&connectivity))
                    .events(events.clone())
                    .clock(clock.clone())
                    .settings(config.offline.clone());
                if let Some(reporter) = self.error_reporter {
                    builder = builder.reporter(reporter);
                }
                Some(builder.build()?)
            }
            _ => None,
        };

        info!(
            rate_limited = limiter.is_some(),
            offline_queue = offline.is_some(),
            replay_target = ?replay_target,
            "Resilient client ready"
        );

        Ok(ResilientClient {
            inner: Arc::new(ClientInner {
                transport,
                chain,
                breakers,
                queue,
                limiter,
                offline,
                connectivity,
                events,
                clock,
                config,
            }),
        })
    }
}

fn config_error(err: ResilienceError) -> NetguardError {
    NetguardError::Config(err.to_string())
}

struct ClientInner {
    transport: Arc<dyn Transport>,
    chain: Arc<InterceptorChain>,
    breakers: CircuitBreakerRegistry,
    queue: RequestQueue<NetResponse>,
    limiter: Option<SlidingWindowLimiter<SharedClock>>,
    offline: Option<OfflineQueue>,
    connectivity: Arc<dyn ConnectivityMonitor>,
    events: EventBus,
    clock: SharedClock,
    config: Config,
}

/// Entry point for resilient calls. Clones share every component.
#[derive(Clone)]
pub struct ResilientClient {
    inner: Arc<ClientInner>,
}

impl std::fmt::Debug for ResilientClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResilientClient")
            .field("queue", &self.inner.queue)
            .field("breakers", &self.inner.breakers.len())
            .field("offline", &self.inner.offline.is_some())
            .finish()
    }
}

impl ResilientClient {
    pub fn builder(transport: Arc<dyn Transport>) -> ClientBuilder {
        ClientBuilder {
            transport,
            config: Config::default(),
            clock: None,
            events: None,
            connectivity: None,
            offline_store: None,
            token_provider: None,
            error_reporter: None,
            replay_target: None,
        }
    }

    pub async fn send(&self, request: NetRequest) -> Result<NetResponse, NetError> {
        self.execute(request, RequestOptions::default()).await
    }

    /// Run `request` through the full pipeline.
    ///
    /// # Errors
    /// The classified failure, always carrying the call's trace id and the
    /// original request. While offline, eligible requests are stored and the
    /// caller gets `QueuedOffline` with the entry id.
    #[instrument(skip(self, request, options), fields(method = %request.method, url = %request.url))]
    pub async fn execute(&self, request: NetRequest, options: RequestOptions) -> Result<NetResponse, NetError> {
        let inner = &self.inner;
        let cancel = options.cancel.clone().unwrap_or_default();
        let attempt_timeout = options.timeout.unwrap_or_else(|| inner.config.queue.default_timeout());

        // Dropping this future mid-flight must not strand a half-open slot
        let mut ctx = inner.breakers.guard(
            CallContext::new(&request, inner.clock.now())
                .with_cancel(cancel.clone())
                .with_attempt_timeout(Some(attempt_timeout)),
        );
        if options.skip_circuit_breaker {
            ctx.set_flag(META_SKIP_CIRCUIT_BREAKER, true);
        }
        if let Some(max_retries) = options.max_retries {
            ctx.metadata.insert(META_MAX_RETRIES.to_string(), Value::from(max_retries));
        }

        let dispatched = match inner.chain.execute_request_chain(request, &mut ctx).await {
            Ok(request) => request,
            Err(err) => {
                ctx.release();
                return Err(finish(err, &ctx));
            }
        };
        ctx.dispatched_request = Some(dispatched.clone());

        let eligible = self.offline_eligible(&dispatched, &options);
        if eligible && !inner.connectivity.is_online() {
            ctx.release();
            return Err(finish(self.queue_offline(&dispatched, &options, &ctx).await, &ctx));
        }

        let outcome = match self.dispatch(dispatched.clone(), &options, cancel, attempt_timeout).await {
            Ok(response) => inner.chain.execute_response_chain(response, &mut ctx).await,
            Err(err) if err.is_local_rejection() => Err(err),
            Err(err) => inner.chain.execute_error_chain(err, &mut ctx).await.into_result(),
        };
        ctx.release();

        match outcome {
            Ok(response) => Ok(response),
            // Connectivity dropped while the call was in flight
            Err(err) if eligible && err.kind == ErrorKind::Transport && !inner.connectivity.is_online() => {
                Err(finish(self.queue_offline(&dispatched, &options, &ctx).await, &ctx))
            }
            Err(err) => Err(finish(err, &ctx)),
        }
    }

    async fn dispatch(
        &self,
        request: NetRequest,
        options: &RequestOptions,
        cancel: CancellationToken,
        attempt_timeout: Duration,
    ) -> Result<NetResponse, NetError> {
        if let Some(limiter) = &self.inner.limiter {
            tokio::select! {
                permit = limiter.acquire() => {
                    let permit = permit.map_err(NetError::from)?;
                    if !permit.waited.is_zero() {
                        debug!(waited_ms = permit.waited.as_millis() as u64, "Rate limiter slot granted");
                    }
                }
                () = cancel.cancelled() => {
                    return Err(NetError::cancelled("request cancelled while rate limited"));
                }
            }
        }

        let mut queue_options = QueueOptions::default().timeout(attempt_timeout).cancel(cancel);
        if let Some(priority) = options.priority {
            queue_options = queue_options.priority(priority);
        }
        if let Some(key) = &options.dedup_key {
            queue_options = queue_options.dedup_key(key.clone());
        }

        let transport = Arc::clone(&self.inner.transport);
        self.inner
            .queue
            .enqueue(
                move || {
                    let transport = Arc::clone(&transport);
                    let request = request.clone();
                    async move { transport.send(request).await }
                },
                queue_options,
            )
            .await
    }

    fn offline_eligible(&self, request: &NetRequest, options: &RequestOptions) -> bool {
        self.inner.offline.is_some()
            && options.offline_eligible.unwrap_or(!request.method.is_idempotent())
    }

    /// Store `request` durably. Returns the error handed back to the caller.
    async fn queue_offline(&self, request: &NetRequest, options: &RequestOptions, ctx: &CallContext) -> NetError {
        let Some(offline) = &self.inner.offline else {
            return NetError::transport("offline and no offline queue configured");
        };
        let mut enqueue = EnqueueOptions {
            priority: options.priority,
            ttl: options.offline_ttl,
            max_retries: None,
            metadata: options.metadata.clone(),
        };
        enqueue.metadata.entry("trace_id".to_string()).or_insert_with(|| ctx.trace_id.clone());

        match offline.enqueue(request, enqueue).await {
            Ok(entry) => {
                info!(entry_id = %entry.id, trace_id = %ctx.trace_id, "Offline, request queued for replay");
                NetError::queued_offline(entry.id)
            }
            Err(err) => {
                warn!(error = %err, trace_id = %ctx.trace_id, "Offline and the request could not be queued");
                NetError::transport(format!("offline and the request could not be queued: {err}"))
            }
        }
    }

    pub fn chain(&self) -> &InterceptorChain {
        &self.inner.chain
    }

    pub fn breakers(&self) -> &CircuitBreakerRegistry {
        &self.inner.breakers
    }

    pub fn offline_queue(&self) -> Option<&OfflineQueue> {
        self.inner.offline.as_ref()
    }

    pub fn queue_stats(&self) -> QueueStats {
        self.inner.queue.stats()
    }

    pub fn rate_limiter(&self) -> Option<RateLimiterSnapshot> {
        self.inner.limiter.as_ref().map(SlidingWindowLimiter::snapshot)
    }

    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }
}

/// Stamp the trace id and the caller's request onto a failure.
fn finish(mut err: NetError, ctx: &CallContext) -> NetError {
    if err.trace_id.is_none() {
        err.trace_id = Some(ctx.trace_id.clone());
    }
    if err.request.is_none() {
        err.request = Some(Box::new(ctx.original_request.clone()));
    }
    err
}

#[cfg(test)]
mod tests {
    use netguard_common::time::MockClock;
    use netguard_domain::{CircuitState, RetrySettings};

    use super::*;
    use crate::testing::ScriptedTransport;

    fn fast_config() -> Config {
        Config {
            retry: RetrySettings {
                max_retries: 2,
                base_delay_ms: 10,
                max_delay_ms: 100,
                jitter: false,
                ..RetrySettings::default()
            },
            ..Config::default()
        }
    }

    fn client(transport: &ScriptedTransport) -> ResilientClient {
        ResilientClient::builder(transport.clone().into_dyn()).config(fast_config()).build().unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn success_passes_through_with_trace_headers() {
        let transport = ScriptedTransport::new();
        transport.push_response(NetResponse::new(200).with_body("ok"));
        let client = client(&transport);

        let response = client.send(NetRequest::get("https://api.example.com/items")).await.unwrap();
        assert_eq!(response.body, b"ok");
        let sent = &transport.requests()[0];
        assert!(sent.header("traceparent").is_some());
        assert_eq!(sent.header("x-trace-id"), sent.header("x-request-id"));
    }

    /// Validates `ResilientClient::execute` behavior for the transient
    /// failure scenario.
    ///
    /// Assertions:
    /// - Confirms the retry engine recovers after two 503s.
    /// - Confirms a per-call `max_retries` override is honoured.
    #[tokio::test(start_paused = true)]
    async fn retries_transient_failures() {
        let transport = ScriptedTransport::new();
        transport.push_status(503);
        transport.push_status(503);
        transport.push_response(NetResponse::new(200));
        let client = client(&transport);

        let response = client.send(NetRequest::get("https://api.example.com/a")).await.unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(transport.calls(), 3);

        transport.push_status(503);
        transport.push_status(503);
        let err = client
            .execute(NetRequest::get("https://api.example.com/a"), RequestOptions::default().max_retries(1))
            .await
            .unwrap_err();
        assert_eq!(err.status, 503);
        assert_eq!(transport.calls(), 5);
        assert!(err.trace_id.is_some());
        assert_eq!(err.request.as_deref().map(|r| r.url.as_str()), Some("https://api.example.com/a"));
    }

    #[tokio::test(start_paused = true)]
    async fn client_errors_are_not_retried() {
        let transport = ScriptedTransport::new();
        transport.push_status(404);
        let client = client(&transport);
        let err = client.send(NetRequest::get("https://api.example.com/missing")).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Client);
        assert_eq!(transport.calls(), 1);
        assert_eq!(client.breakers().state("api.example.com"), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn skip_circuit_breaker_bypasses_open_circuit() {
        let transport = ScriptedTransport::new();
        let client = client(&transport);
        let breaker = client.breakers().get("api.example.com");
        for _ in 0..client.config().circuit_breaker.failure_threshold {
            breaker.record_failure();
        }

        let err = client.send(NetRequest::get("https://api.example.com/a")).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::CircuitOpen);
        assert_eq!(transport.calls(), 0);

        let ok = client
            .execute(NetRequest::get("https://api.example.com/a"), RequestOptions::default().skip_circuit_breaker())
            .await
            .unwrap();
        assert_eq!(ok.status, 200);
    }

    /// Validates `ResilientClient::execute` behavior for the abandoned
    /// half-open call scenario.
    ///
    /// Assertions:
    /// - Confirms a caller timing out the only half-open call frees its slot.
    /// - Confirms the next call is admitted and closes the circuit.
    #[tokio::test(start_paused = true)]
    async fn dropped_call_releases_half_open_slot() {
        let clock = MockClock::new();
        let mut config = fast_config();
        config.circuit_breaker.failure_threshold = 1;
        config.circuit_breaker.success_threshold = 1;
        config.circuit_breaker.reset_timeout_ms = 1_000;
        let transport = ScriptedTransport::new();
        let client = ResilientClient::builder(transport.clone().into_dyn())
            .config(config)
            .clock(Arc::new(clock.clone()))
            .build()
            .unwrap();

        client.breakers().get("api.example.com").record_failure();
        assert_eq!(client.breakers().state("api.example.com"), CircuitState::Open);
        clock.advance(Duration::from_secs(2));

        transport.set_delay(Duration::from_secs(5));
        let abandoned = tokio::time::timeout(
            Duration::from_millis(100),
            client.send(NetRequest::get("https://api.example.com/slow")),
        )
        .await;
        assert!(abandoned.is_err());

        let metrics = client.breakers().metrics("api.example.com").unwrap();
        assert_eq!(metrics.state, CircuitState::HalfOpen);
        assert_eq!(metrics.half_open_in_flight, 0);

        transport.set_delay(Duration::ZERO);
        let response = client.send(NetRequest::get("https://api.example.com/health")).await.unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(client.breakers().state("api.example.com"), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_token_rejects_call() {
        let transport = ScriptedTransport::new();
        transport.set_delay(Duration::from_secs(5));
        let client = client(&transport);
        let token = CancellationToken::new();
        let cancel = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel.cancel();
        });

        let err = client
            .execute(NetRequest::get("https://api.example.com/slow"), RequestOptions::default().cancel(token))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_retry_resubmission() {
        let transport = ScriptedTransport::new();
        transport.set_delay(Duration::from_secs(5));
        transport.push_status(503);
        let client = client(&transport);
        let token = CancellationToken::new();
        let cancel = token.clone();
        tokio::spawn(async move {
            // First attempt answers 503 at 5 s; the resubmission would end at 10 s
            tokio::time::sleep(Duration::from_secs(6)).await;
            cancel.cancel();
        });

        let started = tokio::time::Instant::now();
        let err = client
            .execute(NetRequest::get("https://api.example.com/slow"), RequestOptions::default().cancel(token))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Cancelled);
        assert!(started.elapsed() < Duration::from_secs(7), "{:?}", started.elapsed());
        assert_eq!(transport.calls(), 2);
    }
}
