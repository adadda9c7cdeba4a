//! Integration tests for the client pipeline
//!
//! Drives `ResilientClient` end to end against a scripted transport: breaker
//! admission, retries, local rate limiting, dedup and custom interceptors.

use std::sync::Arc;
use std::time::Duration;

use netguard_common::time::{MockClock, SharedClock};
use netguard_core::interceptor::{ErrorDisposition, ErrorInterceptor, RequestInterceptor};
use netguard_core::testing::{drain_events, ScriptedTransport};
use netguard_core::{EventBus, RequestOptions, ResilientClient};
use netguard_domain::{
    CircuitBreakerSettings, CircuitState, Config, ErrorKind, NetEvent, NetRequest, NetResponse,
    RateLimitSettings, RateLimitStrategy, RetrySettings,
};

fn no_retry_config() -> Config {
    Config {
        retry: RetrySettings { max_retries: 0, ..RetrySettings::default() },
        ..Config::default()
    }
}

/// Validates the breaker lifecycle through the client.
///
/// # Test Steps
/// 1. Fail three calls so the breaker for the host opens
/// 2. Verify the next call is rejected without reaching the transport
/// 3. Advance past the reset timeout and let the probe succeed
/// 4. Confirm the breaker closes and transitions were published
#[tokio::test]
async fn test_breaker_opens_rejects_and_recovers() {
    let clock = MockClock::new();
    let shared: SharedClock = Arc::new(clock.clone());
    let events = EventBus::default();
    let mut rx = events.subscribe();
    let transport = ScriptedTransport::new();
    for _ in 0..3 {
        transport.push_status(503);
    }
    let config = Config {
        circuit_breaker: CircuitBreakerSettings {
            failure_threshold: 3,
            success_threshold: 1,
            reset_timeout_ms: 30_000,
            ..CircuitBreakerSettings::default()
        },
        ..no_retry_config()
    };
    let client = ResilientClient::builder(transport.clone().into_dyn())
        .config(config)
        .clock(shared)
        .events(events)
        .build()
        .expect("client");

    for _ in 0..3 {
        let err = client.send(NetRequest::get("https://api.example.com/a")).await.expect_err("503");
        assert_eq!(err.status, 503);
    }
    assert_eq!(client.breakers().state("api.example.com"), CircuitState::Open);

    let err = client.send(NetRequest::get("https://api.example.com/b")).await.expect_err("open");
    assert_eq!(err.kind, ErrorKind::CircuitOpen);
    assert!(err.retry_after.is_some());
    assert!(err.trace_id.is_some());
    assert_eq!(transport.calls(), 3);

    // Other services are unaffected
    client.send(NetRequest::get("https://other.example.com/")).await.expect("other host");
    assert_eq!(transport.calls(), 4);

    clock.advance(Duration::from_secs(30));
    client.send(NetRequest::get("https://api.example.com/probe")).await.expect("probe");
    assert_eq!(client.breakers().state("api.example.com"), CircuitState::Closed);

    let names: Vec<_> = drain_events(&mut rx).iter().map(NetEvent::name).collect();
    assert!(names.contains(&"circuit_opened"));
    assert!(names.contains(&"circuit_half_opened"));
    assert!(names.contains(&"circuit_closed"));
}

/// Validates that retries resubmit exactly `max_retries` times.
///
/// # Test Steps
/// 1. Script four network failures
/// 2. Execute with three retries allowed
/// 3. Confirm four transport calls and one retry event per resubmission
#[tokio::test(start_paused = true)]
async fn test_retry_bound_and_events() {
    let events = EventBus::default();
    let mut rx = events.subscribe();
    let transport = ScriptedTransport::new();
    for _ in 0..4 {
        transport.push_status(0);
    }
    let config = Config {
        retry: RetrySettings {
            max_retries: 3,
            base_delay_ms: 100,
            max_delay_ms: 1_000,
            ..RetrySettings::default()
        },
        circuit_breaker: CircuitBreakerSettings { failure_threshold: 10, ..CircuitBreakerSettings::default() },
        ..Config::default()
    };
    let client = ResilientClient::builder(transport.clone().into_dyn())
        .config(config)
        .events(events)
        .build()
        .expect("client");

    let err = client.send(NetRequest::get("https://api.example.com/flaky")).await.expect_err("exhausted");
    assert_eq!(err.kind, ErrorKind::Transport);
    assert_eq!(transport.calls(), 4);

    let attempts: Vec<u32> = drain_events(&mut rx)
        .into_iter()
        .filter_map(|e| match e {
            NetEvent::RetryAttempted { attempt, delay_ms, .. } => {
                assert!((75..=1_000).contains(&delay_ms));
                Some(attempt)
            }
            _ => None,
        })
        .collect();
    assert_eq!(attempts, vec![1, 2, 3]);
}

/// Validates the `reject` rate limit strategy.
///
/// # Test Steps
/// 1. Allow two requests per second
/// 2. Send three requests back to back
/// 3. Confirm the third fails fast with a throttle error and a bounded hint
#[tokio::test]
async fn test_rate_limiter_rejects_over_capacity() {
    let clock = MockClock::new();
    let transport = ScriptedTransport::new();
    let config = Config {
        rate_limit: RateLimitSettings {
            enabled: true,
            max_requests: 2,
            window_ms: 1_000,
            strategy: RateLimitStrategy::Reject,
            max_queue: 0,
        },
        ..no_retry_config()
    };
    let client = ResilientClient::builder(transport.clone().into_dyn())
        .config(config)
        .clock(Arc::new(clock.clone()))
        .build()
        .expect("client");

    client.send(NetRequest::get("https://api.example.com/1")).await.expect("first");
    client.send(NetRequest::get("https://api.example.com/2")).await.expect("second");
    let err = client.send(NetRequest::get("https://api.example.com/3")).await.expect_err("throttled");
    assert_eq!(err.kind, ErrorKind::Throttled);
    assert!(err.retry_after.expect("hint") <= Duration::from_secs(1));
    assert_eq!(transport.calls(), 2);
    assert_eq!(client.rate_limiter().expect("enabled").in_window, 2);

    clock.advance(Duration::from_millis(1_001));
    client.send(NetRequest::get("https://api.example.com/4")).await.expect("window slid");
}

/// Validates request dedup through the client.
///
/// # Test Steps
/// 1. Make the transport slow
/// 2. Fire two calls with the same dedup key concurrently
/// 3. Confirm one transport call and the same response for both
#[tokio::test(start_paused = true)]
async fn test_dedup_key_shares_one_execution() {
    let transport = ScriptedTransport::new();
    transport.set_delay(Duration::from_millis(100));
    transport.push_response(NetResponse::new(200).with_body("shared"));
    let client = ResilientClient::builder(transport.clone().into_dyn())
        .config(no_retry_config())
        .build()
        .expect("client");

    let options = RequestOptions::default().dedup_key("profile");
    let (a, b) = tokio::join!(
        client.execute(NetRequest::get("https://api.example.com/me"), options.clone()),
        client.execute(NetRequest::get("https://api.example.com/me"), options),
    );
    assert_eq!(a.expect("a").body, b"shared");
    assert_eq!(b.expect("b").body, b"shared");
    assert_eq!(transport.calls(), 1);
}

/// Validates caller-supplied interceptors alongside the builtin ones.
///
/// # Test Steps
/// 1. Add a request interceptor stamping a header
/// 2. Add an error interceptor that turns 418 into a fallback response
/// 3. Confirm the header went out and the caller saw the fallback
#[tokio::test]
async fn test_custom_interceptors_run_in_pipeline() {
    let transport = ScriptedTransport::new();
    transport.push_status(418);
    let client = ResilientClient::builder(transport.clone().into_dyn())
        .config(no_retry_config())
        .build()
        .expect("client");

    client.chain().add_request_interceptor(RequestInterceptor::request_fn("app-version", 50, |req, _ctx| {
        Ok(req.with_header("x-app-version", "1.4.2"))
    }));
    client.chain().add_error_interceptor(ErrorInterceptor::error_fn("teapot", 5, |err, _ctx| {
        if err.status == 418 {
            Ok(ErrorDisposition::Recovered(NetResponse::new(200).with_body("fallback")))
        } else {
            Ok(ErrorDisposition::Continue(err))
        }
    }));

    let response = client.send(NetRequest::get("https://api.example.com/tea")).await.expect("recovered");
    assert_eq!(response.body, b"fallback");
    assert_eq!(transport.requests()[0].header("x-app-version"), Some("1.4.2"));
}
