//! Integration tests for configuration loader
//!
//! Tests the end-to-end behavior of loading configuration from files and
//! layering environment overrides on top.

use std::collections::HashMap;
use std::fs;

use netguard_domain::{LogFormat, NetguardError, RateLimitStrategy};
use netguard_infra::config;
use tempfile::TempDir;

/// Validates `load_from_file` for a partial TOML file.
///
/// # Test Steps
/// 1. Write a TOML file setting a handful of fields in several sections
/// 2. Load it
/// 3. Verify the set fields and that every other field kept its default
#[test]
fn partial_toml_file_keeps_defaults() {
    let dir = TempDir::new().expect("temp dir");
    let path = dir.path().join("netguard.toml");
    fs::write(
        &path,
        r#"
[circuit_breaker]
failure_threshold = 3
reset_timeout_ms = 10000

[retry]
max_retries = 5
jitter = false

[rate_limit]
strategy = "reject"
max_requests = 20

[database]
path = "/var/lib/netguard/offline.db"

[logging]
format = "json"
"#,
    )
    .expect("write config");

    let loaded = config::load_from_file(Some(path)).expect("config loads");
    let defaults = netguard_domain::Config::default();

    assert_eq!(loaded.circuit_breaker.failure_threshold, 3);
    assert_eq!(loaded.circuit_breaker.reset_timeout_ms, 10_000);
    assert_eq!(loaded.circuit_breaker.success_threshold, defaults.circuit_breaker.success_threshold);
    assert_eq!(loaded.retry.max_retries, 5);
    assert!(!loaded.retry.jitter);
    assert_eq!(loaded.retry.base_delay_ms, defaults.retry.base_delay_ms);
    assert_eq!(loaded.rate_limit.strategy, RateLimitStrategy::Reject);
    assert_eq!(loaded.rate_limit.max_requests, 20);
    assert_eq!(loaded.database.path, "/var/lib/netguard/offline.db");
    assert_eq!(loaded.database.pool_size, defaults.database.pool_size);
    assert_eq!(loaded.logging.format, LogFormat::Json);
    assert_eq!(loaded.queue, defaults.queue);
    assert_eq!(loaded.offline, defaults.offline);
    loaded.validate().expect("loaded config is valid");
}

/// Validates `load_from_file` for a JSON file.
///
/// # Test Steps
/// 1. Write the same kind of partial document as JSON
/// 2. Load it and verify the parsed values
#[test]
fn json_file_is_parsed_by_extension() {
    let dir = TempDir::new().expect("temp dir");
    let path = dir.path().join("netguard.json");
    fs::write(
        &path,
        r#"{
            "queue": { "concurrency": 2, "max_depth": 40 },
            "offline": { "enabled": false, "max_size": 10 },
            "transport": { "timeout_ms": 2500 }
        }"#,
    )
    .expect("write config");

    let loaded = config::load_from_file(Some(path)).expect("config loads");
    assert_eq!(loaded.queue.concurrency, 2);
    assert_eq!(loaded.queue.max_depth, 40);
    assert!(!loaded.offline.enabled);
    assert_eq!(loaded.offline.max_size, 10);
    assert_eq!(loaded.transport.timeout_ms, 2_500);
}

/// Validates `load_from_file` error reporting for malformed content.
///
/// # Test Steps
/// 1. Write a TOML file with a type error
/// 2. Write a file with an unsupported extension
/// 3. Verify both produce `NetguardError::Config`
#[test]
fn malformed_files_are_config_errors() {
    let dir = TempDir::new().expect("temp dir");

    let bad_toml = dir.path().join("bad.toml");
    fs::write(&bad_toml, "[retry]\nmax_retries = \"many\"\n").expect("write config");
    let err = config::load_from_file(Some(bad_toml)).expect_err("type error");
    assert!(matches!(err, NetguardError::Config(_)), "got {err:?}");

    let yaml = dir.path().join("netguard.yaml");
    fs::write(&yaml, "retry: {}\n").expect("write config");
    let err = config::load_from_file(Some(yaml)).expect_err("unsupported format");
    match err {
        NetguardError::Config(msg) => assert!(msg.contains("yaml"), "message: {msg}"),
        other => panic!("expected Config error, got {other:?}"),
    }
}

/// Validates env overrides layered over a file.
///
/// # Test Steps
/// 1. Load a TOML file
/// 2. Apply overrides from a map standing in for the environment
/// 3. Verify overrides win and untouched file values survive
#[test]
fn overrides_apply_on_top_of_file_values() {
    let dir = TempDir::new().expect("temp dir");
    let path = dir.path().join("netguard.toml");
    fs::write(&path, "[retry]\nmax_retries = 5\nbase_delay_ms = 250\n").expect("write config");

    let mut loaded = config::load_from_file(Some(path)).expect("config loads");
    let env: HashMap<&str, &str> =
        HashMap::from([("NETGUARD_RETRY_MAX_ATTEMPTS", "1"), ("NETGUARD_LOG_LEVEL", "debug")]);
    config::apply_overrides_from(&mut loaded, |key| env.get(key).map(|v| (*v).to_string()))
        .expect("overrides apply");

    assert_eq!(loaded.retry.max_retries, 1);
    assert_eq!(loaded.retry.base_delay_ms, 250);
    assert_eq!(loaded.logging.level, "debug");
}
