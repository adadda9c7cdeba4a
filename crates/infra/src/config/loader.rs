//! Configuration loader
//!
//! Builds a [`Config`] from an optional file plus environment overrides.
//!
//! ## Loading Strategy
//! 1. Start from the first config file found (or the built-in defaults)
//! 2. Overlay any `NETGUARD_*` environment variables
//! 3. Validate the result
//!
//! ## File Locations
//! `NETGUARD_CONFIG` names an explicit file. Otherwise the loader probes, in
//! order: `./netguard.toml`, `./netguard.json`, `./config/netguard.toml`.
//! The format is chosen by extension.
//!
//! ## Environment Variables
//! - `NETGUARD_DB_PATH`, `NETGUARD_DB_POOL_SIZE`
//! - `NETGUARD_BREAKER_FAILURE_THRESHOLD`, `NETGUARD_BREAKER_SUCCESS_THRESHOLD`,
//!   `NETGUARD_BREAKER_RESET_TIMEOUT_MS`
//! - `NETGUARD_RETRY_MAX_ATTEMPTS`, `NETGUARD_RETRY_BASE_DELAY_MS`,
//!   `NETGUARD_RETRY_MAX_DELAY_MS`, `NETGUARD_RETRY_JITTER`
//! - `NETGUARD_RATE_LIMIT_ENABLED`, `NETGUARD_RATE_LIMIT_MAX_REQUESTS`,
//!   `NETGUARD_RATE_LIMIT_WINDOW_MS`, `NETGUARD_RATE_LIMIT_STRATEGY`
//! - `NETGUARD_QUEUE_CONCURRENCY`, `NETGUARD_QUEUE_MAX_DEPTH`
//! - `NETGUARD_OFFLINE_ENABLED`, `NETGUARD_OFFLINE_MAX_SIZE`,
//!   `NETGUARD_OFFLINE_TTL_MS`
//! - `NETGUARD_TRANSPORT_TIMEOUT_MS`
//! - `NETGUARD_LOG_LEVEL`, `NETGUARD_LOG_FORMAT`

use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use netguard_domain::{Config, LogFormat, NetguardError, RateLimitStrategy, Result};

use crate::errors::InfraError;

/// Environment variable naming an explicit config file.
pub const CONFIG_PATH_VAR: &str = "NETGUARD_CONFIG";

/// Load configuration: file (if any), then environment, then validation.
///
/// # Errors
/// Returns `NetguardError::Config` if a file is unreadable or malformed, an
/// environment value does not parse, or the merged result fails validation.
pub fn load() -> Result<Config> {
    let mut config = match probe_config_paths() {
        Some(path) => load_from_file(Some(path))?,
        None => {
            tracing::debug!("No config file found, starting from defaults");
            Config::default()
        }
    };
    apply_env_overrides(&mut config)?;
    config.validate()?;
    Ok(config)
}

/// Load configuration from a file
///
/// If `path` is `None`, probes the standard locations.
///
/// # Errors
/// Returns `NetguardError::Config` if the file is missing, unreadable or
/// malformed.
pub fn load_from_file(path: Option<PathBuf>) -> Result<Config> {
    let config_path = match path {
        Some(p) => {
            if !p.exists() {
                return Err(NetguardError::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            p
        }
        None => probe_config_paths().ok_or_else(|| {
            NetguardError::Config("No config file found in any of the standard locations".into())
        })?,
    };

    tracing::info!(path = %config_path.display(), "Loading configuration from file");

    let contents = std::fs::read_to_string(&config_path)
        .map_err(|e| NetguardError::Config(format!("Failed to read config file: {e}")))?;

    parse_config(&contents, &config_path)
}

/// Parse configuration text; the format comes from the file extension.
fn parse_config(contents: &str, path: &Path) -> Result<Config> {
    let extension = path.extension().and_then(|e| e.to_str()).unwrap_or("toml");

    match extension {
        "toml" => toml::from_str(contents).map_err(|e| NetguardError::from(InfraError::from(e))),
        "json" => serde_json::from_str(contents)
            .map_err(|e| NetguardError::Config(format!("Invalid JSON format: {e}"))),
        _ => Err(NetguardError::Config(format!("Unsupported config format: {extension}"))),
    }
}

/// First existing config file, honouring `NETGUARD_CONFIG`.
pub fn probe_config_paths() -> Option<PathBuf> {
    if let Ok(explicit) = std::env::var(CONFIG_PATH_VAR) {
        return Some(PathBuf::from(explicit));
    }

    let cwd = std::env::current_dir().ok()?;
    candidate_paths(&cwd).into_iter().find(|path| path.exists())
}

fn candidate_paths(base: &Path) -> Vec<PathBuf> {
    vec![
        base.join("netguard.toml"),
        base.join("netguard.json"),
        base.join("config").join("netguard.toml"),
    ]
}

/// Overlay `NETGUARD_*` environment variables onto `config`.
pub fn apply_env_overrides(config: &mut Config) -> Result<()> {
    apply_overrides_from(config, |key| std::env::var(key).ok())
}

/// Overlay values from an arbitrary lookup (the environment in production).
pub fn apply_overrides_from<F>(config: &mut Config, lookup: F) -> Result<()>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(path) = lookup("NETGUARD_DB_PATH") {
        config.database.path = path;
    }
    if let Some(v) = parse_var(&lookup, "NETGUARD_DB_POOL_SIZE")? {
        config.database.pool_size = v;
    }

    if let Some(v) = parse_var(&lookup, "NETGUARD_BREAKER_FAILURE_THRESHOLD")? {
        config.circuit_breaker.failure_threshold = v;
    }
    if let Some(v) = parse_var(&lookup, "NETGUARD_BREAKER_SUCCESS_THRESHOLD")? {
        config.circuit_breaker.success_threshold = v;
    }
    if let Some(v) = parse_var(&lookup, "NETGUARD_BREAKER_RESET_TIMEOUT_MS")? {
        config.circuit_breaker.reset_timeout_ms = v;
    }

    if let Some(v) = parse_var(&lookup, "NETGUARD_RETRY_MAX_ATTEMPTS")? {
        config.retry.max_retries = v;
    }
    if let Some(v) = parse_var(&lookup, "NETGUARD_RETRY_BASE_DELAY_MS")? {
        config.retry.base_delay_ms = v;
    }
    if let Some(v) = parse_var(&lookup, "NETGUARD_RETRY_MAX_DELAY_MS")? {
        config.retry.max_delay_ms = v;
    }
    if let Some(v) = parse_bool(&lookup, "NETGUARD_RETRY_JITTER")? {
        config.retry.jitter = v;
    }

    if let Some(v) = parse_bool(&lookup, "NETGUARD_RATE_LIMIT_ENABLED")? {
        config.rate_limit.enabled = v;
    }
    if let Some(v) = parse_var(&lookup, "NETGUARD_RATE_LIMIT_MAX_REQUESTS")? {
        config.rate_limit.max_requests = v;
    }
    if let Some(v) = parse_var(&lookup, "NETGUARD_RATE_LIMIT_WINDOW_MS")? {
        config.rate_limit.window_ms = v;
    }
    if let Some(raw) = lookup("NETGUARD_RATE_LIMIT_STRATEGY") {
        config.rate_limit.strategy = parse_strategy(&raw)?;
    }

    if let Some(v) = parse_var(&lookup, "NETGUARD_QUEUE_CONCURRENCY")? {
        config.queue.concurrency = v;
    }
    if let Some(v) = parse_var(&lookup, "NETGUARD_QUEUE_MAX_DEPTH")? {
        config.queue.max_depth = v;
    }

    if let Some(v) = parse_bool(&lookup, "NETGUARD_OFFLINE_ENABLED")? {
        config.offline.enabled = v;
    }
    if let Some(v) = parse_var(&lookup, "NETGUARD_OFFLINE_MAX_SIZE")? {
        config.offline.max_size = v;
    }
    if let Some(v) = parse_var(&lookup, "NETGUARD_OFFLINE_TTL_MS")? {
        config.offline.default_ttl_ms = v;
    }

    if let Some(v) = parse_var(&lookup, "NETGUARD_TRANSPORT_TIMEOUT_MS")? {
        config.transport.timeout_ms = v;
    }

    if let Some(level) = lookup("NETGUARD_LOG_LEVEL") {
        config.logging.level = level;
    }
    if let Some(raw) = lookup("NETGUARD_LOG_FORMAT") {
        config.logging.format = parse_log_format(&raw)?;
    }

    Ok(())
}

fn parse_var<F, T>(lookup: &F, key: &str) -> Result<Option<T>>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: Display,
{
    lookup(key)
        .map(|raw| {
            raw.trim()
                .parse::<T>()
                .map_err(|e| NetguardError::Config(format!("Invalid value for {key} ({raw}): {e}")))
        })
        .transpose()
}

/// Accepts `1`/`0`, `true`/`false`, `yes`/`no`, `on`/`off` (case-insensitive).
fn parse_bool<F>(lookup: &F, key: &str) -> Result<Option<bool>>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .map(|raw| match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(NetguardError::Config(format!("Invalid boolean for {key}: {raw}"))),
        })
        .transpose()
}

fn parse_strategy(raw: &str) -> Result<RateLimitStrategy> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "reject" => Ok(RateLimitStrategy::Reject),
        "queue" => Ok(RateLimitStrategy::Queue),
        "delay" => Ok(RateLimitStrategy::Delay),
        _ => Err(NetguardError::Config(format!("Invalid rate limit strategy: {raw}"))),
    }
}

fn parse_log_format(raw: &str) -> Result<LogFormat> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "pretty" => Ok(LogFormat::Pretty),
        "json" => Ok(LogFormat::Json),
        _ => Err(NetguardError::Config(format!("Invalid log format: {raw}"))),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use tempfile::TempDir;

    use super::*;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> =
            pairs.iter().map(|(k, v)| ((*k).to_string(), (*v).to_string())).collect();
        move |key| map.get(key).cloned()
    }

    /// Validates `apply_overrides_from` behavior for the environment overlay
    /// scenario.
    ///
    /// Assertions:
    /// - Confirms numeric, boolean and enum values land in their sections.
    /// - Ensures untouched fields keep their previous values.
    #[test]
    fn overrides_apply_on_top_of_existing_values() {
        let mut config = Config::default();
        config.queue.concurrency = 9;
        let lookup = lookup_from(&[
            ("NETGUARD_DB_PATH", "/var/lib/netguard/queue.db"),
            ("NETGUARD_RETRY_MAX_ATTEMPTS", "5"),
            ("NETGUARD_RETRY_JITTER", "off"),
            ("NETGUARD_RATE_LIMIT_MAX_REQUESTS", " 20 "),
            ("NETGUARD_RATE_LIMIT_STRATEGY", "Delay"),
            ("NETGUARD_OFFLINE_ENABLED", "0"),
            ("NETGUARD_LOG_LEVEL", "netguard=debug"),
            ("NETGUARD_LOG_FORMAT", "json"),
        ]);

        apply_overrides_from(&mut config, lookup).expect("overrides apply");

        assert_eq!(config.database.path, "/var/lib/netguard/queue.db");
        assert_eq!(config.retry.max_retries, 5);
        assert!(!config.retry.jitter);
        assert_eq!(config.rate_limit.max_requests, 20);
        assert_eq!(config.rate_limit.strategy, RateLimitStrategy::Delay);
        assert!(!config.offline.enabled);
        assert_eq!(config.logging.level, "netguard=debug");
        assert_eq!(config.logging.format, LogFormat::Json);
        assert_eq!(config.queue.concurrency, 9);
    }

    #[test]
    fn malformed_values_are_config_errors() {
        for (key, value) in [
            ("NETGUARD_DB_POOL_SIZE", "many"),
            ("NETGUARD_RETRY_JITTER", "sometimes"),
            ("NETGUARD_RATE_LIMIT_STRATEGY", "drop"),
            ("NETGUARD_LOG_FORMAT", "xml"),
        ] {
            let mut config = Config::default();
            let err = apply_overrides_from(&mut config, lookup_from(&[(key, value)]))
                .expect_err("malformed value rejected");
            assert!(matches!(err, NetguardError::Config(ref msg) if msg.contains(value)), "{key}");
        }
    }

    #[test]
    fn parse_config_picks_format_by_extension() {
        let toml = parse_config("[retry]\nmax_retries = 1\n", Path::new("netguard.toml"))
            .expect("toml parses");
        assert_eq!(toml.retry.max_retries, 1);

        let json = parse_config(r#"{"retry": {"max_retries": 2}}"#, Path::new("netguard.json"))
            .expect("json parses");
        assert_eq!(json.retry.max_retries, 2);

        let err = parse_config("", Path::new("netguard.yaml")).expect_err("yaml unsupported");
        assert!(matches!(err, NetguardError::Config(msg) if msg.contains("yaml")));
    }

    #[test]
    fn candidate_paths_follow_probe_order() {
        let dir = TempDir::new().expect("temp dir");
        let paths = candidate_paths(dir.path());
        assert_eq!(paths[0], dir.path().join("netguard.toml"));
        assert_eq!(paths[1], dir.path().join("netguard.json"));
        assert_eq!(paths[2], dir.path().join("config/netguard.toml"));
    }

    #[test]
    fn missing_explicit_file_is_an_error() {
        let dir = TempDir::new().expect("temp dir");
        let err = load_from_file(Some(dir.path().join("absent.toml"))).expect_err("missing");
        assert!(matches!(err, NetguardError::Config(msg) if msg.contains("not found")));
    }
}
