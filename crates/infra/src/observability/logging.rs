//! Global `tracing` subscriber setup

use netguard_domain::{LogFormat, LoggingSettings, NetguardError, Result};
use tracing_subscriber::EnvFilter;

/// Install the process-wide subscriber.
///
/// `RUST_LOG` wins over `settings.level` when it is set and valid.
///
/// # Errors
/// Returns `NetguardError::Config` if the level directive does not parse or a
/// global subscriber is already installed.
pub fn init_logging(settings: &LoggingSettings) -> Result<()> {
    let filter = build_filter(&settings.level)?;

    let installed = match settings.format {
        LogFormat::Pretty => tracing_subscriber::fmt().with_env_filter(filter).with_target(true).try_init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_current_span(true)
            .try_init(),
    };

    installed.map_err(|e| NetguardError::Config(format!("failed to install tracing subscriber: {e}")))
}

fn build_filter(default_directive: &str) -> Result<EnvFilter> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    EnvFilter::try_new(default_directive)
        .map_err(|e| NetguardError::Config(format!("invalid log level '{default_directive}': {e}")))
}
