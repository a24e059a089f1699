//! Tracing subscriber setup for the `dialq` binary and tests

use std::str::FromStr;

use tracing::Level;
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::LoggingConfig;
use crate::error::{CallCenterError, Result};

/// Parse a log level from a string
pub fn parse_log_level(level: &str) -> Result<Level> {
    Level::from_str(level).map_err(|_| CallCenterError::configuration(format!("Invalid log level: {}", level)))
}

/// Filter from `RUST_LOG` when set, otherwise the configured level for this
/// crate and `warn` for everything else
pub fn build_filter(config: &LoggingConfig) -> Result<EnvFilter> {
    let level = parse_log_level(&config.level)?;
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => EnvFilter::try_new(format!("warn,dialq_call_engine={},dialq={}", level, level))
            .map_err(|e| CallCenterError::configuration(format!("Invalid log filter: {}", e))),
    }
}

/// Install the global subscriber. Fails if one is already installed.
pub fn setup_logging(config: &LoggingConfig) -> Result<()> {
    let filter = build_filter(config)?;
    let builder = fmt::Subscriber::builder().with_env_filter(filter).with_target(false);

    let installed = if config.json {
        builder.with_writer(std::io::stdout).json().try_init()
    } else {
        builder.try_init()
    };
    installed.map_err(|e| CallCenterError::configuration(format!("Logging already initialized: {}", e)))
}

/// Best-effort subscriber for tests; repeated calls are harmless
pub fn init_test_logging() {
    let _ = fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn log_welcome(instance: &str) {
    tracing::info!("🚀 Starting {} v{}", instance, env!("CARGO_PKG_VERSION"));
}
