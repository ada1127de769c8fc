//! Logging setup shared by the binaries.
//!
//! Events go to stderr so that stdout stays free for the JSON run report.

use std::env;
use std::io;

use thiserror::Error;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

pub const LOG_LEVEL_ENV: &str = "CHURN_LOG_LEVEL";
pub const LOG_FORMAT_ENV: &str = "CHURN_LOG_FORMAT";
pub const LOG_TARGET_ENV: &str = "CHURN_LOG_TARGET";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Pretty,
    /// One line per event, for batch jobs whose stderr goes to a file.
    Compact,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingConfig {
    /// An `EnvFilter` directive, e.g. `info` or `churn_features=debug`.
    pub level: String,
    pub format: LogFormat,
    pub include_target: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Compact,
            include_target: false,
        }
    }
}

#[derive(Debug, Error)]
pub enum LoggingInitError {
    #[error("logging already initialized: {0}")]
    AlreadyInitialized(#[from] tracing::subscriber::SetGlobalDefaultError),
}

pub fn logging_config_from_env() -> LoggingConfig {
    let mut config = LoggingConfig::default();

    if let Ok(level) = env::var(LOG_LEVEL_ENV) {
        let trimmed = level.trim();
        if !trimmed.is_empty() {
            config.level = trimmed.to_string();
        }
    }
    if let Some(format) = env::var(LOG_FORMAT_ENV).ok().and_then(|raw| parse_log_format(&raw)) {
        config.format = format;
    }
    if let Some(include_target) = env::var(LOG_TARGET_ENV).ok().and_then(|raw| parse_bool(&raw)) {
        config.include_target = include_target;
    }

    config
}

pub fn init_logging(config: &LoggingConfig) -> Result<(), LoggingInitError> {
    let env_filter =
        EnvFilter::try_new(config.level.clone()).unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(io::stderr)
        .with_target(config.include_target)
        .with_ansi(matches!(config.format, LogFormat::Pretty));

    match config.format {
        LogFormat::Json => tracing::subscriber::set_global_default(builder.json().finish())?,
        LogFormat::Pretty => tracing::subscriber::set_global_default(builder.pretty().finish())?,
        LogFormat::Compact => tracing::subscriber::set_global_default(builder.compact().finish())?,
    }

    Ok(())
}

pub fn log_app_start(binary: &str, config: &LoggingConfig) {
    info!(
        component = binary,
        event = "app.start",
        log_level = %config.level,
        log_format = ?config.format,
        include_target = config.include_target
    );
}

pub fn log_app_finish(binary: &str, elapsed_ms: u64) {
    info!(component = binary, event = "app.finish", elapsed_ms);
}

pub fn log_app_error(binary: &str, err: &dyn std::error::Error) {
    error!(component = binary, event = "app.error", error = %err);
}

fn parse_log_format(raw: &str) -> Option<LogFormat> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "json" => Some(LogFormat::Json),
        "pretty" => Some(LogFormat::Pretty),
        "compact" | "text" => Some(LogFormat::Compact),
        _ => None,
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
