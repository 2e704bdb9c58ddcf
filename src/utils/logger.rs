//! Logging setup for the MeshPhone agent

use std::path::Path;

use tracing::info;
use tracing_appender::{non_blocking, non_blocking::WorkerGuard, rolling};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::config::{LogFormat, LoggingConfig};
use crate::Result;

/// Setup logging based on configuration. Returns the worker guard that
/// keeps the non-blocking file writer alive for the process lifetime.
pub fn setup_logging(config: &LoggingConfig) -> Result<Option<WorkerGuard>> {
    let directive = level_directive(&config.level)?;

    let env_filter = EnvFilter::builder()
        .with_default_directive(directive.parse().map_err(|e| {
            crate::Error::config(format!("bad log directive: {}", e))
        })?)
        .from_env_lossy();

    let registry = tracing_subscriber::registry().with(env_filter);

    let mut guard = None;
    match &config.file {
        Some(file_path) => {
            let file_path = Path::new(file_path);
            let directory = file_path
                .parent()
                .ok_or_else(|| crate::Error::config("Invalid log file path"))?;

            let file_appender = rolling::RollingFileAppender::builder()
                .rotation(rolling::Rotation::DAILY)
                .filename_suffix("log")
                .build(directory)
                .map_err(|e| {
                    crate::Error::internal(format!("Failed to create file appender: {}", e))
                })?;

            let (file_writer, file_guard) = non_blocking(file_appender);
            guard = Some(file_guard);

            let file_layer = match config.format {
                LogFormat::Json => fmt::layer().json().with_writer(file_writer).boxed(),
                LogFormat::Compact => fmt::layer().compact().with_writer(file_writer).boxed(),
                LogFormat::Full => fmt::layer().with_writer(file_writer).boxed(),
            };

            let console_layer = match config.format {
                LogFormat::Json => fmt::layer().json().with_writer(std::io::stdout).boxed(),
                LogFormat::Compact => fmt::layer().compact().with_writer(std::io::stdout).boxed(),
                LogFormat::Full => fmt::layer().with_writer(std::io::stdout).boxed(),
            };

            registry.with(file_layer).with(console_layer).init();
        }
        None => {
            let console_layer = match config.format {
                LogFormat::Json => fmt::layer().json().boxed(),
                LogFormat::Compact => fmt::layer().compact().boxed(),
                LogFormat::Full => fmt::layer().boxed(),
            };

            registry.with(console_layer).init();
        }
    }

    info!("Logging initialized with level: {}", config.level);
    Ok(guard)
}

/// Map the agent's configured level names onto tracing filter directives.
fn level_directive(level: &str) -> Result<&'static str> {
    match level.to_ascii_uppercase().as_str() {
        "ERROR" => Ok("error"),
        "WARNING" => Ok("warn"),
        "INFO" => Ok("info"),
        "DEBUG" => Ok("debug"),
        "NONE" => Ok("off"),
        _ => Err(crate::Error::config("Invalid log level")),
    }
}
