//! Logging system initialization and configuration
//!
//! Uses the tracing ecosystem for structured logging with support for:
//! - Environment variable override (DEVTRACE_LOG)
//! - File output with daily rotation
//! - Optional console output on stderr
//!
//! While a bridged shell owns the terminal, anything written to stderr lands
//! in the middle of the relayed byte stream, so `shell` runs with the console
//! layer disabled and logs only to file.

use crate::config::{expand_path, LoggingConfig};
use std::path::PathBuf;
use tracing::Level;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

/// Environment variable overriding the configured filter
pub const LOG_ENV_VAR: &str = "DEVTRACE_LOG";

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
    Compact,
}

impl LogFormat {
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "json" => LogFormat::Json,
            "compact" => LogFormat::Compact,
            _ => LogFormat::Pretty,
        }
    }
}

/// Where log records go
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogTarget {
    /// stderr (if enabled) and file
    Console,
    /// File only; the terminal belongs to a bridged session
    FileOnly,
}

/// Get the default log directory path
fn default_log_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("devtrace")
        .join("logs")
}

/// Parse log level from string
pub fn parse_level(s: &str) -> Level {
    match s.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" | "warning" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    }
}

fn build_layer<S, W>(
    writer: W,
    format: LogFormat,
    config: &LoggingConfig,
    ansi: bool,
) -> Box<dyn Layer<S> + Send + Sync>
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
    W: for<'w> fmt::MakeWriter<'w> + Send + Sync + 'static,
{
    let layer = fmt::layer()
        .with_writer(writer)
        .with_target(true)
        .with_level(true)
        .with_file(config.file_line)
        .with_line_number(config.file_line)
        .with_ansi(ansi);

    match (format, config.timestamps) {
        (LogFormat::Json, _) => layer.json().with_span_events(FmtSpan::CLOSE).boxed(),
        (LogFormat::Compact, true) => layer.compact().boxed(),
        (LogFormat::Compact, false) => layer.compact().without_time().boxed(),
        (LogFormat::Pretty, true) => layer.boxed(),
        (LogFormat::Pretty, false) => layer.without_time().boxed(),
    }
}

/// Initialize the logging system
///
/// Returns `false` if a global subscriber was already installed.
///
/// # Environment Variables
/// - `DEVTRACE_LOG`: Override log level (e.g., "devtrace=debug,devtrace::bridge=trace")
pub fn init_logging(config: &LoggingConfig, target: LogTarget) -> bool {
    let env_filter = EnvFilter::try_from_env(LOG_ENV_VAR).unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "devtrace={}",
            parse_level(&config.level).as_str().to_lowercase()
        ))
    });
    let format = LogFormat::parse(&config.format);

    let console_layer = match target {
        LogTarget::Console => Some(build_layer(std::io::stderr, format, config, true)),
        LogTarget::FileOnly => None,
    };

    let file_layer = if config.file_output {
        let log_dir = config
            .file_path
            .as_deref()
            .map(expand_path)
            .unwrap_or_else(default_log_dir);

        if let Err(e) = std::fs::create_dir_all(&log_dir) {
            if target == LogTarget::Console {
                eprintln!("Warning: Failed to create log directory {:?}: {}", log_dir, e);
            }
            None
        } else {
            let file_appender = RollingFileAppender::new(Rotation::DAILY, &log_dir, "devtrace.log");
            Some(build_layer(file_appender, format, config, false))
        }
    } else {
        None
    };

    let installed = tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .is_ok();

    if installed {
        tracing::debug!(
            level = %config.level,
            format = ?format,
            file_output = config.file_output,
            target = ?target,
            "Logging initialized"
        );
    }
    installed
}
