//! Logging configuration and initialization
//!
//! This module provides centralized logging setup using the `tracing` ecosystem.
//! It supports both human-readable and JSON output formats, configurable via
//! environment variables or programmatically. Backend paths that hand control
//! to native plugin libraries initialize logging first so library diagnostics
//! land in a configured subscriber instead of raw stderr.
//!
//! # Environment Variables
//!
//! - `RUST_LOG`: Standard tracing filter (e.g., "info", "debug,accelforge=trace")
//! - `ACCELFORGE_LOG_LEVEL`: Simple log level (error, warn, info, debug, trace)
//! - `ACCELFORGE_LOG_FORMAT`: Output format ("human" or "json")
//! - `ACCELFORGE_LOG_FILE`: Optional file path for JSON log output

use once_cell::sync::OnceCell;
use std::path::PathBuf;
use thiserror::Error;
use tracing_subscriber::{
    fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter,
};

/// Global flag to track if tracing has been initialized
static TRACING_INITIALIZED: OnceCell<()> = OnceCell::new();

/// Environment variable for log level override
pub const LOG_LEVEL_ENV: &str = "ACCELFORGE_LOG_LEVEL";

/// Environment variable for log format (json/human)
pub const LOG_FORMAT_ENV: &str = "ACCELFORGE_LOG_FORMAT";

/// Environment variable for log file path
pub const LOG_FILE_ENV: &str = "ACCELFORGE_LOG_FILE";

/// Errors that can occur during logging initialization
#[derive(Debug, Error)]
pub enum LoggingError {
    /// Invalid filter expression in RUST_LOG
    #[error("invalid log filter: {0}")]
    InvalidFilter(String),

    /// Failed to create log file directory
    #[error("failed to create log directory: {0}")]
    DirectoryCreationFailed(String),

    /// Failed to open log file
    #[error("failed to open log file: {0}")]
    FileOpenFailed(String),
}

/// Log level enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogLevel {
    /// Error level
    Error,
    /// Warning level
    Warn,
    /// Info level (default)
    #[default]
    Info,
    /// Debug level
    Debug,
    /// Trace level
    Trace,
}

impl LogLevel {
    /// Parse from string
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "error" => Some(LogLevel::Error),
            "warn" | "warning" => Some(LogLevel::Warn),
            "info" => Some(LogLevel::Info),
            "debug" => Some(LogLevel::Debug),
            "trace" => Some(LogLevel::Trace),
            _ => None,
        }
    }

    /// Convert to EnvFilter string
    pub fn as_filter_str(&self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

/// Log format enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Human-readable output (default)
    #[default]
    Human,
    /// JSON structured output
    Json,
}

impl LogFormat {
    /// Parse from string
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "human" | "pretty" | "console" => Some(LogFormat::Human),
            "json" | "structured" => Some(LogFormat::Json),
            _ => None,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Default)]
pub struct LoggingConfig {
    /// Log level to use
    pub level: LogLevel,
    /// Output format
    pub format: LogFormat,
    /// Whether to include file/line in logs
    pub with_file_info: bool,
    /// Optional file path for JSON log output
    pub log_file: Option<PathBuf>,
}

impl LoggingConfig {
    /// Create a new default logging configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the log level
    pub fn with_level(mut self, level: LogLevel) -> Self {
        self.level = level;
        self
    }

    /// Set the log format
    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    /// Enable or disable file/line information
    pub fn with_file_info(mut self, with_file_info: bool) -> Self {
        self.with_file_info = with_file_info;
        self
    }

    /// Set the log file path for output
    pub fn with_log_file(mut self, path: PathBuf) -> Self {
        self.log_file = Some(path);
        self
    }

    /// Build a configuration from the ACCELFORGE_LOG_* environment variables
    pub fn from_env() -> Self {
        let level = std::env::var(LOG_LEVEL_ENV)
            .ok()
            .and_then(|s| LogLevel::from_str(&s))
            .unwrap_or_default();
        let format = std::env::var(LOG_FORMAT_ENV)
            .ok()
            .and_then(|s| LogFormat::from_str(&s))
            .unwrap_or_default();
        let log_file = std::env::var(LOG_FILE_ENV).ok().map(PathBuf::from);
        Self {
            level,
            format,
            with_file_info: false,
            log_file,
        }
    }
}

/// Initialize logging with environment-derived configuration.
///
/// Swallows initialization errors; backend paths call this before handing
/// control to native libraries and must not fail the bootstrap over logging.
///
/// This function is idempotent.
pub fn init_logging_default() {
    TRACING_INITIALIZED.get_or_init(|| {
        let _ = init_internal(&LoggingConfig::from_env());
    });
}

/// Initialize logging with a custom configuration.
///
/// This function is idempotent; the first caller wins.
pub fn init_with_config(config: &LoggingConfig) {
    TRACING_INITIALIZED.get_or_init(|| {
        let _ = init_internal(config);
    });
}

/// Internal initialization that can return errors
fn init_internal(config: &LoggingConfig) -> Result<(), LoggingError> {
    let env_filter = build_env_filter(config.level)?;

    let file = match &config.log_file {
        Some(path) => Some(open_log_file(path)?),
        None => None,
    };

    match (config.format, file) {
        (LogFormat::Json, Some(file)) => {
            let console = fmt::layer()
                .json()
                .with_target(false)
                .with_file(config.with_file_info)
                .with_line_number(config.with_file_info);
            tracing_subscriber::registry()
                .with(env_filter)
                .with(console)
                .with(json_file_layer(file))
                .init();
        }
        (LogFormat::Json, None) => {
            let console = fmt::layer()
                .json()
                .with_target(false)
                .with_file(config.with_file_info)
                .with_line_number(config.with_file_info);
            tracing_subscriber::registry()
                .with(env_filter)
                .with(console)
                .init();
        }
        (LogFormat::Human, Some(file)) => {
            let console = fmt::layer()
                .with_target(true)
                .with_file(config.with_file_info)
                .with_line_number(config.with_file_info);
            tracing_subscriber::registry()
                .with(env_filter)
                .with(console)
                .with(json_file_layer(file))
                .init();
        }
        (LogFormat::Human, None) => {
            let console = fmt::layer()
                .with_target(true)
                .with_file(config.with_file_info)
                .with_line_number(config.with_file_info);
            tracing_subscriber::registry()
                .with(env_filter)
                .with(console)
                .init();
        }
    }

    Ok(())
}

/// Open the log file, creating parent directories as needed
fn open_log_file(path: &PathBuf) -> Result<std::fs::File, LoggingError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| LoggingError::DirectoryCreationFailed(e.to_string()))?;
    }
    std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| LoggingError::FileOpenFailed(e.to_string()))
}

/// File output is always JSON regardless of console format
fn json_file_layer<S>(file: std::fs::File) -> impl tracing_subscriber::Layer<S>
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
{
    fmt::layer()
        .json()
        .with_writer(file)
        .with_target(false)
        .with_file(true)
        .with_line_number(true)
        .with_ansi(false)
}

/// Build the environment filter for log level.
/// Tries RUST_LOG first (standard tracing convention), then ACCELFORGE_LOG_LEVEL.
fn build_env_filter(default_level: LogLevel) -> Result<EnvFilter, LoggingError> {
    if let Ok(rust_log) = std::env::var("RUST_LOG") {
        return EnvFilter::try_new(rust_log)
            .map_err(|e| LoggingError::InvalidFilter(e.to_string()));
    }

    if let Ok(level) = std::env::var(LOG_LEVEL_ENV) {
        if let Some(level) = LogLevel::from_str(&level) {
            return Ok(EnvFilter::new(level.as_filter_str()));
        }
    }

    Ok(EnvFilter::new(default_level.as_filter_str()))
}

/// Check if tracing has been initialized
pub fn is_initialized() -> bool {
    TRACING_INITIALIZED.get().is_some()
}
