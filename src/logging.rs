//! Tracing initialization
//!
//! Sets up the global `tracing` subscriber for the `pe-daq` binary:
//! - Multiple output formats (pretty, compact, JSON)
//! - `RUST_LOG` filtering, falling back to the configured level
//! - Idempotent initialization, safe to call from tests
//!
//! Logs go to stderr so stdout stays a clean JSON-lines document stream.
//!
//! # Example
//! ```no_run
//! use pe_daq::{config::PeDaqConfig, logging};
//! use tracing::info;
//!
//! # fn main() -> anyhow::Result<()> {
//! let config = PeDaqConfig::load()?;
//! logging::init_from_config(&config)?;
//! info!(detector = %config.detector.name, "Application started");
//! # Ok(())
//! # }
//! ```

use crate::config::{LogFormat, PeDaqConfig};
use anyhow::{anyhow, Result};
use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

/// Tracing configuration options
#[derive(Debug, Clone)]
pub struct TracingConfig {
    /// Fallback level when `RUST_LOG` is unset
    pub level: Level,
    /// Output format
    pub format: LogFormat,
    /// Whether to include span events (NEW, CLOSE)
    pub with_span_events: bool,
    /// Whether to include file and line numbers
    pub with_file_and_line: bool,
    /// Whether to enable ANSI colors (only for Pretty format)
    pub with_ansi: bool,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: LogFormat::Pretty,
            with_span_events: false,
            with_file_and_line: true,
            with_ansi: true,
        }
    }
}

impl TracingConfig {
    /// Create tracing config from the application section
    pub fn from_config(config: &PeDaqConfig) -> Result<Self> {
        Ok(Self {
            level: parse_log_level(&config.application.log_level)?,
            format: config.application.log_format,
            ..Default::default()
        })
    }

    /// Defaults at `level`
    pub fn new(level: Level) -> Self {
        Self {
            level,
            ..Default::default()
        }
    }

    /// Set the output format
    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    /// Log span open and close
    pub fn with_span_events(mut self, enabled: bool) -> Self {
        self.with_span_events = enabled;
        self
    }

    /// Colorize pretty output
    pub fn with_ansi(mut self, enabled: bool) -> Self {
        self.with_ansi = enabled;
        self
    }
}

/// Initialize tracing from the loaded configuration
pub fn init_from_config(config: &PeDaqConfig) -> Result<()> {
    init(TracingConfig::from_config(config)?)
}

/// Initialize tracing with custom configuration
///
/// Idempotent: if a global subscriber is already set this returns `Ok(())`.
pub fn init(config: TracingConfig) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.as_str().to_lowercase()));

    let span_events = if config.with_span_events {
        FmtSpan::NEW | FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };

    let base = fmt::layer()
        .with_writer(std::io::stderr)
        .with_span_events(span_events)
        .with_file(config.with_file_and_line)
        .with_line_number(config.with_file_and_line);

    let layer = match config.format {
        LogFormat::Pretty => base.pretty().with_ansi(config.with_ansi).boxed(),
        LogFormat::Compact => base.compact().with_ansi(false).boxed(),
        LogFormat::Json => base.json().boxed(),
    };

    match tracing_subscriber::registry()
        .with(layer.with_filter(env_filter))
        .try_init()
    {
        Ok(()) => Ok(()),
        // Already initialized; expected in tests
        Err(e) if e.to_string().contains("already been set") => Ok(()),
        Err(e) => Err(anyhow!("Failed to initialize tracing: {}", e)),
    }
}

/// Parse log level string into tracing Level
pub fn parse_log_level(level: &str) -> Result<Level> {
    match level.to_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        _ => Err(anyhow!(
            "Invalid log level '{}'. Must be one of: trace, debug, info, warn, error",
            level
        )),
    }
}
