//! Logging setup for processes embedding Waypoint.
//!
//! Every component logs through `tracing`: state transitions at `info!`,
//! degraded paths (refresh failures, probe errors, callback panics) at
//! `warn!`, and per-call detail at `debug!`/`trace!`. This module only
//! installs a subscriber; libraries never do so on their own.
//!
//! ```no_run
//! use waypoint_core::logging::*;
//!
//! let _guard = LogConfig::new()
//!     .level(LogLevel::Debug)
//!     .format(LogFormat::Pretty)
//!     .init();
//!
//! info!("resolver starting");
//! ```

use std::io;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::Level;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::{
    EnvFilter, Layer, Registry,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

use crate::error::ConfigError;

pub use tracing::{debug, error, info, trace, warn};

/// Minimum level emitted when no `RUST_LOG` or explicit filter is present.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// Convert to tracing Level
    pub fn to_tracing_level(&self) -> Level {
        match self {
            LogLevel::Trace => Level::TRACE,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Info => Level::INFO,
            LogLevel::Warn => Level::WARN,
            LogLevel::Error => Level::ERROR,
        }
    }

    /// Directive string understood by `EnvFilter`
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

impl FromStr for LogLevel {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "trace" => Ok(LogLevel::Trace),
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            other => Err(ConfigError::invalid(
                "log.level",
                format!("unknown level `{}`", other),
            )),
        }
    }
}

/// Line format written by the subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Structured, one JSON object per event (default)
    Json,
    Plain,
    /// Multi-line, for local development
    Pretty,
    Compact,
}

/// Where log lines go.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogOutput {
    Stdout,
    Stderr,
}

/// Subscriber configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: LogLevel,
    pub format: LogFormat,
    pub output: LogOutput,
    /// Include target (module path)
    pub targets: bool,
    pub thread_ids: bool,
    /// Emit span close events with timings
    pub spans: bool,
    /// ANSI colors, ignored for JSON
    pub colors: bool,
    /// Explicit filter such as `waypoint_breaker=debug,info`; wins over `level`
    pub env_filter: Option<String>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            format: LogFormat::Json,
            output: LogOutput::Stdout,
            targets: true,
            thread_ids: false,
            spans: false,
            colors: false,
            env_filter: None,
        }
    }
}

impl LogConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn level(mut self, level: LogLevel) -> Self {
        self.level = level;
        self
    }

    pub fn format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    pub fn output(mut self, output: LogOutput) -> Self {
        self.output = output;
        self
    }

    pub fn with_targets(mut self, enable: bool) -> Self {
        self.targets = enable;
        self
    }

    pub fn with_thread_ids(mut self, enable: bool) -> Self {
        self.thread_ids = enable;
        self
    }

    pub fn with_spans(mut self, enable: bool) -> Self {
        self.spans = enable;
        self
    }

    pub fn with_colors(mut self, enable: bool) -> Self {
        self.colors = enable;
        self
    }

    pub fn with_env_filter(mut self, filter: impl Into<String>) -> Self {
        self.env_filter = Some(filter.into());
        self
    }

    /// Install the global subscriber.
    ///
    /// Keep the returned guard alive; dropping it flushes buffered lines.
    /// Returns `None` if a global subscriber was already installed.
    pub fn init(self) -> Option<WorkerGuard> {
        self.try_init().ok()
    }

    /// Like [`init`](Self::init) but reports why installation failed.
    pub fn try_init(self) -> Result<WorkerGuard, ConfigError> {
        let filter = self.build_filter()?;
        let (writer, guard) = match self.output {
            LogOutput::Stdout => tracing_appender::non_blocking(io::stdout()),
            LogOutput::Stderr => tracing_appender::non_blocking(io::stderr()),
        };

        tracing_subscriber::registry()
            .with(self.build_layer(writer))
            .with(filter)
            .try_init()
            .map_err(|e| ConfigError::invalid("log", e.to_string()))?;

        Ok(guard)
    }

    fn build_filter(&self) -> Result<EnvFilter, ConfigError> {
        match &self.env_filter {
            Some(directives) => EnvFilter::try_new(directives)
                .map_err(|e| ConfigError::invalid("log.env_filter", e.to_string())),
            None => Ok(EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(self.level.as_str()))),
        }
    }

    fn build_layer(&self, writer: NonBlocking) -> Box<dyn Layer<Registry> + Send + Sync> {
        let span_events = if self.spans {
            FmtSpan::CLOSE
        } else {
            FmtSpan::NONE
        };

        match self.format {
            LogFormat::Json => fmt::layer()
                .json()
                .with_writer(writer)
                .with_current_span(self.spans)
                .with_span_list(self.spans)
                .with_target(self.targets)
                .with_thread_ids(self.thread_ids)
                .with_span_events(span_events)
                .boxed(),
            LogFormat::Plain => fmt::layer()
                .with_writer(writer)
                .with_target(self.targets)
                .with_thread_ids(self.thread_ids)
                .with_ansi(self.colors)
                .with_span_events(span_events)
                .boxed(),
            LogFormat::Pretty => fmt::layer()
                .pretty()
                .with_writer(writer)
                .with_target(self.targets)
                .with_thread_ids(self.thread_ids)
                .with_ansi(self.colors)
                .with_span_events(span_events)
                .boxed(),
            LogFormat::Compact => fmt::layer()
                .compact()
                .with_writer(writer)
                .with_target(self.targets)
                .with_thread_ids(self.thread_ids)
                .with_ansi(self.colors)
                .with_span_events(span_events)
                .boxed(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_level_parse() {
        assert_eq!("DEBUG".parse::<LogLevel>().unwrap(), LogLevel::Debug);
        assert_eq!("warning".parse::<LogLevel>().unwrap(), LogLevel::Warn);
        assert!("loud".parse::<LogLevel>().is_err());
        assert_eq!(LogLevel::Error.to_tracing_level(), Level::ERROR);
    }

    #[test]
    fn test_default_config() {
        let config = LogConfig::default();
        assert_eq!(config.level, LogLevel::Info);
        assert_eq!(config.format, LogFormat::Json);
        assert_eq!(config.output, LogOutput::Stdout);
        assert!(config.targets);
    }

    #[test]
    fn test_config_builder() {
        let config = LogConfig::new()
            .level(LogLevel::Trace)
            .format(LogFormat::Compact)
            .output(LogOutput::Stderr)
            .with_colors(true)
            .with_targets(false);

        assert_eq!(config.level, LogLevel::Trace);
        assert_eq!(config.format, LogFormat::Compact);
        assert_eq!(config.output, LogOutput::Stderr);
        assert!(config.colors);
        assert!(!config.targets);
    }

    #[test]
    fn test_invalid_filter_rejected() {
        let config = LogConfig::new().with_env_filter("waypoint=notalevel");
        assert!(config.build_filter().is_err());
    }
}
