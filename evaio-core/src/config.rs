//! Backend Configuration
//!
//! Configuration can be set programmatically or loaded from environment
//! variables.
//!
//! # Environment Variables
//!
//! | Variable | Description | Default |
//! |----------|-------------|---------|
//! | `EVAIO_CAPACITY` | Maximum in-flight operations (also the batch size) | 64 |
//! | `EVAIO_LOG_LEVEL` | Log level (off/error/warn/info/debug/trace) | info |
//! | `EVAIO_LOG_FORMAT` | Log line format (full/compact) | full |
//!
//! # Example
//!
//! ```rust,ignore
//! use evaio::config::AioConfig;
//!
//! // Load from environment with defaults
//! let config = AioConfig::from_env();
//!
//! // Or use the builder pattern
//! let config = AioConfig::builder()
//!     .capacity(128)
//!     .build()?;
//! ```

use std::env;

use thiserror::Error;

/// Default number of operations the kernel context can hold in flight.
pub const DEFAULT_CAPACITY: usize = 64;

/// Largest accepted capacity. The kernel takes `nr_events` as an unsigned int
/// and the per-user `aio-max-nr` limit is 65536 by default.
pub const MAX_CAPACITY: usize = 65536;

/// Log level for backend logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogLevel {
    /// No logging.
    Off,
    /// Error messages only.
    Error,
    /// Warnings and errors.
    Warn,
    /// Informational messages (default).
    #[default]
    Info,
    /// Debug messages.
    Debug,
    /// Trace-level messages.
    Trace,
}

impl LogLevel {
    /// Parse a log level from a string.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "off" | "none" | "0" => Some(LogLevel::Off),
            "error" | "err" | "1" => Some(LogLevel::Error),
            "warn" | "warning" | "2" => Some(LogLevel::Warn),
            "info" | "3" => Some(LogLevel::Info),
            "debug" | "4" => Some(LogLevel::Debug),
            "trace" | "5" => Some(LogLevel::Trace),
            _ => None,
        }
    }

    /// Directive string understood by `tracing_subscriber::EnvFilter`.
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Off => "off",
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

/// Output format for log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Full single-line format with target and span context.
    #[default]
    Full,
    /// Compact format.
    Compact,
}

impl LogFormat {
    /// Parse a format from a string.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "full" | "plain" | "text" => Some(LogFormat::Full),
            "compact" => Some(LogFormat::Compact),
            _ => None,
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Default)]
pub struct LogConfig {
    /// Log level.
    /// Default: Info.
    pub level: LogLevel,

    /// Log line format.
    /// Default: Full.
    pub format: LogFormat,
}

/// Complete backend configuration.
#[derive(Debug, Clone)]
pub struct AioConfig {
    /// Capacity `N`: maximum operations submitted to the kernel at once,
    /// which is also the size of every submission and completion batch.
    /// Default: 64.
    pub capacity: usize,

    /// Logging configuration.
    pub log: LogConfig,
}

impl Default for AioConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            log: LogConfig::default(),
        }
    }
}

impl AioConfig {
    /// Create a new builder for AioConfig.
    pub fn builder() -> AioConfigBuilder {
        AioConfigBuilder::new()
    }

    /// Load configuration from environment variables.
    ///
    /// Variables that are not set, or that hold invalid values, leave the
    /// default in place.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(val) = parse_env_usize("EVAIO_CAPACITY") {
            if (1..=MAX_CAPACITY).contains(&val) {
                config.capacity = val;
            }
        }

        if let Ok(val) = env::var("EVAIO_LOG_LEVEL") {
            if let Some(level) = LogLevel::parse(&val) {
                config.log.level = level;
            }
        }

        if let Ok(val) = env::var("EVAIO_LOG_FORMAT") {
            if let Some(format) = LogFormat::parse(&val) {
                config.log.format = format;
            }
        }

        config
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.capacity == 0 {
            return Err(ConfigError::InvalidValue {
                field: "capacity".into(),
                message: "must be at least 1".into(),
            });
        }

        if self.capacity > MAX_CAPACITY {
            return Err(ConfigError::InvalidValue {
                field: "capacity".into(),
                message: format!("must be at most {MAX_CAPACITY}"),
            });
        }

        Ok(())
    }
}

/// Configuration error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// Invalid configuration value.
    #[error("invalid value for {field}: {message}")]
    InvalidValue {
        /// Field name.
        field: String,
        /// Error message.
        message: String,
    },
}

/// Builder for [`AioConfig`].
#[derive(Debug, Clone, Default)]
pub struct AioConfigBuilder {
    config: AioConfig,
}

impl AioConfigBuilder {
    /// Create a new builder with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the capacity `N`.
    pub fn capacity(mut self, capacity: usize) -> Self {
        self.config.capacity = capacity;
        self
    }

    /// Set the log level.
    pub fn log_level(mut self, level: LogLevel) -> Self {
        self.config.log.level = level;
        self
    }

    /// Set the log format.
    pub fn log_format(mut self, format: LogFormat) -> Self {
        self.config.log.format = format;
        self
    }

    /// Build and validate the configuration.
    pub fn build(self) -> Result<AioConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

fn parse_env_usize(name: &str) -> Option<usize> {
    env::var(name).ok().and_then(|v| v.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AioConfig::default();
        assert_eq!(config.capacity, DEFAULT_CAPACITY);
        assert_eq!(config.log.level, LogLevel::Info);
        assert_eq!(config.log.format, LogFormat::Full);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder() {
        let config = AioConfig::builder()
            .capacity(2)
            .log_level(LogLevel::Debug)
            .log_format(LogFormat::Compact)
            .build()
            .unwrap();

        assert_eq!(config.capacity, 2);
        assert_eq!(config.log.level, LogLevel::Debug);
        assert_eq!(config.log.format, LogFormat::Compact);
    }

    #[test]
    fn test_builder_rejects_zero_capacity() {
        let err = AioConfig::builder().capacity(0).build().unwrap_err();
        assert!(err.to_string().contains("capacity"));
    }

    #[test]
    fn test_builder_rejects_huge_capacity() {
        assert!(AioConfig::builder()
            .capacity(MAX_CAPACITY + 1)
            .build()
            .is_err());
        assert!(AioConfig::builder().capacity(MAX_CAPACITY).build().is_ok());
    }

    #[test]
    fn test_log_level_parse() {
        assert_eq!(LogLevel::parse("OFF"), Some(LogLevel::Off));
        assert_eq!(LogLevel::parse("warning"), Some(LogLevel::Warn));
        assert_eq!(LogLevel::parse(" debug "), Some(LogLevel::Debug));
        assert_eq!(LogLevel::parse("5"), Some(LogLevel::Trace));
        assert_eq!(LogLevel::parse("loud"), None);
    }

    #[test]
    fn test_log_format_parse() {
        assert_eq!(LogFormat::parse("compact"), Some(LogFormat::Compact));
        assert_eq!(LogFormat::parse("Plain"), Some(LogFormat::Full));
        assert_eq!(LogFormat::parse("json"), None);
    }

    #[test]
    fn test_from_env() {
        // Only this test touches EVAIO_* variables.
        env::set_var("EVAIO_CAPACITY", "8");
        env::set_var("EVAIO_LOG_LEVEL", "trace");
        env::set_var("EVAIO_LOG_FORMAT", "compact");
        let config = AioConfig::from_env();
        assert_eq!(config.capacity, 8);
        assert_eq!(config.log.level, LogLevel::Trace);
        assert_eq!(config.log.format, LogFormat::Compact);

        env::set_var("EVAIO_CAPACITY", "0");
        env::set_var("EVAIO_LOG_LEVEL", "nonsense");
        let config = AioConfig::from_env();
        assert_eq!(config.capacity, DEFAULT_CAPACITY);
        assert_eq!(config.log.level, LogLevel::Info);

        env::remove_var("EVAIO_CAPACITY");
        env::remove_var("EVAIO_LOG_LEVEL");
        env::remove_var("EVAIO_LOG_FORMAT");
    }
}
