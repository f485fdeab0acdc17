//! Logging setup for the engine.
//!
//! Thin wrapper over `tracing-subscriber` so every surface (tests, example
//! runners, services embedding the engine) initializes the same way.
//!
//! # Environment variables
//!
//! - `RUST_LOG`: standard tracing filter (e.g. `info`, `quant_engine=debug`)
//! - `LOG_FORMAT`: `pretty` (default), `compact`, or `json`

use std::env;

use tracing_subscriber::{fmt, EnvFilter};

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Human-readable output (default for terminals)
    #[default]
    Pretty,
    /// Compact single-line output
    Compact,
    /// JSON output for log aggregation
    Json,
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

/// Logging configuration.
#[derive(Debug, Clone)]
pub struct LogConfig {
    pub format: LogFormat,
    /// Filter used when `RUST_LOG` is unset.
    pub default_level: String,
    /// Include module path in output.
    pub include_target: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::Pretty,
            default_level: "info".to_string(),
            include_target: true,
        }
    }
}

impl LogConfig {
    /// Build a config from `LOG_FORMAT` / `RUST_LOG`, falling back to defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(fmt) = env::var("LOG_FORMAT") {
            config.format = LogFormat::parse(&fmt);
        }
        if let Ok(level) = env::var("RUST_LOG") {
            config.default_level = level;
        }
        config
    }
}

/// Install the global subscriber. Safe to call more than once; only the first
/// call wins (subsequent calls return an error string from the subscriber).
pub fn init_logging(config: LogConfig) -> Result<(), String> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.default_level.clone()));

    let builder = fmt()
        .with_env_filter(filter)
        .with_target(config.include_target);

    let result = match config.format {
        LogFormat::Pretty => builder.try_init(),
        LogFormat::Compact => builder.compact().try_init(),
        LogFormat::Json => builder.json().try_init(),
    };

    result.map_err(|e| e.to_string())
}
