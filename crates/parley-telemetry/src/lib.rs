//! # parley-telemetry
//!
//! Installs the global `tracing` subscriber: an [`EnvFilter`] built from
//! configuration (overridden by `RUST_LOG`) feeding either a JSON or a
//! human-readable fmt layer.

#![deny(unsafe_code)]

use parley_settings::LoggingSettings;
use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Errors raised while installing the subscriber.
#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    /// The configured level is not a valid filter directive.
    #[error("invalid log filter: {0}")]
    Filter(String),
    /// A global subscriber was already installed.
    #[error("tracing subscriber already initialized: {0}")]
    AlreadyInitialized(String),
}

/// Configuration for the logging subsystem.
#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    /// Default log level. Overridden by `RUST_LOG`.
    pub log_level: Level,
    /// Per-module level overrides (e.g. `parley_server::hub` => DEBUG).
    pub module_levels: Vec<(String, Level)>,
    /// Emit JSON lines instead of pretty output.
    pub json: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: Level::INFO,
            module_levels: Vec::new(),
            json: true,
        }
    }
}

impl TelemetryConfig {
    /// Build from settings. `level` accepts either a bare level (`debug`) or
    /// a directive list (`info,parley_server::hub=trace`).
    pub fn from_settings(settings: &LoggingSettings) -> Result<Self, TelemetryError> {
        let mut parts = settings.level.split(',').map(str::trim).filter(|p| !p.is_empty());
        let log_level = match parts.next() {
            Some(level) => parse_level(level)?,
            None => Level::INFO,
        };
        let mut module_levels = Vec::new();
        for directive in parts {
            let (module, level) = directive
                .split_once('=')
                .ok_or_else(|| TelemetryError::Filter(directive.to_string()))?;
            module_levels.push((module.to_string(), parse_level(level)?));
        }
        Ok(Self {
            log_level,
            module_levels,
            json: settings.json,
        })
    }

    /// Filter directive string derived from this config.
    pub fn filter_directives(&self) -> String {
        let mut filter = self.log_level.to_string().to_lowercase();
        for (module, level) in &self.module_levels {
            filter.push_str(&format!(",{}={}", module, level.to_string().to_lowercase()));
        }
        filter
    }
}

fn parse_level(raw: &str) -> Result<Level, TelemetryError> {
    raw.parse::<Level>()
        .map_err(|_| TelemetryError::Filter(raw.to_string()))
}

/// Initialize logging. Call once at startup.
pub fn init_telemetry(config: &TelemetryConfig) -> Result<(), TelemetryError> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(config.filter_directives()))
        .map_err(|e| TelemetryError::Filter(e.to_string()))?;

    let fmt_layer = if config.json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_span_list(true)
            .with_filter(env_filter)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_filter(env_filter)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(fmt_layer)
        .try_init()
        .map_err(|e| TelemetryError::AlreadyInitialized(e.to_string()))
}
