//! Structured logging for roomcast nodes.
//!
//! - [`init_logging`] installs the global `tracing` subscriber from
//!   [`LoggingSettings`]: JSON lines or human-readable output on stderr,
//!   filtered by `RUST_LOG` when set, otherwise by the configured level plus
//!   per-module overrides.
//! - [`capture`] installs a thread-local subscriber that records events in
//!   memory for test assertions.

#![deny(unsafe_code)]

pub mod capture;

use roomcast_settings::LoggingSettings;
use thiserror::Error;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

pub use capture::{CapturedEvent, CapturedLogs, capture_logs};

/// Failures while installing the subscriber.
#[derive(Debug, Error)]
pub enum LoggingError {
    /// The level or a module override is not a valid filter directive.
    #[error("invalid log filter {directive:?}: {source}")]
    InvalidFilter {
        /// The directive string that failed to parse.
        directive: String,
        /// Parser error.
        #[source]
        source: tracing_subscriber::filter::ParseError,
    },
    /// A global subscriber is already installed.
    #[error("logging already initialized: {0}")]
    AlreadyInitialized(#[from] tracing_subscriber::util::TryInitError),
}

/// Build the filter directive from settings: `level[,module=level]*`.
pub fn build_filter_directive(settings: &LoggingSettings) -> String {
    let mut directive = settings.level.to_lowercase();
    for (module, level) in &settings.module_levels {
        directive.push_str(&format!(",{module}={}", level.to_lowercase()));
    }
    directive
}

/// Resolve the effective filter. `RUST_LOG` wins when it parses.
pub fn build_filter(settings: &LoggingSettings) -> Result<EnvFilter, LoggingError> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    let directive = build_filter_directive(settings);
    EnvFilter::try_new(&directive).map_err(|source| LoggingError::InvalidFilter { directive, source })
}

/// Install the global subscriber. Call once at startup.
pub fn init_logging(settings: &LoggingSettings) -> Result<(), LoggingError> {
    let filter = build_filter(settings)?;

    if settings.json {
        let fmt_layer = tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_span_list(true)
            .with_writer(std::io::stderr);
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt_layer)
            .try_init()?;
    } else {
        let fmt_layer = tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_writer(std::io::stderr)
            .compact();
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt_layer)
            .try_init()?;
    }
    Ok(())
}
