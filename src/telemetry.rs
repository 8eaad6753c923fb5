//! Logging setup.
//!
//! Every component logs through `tracing` with structured fields (`node`,
//! `server`, `datacenter`, `error`, ...). Embedding binaries call
//! [`init_logging`] once at startup.
//!
//! ```rust,no_run
//! use consulate::telemetry::{LogFormat, init_logging};
//!
//! init_logging(LogFormat::from_env()).expect("Failed to init logging");
//! ```
//!
//! # Environment Variables
//!
//! - `CONSULATE_LOG_FORMAT` (or `LOG_FORMAT`): `json` or `pretty` (default: `pretty`)
//! - `RUST_LOG`: filter directives (default: [`DEFAULT_LOG_FILTER`])

use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

/// Filter used when `RUST_LOG` is unset or invalid.
pub const DEFAULT_LOG_FILTER: &str = "info,consulate=info";

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Pretty,
    /// One JSON object per event, for log aggregators.
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(LogFormat::Json),
            "pretty" | "" => Ok(LogFormat::Pretty),
            other => Err(format!("unknown log format: {other}")),
        }
    }
}

impl LogFormat {
    /// Read `CONSULATE_LOG_FORMAT`, then `LOG_FORMAT`. Unknown values fall
    /// back to pretty output.
    pub fn from_env() -> Self {
        ["CONSULATE_LOG_FORMAT", "LOG_FORMAT"]
            .iter()
            .find_map(|key| std::env::var(key).ok())
            .and_then(|value| value.parse().ok())
            .unwrap_or_default()
    }
}

/// Install the global subscriber. Fails if one is already installed.
pub fn init_logging(format: LogFormat) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let registry = tracing_subscriber::registry().with(filter);

    match format {
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json().with_current_span(false))
            .try_init()?,
        LogFormat::Pretty => registry
            .with(tracing_subscriber::fmt::layer().with_target(true))
            .try_init()?,
    }
    Ok(())
}
