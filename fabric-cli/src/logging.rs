//! Tracing subscriber setup with format selection.

use anyhow::{Context, Result};
use std::str::FromStr;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// JSON format for structured logging.
    Json,
    /// Human-readable pretty format with colors.
    Pretty,
    /// Compact single-line format.
    #[default]
    Compact,
}

impl FromStr for LogFormat {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_lowercase().as_str() {
            "json" => Self::Json,
            "pretty" => Self::Pretty,
            "compact" => Self::Compact,
            _ => Self::default(),
        })
    }
}

/// Filter directive for a `-v` count.
pub fn verbosity_filter(verbosity: u8) -> &'static str {
    match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    }
}

/// Install the global subscriber.
///
/// `RUST_LOG` overrides `filter` when set.
pub fn init_tracing(format: LogFormat, filter: &str) -> Result<()> {
    let directive = std::env::var("RUST_LOG").unwrap_or_else(|_| filter.to_string());
    let filter = EnvFilter::try_new(&directive).unwrap_or_else(|_| EnvFilter::new("info"));

    match format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_target(true).flatten_event(true))
            .try_init(),
        LogFormat::Pretty => tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().pretty().with_target(true))
            .try_init(),
        LogFormat::Compact => tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().compact().with_target(true))
            .try_init(),
    }
    .context("Failed to initialize tracing subscriber")
}
