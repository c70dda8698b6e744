//! Structured logging.

use std::io;

use anyhow::Result;
use clap::ValueEnum;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Log line format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum LogFormat {
    Json,
    Pretty,
    #[default]
    Compact,
}

/// Install the global subscriber, writing to stderr.
///
/// `RUST_LOG` wins over `level`; `info` is the fallback.
pub fn init_tracing(level: Option<&str>, format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level.unwrap_or("info")))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let registry = tracing_subscriber::registry().with(env_filter);
    let layer = fmt::layer().with_target(true).with_writer(io::stderr);

    match format {
        LogFormat::Json => registry.with(layer.json().with_current_span(true)).try_init()?,
        LogFormat::Pretty => registry.with(layer.pretty()).try_init()?,
        LogFormat::Compact => registry.with(layer.compact()).try_init()?,
    }

    tracing::debug!(format = ?format, "tracing initialized");
    Ok(())
}
