//! Process-wide `tracing` subscriber setup.

use anyhow::{Context, Result};
use clap::ValueEnum;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Install the global subscriber. `RUST_LOG` selects levels (default `info`);
/// `journald` adds a layer writing to the systemd journal.
pub fn init(format: LogFormat, journald: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let journald = if journald {
        Some(tracing_journald::layer().context("failed to connect to journald")?)
    } else {
        None
    };
    let registry = tracing_subscriber::registry().with(filter).with(journald);
    match format {
        LogFormat::Text => registry.with(fmt::layer()).try_init(),
        LogFormat::Json => registry.with(fmt::layer().json()).try_init(),
    }
    .context("failed to install tracing subscriber")
}
