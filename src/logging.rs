//! Logging setup, powered by tracing-subscriber.
//!
//! Events go to stderr so `dbic get` and `dbic stats` output on stdout stays
//! clean. `RUST_LOG`, when set, takes precedence over `[logging].level`.

use anyhow::{anyhow, Result};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use crate::config::LoggingConfig;

/// Output format for log events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Compact text: timestamp LEVEL target message fields
    Compact,
    /// JSON Lines
    Json,
}

impl LogFormat {
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "json" | "jsonl" => LogFormat::Json,
            _ => LogFormat::Compact,
        }
    }
}

/// Base level plus quieter defaults for chatty dependencies.
fn build_env_filter(level: &str) -> Result<EnvFilter> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }

    let mut directives = vec![level.to_string()];
    for (target, lvl) in [("sqlx", "warn"), ("sqlx::query", "warn")] {
        directives.push(format!("{}={}", target, lvl));
    }

    let filter_str = directives.join(",");
    EnvFilter::try_new(&filter_str)
        .map_err(|e| anyhow!("Invalid tracing filter '{}': {}", filter_str, e))
}

/// Install the global subscriber. Calling it twice is harmless.
pub fn init(config: &LoggingConfig) -> Result<()> {
    let filter = build_env_filter(&config.level)?;

    let layer = match LogFormat::parse(&config.format) {
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .with_target(true)
            .with_filter(filter)
            .boxed(),
        LogFormat::Compact => tracing_subscriber::fmt::layer()
            .compact()
            .with_writer(std::io::stderr)
            .with_target(true)
            .with_filter(filter)
            .boxed(),
    };

    // try_init fails only when a subscriber is already installed
    tracing_subscriber::registry().with(layer).try_init().ok();
    Ok(())
}
