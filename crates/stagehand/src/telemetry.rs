//! Logging initialization.
//!
//! Structured `tracing` output to stderr. `RUST_LOG` wins over the configured
//! level so an operator can turn up a single module without editing config.

use anyhow::{Context, Result};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Used when neither `RUST_LOG` nor the config names a level.
pub const DEFAULT_FILTER: &str = "info,stagehand=debug";

/// Install the global subscriber. `log_level` is any `EnvFilter` directive
/// string, e.g. `info` or `warn,stagehand::monitor=debug`.
pub fn init(log_level: &str) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init()
        .context("Failed to install tracing subscriber")?;

    tracing::debug!("🔭 logging initialized");
    Ok(())
}
