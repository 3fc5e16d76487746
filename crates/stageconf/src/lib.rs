//! Minimal configuration loading for stagehand.
//!
//! # Configuration Philosophy
//!
//! Configuration is split into two categories:
//!
//! - **Infrastructure** (`InfraConfig`): things that cannot change at runtime -
//!   the state directory, log level, helper binary names.
//!
//! - **Bootstrap** (`BootstrapConfig`): initial values that seed runtime state.
//!   The routing table is seeded from here only until an operator changes a
//!   route; after that the persisted table is the source of truth.
//!
//! # Config File Locations
//!
//! Files are loaded in order (later wins, table by table):
//! 1. `/etc/stagehand/config.toml` (system)
//! 2. `~/.config/stagehand/config.toml` (user)
//! 3. `./stagehand.toml` (local override, or the `--config` path)
//! 4. Environment variables (`STAGEHAND_*`)
//!
//! # Example Config
//!
//! ```toml
//! [paths]
//! state_dir = "~/.local/share/stagehand"
//!
//! [telemetry]
//! log_level = "info,stagehand=debug"
//!
//! [bootstrap.routing]
//! default_sink = "hdmi"
//!
//! [bootstrap.routing.routes.spotify]
//! sink = "bluetooth"
//! fallback = "hdmi"
//!
//! [[bootstrap.ducking.rules]]
//! when = "video"
//! duck = "spotify"
//! to = 20
//! fade_ms = 500
//! ```

pub mod bootstrap;
pub mod infra;
pub mod loader;

pub use bootstrap::{
    BluetoothConfig, BootstrapConfig, CombineConfig, DuckingConfig, DuckingRuleSeed,
    MonitorConfig, RouteSeed, RoutingConfig, StreamsConfig,
};
pub use infra::{InfraConfig, PathsConfig, TelemetryConfig, ToolsConfig};
pub use loader::{discover_config_files_with_override, ConfigSources};

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {message}")]
    Parse { path: PathBuf, message: String },
}

/// Complete stagehand configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct StageConfig {
    /// Infrastructure - cannot change at runtime.
    #[serde(flatten)]
    pub infra: InfraConfig,

    /// Bootstrap - seeds runtime state.
    #[serde(default)]
    pub bootstrap: BootstrapConfig,
}

impl StageConfig {
    /// Load configuration from all sources.
    pub fn load() -> Result<Self, ConfigError> {
        let (config, _sources) = Self::load_with_sources_from(None)?;
        Ok(config)
    }

    /// Load configuration, letting `config_path` replace the local override.
    pub fn load_from(config_path: Option<&std::path::Path>) -> Result<Self, ConfigError> {
        let (config, _sources) = Self::load_with_sources_from(config_path)?;
        Ok(config)
    }

    /// Load configuration from optional path and return information about sources.
    pub fn load_with_sources_from(
        config_path: Option<&std::path::Path>,
    ) -> Result<(Self, ConfigSources), ConfigError> {
        let mut sources = ConfigSources::default();
        let mut merged = toml::Table::new();

        for path in loader::discover_config_files_with_override(config_path) {
            let table = loader::load_table(&path)?;
            loader::merge_tables(&mut merged, table);
            sources.files.push(path);
        }

        let origin = sources
            .files
            .last()
            .cloned()
            .unwrap_or_else(|| PathBuf::from("<defaults>"));
        let mut config = loader::from_table(merged, &origin)?;

        loader::apply_env_overrides(&mut config, &mut sources);

        Ok((config, sources))
    }

    /// One-shot command timeout as a `Duration`.
    pub fn command_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.infra.tools.command_timeout_ms)
    }

    /// Serialize config to a TOML string.
    pub fn to_toml(&self) -> String {
        // Built by hand so section order matches the docs above
        let mut output = String::new();

        output.push_str("# stagehand configuration\n\n");

        output.push_str("[paths]\n");
        output.push_str(&format!(
            "state_dir = {}\n",
            quoted(&self.infra.paths.state_dir.display().to_string())
        ));

        output.push_str("\n[telemetry]\n");
        output.push_str(&format!(
            "log_level = {}\n",
            quoted(&self.infra.telemetry.log_level)
        ));

        let tools = &self.infra.tools;
        output.push_str("\n[tools]\n");
        output.push_str(&format!("pactl = {}\n", quoted(&tools.pactl)));
        output.push_str(&format!("bluetoothctl = {}\n", quoted(&tools.bluetoothctl)));
        output.push_str(&format!("pw_loopback = {}\n", quoted(&tools.pw_loopback)));
        output.push_str(&format!(
            "command_timeout_ms = {}\n",
            tools.command_timeout_ms
        ));

        let boot = &self.bootstrap;
        output.push_str("\n[bootstrap.routing]\n");
        output.push_str(&format!(
            "default_sink = {}\n",
            quoted(&boot.routing.default_sink)
        ));
        for (stream, route) in &boot.routing.routes {
            output.push_str(&format!("\n[bootstrap.routing.routes.{}]\n", key(stream)));
            output.push_str(&format!("sink = {}\n", quoted(&route.sink)));
            if let Some(fallback) = &route.fallback {
                output.push_str(&format!("fallback = {}\n", quoted(fallback)));
            }
        }

        output.push_str("\n[bootstrap.streams]\n");
        for (stream, pattern) in &boot.streams {
            output.push_str(&format!("{} = {}\n", key(stream), quoted(pattern)));
        }

        output.push_str("\n[bootstrap.combine]\n");
        output.push_str(&format!("latency_ms = {}\n", boot.combine.latency_ms));

        output.push_str("\n[bootstrap.monitor]\n");
        output.push_str(&format!(
            "base_delay_ms = {}\n",
            boot.monitor.base_delay_ms
        ));
        output.push_str(&format!("multiplier = {:?}\n", boot.monitor.multiplier));
        output.push_str(&format!(
            "max_failures = {}\n",
            boot.monitor.max_failures
        ));

        let bt = &boot.bluetooth;
        output.push_str("\n[bootstrap.bluetooth]\n");
        output.push_str(&format!(
            "discovery_timeout_ms = {}\n",
            bt.discovery_timeout_ms
        ));
        output.push_str(&format!("pair_timeout_ms = {}\n", bt.pair_timeout_ms));
        output.push_str(&format!("scan_timeout_secs = {}\n", bt.scan_timeout_secs));
        output.push_str(&format!(
            "connect_timeout_ms = {}\n",
            bt.connect_timeout_ms
        ));
        output.push_str(&format!(
            "teardown_grace_ms = {}\n",
            bt.teardown_grace_ms
        ));

        for rule in &boot.ducking.rules {
            output.push_str("\n[[bootstrap.ducking.rules]]\n");
            output.push_str(&format!("when = {}\n", quoted(&rule.when)));
            output.push_str(&format!("duck = {}\n", quoted(&rule.duck)));
            output.push_str(&format!("to = {}\n", rule.to));
            output.push_str(&format!("fade_ms = {}\n", rule.fade_ms));
        }

        output
    }
}

/// Render a TOML string value, escaped.
fn quoted(value: &str) -> String {
    toml::Value::String(value.to_string()).to_string()
}

/// Render a TOML key, quoting it unless it is a valid bare key.
fn key(name: &str) -> String {
    let bare = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if bare {
        name.to_string()
    } else {
        quoted(name)
    }
}
