//! Infrastructure configuration - things that cannot change at runtime.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Filesystem paths for stagehand state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Directory holding persisted key/value blobs (routing table).
    /// Default: ~/.local/share/stagehand
    #[serde(default = "PathsConfig::default_state_dir")]
    pub state_dir: PathBuf,
}

impl PathsConfig {
    fn default_state_dir() -> PathBuf {
        directories::BaseDirs::new()
            .map(|dirs| dirs.home_dir().join(".local/share/stagehand"))
            .unwrap_or_else(|| PathBuf::from(".local/share/stagehand"))
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            state_dir: Self::default_state_dir(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Log filter (trace, debug, info, warn, error, or a full EnvFilter directive).
    /// Default: info
    #[serde(default = "TelemetryConfig::default_log_level")]
    pub log_level: String,
}

impl TelemetryConfig {
    fn default_log_level() -> String {
        "info".to_string()
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: Self::default_log_level(),
        }
    }
}

/// External helper binaries and the one-shot command budget.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolsConfig {
    /// Audio server CLI.
    /// Default: pactl
    #[serde(default = "ToolsConfig::default_pactl")]
    pub pactl: String,

    /// Bluetooth adapter CLI.
    /// Default: bluetoothctl
    #[serde(default = "ToolsConfig::default_bluetoothctl")]
    pub bluetoothctl: String,

    /// Forwarding process used by the combine sink.
    /// Default: pw-loopback
    #[serde(default = "ToolsConfig::default_pw_loopback")]
    pub pw_loopback: String,

    /// Timeout for any one-shot command, in milliseconds.
    /// Default: 5000
    #[serde(default = "ToolsConfig::default_command_timeout_ms")]
    pub command_timeout_ms: u64,
}

impl ToolsConfig {
    fn default_pactl() -> String {
        "pactl".to_string()
    }

    fn default_bluetoothctl() -> String {
        "bluetoothctl".to_string()
    }

    fn default_pw_loopback() -> String {
        "pw-loopback".to_string()
    }

    fn default_command_timeout_ms() -> u64 {
        5_000
    }
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            pactl: Self::default_pactl(),
            bluetoothctl: Self::default_bluetoothctl(),
            pw_loopback: Self::default_pw_loopback(),
            command_timeout_ms: Self::default_command_timeout_ms(),
        }
    }
}

/// Infrastructure configuration - cannot change at runtime.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InfraConfig {
    /// Filesystem paths.
    #[serde(default)]
    pub paths: PathsConfig,

    /// Logging settings.
    #[serde(default)]
    pub telemetry: TelemetryConfig,

    /// Helper binaries.
    #[serde(default)]
    pub tools: ToolsConfig,
}
