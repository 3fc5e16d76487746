//! Config file discovery, loading, and environment variable overlay.

use crate::{ConfigError, StageConfig};
use std::env;
use std::path::{Path, PathBuf};

/// Information about where config values came from.
#[derive(Debug, Clone, Default)]
pub struct ConfigSources {
    /// Config files that were loaded (in order)
    pub files: Vec<PathBuf>,
    /// Environment variables that overrode config values
    pub env_overrides: Vec<String>,
}

/// Discover config files in standard locations.
pub fn discover_config_files() -> Vec<PathBuf> {
    discover_config_files_with_override(None)
}

/// Discover config files, optionally with a CLI override path.
///
/// If `cli_path` is provided and exists, it replaces the local override.
/// Returns paths in load order (system, user, local/cli). Only existing
/// files are returned.
pub fn discover_config_files_with_override(cli_path: Option<&Path>) -> Vec<PathBuf> {
    let mut files = Vec::new();

    let system = PathBuf::from("/etc/stagehand/config.toml");
    if system.exists() {
        files.push(system);
    }

    if let Some(config_dir) = directories::BaseDirs::new().map(|d| d.config_dir().to_path_buf()) {
        let user = config_dir.join("stagehand/config.toml");
        if user.exists() {
            files.push(user);
        }
    }

    if let Some(path) = cli_path {
        if path.exists() {
            files.push(path.to_path_buf());
            return files;
        }
    }

    let local = PathBuf::from("stagehand.toml");
    if local.exists() {
        files.push(local);
    }

    files
}

/// Read a TOML file into a raw table.
pub fn load_table(path: &Path) -> Result<toml::Table, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
        path: path.to_path_buf(),
        source: e,
    })?;

    contents
        .parse()
        .map_err(|e: toml::de::Error| ConfigError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
}

/// Load a single config file, filling missing values with defaults.
pub fn load_from_file(path: &Path) -> Result<StageConfig, ConfigError> {
    let table = load_table(path)?;
    from_table(table, path)
}

/// Deserialize a (merged) table into a config.
pub fn from_table(table: toml::Table, origin: &Path) -> Result<StageConfig, ConfigError> {
    let mut config: StageConfig =
        toml::Value::Table(table)
            .try_into()
            .map_err(|e: toml::de::Error| ConfigError::Parse {
                path: origin.to_path_buf(),
                message: e.to_string(),
            })?;

    config.infra.paths.state_dir = expand_path(&config.infra.paths.state_dir.to_string_lossy());
    Ok(config)
}

/// Merge `overlay` into `base`, recursing into tables.
///
/// Scalars and arrays in the overlay replace the base value outright, so a
/// later file's `[[bootstrap.ducking.rules]]` replaces the whole rule list.
pub fn merge_tables(base: &mut toml::Table, overlay: toml::Table) {
    for (key, value) in overlay {
        match (base.get_mut(&key), value) {
            (Some(toml::Value::Table(existing)), toml::Value::Table(incoming)) => {
                merge_tables(existing, incoming);
            }
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}

/// Apply environment variable overrides to config.
pub fn apply_env_overrides(config: &mut StageConfig, sources: &mut ConfigSources) {
    if let Ok(v) = env::var("STAGEHAND_STATE_DIR") {
        config.infra.paths.state_dir = expand_path(&v);
        sources.env_overrides.push("STAGEHAND_STATE_DIR".to_string());
    }

    if let Ok(v) = env::var("STAGEHAND_LOG_LEVEL") {
        config.infra.telemetry.log_level = v;
        sources.env_overrides.push("STAGEHAND_LOG_LEVEL".to_string());
    }
    // Also support RUST_LOG
    if let Ok(v) = env::var("RUST_LOG") {
        config.infra.telemetry.log_level = v;
        sources.env_overrides.push("RUST_LOG".to_string());
    }

    if let Ok(v) = env::var("STAGEHAND_PACTL") {
        config.infra.tools.pactl = v;
        sources.env_overrides.push("STAGEHAND_PACTL".to_string());
    }
    if let Ok(v) = env::var("STAGEHAND_BLUETOOTHCTL") {
        config.infra.tools.bluetoothctl = v;
        sources.env_overrides.push("STAGEHAND_BLUETOOTHCTL".to_string());
    }
    if let Ok(v) = env::var("STAGEHAND_PW_LOOPBACK") {
        config.infra.tools.pw_loopback = v;
        sources.env_overrides.push("STAGEHAND_PW_LOOPBACK".to_string());
    }
    if let Ok(v) = env::var("STAGEHAND_COMMAND_TIMEOUT_MS") {
        if let Ok(ms) = v.parse() {
            config.infra.tools.command_timeout_ms = ms;
            sources.env_overrides.push("STAGEHAND_COMMAND_TIMEOUT_MS".to_string());
        }
    }

    if let Ok(v) = env::var("STAGEHAND_DEFAULT_SINK") {
        config.bootstrap.routing.default_sink = v;
        sources.env_overrides.push("STAGEHAND_DEFAULT_SINK".to_string());
    }
    if let Ok(v) = env::var("STAGEHAND_COMBINE_LATENCY_MS") {
        if let Ok(ms) = v.parse() {
            config.bootstrap.combine.latency_ms = ms;
            sources.env_overrides.push("STAGEHAND_COMBINE_LATENCY_MS".to_string());
        }
    }

    // Stream patterns (STAGEHAND_STREAM_<NAME>)
    for (key, value) in env::vars() {
        if let Some(stream) = key.strip_prefix("STAGEHAND_STREAM_") {
            config.bootstrap.streams.insert(stream.to_lowercase(), value);
            sources.env_overrides.push(key);
        }
    }
}

/// Expand a leading `~/` or `$VAR/` in a path.
pub fn expand_path(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = directories::BaseDirs::new().map(|d| d.home_dir().to_path_buf()) {
            return home.join(stripped);
        }
        return PathBuf::from(path);
    }

    if let Some(stripped) = path.strip_prefix('$') {
        let (var_name, rest) = match stripped.find('/') {
            Some(slash_pos) => (&stripped[..slash_pos], Some(&stripped[slash_pos + 1..])),
            None => (stripped, None),
        };
        return match (env::var(var_name), rest) {
            (Ok(value), Some(rest)) => PathBuf::from(value).join(rest),
            (Ok(value), None) => PathBuf::from(value),
            (Err(_), _) => PathBuf::from(path),
        };
    }

    PathBuf::from(path)
}
