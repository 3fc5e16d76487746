//! Bootstrap configuration - seeds runtime state, then runtime owns it.
//!
//! The routing table in particular is only seeded from here when nothing has
//! been persisted yet; after the first `set_route` the persisted blob wins.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A seeded route: a sink type (`hdmi`, `bluetooth`, `combine`, `other`) or a
/// concrete sink name, with an optional explicit fallback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteSeed {
    pub sink: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback: Option<String>,
}

/// Initial routing table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingConfig {
    /// Sink type used by every stream without a route.
    /// Default: hdmi
    #[serde(default = "RoutingConfig::default_sink")]
    pub default_sink: String,

    /// Per-stream routes keyed by stream name.
    #[serde(default)]
    pub routes: BTreeMap<String, RouteSeed>,
}

impl RoutingConfig {
    fn default_sink() -> String {
        "hdmi".to_string()
    }
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            default_sink: Self::default_sink(),
            routes: BTreeMap::new(),
        }
    }
}

/// Application-name patterns used to find each stream's sink-input.
///
/// Maps stream name to a case-insensitive substring of `application.name`
/// or `application.process.binary`.
pub type StreamsConfig = BTreeMap<String, String>;

/// Default stream patterns.
pub fn default_streams() -> StreamsConfig {
    let mut streams = BTreeMap::new();
    streams.insert("video".to_string(), "vlc".to_string());
    streams.insert("spotify".to_string(), "spotify".to_string());
    streams.insert("sound".to_string(), "pw-play".to_string());
    streams
}

/// Combine-sink forwarding settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CombineConfig {
    /// Latency budget handed to each forwarding process, in milliseconds.
    /// Default: 100
    #[serde(default = "CombineConfig::default_latency_ms")]
    pub latency_ms: u32,
}

impl CombineConfig {
    fn default_latency_ms() -> u32 {
        100
    }
}

impl Default for CombineConfig {
    fn default() -> Self {
        Self {
            latency_ms: Self::default_latency_ms(),
        }
    }
}

/// Sink monitor restart policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Base restart delay in milliseconds.
    /// Default: 1000
    #[serde(default = "MonitorConfig::default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Backoff multiplier applied per consecutive no-output exit.
    /// Default: 2.0
    #[serde(default = "MonitorConfig::default_multiplier")]
    pub multiplier: f64,

    /// Consecutive no-output exits before the monitor gives up.
    /// Default: 5
    #[serde(default = "MonitorConfig::default_max_failures")]
    pub max_failures: u32,
}

impl MonitorConfig {
    fn default_base_delay_ms() -> u64 {
        1_000
    }

    fn default_multiplier() -> f64 {
        2.0
    }

    fn default_max_failures() -> u32 {
        5
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: Self::default_base_delay_ms(),
            multiplier: Self::default_multiplier(),
            max_failures: Self::default_max_failures(),
        }
    }
}

/// Bluetooth timing budgets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BluetoothConfig {
    /// Time to wait for the target to be seen before pairing anyway.
    /// Default: 8000
    #[serde(default = "BluetoothConfig::default_discovery_timeout_ms")]
    pub discovery_timeout_ms: u64,

    /// Budget for the pair/trust exchange. The whole session is bounded by
    /// this plus `discovery_timeout_ms`.
    /// Default: 30000
    #[serde(default = "BluetoothConfig::default_pair_timeout_ms")]
    pub pair_timeout_ms: u64,

    /// Duration of a passive scan, in seconds.
    /// Default: 15
    #[serde(default = "BluetoothConfig::default_scan_timeout_secs")]
    pub scan_timeout_secs: u64,

    /// Budget for `connect` (slower than other one-shot commands).
    /// Default: 15000
    #[serde(default = "BluetoothConfig::default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Grace period between the exit directive and the force kill.
    /// Default: 500
    #[serde(default = "BluetoothConfig::default_teardown_grace_ms")]
    pub teardown_grace_ms: u64,
}

impl BluetoothConfig {
    fn default_discovery_timeout_ms() -> u64 {
        8_000
    }

    fn default_pair_timeout_ms() -> u64 {
        30_000
    }

    fn default_scan_timeout_secs() -> u64 {
        15
    }

    fn default_connect_timeout_ms() -> u64 {
        15_000
    }

    fn default_teardown_grace_ms() -> u64 {
        500
    }
}

impl Default for BluetoothConfig {
    fn default() -> Self {
        Self {
            discovery_timeout_ms: Self::default_discovery_timeout_ms(),
            pair_timeout_ms: Self::default_pair_timeout_ms(),
            scan_timeout_secs: Self::default_scan_timeout_secs(),
            connect_timeout_ms: Self::default_connect_timeout_ms(),
            teardown_grace_ms: Self::default_teardown_grace_ms(),
        }
    }
}

/// One seeded ducking rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DuckingRuleSeed {
    pub when: String,
    pub duck: String,
    pub to: u8,
    #[serde(default)]
    pub fade_ms: u64,
}

/// Ducking rules loaded at startup.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DuckingConfig {
    #[serde(default)]
    pub rules: Vec<DuckingRuleSeed>,
}

/// Bootstrap configuration - seeds runtime, then runtime owns it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BootstrapConfig {
    #[serde(default)]
    pub routing: RoutingConfig,

    #[serde(default = "default_streams")]
    pub streams: StreamsConfig,

    #[serde(default)]
    pub combine: CombineConfig,

    #[serde(default)]
    pub monitor: MonitorConfig,

    #[serde(default)]
    pub bluetooth: BluetoothConfig,

    #[serde(default)]
    pub ducking: DuckingConfig,
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self {
            routing: RoutingConfig::default(),
            streams: default_streams(),
            combine: CombineConfig::default(),
            monitor: MonitorConfig::default(),
            bluetooth: BluetoothConfig::default(),
            ducking: DuckingConfig::default(),
        }
    }
}
