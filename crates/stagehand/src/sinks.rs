//! Sink discovery and classification.
//!
//! The catalog is rebuilt from `pactl list short sinks` on every query; nothing
//! here is cached or persisted.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::error;

use crate::error::StageError;
use crate::pulse::PulseCli;

/// Null sink loaded by the combine manager.
pub const COMBINE_SINK_NAME: &str = "stagehand-combine";
/// Legacy combine name still present on older installs.
pub const LEGACY_COMBINE_SINK_NAME: &str = "combine-bt";
pub const RESERVED_SINK_NAMES: [&str; 2] = [COMBINE_SINK_NAME, LEGACY_COMBINE_SINK_NAME];

const BLUETOOTH_PREFIXES: [&str; 2] = ["bluez_output.", "bluez_sink."];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SinkType {
    Hdmi,
    Bluetooth,
    Combine,
    Other,
}

impl SinkType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hdmi => "hdmi",
            Self::Bluetooth => "bluetooth",
            Self::Combine => "combine",
            Self::Other => "other",
        }
    }
}

impl fmt::Display for SinkType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for SinkType {
    type Err = StageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "hdmi" => Ok(Self::Hdmi),
            "bluetooth" => Ok(Self::Bluetooth),
            "combine" => Ok(Self::Combine),
            "other" => Ok(Self::Other),
            _ => Err(StageError::InvalidSinkType(s.to_string())),
        }
    }
}

/// One audio output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sink {
    pub id: String,
    pub name: String,
    pub driver: String,
    pub format: String,
    pub state: String,
    #[serde(rename = "type")]
    pub sink_type: SinkType,
    pub label: String,
    #[serde(rename = "virtual")]
    pub is_virtual: bool,
}

impl Sink {
    /// The synthetic entry reported while the combine sink is up.
    pub fn combine() -> Self {
        Self {
            id: COMBINE_SINK_NAME.to_string(),
            name: COMBINE_SINK_NAME.to_string(),
            driver: "module-null-sink".to_string(),
            format: String::new(),
            state: "RUNNING".to_string(),
            sink_type: SinkType::Combine,
            label: label(COMBINE_SINK_NAME, SinkType::Combine),
            is_virtual: true,
        }
    }
}

pub fn is_bluetooth_name(name: &str) -> bool {
    BLUETOOTH_PREFIXES.iter().any(|p| name.starts_with(p))
}

pub fn classify(name: &str) -> SinkType {
    if is_bluetooth_name(name) {
        SinkType::Bluetooth
    } else if name.to_lowercase().contains("hdmi") {
        SinkType::Hdmi
    } else if RESERVED_SINK_NAMES.contains(&name) {
        SinkType::Combine
    } else {
        SinkType::Other
    }
}

/// Human-readable label. Bluetooth sinks show the last two MAC bytes,
/// e.g. `bluez_output.AA_BB_CC_DD_EE_FF.1` becomes `BT Speaker (EE:FF)`.
pub fn label(name: &str, sink_type: SinkType) -> String {
    match sink_type {
        SinkType::Hdmi => "HDMI".to_string(),
        SinkType::Combine => "All Bluetooth Speakers".to_string(),
        SinkType::Other => name.to_string(),
        SinkType::Bluetooth => bluetooth_suffix(name)
            .map(|suffix| format!("BT Speaker ({})", suffix))
            .unwrap_or_else(|| "Bluetooth Speaker".to_string()),
    }
}

fn bluetooth_suffix(name: &str) -> Option<String> {
    let rest = BLUETOOTH_PREFIXES
        .iter()
        .find_map(|p| name.strip_prefix(p))?;
    let mac = rest.split('.').next()?;
    let octets: Vec<&str> = mac.split('_').collect();
    let well_formed = octets.len() == 6
        && octets
            .iter()
            .all(|o| o.len() == 2 && o.chars().all(|c| c.is_ascii_hexdigit()));
    if !well_formed {
        return None;
    }
    Some(format!("{}:{}", octets[4], octets[5]).to_uppercase())
}

/// Parse tab-delimited `id, name, driver, format, state` rows.
pub fn parse_sink_list(output: &str) -> Vec<Sink> {
    output
        .lines()
        .filter_map(|line| {
            let cols: Vec<&str> = line.split('\t').map(str::trim).collect();
            let [id, name, driver, format, state] = cols.as_slice() else {
                return None;
            };
            let sink_type = classify(name);
            Some(Sink {
                id: id.to_string(),
                name: name.to_string(),
                driver: driver.to_string(),
                format: format.to_string(),
                state: state.to_string(),
                sink_type,
                label: label(name, sink_type),
                is_virtual: false,
            })
        })
        .collect()
}

/// Live view of the audio server's outputs.
#[derive(Clone)]
pub struct SinkCatalog {
    pulse: PulseCli,
}

impl SinkCatalog {
    pub fn new(pulse: PulseCli) -> Self {
        Self { pulse }
    }

    /// Current sinks. Command failure yields an empty list.
    pub async fn list_sinks(&self) -> Vec<Sink> {
        match self.pulse.list_short_sinks().await {
            Ok(output) => parse_sink_list(&output),
            Err(e) => {
                error!("Failed to list sinks: {}", e);
                Vec::new()
            }
        }
    }

    pub async fn list_by_type(&self, sink_type: SinkType) -> Vec<Sink> {
        self.list_sinks()
            .await
            .into_iter()
            .filter(|s| s.sink_type == sink_type)
            .collect()
    }

    /// Like [`list_sinks`](Self::list_sinks), but reserved-name sinks are
    /// replaced by a single synthetic combine entry when `combine_active`.
    pub async fn list_with_combine(&self, combine_active: bool) -> Vec<Sink> {
        let mut sinks: Vec<Sink> = self
            .list_sinks()
            .await
            .into_iter()
            .filter(|s| !RESERVED_SINK_NAMES.contains(&s.name.as_str()))
            .collect();
        if combine_active {
            sinks.push(Sink::combine());
        }
        sinks
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const SHORT_SINKS: &str = "\
47\talsa_output.pci-0000_00_1f.3.hdmi-stereo\tPipeWire\ts32le 2ch 48000Hz\tSUSPENDED
52\tbluez_output.AA_BB_CC_DD_EE_FF.1\tPipeWire\ts16le 2ch 48000Hz\tRUNNING
53\tbluez_sink.11_22_33_44_55_66.a2dp_sink\tPipeWire\ts16le 2ch 44100Hz\tIDLE
60\tstagehand-combine\tPipeWire\tfloat32le 2ch 48000Hz\tIDLE
61\talsa_output.usb-Focusrite\tPipeWire\ts24le 2ch 48000Hz\tIDLE
not a sink row
62\ttoo\tfew
";

    #[test]
    fn classifies_by_name() {
        assert_eq!(classify("bluez_output.AA_BB_CC_DD_EE_FF.1"), SinkType::Bluetooth);
        assert_eq!(classify("bluez_sink.AA_BB_CC_DD_EE_FF"), SinkType::Bluetooth);
        assert_eq!(classify("alsa_output.pci.HDMI-stereo"), SinkType::Hdmi);
        assert_eq!(classify("stagehand-combine"), SinkType::Combine);
        assert_eq!(classify("combine-bt"), SinkType::Combine);
        assert_eq!(classify("alsa_output.usb"), SinkType::Other);
    }

    #[test]
    fn labels() {
        assert_eq!(
            label("bluez_output.AA_BB_CC_DD_ee_ff.1", SinkType::Bluetooth),
            "BT Speaker (EE:FF)"
        );
        assert_eq!(label("bluez_output.weird", SinkType::Bluetooth), "Bluetooth Speaker");
        assert_eq!(label("x.hdmi", SinkType::Hdmi), "HDMI");
        assert_eq!(label("combine-bt", SinkType::Combine), "All Bluetooth Speakers");
        assert_eq!(label("alsa_output.usb", SinkType::Other), "alsa_output.usb");
    }

    #[test]
    fn parses_rows_and_skips_garbage() {
        let sinks = parse_sink_list(SHORT_SINKS);
        let names: Vec<&str> = sinks.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "alsa_output.pci-0000_00_1f.3.hdmi-stereo",
                "bluez_output.AA_BB_CC_DD_EE_FF.1",
                "bluez_sink.11_22_33_44_55_66.a2dp_sink",
                "stagehand-combine",
                "alsa_output.usb-Focusrite",
            ]
        );
        assert_eq!(sinks[1].label, "BT Speaker (EE:FF)");
        assert_eq!(sinks[2].label, "BT Speaker (55:66)");
        assert_eq!(sinks[0].state, "SUSPENDED");
        assert!(sinks.iter().all(|s| !s.is_virtual));
    }

    #[test]
    fn sink_type_from_str() {
        assert_eq!("bluetooth".parse::<SinkType>().unwrap(), SinkType::Bluetooth);
        assert!(matches!(
            "speaker".parse::<SinkType>(),
            Err(StageError::InvalidSinkType(_))
        ));
    }

    #[test]
    fn sink_serializes_contract_keys() {
        let value = serde_json::to_value(Sink::combine()).unwrap();
        assert_eq!(value["type"], "combine");
        assert_eq!(value["virtual"], true);
        assert_eq!(value["label"], "All Bluetooth Speakers");
    }
}
