//! `bluetoothctl` output parsing.
//!
//! Interactive output is full of colour codes, prompt redraws and carriage
//! returns. Every line goes through [`strip_ansi`] before any matching.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{Result, StageError};

/// Audio Sink service class (A2DP sink).
pub const AUDIO_SINK_UUID: &str = "0000110b";

static ANSI: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\x1b\[[0-9;?]*[ -/]*[@-~]|\x1b[()][0-9A-Za-z]|\x1b[=>]|[\x01\x02\r]")
        .expect("static regex")
});

static MAC: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[0-9A-Fa-f]{2}(:[0-9A-Fa-f]{2}){5}$").expect("static regex"));

static DEVICE_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^Device ([0-9A-Fa-f:]{17})(?: (.+))?$").expect("static regex")
});

static SCAN_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\[(NEW|CHG)\] Device ([0-9A-Fa-f:]{17})(?: (.*))?$").expect("static regex")
});

static CONTROLLER_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^Controller ([0-9A-Fa-f:]{17})").expect("static regex")
});

/// Remove terminal control sequences and carriage returns.
pub fn strip_ansi(line: &str) -> String {
    ANSI.replace_all(line, "").into_owned()
}

pub fn is_valid_address(address: &str) -> bool {
    MAC.is_match(address)
}

/// Validate and normalise to upper case.
pub fn validate_address(address: &str) -> Result<String> {
    let trimmed = address.trim();
    if !is_valid_address(trimmed) {
        return Err(StageError::InvalidAddress(address.to_string()));
    }
    Ok(trimmed.to_uppercase())
}

/// `bluetoothctl` prints unnamed devices with their address in dash form.
fn real_name(address: &str, name: &str) -> Option<String> {
    let name = name.trim();
    if name.is_empty() || name.replace('-', ":").eq_ignore_ascii_case(address) {
        None
    } else {
        Some(name.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BluetoothDevice {
    pub address: String,
    pub name: String,
}

/// Parse `Device <MAC> <name>` lines from `devices Paired|Connected`.
pub fn parse_devices(output: &str) -> Vec<BluetoothDevice> {
    output
        .lines()
        .filter_map(|line| {
            let line = strip_ansi(line);
            let caps = DEVICE_LINE.captures(line.trim())?;
            let address = caps[1].to_uppercase();
            let name = caps
                .get(2)
                .and_then(|m| real_name(&address, m.as_str()))
                .unwrap_or_else(|| address.clone());
            Some(BluetoothDevice { address, name })
        })
        .collect()
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterStatus {
    pub controller: Option<String>,
    pub powered: bool,
    pub discoverable: bool,
    pub discovering: bool,
}

fn yes(value: &str) -> bool {
    value.trim().eq_ignore_ascii_case("yes")
}

/// Parse the `show` block.
pub fn parse_show(output: &str) -> AdapterStatus {
    let mut status = AdapterStatus::default();
    for line in output.lines() {
        let line = strip_ansi(line);
        let line = line.trim();
        if let Some(caps) = CONTROLLER_LINE.captures(line) {
            status.controller = Some(caps[1].to_uppercase());
        } else if let Some((key, value)) = line.split_once(':') {
            match key {
                "Powered" => status.powered = yes(value),
                "Discoverable" => status.discoverable = yes(value),
                "Discovering" => status.discovering = yes(value),
                _ => {}
            }
        }
    }
    status
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub address: String,
    pub name: Option<String>,
    pub connected: bool,
    pub paired: bool,
    pub trusted: bool,
    /// Advertises the Audio Sink UUID
    pub audio: bool,
    /// Whether the block listed any UUIDs at all
    pub has_uuids: bool,
}

/// Parse an `info <MAC>` block.
pub fn parse_info(address: &str, output: &str) -> DeviceInfo {
    let mut info = DeviceInfo {
        address: address.to_uppercase(),
        ..Default::default()
    };
    for line in output.lines() {
        let line = strip_ansi(line);
        let Some((key, value)) = line.trim().split_once(':') else {
            continue;
        };
        match key {
            "Name" => info.name = real_name(address, value),
            "Alias" if info.name.is_none() => info.name = real_name(address, value),
            "Connected" => info.connected = yes(value),
            "Paired" => info.paired = yes(value),
            "Trusted" => info.trusted = yes(value),
            "UUID" => {
                info.has_uuids = true;
                if value.to_lowercase().contains(AUDIO_SINK_UUID) {
                    info.audio = true;
                }
            }
            _ => {}
        }
    }
    info
}

/// What a line of the interactive pairing session means for `address`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PairingSignal {
    DiscoveryStarted,
    DeviceSeen,
    Paired,
    AlreadyPaired,
    Trusted,
    Failed(String),
}

/// Classify one stripped session line. Order matters: `AlreadyExists`
/// arrives as a "Failed to pair" line but means success.
pub fn classify_pairing_line(line: &str, address: &str) -> Option<PairingSignal> {
    let line = line.trim();
    let lower = line.to_lowercase();

    if line.contains("AlreadyExists") || lower.contains("already paired") {
        return Some(PairingSignal::AlreadyPaired);
    }
    if line.contains("Failed to pair") || lower.contains("not available") {
        return Some(PairingSignal::Failed(line.to_string()));
    }
    if line.contains("Pairing successful") {
        return Some(PairingSignal::Paired);
    }
    if lower.contains("trust succeeded") {
        return Some(PairingSignal::Trusted);
    }
    if line.contains("Discovery started") {
        return Some(PairingSignal::DiscoveryStarted);
    }
    if lower.contains(&address.to_lowercase()) {
        return Some(PairingSignal::DeviceSeen);
    }
    None
}

/// A device line from a passive scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanLine {
    pub address: String,
    /// Present when the line names the device; property updates like
    /// `RSSI:` carry none.
    pub name: Option<String>,
}

pub fn parse_scan_line(line: &str) -> Option<ScanLine> {
    let line = strip_ansi(line);
    let caps = SCAN_LINE.captures(line.trim())?;
    let address = caps[2].to_uppercase();
    let rest = caps.get(3).map(|m| m.as_str()).unwrap_or("");

    let name = match &caps[1] {
        "NEW" => real_name(&address, rest),
        _ => rest
            .strip_prefix("Name:")
            .or_else(|| rest.strip_prefix("Alias:"))
            .and_then(|name| real_name(&address, name)),
    };
    Some(ScanLine { address, name })
}
