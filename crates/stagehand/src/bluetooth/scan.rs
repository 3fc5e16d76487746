//! Passive discovery (`bluetoothctl --timeout <n> scan on`).
//!
//! Devices BlueZ already knows show up only as property updates (`RSSI:`)
//! with no name. Those addresses are queued and resolved with `info` once
//! the scan process has exited.

use std::collections::{BTreeSet, HashSet};

use super::parse::{parse_scan_line, BluetoothDevice, DeviceInfo};

/// Dedupe state for one scan.
#[derive(Debug, Default)]
pub struct ScanTracker {
    announced: HashSet<String>,
    pending: BTreeSet<String>,
    discovered: Vec<BluetoothDevice>,
}

impl ScanTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one raw output line; returns a device the first time it is
    /// seen with a name.
    pub fn on_line(&mut self, line: &str) -> Option<BluetoothDevice> {
        let parsed = parse_scan_line(line)?;
        match parsed.name {
            Some(name) => self.announce(parsed.address, name),
            None => {
                if !self.announced.contains(&parsed.address) {
                    self.pending.insert(parsed.address);
                }
                None
            }
        }
    }

    fn announce(&mut self, address: String, name: String) -> Option<BluetoothDevice> {
        if !self.announced.insert(address.clone()) {
            return None;
        }
        self.pending.remove(&address);
        let device = BluetoothDevice { address, name };
        self.discovered.push(device.clone());
        Some(device)
    }

    /// Addresses still waiting for an `info` lookup.
    pub fn take_pending(&mut self) -> Vec<String> {
        std::mem::take(&mut self.pending).into_iter().collect()
    }

    /// Record a resolved lookup. Unnamed devices are dropped, as are devices
    /// whose service list lacks the Audio Sink UUID.
    pub fn resolve(&mut self, info: DeviceInfo) -> Option<BluetoothDevice> {
        let name = info.name?;
        if info.has_uuids && !info.audio {
            return None;
        }
        self.announce(info.address, name)
    }

    pub fn discovered(&self) -> &[BluetoothDevice] {
        &self.discovered
    }

    pub fn into_discovered(self) -> Vec<BluetoothDevice> {
        self.discovered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const SCAN: &str = include_str!("../../tests/fixtures/bluetoothctl_scan.txt");

    #[test]
    fn named_change_then_rssi_only_yields_one_discovery() {
        let mut tracker = ScanTracker::new();
        let first = tracker.on_line("[CHG] Device AA:BB:CC:DD:EE:FF Name: Speaker");
        assert_eq!(
            first,
            Some(BluetoothDevice {
                address: "AA:BB:CC:DD:EE:FF".into(),
                name: "Speaker".into()
            })
        );
        assert_eq!(tracker.on_line("[CHG] Device AA:BB:CC:DD:EE:FF RSSI: -58"), None);
        assert_eq!(tracker.on_line("[CHG] Device AA:BB:CC:DD:EE:FF Name: Speaker"), None);
        assert!(tracker.take_pending().is_empty());
        assert_eq!(tracker.discovered().len(), 1);
    }

    #[test]
    fn fixture_queues_unnamed_devices() {
        let mut tracker = ScanTracker::new();
        let announced: Vec<String> = SCAN
            .lines()
            .filter_map(|l| tracker.on_line(l))
            .map(|d| d.name)
            .collect();
        assert_eq!(announced, vec!["Soundcore Motion+", "JBL Flip 5"]);
        assert_eq!(
            tracker.take_pending(),
            vec!["77:88:99:AA:BB:CC".to_string(), "DE:AD:BE:EF:00:01".to_string()]
        );
        assert!(tracker.take_pending().is_empty());
    }

    #[test]
    fn resolve_filters_non_audio() {
        let mut tracker = ScanTracker::new();
        let speaker = DeviceInfo {
            address: "77:88:99:AA:BB:CC".into(),
            name: Some("Kitchen".into()),
            audio: true,
            has_uuids: true,
            ..Default::default()
        };
        let keyboard = DeviceInfo {
            address: "DE:AD:BE:EF:00:01".into(),
            name: Some("Keyboard".into()),
            audio: false,
            has_uuids: true,
            ..Default::default()
        };
        let unknown = DeviceInfo {
            address: "01:02:03:04:05:06".into(),
            name: Some("Mystery".into()),
            ..Default::default()
        };
        assert!(tracker.resolve(speaker).is_some());
        assert!(tracker.resolve(keyboard).is_none());
        assert!(tracker.resolve(unknown).is_some());
        assert!(tracker
            .resolve(DeviceInfo {
                address: "0A:0B:0C:0D:0E:0F".into(),
                ..Default::default()
            })
            .is_none());
    }
}
