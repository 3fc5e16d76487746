//! Bluetooth adapter control over `bluetoothctl`.
//!
//! One-shot queries and commands run through the [`CommandRunner`] with a
//! bounded timeout. Long-lived children (passive scan, pairing sessions) are
//! tracked so [`BluetoothService::cleanup`] can kill every one of them.

pub mod pairing;
pub mod parse;
pub mod scan;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::join_all;
use tracing::{debug, info, warn};

use crate::error::{Result, StageError};
use crate::events::{EventBus, StageEvent};
use crate::process::{CommandRunner, KillHandle, SupervisedChild};

pub use pairing::{PairingMachine, PairingState, PairingTimings};
pub use parse::{AdapterStatus, BluetoothDevice, DeviceInfo};
pub use scan::ScanTracker;

/// Extra time past `--timeout` before a scan is killed outright.
const SCAN_WATCHDOG_SLACK: Duration = Duration::from_secs(5);

#[derive(Clone)]
pub struct BluetoothService {
    inner: Arc<Inner>,
}

struct Inner {
    runner: Arc<dyn CommandRunner>,
    program: String,
    command_timeout: Duration,
    config: stageconf::BluetoothConfig,
    bus: EventBus,
    scan: Mutex<Option<(u64, KillHandle)>>,
    sessions: Mutex<HashMap<u64, KillHandle>>,
    next_id: AtomicU64,
}

/// Which `bluetoothctl` output lines mean a one-shot command failed even
/// though it exited 0.
const FAILURE_MARKERS: [&str; 3] = ["Failed to", "not available", "org.bluez.Error"];

impl BluetoothService {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        program: impl Into<String>,
        command_timeout: Duration,
        config: stageconf::BluetoothConfig,
        bus: EventBus,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                runner,
                program: program.into(),
                command_timeout,
                config,
                bus,
                scan: Mutex::new(None),
                sessions: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    async fn run(&self, args: &[&str], timeout: Duration) -> Result<String> {
        let output = self.inner.runner.run(&self.inner.program, args, timeout).await?;
        if let Some(line) = output
            .lines()
            .map(parse::strip_ansi)
            .find(|l| FAILURE_MARKERS.iter().any(|m| l.contains(m)))
        {
            return Err(StageError::CommandFailed {
                program: self.inner.program.clone(),
                message: line.trim().to_string(),
            });
        }
        Ok(output)
    }

    pub async fn adapter_status(&self) -> Result<AdapterStatus> {
        let output = self.run(&["show"], self.inner.command_timeout).await?;
        Ok(parse::parse_show(&output))
    }

    pub async fn paired_devices(&self) -> Result<Vec<BluetoothDevice>> {
        let output = self
            .run(&["devices", "Paired"], self.inner.command_timeout)
            .await?;
        Ok(parse::parse_devices(&output))
    }

    pub async fn connected_devices(&self) -> Result<Vec<BluetoothDevice>> {
        let output = self
            .run(&["devices", "Connected"], self.inner.command_timeout)
            .await?;
        Ok(parse::parse_devices(&output))
    }

    pub async fn device_info(&self, address: &str) -> Result<DeviceInfo> {
        let address = parse::validate_address(address)?;
        let output = self
            .run(&["info", &address], self.inner.command_timeout)
            .await?;
        Ok(parse::parse_info(&address, &output))
    }

    pub async fn connect(&self, address: &str) -> Result<()> {
        let address = parse::validate_address(address)?;
        let timeout = Duration::from_millis(self.inner.config.connect_timeout_ms);
        self.run(&["connect", &address], timeout).await?;
        info!(address = %address, "🔗 connected");
        self.inner
            .bus
            .emit(StageEvent::DeviceConnected { address });
        Ok(())
    }

    pub async fn disconnect(&self, address: &str) -> Result<()> {
        let address = parse::validate_address(address)?;
        self.run(&["disconnect", &address], self.inner.command_timeout)
            .await?;
        info!(address = %address, "disconnected");
        self.inner
            .bus
            .emit(StageEvent::DeviceDisconnected { address });
        Ok(())
    }

    /// Forget a paired device (`remove`).
    pub async fn unpair(&self, address: &str) -> Result<()> {
        let address = parse::validate_address(address)?;
        self.run(&["remove", &address], self.inner.command_timeout)
            .await?;
        info!(address = %address, "unpaired");
        self.inner.bus.emit(StageEvent::DeviceUnpaired { address });
        Ok(())
    }

    /// Pair and trust `address` in a single interactive session, then try
    /// to connect in the background.
    pub async fn pair(&self, address: &str) -> Result<()> {
        let address = parse::validate_address(address)?;
        self.stop_scan();

        let child = self.inner.runner.spawn(&self.inner.program, &[])?;
        let id = self.inner.track_session(child.kill.clone());
        let timings = PairingTimings::from_config(&self.inner.config);
        let outcome = pairing::run_session(child, &address, timings).await;
        self.inner.untrack_session(id);
        outcome?;

        self.inner.bus.emit(StageEvent::DevicePaired {
            address: address.clone(),
        });

        let service = self.clone();
        tokio::spawn(async move {
            if let Err(e) = service.connect(&address).await {
                warn!(address = %address, "auto-connect after pairing failed: {}", e);
            }
        });
        Ok(())
    }

    /// Start a passive scan in the background. Events report progress;
    /// `scan:stopped` always fires once the scan ends.
    pub fn start_scan(&self) -> Result<()> {
        let child = self.begin_scan()?;
        let service = self.clone();
        tokio::spawn(async move {
            service.finish_scan(child).await;
        });
        Ok(())
    }

    /// Run a passive scan to completion.
    pub async fn scan(&self) -> Result<Vec<BluetoothDevice>> {
        let child = self.begin_scan()?;
        Ok(self.finish_scan(child).await)
    }

    fn begin_scan(&self) -> Result<(u64, SupervisedChild)> {
        self.stop_scan();

        let secs = self.inner.config.scan_timeout_secs;
        let timeout_arg = secs.to_string();
        let child = self
            .inner
            .runner
            .spawn(&self.inner.program, &["--timeout", &timeout_arg, "scan", "on"])?;

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        *self.inner.scan.lock().unwrap_or_else(|e| e.into_inner()) =
            Some((id, child.kill.clone()));

        info!(timeout_secs = secs, "scan started");
        self.inner
            .bus
            .emit(StageEvent::ScanStarted { timeout_secs: secs });
        Ok((id, child))
    }

    async fn finish_scan(&self, (id, child): (u64, SupervisedChild)) -> Vec<BluetoothDevice> {
        let SupervisedChild {
            mut lines, kill, ..
        } = child;
        let mut tracker = ScanTracker::new();

        let watchdog = tokio::time::sleep(
            Duration::from_secs(self.inner.config.scan_timeout_secs) + SCAN_WATCHDOG_SLACK,
        );
        tokio::pin!(watchdog);
        loop {
            tokio::select! {
                line = lines.recv() => {
                    let Some(line) = line else { break };
                    if let Some(device) = tracker.on_line(&line) {
                        debug!(address = %device.address, name = %device.name, "discovered");
                        self.inner.bus.emit(StageEvent::DeviceDiscovered {
                            address: device.address,
                            name: device.name,
                        });
                    }
                }
                _ = &mut watchdog => {
                    warn!("scan overran its timeout, killing");
                    kill.kill();
                    break;
                }
            }
        }
        kill.kill();

        {
            let mut scan = self.inner.scan.lock().unwrap_or_else(|e| e.into_inner());
            if scan.as_ref().is_some_and(|(current, _)| *current == id) {
                *scan = None;
            }
        }

        // Cached devices never re-announce their name; ask for it directly
        let pending = tracker.take_pending();
        if !pending.is_empty() {
            debug!(count = pending.len(), "resolving unnamed devices");
            let lookups = pending.iter().map(|address| self.device_info(address));
            for (address, result) in pending.iter().zip(join_all(lookups).await) {
                match result {
                    Ok(info) => {
                        if let Some(device) = tracker.resolve(info) {
                            self.inner.bus.emit(StageEvent::DeviceDiscovered {
                                address: device.address,
                                name: device.name,
                            });
                        }
                    }
                    Err(e) => debug!(address = %address, "info lookup failed: {}", e),
                }
            }
        }

        let discovered = tracker.into_discovered();
        info!(discovered = discovered.len(), "scan stopped");
        self.inner.bus.emit(StageEvent::ScanStopped {
            discovered: discovered.len(),
        });
        discovered
    }

    /// Kill a running passive scan, if any.
    pub fn stop_scan(&self) {
        let current = self
            .inner
            .scan
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some((_, kill)) = current {
            debug!("stopping passive scan");
            kill.kill();
        }
    }

    pub fn is_scanning(&self) -> bool {
        self.inner
            .scan
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    /// Kill every tracked child.
    pub fn cleanup(&self) {
        self.stop_scan();
        let sessions: Vec<KillHandle> = self
            .inner
            .sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain()
            .map(|(_, kill)| kill)
            .collect();
        for kill in &sessions {
            kill.kill();
        }
        debug!(sessions = sessions.len(), "bluetooth children cleaned up");
    }
}

impl Inner {
    fn track_session(&self, kill: KillHandle) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, kill);
        id
    }

    fn untrack_session(&self, id: u64) {
        self.sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id);
    }
}
