//! Interactive pairing: scan → discover → pair → trust, in one session.
//!
//! BlueZ flushes its discovery cache as soon as the process that owns
//! discovery exits, so scanning and pairing must happen inside the same
//! `bluetoothctl` session. [`PairingMachine`] is the pure protocol;
//! [`run_session`] drives it against a supervised child with timers.

use std::fmt;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};

use super::parse::{classify_pairing_line, strip_ansi, PairingSignal};
use crate::error::{Result, StageError};
use crate::process::SupervisedChild;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PairingState {
    Scan,
    Discover,
    Pair,
    Trust,
    Done,
    Failed,
}

impl fmt::Display for PairingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Scan => "scan",
            Self::Discover => "discover",
            Self::Pair => "pair",
            Self::Trust => "trust",
            Self::Done => "done",
            Self::Failed => "failed",
        };
        f.pad(s)
    }
}

/// What the driver should do after feeding the machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    Send(String),
    Succeed,
    Fail(String),
}

#[derive(Debug, Clone)]
pub struct PairingMachine {
    address: String,
    state: PairingState,
}

impl PairingMachine {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            state: PairingState::Scan,
        }
    }

    pub fn state(&self) -> PairingState {
        self.state
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    fn is_finished(&self) -> bool {
        matches!(self.state, PairingState::Done | PairingState::Failed)
    }

    /// Directives sent when the session opens.
    pub fn start(&self) -> Vec<String> {
        vec!["scan on".to_string()]
    }

    fn to_pair(&mut self) -> Step {
        self.state = PairingState::Pair;
        Step::Send(format!("pair {}", self.address))
    }

    /// Feed one already-stripped output line.
    pub fn on_line(&mut self, line: &str) -> Option<Step> {
        if self.is_finished() {
            return None;
        }
        let signal = classify_pairing_line(line, &self.address)?;

        match (self.state, signal) {
            (_, PairingSignal::Failed(message)) => {
                self.state = PairingState::Failed;
                Some(Step::Fail(message))
            }
            (PairingState::Scan, PairingSignal::DiscoveryStarted) => {
                self.state = PairingState::Discover;
                None
            }
            (PairingState::Scan | PairingState::Discover, PairingSignal::DeviceSeen) => {
                Some(self.to_pair())
            }
            (PairingState::Pair, PairingSignal::Paired | PairingSignal::AlreadyPaired) => {
                self.state = PairingState::Trust;
                Some(Step::Send(format!("trust {}", self.address)))
            }
            (PairingState::Trust, PairingSignal::Trusted) => {
                self.state = PairingState::Done;
                Some(Step::Succeed)
            }
            _ => None,
        }
    }

    /// The discovery timer fired. A device BlueZ already knows may never be
    /// announced again, so pairing is attempted anyway.
    pub fn on_discovery_timeout(&mut self) -> Option<Step> {
        match self.state {
            PairingState::Scan | PairingState::Discover => Some(self.to_pair()),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PairingTimings {
    /// Forced move to `pair` when the device hasn't been seen
    pub discovery: Duration,
    /// Budget for pair + trust; the session deadline is this plus `discovery`
    pub pair: Duration,
    /// Between the `exit` directive and the force kill
    pub grace: Duration,
}

impl PairingTimings {
    pub fn from_config(config: &stageconf::BluetoothConfig) -> Self {
        Self {
            discovery: Duration::from_millis(config.discovery_timeout_ms),
            pair: Duration::from_millis(config.pair_timeout_ms),
            grace: Duration::from_millis(config.teardown_grace_ms),
        }
    }

    pub fn deadline(&self) -> Duration {
        self.discovery + self.pair
    }
}

/// Drive one pairing attempt to completion. The child is always torn down
/// before this returns.
pub async fn run_session(
    mut child: SupervisedChild,
    address: &str,
    timings: PairingTimings,
) -> Result<()> {
    let mut machine = PairingMachine::new(address);
    for directive in machine.start() {
        child.send(&directive);
    }
    info!(address, "📡 pairing session started");

    let discovery = tokio::time::sleep(timings.discovery);
    let deadline = tokio::time::sleep(timings.deadline());
    tokio::pin!(discovery, deadline);
    let mut discovery_pending = true;

    let outcome = loop {
        tokio::select! {
            line = child.lines.recv() => {
                let Some(line) = line else {
                    break Err(StageError::SessionExited {
                        program: child.program.clone(),
                        state: machine.state().to_string(),
                    });
                };
                let line = strip_ansi(&line);
                debug!(address, state = %machine.state(), "{}", line.trim());
                match machine.on_line(&line) {
                    Some(Step::Send(directive)) => {
                        debug!(address, %directive, "sending");
                        child.send(&directive);
                    }
                    Some(Step::Succeed) => break Ok(()),
                    Some(Step::Fail(message)) => break Err(StageError::PairingFailed(message)),
                    None => {}
                }
            }
            _ = &mut discovery, if discovery_pending => {
                discovery_pending = false;
                if let Some(Step::Send(directive)) = machine.on_discovery_timeout() {
                    // Possible false success: an absent device looks the same
                    // as a cached one until `pair` fails
                    warn!(address, "device not seen before discovery timeout, pairing anyway");
                    child.send(&directive);
                }
            }
            _ = &mut deadline => {
                break Err(StageError::PairingTimeout(address.to_string()));
            }
        }
    };

    match &outcome {
        Ok(()) => info!(address, "✅ paired and trusted"),
        Err(e) => warn!(address, state = %machine.state(), "pairing failed: {}", e),
    }

    teardown(child, timings.grace).await;
    outcome
}

async fn teardown(mut child: SupervisedChild, grace: Duration) {
    child.send("scan off");
    child.send("exit");
    let _ = tokio::time::timeout(grace, &mut child.exit).await;
    child.kill.kill();
    debug!(program = %child.program, "pairing session torn down");
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const ADDR: &str = "AA:BB:CC:DD:EE:FF";

    fn feed(machine: &mut PairingMachine, lines: &[&str]) -> Vec<Step> {
        lines.iter().filter_map(|l| machine.on_line(l)).collect()
    }

    #[test]
    fn happy_path_sends_pair_then_trust() {
        let mut machine = PairingMachine::new(ADDR);
        assert_eq!(machine.start(), vec!["scan on".to_string()]);

        let steps = feed(
            &mut machine,
            &[
                "Discovery started",
                "[NEW] Device AA:BB:CC:DD:EE:FF JBL Flip 5",
                "[CHG] Device AA:BB:CC:DD:EE:FF RSSI: -60",
                "Attempting to pair with AA:BB:CC:DD:EE:FF",
                "Pairing successful",
                "Changing AA:BB:CC:DD:EE:FF trust succeeded",
            ],
        );
        assert_eq!(
            steps,
            vec![
                Step::Send(format!("pair {}", ADDR)),
                Step::Send(format!("trust {}", ADDR)),
                Step::Succeed,
            ]
        );
        assert_eq!(machine.state(), PairingState::Done);
    }

    #[test]
    fn already_paired_moves_to_trust() {
        let mut machine = PairingMachine::new(ADDR);
        let steps = feed(
            &mut machine,
            &[
                "[NEW] Device AA:BB:CC:DD:EE:FF JBL",
                "Failed to pair: org.bluez.Error.AlreadyExists",
            ],
        );
        assert_eq!(steps.last(), Some(&Step::Send(format!("trust {}", ADDR))));
        assert_eq!(machine.state(), PairingState::Trust);
    }

    #[test]
    fn failure_keeps_raw_message() {
        let mut machine = PairingMachine::new(ADDR);
        machine.on_discovery_timeout();
        let step = machine.on_line("Failed to pair: org.bluez.Error.ConnectionAttemptFailed");
        assert_eq!(
            step,
            Some(Step::Fail(
                "Failed to pair: org.bluez.Error.ConnectionAttemptFailed".into()
            ))
        );
        assert_eq!(machine.state(), PairingState::Failed);
        assert_eq!(machine.on_line("Pairing successful"), None);
    }

    #[test]
    fn discovery_timeout_forces_pair_once() {
        let mut machine = PairingMachine::new(ADDR);
        machine.on_line("Discovery started");
        assert_eq!(
            machine.on_discovery_timeout(),
            Some(Step::Send(format!("pair {}", ADDR)))
        );
        assert_eq!(machine.on_discovery_timeout(), None);
        // Late sighting after the forced pair is ignored
        assert_eq!(machine.on_line("[NEW] Device AA:BB:CC:DD:EE:FF JBL"), None);
    }

    #[test]
    fn trust_before_pair_is_ignored() {
        let mut machine = PairingMachine::new(ADDR);
        assert_eq!(machine.on_line("Changing AA:BB:CC:DD:EE:FF trust succeeded"), None);
        assert_eq!(machine.state(), PairingState::Scan);
    }
}
