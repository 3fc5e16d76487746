//! stagehand - audio routing control plane for show installations
//!
//! Decides which audio output each stream (video, spotify, sound) plays on,
//! keeps that decision across restarts, merges every Bluetooth speaker into
//! one combine sink on demand, ducks streams under each other, and drives
//! `bluetoothctl` for scanning and pairing.
//!
//! All audio-server and Bluetooth access goes through subprocesses behind
//! [`process::CommandRunner`], so every component can run against a fake.

pub mod bluetooth;
pub mod combine;
pub mod ducking;
pub mod error;
pub mod events;
pub mod monitor;
pub mod persistence;
pub mod process;
pub mod pulse;
pub mod routing;
pub mod service;
pub mod sinks;
pub mod telemetry;

pub use error::{ErrorKind, Result, StageError};
pub use events::{EventBus, StageEvent};
pub use service::Stage;
