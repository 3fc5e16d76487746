//! Lifecycle events for the external sync/observability layer.
//!
//! Event names are a contract: the sync layer keys off the `event` field, so
//! variants are renamed explicitly and payload fields are camelCase.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all_fields = "camelCase")]
pub enum StageEvent {
    #[serde(rename = "routing:changed")]
    RoutingChanged {
        stream: String,
        sink: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        fallback: Option<String>,
    },

    #[serde(rename = "routing:applied")]
    RoutingApplied {
        stream: String,
        sink: String,
        fallback: bool,
    },

    #[serde(rename = "routing:fallback")]
    RoutingFallback {
        stream: String,
        requested: String,
        actual: String,
        reason: String,
    },

    #[serde(rename = "routing:error")]
    RoutingError { stream: String, error: String },

    #[serde(rename = "sink:added")]
    SinkAdded { id: String },

    #[serde(rename = "sink:removed")]
    SinkRemoved { id: String },

    #[serde(rename = "combine-sink:created")]
    CombineSinkCreated { pids: Vec<u32>, sinks: Vec<String> },

    #[serde(rename = "combine-sink:destroyed")]
    CombineSinkDestroyed { reason: String },

    #[serde(rename = "ducking:changed")]
    DuckingChanged {
        target: String,
        ducked: bool,
        active_sources: Vec<String>,
        volume: u8,
        restore_volume: u8,
    },

    #[serde(rename = "device:discovered")]
    DeviceDiscovered { address: String, name: String },

    #[serde(rename = "device:paired")]
    DevicePaired { address: String },

    #[serde(rename = "device:connected")]
    DeviceConnected { address: String },

    #[serde(rename = "device:disconnected")]
    DeviceDisconnected { address: String },

    #[serde(rename = "device:unpaired")]
    DeviceUnpaired { address: String },

    #[serde(rename = "scan:started")]
    ScanStarted { timeout_secs: u64 },

    #[serde(rename = "scan:stopped")]
    ScanStopped { discovered: usize },
}

impl StageEvent {
    /// The contract name, e.g. `routing:fallback`.
    pub fn name(&self) -> &'static str {
        match self {
            Self::RoutingChanged { .. } => "routing:changed",
            Self::RoutingApplied { .. } => "routing:applied",
            Self::RoutingFallback { .. } => "routing:fallback",
            Self::RoutingError { .. } => "routing:error",
            Self::SinkAdded { .. } => "sink:added",
            Self::SinkRemoved { .. } => "sink:removed",
            Self::CombineSinkCreated { .. } => "combine-sink:created",
            Self::CombineSinkDestroyed { .. } => "combine-sink:destroyed",
            Self::DuckingChanged { .. } => "ducking:changed",
            Self::DeviceDiscovered { .. } => "device:discovered",
            Self::DevicePaired { .. } => "device:paired",
            Self::DeviceConnected { .. } => "device:connected",
            Self::DeviceDisconnected { .. } => "device:disconnected",
            Self::DeviceUnpaired { .. } => "device:unpaired",
            Self::ScanStarted { .. } => "scan:started",
            Self::ScanStopped { .. } => "scan:stopped",
        }
    }
}

/// An event with its emission time, as written by `stagehand serve`.
#[derive(Debug, Clone, Serialize)]
pub struct StampedEvent {
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub event: StageEvent,
}

impl From<StageEvent> for StampedEvent {
    fn from(event: StageEvent) -> Self {
        Self {
            at: Utc::now(),
            event,
        }
    }
}

/// Fan-out of [`StageEvent`]s to any number of subscribers.
///
/// Emitting with no subscribers is not an error; slow subscribers lag and
/// lose the oldest events rather than blocking the emitter.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<StageEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn emit(&self, event: StageEvent) {
        debug!(event = event.name(), "emit");
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StageEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
