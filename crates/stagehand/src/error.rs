//! Error types and their operator-facing classification.
//!
//! Every failure surfaced by the control plane is a [`StageError`]. Callers
//! that need to decide between "tell the operator" and "log and carry on"
//! look at [`StageError::kind`] rather than matching variants.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Broad failure categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Bad stream name, bad MAC; rejected before any process is spawned
    InvalidInput,
    /// No matching sink, no sink-input yet, too few speakers
    ResourceUnavailable,
    /// A wrapped CLI tool failed; its message is kept intact
    ExternalCommandFailure,
    /// An interactive session did not reach its next state in time
    ProtocolTimeout,
    /// A supervised set lost a member and was torn down
    InvariantViolation,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidInput => "invalid_input",
            Self::ResourceUnavailable => "resource_unavailable",
            Self::ExternalCommandFailure => "external_command_failure",
            Self::ProtocolTimeout => "protocol_timeout",
            Self::InvariantViolation => "invariant_violation",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum StageError {
    #[error("Invalid stream '{0}'. Valid streams: video, spotify, sound")]
    InvalidStream(String),

    #[error("Invalid sink type '{0}'. Valid types: hdmi, bluetooth, combine, other")]
    InvalidSinkType(String),

    #[error("Invalid lifecycle '{0}'. Valid: started, resumed, completed, paused")]
    InvalidLifecycle(String),

    #[error("Invalid Bluetooth address '{0}'")]
    InvalidAddress(String),

    #[error("No available sink for stream '{0}'")]
    NoSinkAvailable(String),

    #[error("No active sink-input for stream '{0}'")]
    NoActiveSinkInput(String),

    #[error("Need at least 2 Bluetooth speakers, found {found}")]
    InsufficientSpeakers { found: usize },

    #[error("Failed to route stream '{stream}': {message}")]
    RouteFailed { stream: String, message: String },

    #[error("{program} failed: {message}")]
    CommandFailed { program: String, message: String },

    #[error("{program} timed out after {}ms", .timeout.as_millis())]
    CommandTimeout { program: String, timeout: Duration },

    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Pairing failed: {0}")]
    PairingFailed(String),

    #[error("Pairing timed out for {0}")]
    PairingTimeout(String),

    #[error("{program} exited before completing ({state})")]
    SessionExited { program: String, state: String },

    #[error("Combine sink member exited: {0}")]
    MemberExited(String),
}

impl StageError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidStream(_)
            | Self::InvalidSinkType(_)
            | Self::InvalidLifecycle(_)
            | Self::InvalidAddress(_) => ErrorKind::InvalidInput,
            Self::NoSinkAvailable(_)
            | Self::NoActiveSinkInput(_)
            | Self::InsufficientSpeakers { .. } => ErrorKind::ResourceUnavailable,
            Self::RouteFailed { .. }
            | Self::CommandFailed { .. }
            | Self::Spawn { .. }
            | Self::Persistence(_)
            | Self::PairingFailed(_)
            | Self::SessionExited { .. } => ErrorKind::ExternalCommandFailure,
            Self::CommandTimeout { .. } | Self::PairingTimeout(_) => ErrorKind::ProtocolTimeout,
            Self::MemberExited(_) => ErrorKind::InvariantViolation,
        }
    }

    /// True for "this app isn't playing right now", which the ducking path
    /// treats as a warning rather than an error.
    pub fn is_no_active_sink_input(&self) -> bool {
        matches!(self, Self::NoActiveSinkInput(_))
    }
}

pub type Result<T, E = StageError> = std::result::Result<T, E>;
