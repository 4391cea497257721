use thiserror::Error;

use crate::models::{AdapterState, DenialReason};

/// Error type for every fallible call into the connectivity core.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SensorLinkError {
    #[error("bluetooth permissions not granted ({reason:?})")]
    PermissionDenied { reason: DenialReason },

    #[error("bluetooth radio not ready ({state:?}), please enable your radio")]
    RadioNotReady { state: AdapterState },

    #[error("scan failed: {reason}")]
    ScanFailed { reason: String },

    #[error("failed to connect to {device}: {reason}")]
    ConnectionFailed { device: String, reason: String },

    #[error("connection to {device} was cancelled")]
    ConnectionCancelled { device: String },

    #[error("no ready session to stream from")]
    SessionNotReady,

    #[error("radio error: {reason}")]
    Radio { reason: String },

    #[error("bluetooth stack unavailable: {reason}")]
    Unsupported { reason: String },

    #[error("connectivity core has stopped")]
    CoreStopped,
}

impl From<btleplug::Error> for SensorLinkError {
    fn from(err: btleplug::Error) -> Self {
        SensorLinkError::Radio {
            reason: err.to_string(),
        }
    }
}

/// Error type for notification payloads that cannot be decoded.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("empty payload")]
    EmptyPayload,

    #[error("expected a single byte, got {len}")]
    OversizedPayload { len: usize },
}
