//! Error types shared by the session and streaming layers.

use std::time::Duration;
use thiserror::Error;

/// Failures reported by a [`Transport`](crate::infrastructure::transport::Transport)
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("could not open link to {address}: {reason}")]
    ConnectFailed { address: String, reason: String },

    #[error("link to {0} is closed")]
    Closed(String),

    #[error("{operation} on {address} timed out after {after:?}")]
    TimedOut {
        address: String,
        operation: &'static str,
        after: Duration,
    },

    #[error("transport rejected the request: {0}")]
    Rejected(String),

    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("transport unavailable: {0}")]
    TransportUnavailable(#[source] TransportError),

    #[error("link lost: {0}")]
    LinkLost(String),

    #[error("a connection attempt is already in progress")]
    AlreadyConnecting,

    #[error("session is not connected")]
    NotConnected,

    #[error("channel index {index} out of range (channel count {count})")]
    IndexOutOfRange { index: usize, count: usize },

    #[error("telemetry transmitter is already running")]
    TransmitterAlreadyRunning,

    #[error("connection attempt was cancelled by disconnect")]
    ConnectCancelled,

    #[error("command text is empty")]
    EmptyCommand,

    #[error("value {0} is outside 0..=100")]
    ValueOutOfRange(u32),
}

pub type SessionResult<T> = std::result::Result<T, SessionError>;
