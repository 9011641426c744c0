use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::time::Instant;

/// A peer the controller can open a session with.
///
/// Devices are produced by discovery (outside this crate) and never mutated
/// afterwards; the address is whatever the transport understands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    pub address: String,
    pub name: String,
    #[serde(default)]
    pub bonded: bool,
}

impl Device {
    pub fn new(address: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            name: name.into(),
            bonded: false,
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.address)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    Idle,
    Connecting,
    Connected,
    Disconnecting,
    Failed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnecting => "disconnecting",
            Self::Failed => "failed",
        };
        f.write_str(label)
    }
}

/// Read-only copy of the session record handed to the UI layer
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub device: Option<Device>,
    pub state: SessionState,
    pub last_error: Option<String>,
    pub last_keepalive_at: Option<Instant>,
    /// When the transport link of the current Connected period was opened
    pub connected_at: Option<Instant>,
}

/// Events pushed to status subscribers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusEvent {
    StateChanged {
        from: SessionState,
        to: SessionState,
    },
    KeepaliveOk,
    KeepaliveFailed(String),
    WriteFailed(String),
    CommandSent(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Sent,
    System,
}

#[derive(Debug, Clone)]
pub struct MessageLogEntry {
    pub text: String,
    pub kind: MessageKind,
    // Timestamp (Unix milliseconds)
    pub timestamp_ms: i64,
}

impl MessageLogEntry {
    pub fn new(text: impl Into<String>, kind: MessageKind) -> Self {
        let timestamp_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or_default();
        Self {
            text: text.into(),
            kind,
            timestamp_ms,
        }
    }
}

/// Consistent copy of the channel values at one instant
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelSnapshot {
    pub values: Vec<i32>,
    pub any_active: bool,
}

impl ChannelSnapshot {
    pub fn zeroed(count: usize) -> Self {
        Self {
            values: vec![0; count],
            any_active: false,
        }
    }
}
