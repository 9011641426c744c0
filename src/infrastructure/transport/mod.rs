//! Transport Module
//!
//! The byte-stream capability a session runs on. Implementations own the
//! physical link (RFCOMM bridge, TCP socket, loopback); the session layer
//! only ever talks to them through [`Transport`].
//!
//! ## Modules
//!
//! - [`tcp`] - Serial-over-TCP transport, device address is `host:port`
//! - [`memory`] - In-process loopback that records traffic

use crate::domain::errors::TransportError;
use async_trait::async_trait;
use tokio::time::Instant;

pub mod memory;
pub mod tcp;

pub use memory::MemoryTransport;
pub use tcp::TcpTransport;

/// Proof of an opened link
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    pub address: String,
    pub opened_at: Instant,
}

impl ConnectionHandle {
    pub fn new(address: &str) -> Self {
        Self {
            address: address.to_string(),
            opened_at: Instant::now(),
        }
    }
}

/// Addressable byte-stream endpoint
///
/// All methods take `&self` so a transport can be shared as `Arc<dyn Transport>`;
/// implementations use interior mutability for their link table.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open the link to `address`.
    ///
    /// Must be cancel safe: dropping the future before it resolves leaves no
    /// link behind.
    async fn connect(&self, address: &str) -> Result<ConnectionHandle, TransportError>;

    /// Close the link. Must succeed when the link is already gone.
    async fn disconnect(&self, address: &str) -> Result<(), TransportError>;

    /// Write the whole buffer, returning the number of bytes written.
    ///
    /// A peer that stops reading must not block the caller forever.
    async fn write(&self, address: &str, bytes: &[u8]) -> Result<usize, TransportError>;

    /// Level check of the link, used by keepalive
    async fn is_connected(&self, address: &str) -> Result<bool, TransportError>;
}
