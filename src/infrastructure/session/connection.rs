//! Per-session link
//!
//! Wraps the transport and the device address of one Connected period.
//! Every byte sent during the session goes through [`Link::write`], which
//! holds the link's write lock for the whole message.

use crate::domain::errors::TransportError;
use crate::infrastructure::transport::{ConnectionHandle, Transport};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

pub struct Link {
    transport: Arc<dyn Transport>,
    handle: ConnectionHandle,
    write_lock: Mutex<()>,
    closed: AtomicBool,
}

impl Link {
    pub fn new(transport: Arc<dyn Transport>, handle: ConnectionHandle) -> Self {
        Self {
            transport,
            handle,
            write_lock: Mutex::new(()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn address(&self) -> &str {
        &self.handle.address
    }

    pub fn handle(&self) -> &ConnectionHandle {
        &self.handle
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Write one complete message
    pub async fn write(&self, bytes: &[u8]) -> Result<usize, TransportError> {
        let _guard = self.write_lock.lock().await;
        if self.is_closed() {
            return Err(TransportError::Closed(self.address().to_string()));
        }
        self.transport.write(self.address(), bytes).await
    }

    pub(super) async fn is_connected(&self) -> Result<bool, TransportError> {
        self.transport.is_connected(self.address()).await
    }

    /// Close the transport link and reject every later write.
    ///
    /// An in-flight write gets up to `grace` to finish first; the transport
    /// disconnect is bounded by `grace` as well. Closing twice is a no-op.
    pub(super) async fn close(&self, grace: Duration) -> Result<(), TransportError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            debug!("Link to {} already closed", self.address());
            return Ok(());
        }
        info!("Closing link to {}", self.address());

        if tokio::time::timeout(grace, self.write_lock.lock())
            .await
            .is_err()
        {
            warn!("Write to {} still pending, closing anyway", self.address());
        }

        tokio::time::timeout(grace, self.transport.disconnect(self.address()))
            .await
            .map_err(|_| TransportError::TimedOut {
                address: self.address().to_string(),
                operation: "disconnect",
                after: grace,
            })?
    }
}
