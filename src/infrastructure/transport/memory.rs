//! In-process loopback transport
//!
//! Records every operation so callers can inspect exactly what would have
//! gone over the wire. Failure knobs simulate refused connects, failed
//! writes, stalled writes and silent link drops.

use super::{ConnectionHandle, Transport};
use crate::domain::errors::TransportError;
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Connect(String),
    Write {
        address: String,
        bytes: Vec<u8>,
        at: Instant,
    },
    Disconnect(String),
}

#[derive(Debug, Default)]
struct MemoryState {
    open: HashSet<String>,
    events: Vec<TransportEvent>,
    refuse_connects: bool,
    connect_delay: Option<Duration>,
    failing_writes: usize,
    drop_on_write_failure: bool,
    stall_writes: bool,
    check_errors: bool,
}

#[derive(Debug, Default)]
pub struct MemoryTransport {
    state: Mutex<MemoryState>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every subsequent connect fails
    pub fn refuse_connects(&self, refuse: bool) {
        self.lock().refuse_connects = refuse;
    }

    /// Make connects take `delay` before resolving
    pub fn set_connect_delay(&self, delay: Option<Duration>) {
        self.lock().connect_delay = delay;
    }

    /// The next `count` writes fail. With `drop_link`, the first failure also
    /// closes the link the way a silent radio drop would.
    pub fn fail_next_writes(&self, count: usize, drop_link: bool) {
        let mut state = self.lock();
        state.failing_writes = count;
        state.drop_on_write_failure = drop_link;
    }

    /// Writes never complete, like a peer that stopped reading
    pub fn stall_writes(&self, stall: bool) {
        self.lock().stall_writes = stall;
    }

    /// Close the link without telling anyone
    pub fn drop_link(&self, address: &str) {
        debug!("Simulating silent drop of {}", address);
        self.lock().open.remove(address);
    }

    /// Make liveness checks raise instead of answering
    pub fn fail_liveness_checks(&self, fail: bool) {
        self.lock().check_errors = fail;
    }

    pub fn events(&self) -> Vec<TransportEvent> {
        self.lock().events.clone()
    }

    /// Written payloads as text, in order
    pub fn written_lines(&self) -> Vec<String> {
        self.lock()
            .events
            .iter()
            .filter_map(|e| match e {
                TransportEvent::Write { bytes, .. } => {
                    Some(String::from_utf8_lossy(bytes).into_owned())
                }
                _ => None,
            })
            .collect()
    }

    pub fn write_count(&self) -> usize {
        self.written_lines().len()
    }

    pub fn is_open(&self, address: &str) -> bool {
        self.lock().open.contains(address)
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn connect(&self, address: &str) -> Result<ConnectionHandle, TransportError> {
        let delay = self.lock().connect_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.lock();
        if state.refuse_connects {
            return Err(TransportError::ConnectFailed {
                address: address.to_string(),
                reason: "connection refused".to_string(),
            });
        }
        state.open.insert(address.to_string());
        state.events.push(TransportEvent::Connect(address.to_string()));
        Ok(ConnectionHandle::new(address))
    }

    async fn disconnect(&self, address: &str) -> Result<(), TransportError> {
        let mut state = self.lock();
        state.open.remove(address);
        state
            .events
            .push(TransportEvent::Disconnect(address.to_string()));
        Ok(())
    }

    async fn write(&self, address: &str, bytes: &[u8]) -> Result<usize, TransportError> {
        let stalled = self.lock().stall_writes;
        if stalled {
            std::future::pending::<()>().await;
        }

        let mut state = self.lock();
        if !state.open.contains(address) {
            return Err(TransportError::Closed(address.to_string()));
        }
        if state.failing_writes > 0 {
            state.failing_writes -= 1;
            if state.drop_on_write_failure {
                state.open.remove(address);
            }
            return Err(TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "simulated write failure",
            )));
        }

        trace!("{} <- {:?}", address, String::from_utf8_lossy(bytes));
        state.events.push(TransportEvent::Write {
            address: address.to_string(),
            bytes: bytes.to_vec(),
            at: Instant::now(),
        });
        Ok(bytes.len())
    }

    async fn is_connected(&self, address: &str) -> Result<bool, TransportError> {
        let state = self.lock();
        if state.check_errors {
            return Err(TransportError::Rejected("liveness check failed".to_string()));
        }
        Ok(state.open.contains(address))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_records_traffic() {
        let transport = MemoryTransport::new();
        transport.connect("dev").await.unwrap();
        transport.write("dev", b"hello").await.unwrap();
        transport.disconnect("dev").await.unwrap();

        let events = transport.events();
        assert_eq!(events.len(), 3);
        assert_eq!(events[0], TransportEvent::Connect("dev".to_string()));
        assert_eq!(events[2], TransportEvent::Disconnect("dev".to_string()));
        assert_eq!(transport.written_lines(), vec!["hello".to_string()]);
    }

    #[tokio::test]
    async fn test_failing_write_can_drop_link() {
        let transport = MemoryTransport::new();
        transport.connect("dev").await.unwrap();
        transport.fail_next_writes(1, true);

        assert!(transport.write("dev", b"a").await.is_err());
        assert!(!transport.is_connected("dev").await.unwrap());
        assert!(matches!(
            transport.write("dev", b"b").await,
            Err(TransportError::Closed(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_write_never_completes() {
        let transport = MemoryTransport::new();
        transport.connect("dev").await.unwrap();
        transport.stall_writes(true);

        let write = tokio::time::timeout(Duration::from_secs(60), transport.write("dev", b"a"));
        assert!(write.await.is_err());
        assert!(transport.is_connected("dev").await.unwrap());
        assert_eq!(transport.write_count(), 0);
    }

    #[tokio::test]
    async fn test_refused_connect() {
        let transport = MemoryTransport::new();
        transport.refuse_connects(true);
        assert!(matches!(
            transport.connect("dev").await,
            Err(TransportError::ConnectFailed { .. })
        ));
        assert!(transport.events().is_empty());
    }
}
