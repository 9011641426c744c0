//! Serial-over-TCP transport
//!
//! Talks to RFCOMM/serial bridges that expose the peer's byte stream on a
//! TCP port. Each device address is a `host:port` string.

use super::{ConnectionHandle, Transport};
use crate::domain::errors::TransportError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::io::ErrorKind;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

/// One open socket. The read half is only polled for liveness, never locked, so a
/// stalled write cannot hold up liveness checks.
struct TcpLink {
    reader: OwnedReadHalf,
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
}

pub struct TcpTransport {
    // Lookup only; never held across I/O
    links: Mutex<HashMap<String, Arc<TcpLink>>>,
    connect_timeout: Duration,
    write_timeout: Duration,
}

impl TcpTransport {
    pub fn new(connect_timeout: Duration, write_timeout: Duration) -> Self {
        Self {
            links: Mutex::new(HashMap::new()),
            connect_timeout,
            write_timeout,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<TcpLink>>> {
        self.links.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn link(&self, address: &str) -> Option<Arc<TcpLink>> {
        self.lock().get(address).cloned()
    }

    /// Forget `link` unless the address has been reopened meanwhile
    fn forget(&self, address: &str, link: &Arc<TcpLink>) {
        let mut links = self.lock();
        if links.get(address).is_some_and(|l| Arc::ptr_eq(l, link)) {
            links.remove(address);
        }
    }

    /// Non-blocking liveness check of the socket.
    ///
    /// `Ok(0)` means the peer closed its side. Inbound bytes are drained and
    /// only logged; the controller protocol is outbound.
    fn check_alive(reader: &OwnedReadHalf) -> Result<bool, TransportError> {
        let mut buf = [0u8; 256];
        loop {
            match reader.try_read(&mut buf) {
                Ok(0) => return Ok(false),
                Ok(n) => {
                    debug!(
                        "Discarding {} inbound bytes: {:?}",
                        n,
                        String::from_utf8_lossy(&buf[..n])
                    );
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(true),
                Err(e) => return Err(TransportError::Io(e)),
            }
        }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn connect(&self, address: &str) -> Result<ConnectionHandle, TransportError> {
        info!("Opening TCP link to {}", address);

        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(address))
            .await
            .map_err(|_| TransportError::ConnectFailed {
                address: address.to_string(),
                reason: format!("timed out after {:?}", self.connect_timeout),
            })?
            .map_err(|e| TransportError::ConnectFailed {
                address: address.to_string(),
                reason: e.to_string(),
            })?;

        if let Err(e) = stream.set_nodelay(true) {
            warn!("Could not disable Nagle on {}: {}", address, e);
        }

        let (reader, writer) = stream.into_split();
        let link = Arc::new(TcpLink {
            reader,
            writer: tokio::sync::Mutex::new(writer),
        });
        if self.lock().insert(address.to_string(), link).is_some() {
            debug!("Replaced stale link to {}", address);
        }

        Ok(ConnectionHandle::new(address))
    }

    async fn disconnect(&self, address: &str) -> Result<(), TransportError> {
        let link = self.lock().remove(address);
        let Some(link) = link else {
            debug!("Disconnect of {} ignored, no open link", address);
            return Ok(());
        };

        // A write stuck on a stalled peer gives up within write_timeout;
        // the socket closes once the last handle to it is dropped either way
        match tokio::time::timeout(self.write_timeout, link.writer.lock()).await {
            Ok(mut writer) => {
                // Peer may already be gone; a failed shutdown still drops the socket
                if let Err(e) = writer.shutdown().await {
                    debug!("Shutdown of {} reported: {}", address, e);
                }
            }
            Err(_) => debug!("Write to {} still pending at close", address),
        }
        info!("Closed TCP link to {}", address);
        Ok(())
    }

    async fn write(&self, address: &str, bytes: &[u8]) -> Result<usize, TransportError> {
        let link = self
            .link(address)
            .ok_or_else(|| TransportError::Closed(address.to_string()))?;

        let result = tokio::time::timeout(self.write_timeout, async {
            let mut writer = link.writer.lock().await;
            writer.write_all(bytes).await
        })
        .await;

        match result {
            Ok(written) => {
                written?;
                Ok(bytes.len())
            }
            Err(_) => {
                // Part of the message may be on the wire; the stream can no
                // longer be framed, so the link is dropped
                warn!("Write to {} timed out, dropping the link", address);
                self.forget(address, &link);
                Err(TransportError::TimedOut {
                    address: address.to_string(),
                    operation: "write",
                    after: self.write_timeout,
                })
            }
        }
    }

    async fn is_connected(&self, address: &str) -> Result<bool, TransportError> {
        match self.link(address) {
            Some(link) => Self::check_alive(&link.reader),
            None => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    fn transport() -> TcpTransport {
        TcpTransport::new(Duration::from_secs(1), Duration::from_secs(1))
    }

    #[tokio::test]
    async fn test_write_reaches_peer() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();

        let transport = transport();
        let (accepted, connected) = tokio::join!(listener.accept(), transport.connect(&address));
        let (mut peer, _) = accepted.unwrap();
        connected.unwrap();

        assert!(transport.is_connected(&address).await.unwrap());

        let written = transport.write(&address, b"X:1,2\n").await.unwrap();
        assert_eq!(written, 6);

        let mut buf = [0u8; 6];
        peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"X:1,2\n");
    }

    #[tokio::test]
    async fn test_peer_close_is_detected() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();

        let transport = transport();
        let (accepted, connected) = tokio::join!(listener.accept(), transport.connect(&address));
        let (peer, _) = accepted.unwrap();
        connected.unwrap();

        drop(peer);
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(!transport.is_connected(&address).await.unwrap_or(false));
    }

    #[tokio::test]
    async fn test_unknown_address_is_not_connected() {
        let transport = transport();
        assert!(!transport.is_connected("127.0.0.1:1").await.unwrap());
        assert!(transport.disconnect("127.0.0.1:1").await.is_ok());
        assert!(matches!(
            transport.write("127.0.0.1:1", b"x").await,
            Err(TransportError::Closed(_))
        ));
    }

    #[tokio::test]
    async fn test_stalled_peer_times_out_write() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();

        let transport = Arc::new(TcpTransport::new(
            Duration::from_secs(1),
            Duration::from_millis(300),
        ));
        let (accepted, connected) = tokio::join!(listener.accept(), transport.connect(&address));
        // Accepted but never read from
        let (_peer, _) = accepted.unwrap();
        connected.unwrap();

        let writer = {
            let transport = Arc::clone(&transport);
            let address = address.clone();
            tokio::spawn(async move {
                let payload = vec![b'x'; 64 * 1024 * 1024];
                transport.write(&address, &payload).await
            })
        };

        // Liveness checks are not held up by the pending write
        tokio::time::sleep(Duration::from_millis(50)).await;
        let alive = tokio::time::timeout(Duration::from_millis(100), transport.is_connected(&address))
            .await
            .expect("is_connected blocked behind a write");
        assert!(alive.unwrap());

        let result = writer.await.unwrap();
        assert!(matches!(
            result,
            Err(TransportError::TimedOut {
                operation: "write",
                ..
            })
        ));

        // The half-written stream is dropped
        assert!(!transport.is_connected(&address).await.unwrap());
        assert!(matches!(
            transport.write(&address, b"X:0\n").await,
            Err(TransportError::Closed(_))
        ));

        let closed = tokio::time::timeout(Duration::from_secs(1), transport.disconnect(&address)).await;
        assert!(matches!(closed, Ok(Ok(()))));
    }
}
