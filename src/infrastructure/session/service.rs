//! Session Service
//!
//! Owns the connection state machine of one controller/peer relationship:
//!
//! ```text
//! Idle ──connect──▶ Connecting ──ok──▶ Connected ──disconnect──▶ Disconnecting ──▶ Idle
//!                       │                  │
//!                       └──error──▶ Failed ◀┘ keepalive / link loss
//!                                     │
//!                                     └──▶ Idle
//! ```
//!
//! Only this module calls `connect`, `disconnect` and `is_connected` on the
//! transport. Reconnection is always an explicit new `connect` call.

use crate::domain::channels::CoordinateAggregator;
use crate::domain::errors::{SessionError, SessionResult, TransportError};
use crate::domain::models::{Device, MessageKind, SessionSnapshot, SessionState, StatusEvent};
use crate::domain::settings::SessionConfig;
use crate::infrastructure::session::command::CommandSender;
use crate::infrastructure::session::connection::Link;
use crate::infrastructure::session::keepalive::KeepaliveTask;
use crate::infrastructure::session::status::{MessageLog, StatusBus, StatusSubscription};
use crate::infrastructure::session::transmitter::{
    RunningTransmitter, TelemetryTransmitter, WriteFailureHook,
};
use crate::infrastructure::transport::{ConnectionHandle, Transport};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

struct SessionRecord {
    device: Option<Device>,
    state: SessionState,
    last_error: Option<String>,
    last_keepalive_at: Option<Instant>,
    // Bumped on every connect attempt; stale tasks compare against it
    epoch: u64,
    // Fired by disconnect to drop an in-flight transport connect
    pending_connect: Option<oneshot::Sender<()>>,
    link: Option<Arc<Link>>,
    transmitter: TelemetryTransmitter,
    keepalive: Option<KeepaliveTask>,
}

enum ConnectOutcome {
    Connected,
    Refused(TransportError),
    StartFailed { link: Arc<Link>, error: SessionError },
    Abandoned { close: bool },
}

pub(crate) struct SessionInner {
    transport: Arc<dyn Transport>,
    aggregator: Arc<CoordinateAggregator>,
    config: SessionConfig,
    record: Mutex<SessionRecord>,
    state_tx: watch::Sender<SessionState>,
    pub(super) status: Arc<StatusBus>,
    pub(super) messages: MessageLog,
}

/// Session Lifecycle Manager
///
/// Cheap to clone; all clones drive the same session.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<SessionInner>,
}

impl SessionManager {
    pub fn new(
        transport: Arc<dyn Transport>,
        aggregator: Arc<CoordinateAggregator>,
        config: SessionConfig,
    ) -> Self {
        let (state_tx, _) = watch::channel(SessionState::Idle);
        let transmitter = TelemetryTransmitter::new(Arc::clone(&aggregator), config.tick_interval)
            .with_stop_timeout(config.teardown_timeout);
        let messages = MessageLog::new(config.message_log_capacity);

        Self {
            inner: Arc::new(SessionInner {
                transport,
                aggregator,
                config,
                record: Mutex::new(SessionRecord {
                    device: None,
                    state: SessionState::Idle,
                    last_error: None,
                    last_keepalive_at: None,
                    epoch: 0,
                    pending_connect: None,
                    link: None,
                    transmitter,
                    keepalive: None,
                }),
                state_tx,
                status: StatusBus::new(),
                messages,
            }),
        }
    }

    /// Open a session with `device`.
    ///
    /// A live session is disconnected first. Failures are reported once and
    /// never retried. A `disconnect` while the transport is still connecting
    /// drops that attempt and this call returns `ConnectCancelled`.
    pub async fn connect(&self, device: Device) -> SessionResult<()> {
        let (epoch, cancelled) = loop {
            let state = {
                let mut record = self.inner.lock();
                match record.state {
                    SessionState::Idle => {
                        let (cancel, cancelled) = oneshot::channel();
                        record.epoch += 1;
                        record.pending_connect = Some(cancel);
                        record.device = Some(device.clone());
                        record.last_keepalive_at = None;
                        self.inner.transition(&mut record, SessionState::Connecting);
                        break (record.epoch, cancelled);
                    }
                    SessionState::Connecting => return Err(SessionError::AlreadyConnecting),
                    other => other,
                }
            };

            if state == SessionState::Connected {
                info!("Replacing the current session before connecting to {}", device);
                self.disconnect().await;
            } else {
                // Teardown in progress elsewhere
                self.inner.wait_for_teardown().await;
            }
        };

        info!("Connecting to {}", device);
        let result = tokio::select! {
            biased;
            _ = cancelled => None,
            result = self.inner.transport.connect(&device.address) => Some(result),
        };

        let outcome = {
            let mut record = self.inner.lock();
            let current = record.epoch == epoch && record.state == SessionState::Connecting;
            match result {
                Some(result) if current => {
                    record.pending_connect = None;
                    match result {
                        Ok(handle) => self.inner.establish(&mut record, handle, epoch),
                        Err(e) => {
                            self.inner.fail_and_reset(&mut record, e.to_string());
                            ConnectOutcome::Refused(e)
                        }
                    }
                }
                // Opened just as it was abandoned. The transport is keyed by
                // address, so a newer attempt on the same device owns the link.
                Some(Ok(_)) => {
                    let superseded = record.epoch != epoch
                        && matches!(
                            record.state,
                            SessionState::Connecting | SessionState::Connected
                        )
                        && record
                            .device
                            .as_ref()
                            .is_some_and(|d| d.address == device.address);
                    ConnectOutcome::Abandoned { close: !superseded }
                }
                _ => ConnectOutcome::Abandoned { close: false },
            }
        };

        match outcome {
            ConnectOutcome::Connected => {
                info!("Connected to {}", device);
                self.inner
                    .messages
                    .push(format!("Connected to {}", device), MessageKind::System);
                Ok(())
            }
            ConnectOutcome::Refused(e) => {
                error!("Connection to {} failed: {}", device, e);
                self.inner.messages.push(
                    format!("Could not connect to {}: {}", device, e),
                    MessageKind::System,
                );
                Err(SessionError::TransportUnavailable(e))
            }
            ConnectOutcome::StartFailed { link, error } => {
                error!("Could not start telemetry for {}: {}", device, error);
                let _ = link.close(self.inner.config.teardown_timeout).await;
                Err(error)
            }
            ConnectOutcome::Abandoned { close } => {
                warn!("Connection attempt to {} was abandoned", device);
                if close {
                    let grace = self.inner.config.teardown_timeout;
                    let closed =
                        tokio::time::timeout(grace, self.inner.transport.disconnect(&device.address))
                            .await;
                    match closed {
                        Ok(Err(e)) => debug!("Closing abandoned link failed: {}", e),
                        Err(_) => debug!("Closing abandoned link timed out after {:?}", grace),
                        Ok(Ok(())) => {}
                    }
                }
                Err(SessionError::ConnectCancelled)
            }
        }
    }

    /// Close the session. Best effort: the local state always ends in `Idle`.
    ///
    /// If a teardown is already running (another disconnect, or link loss)
    /// this waits for it to finish.
    pub async fn disconnect(&self) {
        let teardown = {
            let mut record = self.inner.lock();
            match record.state {
                SessionState::Idle => return,
                SessionState::Disconnecting | SessionState::Failed => None,
                SessionState::Connecting | SessionState::Connected => {
                    if let Some(cancel) = record.pending_connect.take() {
                        let _ = cancel.send(());
                    }
                    self.inner
                        .transition(&mut record, SessionState::Disconnecting);
                    Some((
                        record.transmitter.detach(),
                        record.keepalive.take(),
                        record.link.take(),
                    ))
                }
            }
        };

        let Some((transmitter, keepalive, link)) = teardown else {
            debug!("Teardown already running, waiting for it");
            self.inner.wait_for_teardown().await;
            return;
        };

        if let Some(keepalive) = keepalive {
            keepalive.stop().await;
        }
        self.inner.release(transmitter, link).await;

        let device = {
            let mut record = self.inner.lock();
            self.inner.transition(&mut record, SessionState::Idle);
            record.device.take()
        };

        if let Some(device) = device {
            info!("Disconnected from {}", device);
            self.inner
                .messages
                .push(format!("Disconnected from {}", device), MessageKind::System);
        }
    }

    /// Disconnect and end every status subscription
    pub async fn shutdown(&self) {
        self.disconnect().await;
        self.inner.status.close();
        debug!("Session manager shut down");
    }

    pub fn current_state(&self) -> SessionState {
        self.inner.lock().state
    }

    pub fn last_error(&self) -> Option<String> {
        self.inner.lock().last_error.clone()
    }

    pub fn session(&self) -> SessionSnapshot {
        let record = self.inner.lock();
        SessionSnapshot {
            device: record.device.clone(),
            state: record.state,
            last_error: record.last_error.clone(),
            last_keepalive_at: record.last_keepalive_at,
            connected_at: record.link.as_ref().map(|l| l.handle().opened_at),
        }
    }

    pub fn subscribe(&self) -> StatusSubscription {
        self.inner.status.subscribe()
    }

    /// Watch channel mirroring [`current_state`](Self::current_state)
    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.inner.state_tx.subscribe()
    }

    pub fn messages(&self) -> Vec<crate::domain::models::MessageLogEntry> {
        self.inner.messages.entries()
    }

    pub fn command_sender(&self) -> CommandSender {
        CommandSender::new(Arc::clone(&self.inner))
    }

    pub fn aggregator(&self) -> &Arc<CoordinateAggregator> {
        &self.inner.aggregator
    }

    pub fn is_transmitting(&self) -> bool {
        self.inner.lock().transmitter.is_running()
    }
}

impl SessionInner {
    fn lock(&self) -> MutexGuard<'_, SessionRecord> {
        self.record.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn transition(&self, record: &mut SessionRecord, to: SessionState) {
        let from = record.state;
        debug_assert!(
            is_valid_transition(from, to),
            "invalid session transition {} -> {}",
            from,
            to
        );
        record.state = to;
        self.state_tx.send_replace(to);
        debug!("Session {} -> {}", from, to);
        self.status.emit(StatusEvent::StateChanged { from, to });
    }

    async fn wait_for_teardown(&self) {
        let mut state_rx = self.state_tx.subscribe();
        let _ = state_rx
            .wait_for(|s| !matches!(s, SessionState::Disconnecting | SessionState::Failed))
            .await;
    }

    /// Final frame, then close. Every step is time-bounded so teardown
    /// always completes.
    async fn release(&self, transmitter: Option<RunningTransmitter>, link: Option<Arc<Link>>) {
        if let Some(transmitter) = transmitter {
            if let Err(e) = transmitter.stop().await {
                warn!("Final reset frame was not delivered: {}", e);
            }
        }
        if let Some(link) = link {
            if let Err(e) = link.close(self.config.teardown_timeout).await {
                warn!("Transport disconnect reported an error: {}", e);
            }
        }
    }

    /// Record the error, then pass through `Failed` back to `Idle`
    fn fail_and_reset(&self, record: &mut SessionRecord, reason: String) {
        record.last_error = Some(reason);
        record.device = None;
        record.link = None;
        self.transition(record, SessionState::Failed);
        self.transition(record, SessionState::Idle);
    }

    /// Wire up link, telemetry and keepalive for a freshly opened transport
    fn establish(
        self: &Arc<Self>,
        record: &mut SessionRecord,
        handle: ConnectionHandle,
        epoch: u64,
    ) -> ConnectOutcome {
        let link = Arc::new(Link::new(Arc::clone(&self.transport), handle));
        let hook = self.write_failure_hook(epoch);
        let state_rx = self.state_tx.subscribe();
        if let Err(error) = record.transmitter.start(Arc::clone(&link), state_rx, hook) {
            self.fail_and_reset(record, error.to_string());
            return ConnectOutcome::StartFailed { link, error };
        }

        record.keepalive = Some(KeepaliveTask::spawn(
            Arc::clone(&link),
            self.config.keepalive_interval,
            Arc::downgrade(self),
            epoch,
        ));
        record.link = Some(link);
        record.last_error = None;
        record.last_keepalive_at = Some(Instant::now());
        self.transition(record, SessionState::Connected);
        ConnectOutcome::Connected
    }

    /// The link of the current Connected period and its epoch
    pub(super) fn connected_link(&self) -> Option<(Arc<Link>, u64)> {
        let record = self.lock();
        if record.state != SessionState::Connected {
            return None;
        }
        record.link.as_ref().map(|l| (Arc::clone(l), record.epoch))
    }

    pub(super) fn current_state(&self) -> SessionState {
        self.lock().state
    }

    pub(super) fn record_keepalive(&self, epoch: u64) {
        let mut record = self.lock();
        if record.epoch != epoch || record.state != SessionState::Connected {
            return;
        }
        record.last_keepalive_at = Some(Instant::now());
        self.status.emit(StatusEvent::KeepaliveOk);
    }

    /// A write failed while Connected. The session stays up; keepalive
    /// decides whether the link is gone.
    pub(super) fn record_write_failure(&self, epoch: u64, err: &TransportError) {
        let mut record = self.lock();
        if record.epoch != epoch || record.state != SessionState::Connected {
            return;
        }
        record.last_error = Some(SessionError::LinkLost(err.to_string()).to_string());
        self.status.emit(StatusEvent::WriteFailed(err.to_string()));
    }

    fn write_failure_hook(self: &Arc<Self>, epoch: u64) -> WriteFailureHook {
        let session = Arc::downgrade(self);
        Arc::new(move |err| {
            if let Some(inner) = session.upgrade() {
                inner.record_write_failure(epoch, &err);
            }
        })
    }

    /// Keepalive found the link dead: tear the session down
    pub(super) async fn handle_link_loss(&self, epoch: u64, reason: String) {
        let (transmitter, link) = {
            let mut record = self.lock();
            if record.epoch != epoch || record.state != SessionState::Connected {
                return;
            }
            warn!("Link lost: {}", reason);
            record.last_error = Some(SessionError::LinkLost(reason.clone()).to_string());
            self.status.emit(StatusEvent::KeepaliveFailed(reason.clone()));
            self.transition(&mut record, SessionState::Failed);
            // Called from the keepalive loop itself, which exits right after
            drop(record.keepalive.take());
            (record.transmitter.detach(), record.link.take())
        };

        self.release(transmitter, link).await;

        let device = {
            let mut record = self.lock();
            self.transition(&mut record, SessionState::Idle);
            record.device.take()
        };

        let name = device.map(|d| d.to_string()).unwrap_or_default();
        self.messages
            .push(format!("Connection to {} lost: {}", name, reason), MessageKind::System);
    }
}

fn is_valid_transition(from: SessionState, to: SessionState) -> bool {
    use SessionState::*;
    matches!(
        (from, to),
        (Idle, Connecting)
            | (Connecting, Connected)
            | (Connecting, Failed)
            | (Connecting, Disconnecting)
            | (Connected, Disconnecting)
            | (Connected, Failed)
            | (Disconnecting, Idle)
            | (Failed, Idle)
    )
}
