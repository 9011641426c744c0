use crate::domain::errors::{SessionError, SessionResult};
use crate::domain::models::{MessageKind, SessionState, StatusEvent};
use crate::infrastructure::session::protocol::{self, SLIDER_MAX};
use crate::infrastructure::session::service::SessionInner;
use std::sync::Arc;
use tracing::{info, warn};

/// One-shot writes through the current session.
///
/// Shares the session link's write lock with the telemetry transmitter, so
/// a command never lands in the middle of a channel frame.
#[derive(Clone)]
pub struct CommandSender {
    session: Arc<SessionInner>,
}

impl CommandSender {
    pub(super) fn new(session: Arc<SessionInner>) -> Self {
        Self { session }
    }

    /// Send raw bytes immediately
    pub async fn send(&self, bytes: &[u8]) -> SessionResult<usize> {
        let (link, epoch) = self
            .session
            .connected_link()
            .ok_or(SessionError::NotConnected)?;

        match link.write(bytes).await {
            Ok(written) => {
                self.session.status.emit(StatusEvent::CommandSent(written));
                Ok(written)
            }
            Err(e) => {
                // Closed by a concurrent disconnect rather than lost
                if self.session.current_state() != SessionState::Connected {
                    return Err(SessionError::NotConnected);
                }
                warn!("Command write to {} failed: {}", link.address(), e);
                self.session.record_write_failure(epoch, &e);
                Err(SessionError::LinkLost(e.to_string()))
            }
        }
    }

    /// Send a text message as typed by the user
    pub async fn send_text(&self, text: &str) -> SessionResult<usize> {
        let text = text.trim();
        if text.is_empty() {
            return Err(SessionError::EmptyCommand);
        }

        let written = self.send(text.as_bytes()).await?;
        info!("Sent text command ({} bytes)", written);
        self.session.messages.push(text, MessageKind::Sent);
        Ok(written)
    }

    /// Send a slider position in `0..=100`
    pub async fn send_value(&self, value: u32) -> SessionResult<usize> {
        if value > SLIDER_MAX {
            return Err(SessionError::ValueOutOfRange(value));
        }

        let payload = protocol::encode_slider(value);
        let written = self.send(payload.as_bytes()).await?;
        self.session
            .messages
            .push(format!("Value sent: {}", payload), MessageKind::Sent);
        Ok(written)
    }
}
