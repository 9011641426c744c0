use crate::infrastructure::session::connection::Link;
use crate::infrastructure::session::service::SessionInner;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, trace};

/// Periodic liveness check of one Connected period.
///
/// A single negative or failed check ends the session.
pub(super) struct KeepaliveTask {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl KeepaliveTask {
    pub(super) fn spawn(
        link: Arc<Link>,
        interval: Duration,
        session: Weak<SessionInner>,
        epoch: u64,
    ) -> Self {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(run_checks(link, interval, session, epoch, shutdown_rx));
        Self { shutdown, handle }
    }

    /// Cancel and wait for the check loop. Never call from inside the loop.
    pub(super) async fn stop(self) {
        let _ = self.shutdown.send(true);
        let _ = self.handle.await;
    }
}

async fn run_checks(
    link: Arc<Link>,
    interval: Duration,
    session: Weak<SessionInner>,
    epoch: u64,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {}
        }

        let result = tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            result = link.is_connected() => result,
        };

        let Some(inner) = session.upgrade() else {
            break;
        };

        let reason = match result {
            Ok(true) => {
                trace!("Keepalive ok for {}", link.address());
                inner.record_keepalive(epoch);
                continue;
            }
            Ok(false) => "peer is no longer connected".to_string(),
            Err(e) => e.to_string(),
        };

        inner.handle_link_loss(epoch, reason).await;
        break;
    }

    debug!("Keepalive for {} stopped", link.address());
}
