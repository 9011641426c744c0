//! Telemetry transmitter
//!
//! Fixed-tick loop that snapshots the coordinate aggregator and writes one
//! channel frame per tick while any channel is held. The tick that follows
//! the last release still sends one frame (all zeros) so the peer sees the
//! lift; after that the loop stays quiet until a channel is active again.

use crate::domain::channels::CoordinateAggregator;
use crate::domain::errors::{SessionError, SessionResult, TransportError};
use crate::domain::models::SessionState;
use crate::infrastructure::session::connection::Link;
use crate::infrastructure::session::protocol;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, trace, warn};

/// Called with every failed tick write
pub type WriteFailureHook = Arc<dyn Fn(TransportError) + Send + Sync>;

pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(1);

pub struct TelemetryTransmitter {
    aggregator: Arc<CoordinateAggregator>,
    interval: Duration,
    stop_timeout: Duration,
    task: Option<RunningTransmitter>,
}

impl TelemetryTransmitter {
    pub fn new(aggregator: Arc<CoordinateAggregator>, interval: Duration) -> Self {
        Self {
            aggregator,
            interval,
            stop_timeout: DEFAULT_STOP_TIMEOUT,
            task: None,
        }
    }

    /// Bound for each step of [`RunningTransmitter::stop`]
    pub fn with_stop_timeout(mut self, stop_timeout: Duration) -> Self {
        self.stop_timeout = stop_timeout;
        self
    }

    pub fn is_running(&self) -> bool {
        self.task
            .as_ref()
            .map(|t| !t.handle.is_finished())
            .unwrap_or(false)
    }

    /// Spawn the tick loop for one Connected period
    pub fn start(
        &mut self,
        link: Arc<Link>,
        state: watch::Receiver<SessionState>,
        on_failure: WriteFailureHook,
    ) -> SessionResult<()> {
        if self.is_running() {
            return Err(SessionError::TransmitterAlreadyRunning);
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(run_ticks(
            Arc::clone(&link),
            Arc::clone(&self.aggregator),
            self.interval,
            state,
            shutdown_rx,
            on_failure,
        ));
        debug!(
            "Telemetry transmitter started for {} every {:?}",
            link.address(),
            self.interval
        );

        self.task = Some(RunningTransmitter {
            shutdown: shutdown_tx,
            handle,
            link,
            channel_count: self.aggregator.channel_count(),
            stop_timeout: self.stop_timeout,
        });
        Ok(())
    }

    /// Take the running loop out so it can be stopped without holding
    /// the session lock
    pub fn detach(&mut self) -> Option<RunningTransmitter> {
        self.task.take()
    }
}

pub struct RunningTransmitter {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
    link: Arc<Link>,
    channel_count: usize,
    stop_timeout: Duration,
}

impl RunningTransmitter {
    /// Cancel the tick loop, wait for it, then write the final all-zero frame.
    ///
    /// A loop stuck in a write is aborted after the stop timeout, and the
    /// final frame is given the same bound. Returns the result of that
    /// final write.
    pub async fn stop(self) -> Result<(), TransportError> {
        let Self {
            shutdown,
            mut handle,
            link,
            channel_count,
            stop_timeout,
        } = self;

        let _ = shutdown.send(true);
        match tokio::time::timeout(stop_timeout, &mut handle).await {
            Ok(Err(e)) if e.is_panic() => warn!("Telemetry tick loop panicked: {}", e),
            Ok(_) => {}
            Err(_) => {
                warn!(
                    "Telemetry tick loop for {} did not stop within {:?}, aborting",
                    link.address(),
                    stop_timeout
                );
                handle.abort();
            }
        }

        let frame = protocol::zero_frame(channel_count);
        tokio::time::timeout(stop_timeout, link.write(frame.as_bytes()))
            .await
            .map_err(|_| TransportError::TimedOut {
                address: link.address().to_string(),
                operation: "final frame write",
                after: stop_timeout,
            })??;
        debug!("Final reset frame sent to {}", link.address());
        Ok(())
    }
}

async fn run_ticks(
    link: Arc<Link>,
    aggregator: Arc<CoordinateAggregator>,
    interval: Duration,
    state: watch::Receiver<SessionState>,
    mut shutdown: watch::Receiver<bool>,
    on_failure: WriteFailureHook,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut streaming = false;

    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {}
        }

        if *state.borrow() != SessionState::Connected {
            continue;
        }

        let snapshot = aggregator.snapshot();
        if !snapshot.any_active && !streaming {
            continue;
        }
        streaming = snapshot.any_active;

        let frame = protocol::encode_frame(&snapshot.values);
        trace!("Tick frame: {}", frame.trim_end());
        if let Err(e) = link.write(frame.as_bytes()).await {
            warn!("Telemetry write to {} failed: {}", link.address(), e);
            on_failure(e);
        }
    }

    debug!("Telemetry tick loop for {} stopped", link.address());
}
