//! Session scenarios against the loopback transport, on a paused clock.

use super::*;
use crate::domain::channels::CoordinateAggregator;
use crate::domain::errors::SessionError;
use crate::domain::models::{Device, MessageKind, SessionState, StatusEvent};
use crate::domain::settings::SessionConfig;
use crate::infrastructure::transport::memory::{MemoryTransport, TransportEvent};
use std::sync::Arc;
use std::time::Duration;

const ADDRESS: &str = "00:11:22:33:44:55";
const ZERO_FRAME: &str = "X:0,0,0,0,0,0,0\n";

fn device() -> Device {
    Device::new(ADDRESS, "Klavier")
}

fn setup() -> (Arc<MemoryTransport>, SessionManager) {
    let transport = Arc::new(MemoryTransport::new());
    let aggregator = Arc::new(CoordinateAggregator::default());
    let config = SessionConfig {
        tick_interval: Duration::from_millis(50),
        keepalive_interval: Duration::from_secs(5),
        teardown_timeout: Duration::from_secs(1),
        message_log_capacity: 50,
    };
    let manager = SessionManager::new(transport.clone(), aggregator, config);
    (transport, manager)
}

async fn sleep_ms(ms: u64) {
    tokio::time::sleep(Duration::from_millis(ms)).await;
}

fn states(status: &mut StatusSubscription) -> Vec<SessionState> {
    status
        .drain()
        .into_iter()
        .filter_map(|e| match e {
            StatusEvent::StateChanged { to, .. } => Some(to),
            _ => None,
        })
        .collect()
}

fn count_events(transport: &MemoryTransport, f: impl Fn(&TransportEvent) -> bool) -> usize {
    transport.events().iter().filter(|e| f(*e)).count()
}

#[tokio::test(start_paused = true)]
async fn test_connect_and_disconnect_transitions() {
    let (transport, manager) = setup();
    let mut status = manager.subscribe();

    manager.connect(device()).await.unwrap();
    assert_eq!(manager.current_state(), SessionState::Connected);
    assert!(manager.is_transmitting());
    assert!(manager.session().last_keepalive_at.is_some());
    assert!(manager.session().connected_at.is_some());
    assert_eq!(manager.last_error(), None);

    manager.disconnect().await;
    assert_eq!(manager.current_state(), SessionState::Idle);
    assert!(!manager.is_transmitting());
    assert!(manager.session().device.is_none());
    assert!(manager.session().connected_at.is_none());
    assert!(!transport.is_open(ADDRESS));

    let transitions: Vec<_> = status
        .drain()
        .into_iter()
        .filter_map(|e| match e {
            StatusEvent::StateChanged { to, .. } => Some(to),
            _ => None,
        })
        .collect();
    assert_eq!(
        transitions,
        vec![
            SessionState::Connecting,
            SessionState::Connected,
            SessionState::Disconnecting,
            SessionState::Idle,
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_when_idle_is_noop() {
    let (transport, manager) = setup();
    let mut status = manager.subscribe();

    manager.disconnect().await;
    assert_eq!(manager.current_state(), SessionState::Idle);
    assert!(status.drain().is_empty());
    assert!(transport.events().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_connect_failure_reports_and_returns_to_idle() {
    let (transport, manager) = setup();
    let mut status = manager.subscribe();
    transport.refuse_connects(true);

    let err = manager.connect(device()).await.unwrap_err();
    assert!(matches!(err, SessionError::TransportUnavailable(_)));
    assert_eq!(manager.current_state(), SessionState::Idle);
    assert!(manager.last_error().is_some());
    assert!(!manager.is_transmitting());

    let transitions: Vec<_> = status
        .drain()
        .into_iter()
        .filter_map(|e| match e {
            StatusEvent::StateChanged { to, .. } => Some(to),
            _ => None,
        })
        .collect();
    assert_eq!(
        transitions,
        vec![
            SessionState::Connecting,
            SessionState::Failed,
            SessionState::Idle
        ]
    );

    // Not retried on its own
    sleep_ms(30_000).await;
    assert!(transport.events().is_empty());

    // Explicit retry works and clears the error
    transport.refuse_connects(false);
    manager.connect(device()).await.unwrap();
    assert_eq!(manager.last_error(), None);
    manager.disconnect().await;
}

#[tokio::test(start_paused = true)]
async fn test_connect_while_connecting_is_rejected() {
    let (transport, manager) = setup();
    transport.set_connect_delay(Some(Duration::from_millis(500)));

    let pending = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.connect(device()).await })
    };
    sleep_ms(100).await;
    assert_eq!(manager.current_state(), SessionState::Connecting);

    let second = manager.connect(Device::new("other", "Other")).await;
    assert!(matches!(second, Err(SessionError::AlreadyConnecting)));
    assert_eq!(manager.current_state(), SessionState::Connecting);

    pending.await.unwrap().unwrap();
    assert_eq!(manager.current_state(), SessionState::Connected);
    assert_eq!(
        manager.session().device.map(|d| d.address),
        Some(ADDRESS.to_string())
    );
    manager.disconnect().await;
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_during_connect_cancels_attempt() {
    let (transport, manager) = setup();
    transport.set_connect_delay(Some(Duration::from_millis(500)));

    let pending = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.connect(device()).await })
    };
    sleep_ms(100).await;
    manager.disconnect().await;
    assert_eq!(manager.current_state(), SessionState::Idle);

    let result = pending.await.unwrap();
    assert!(matches!(result, Err(SessionError::ConnectCancelled)));
    assert_eq!(manager.current_state(), SessionState::Idle);
    assert!(!transport.is_open(ADDRESS));
    // The transport connect was dropped before it opened anything
    assert!(transport.events().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_cancelled_attempt_leaves_retry_alone() {
    let (transport, manager) = setup();
    transport.set_connect_delay(Some(Duration::from_millis(500)));

    let stale = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.connect(device()).await })
    };
    sleep_ms(100).await;
    manager.disconnect().await;
    sleep_ms(200).await;

    transport.set_connect_delay(None);
    manager.connect(device()).await.unwrap();
    assert!(matches!(
        stale.await.unwrap(),
        Err(SessionError::ConnectCancelled)
    ));
    assert!(transport.is_open(ADDRESS));

    // Past the first keepalive of the retried session
    sleep_ms(5_100).await;
    assert_eq!(manager.current_state(), SessionState::Connected);
    assert_eq!(manager.last_error(), None);
    assert!(transport.is_open(ADDRESS));
    assert_eq!(
        count_events(&transport, |e| matches!(e, TransportEvent::Connect(_))),
        1
    );
    assert_eq!(
        count_events(&transport, |e| matches!(e, TransportEvent::Disconnect(_))),
        0
    );

    manager.disconnect().await;
}

#[tokio::test(start_paused = true)]
async fn test_press_and_release_stream() {
    let (transport, manager) = setup();
    manager.connect(device()).await.unwrap();

    sleep_ms(200).await;
    assert_eq!(transport.write_count(), 0, "nothing before first activation");

    manager.aggregator().set_channel(3, 150).unwrap();
    sleep_ms(120).await;
    manager.aggregator().release_channel(3).unwrap();
    sleep_ms(100).await;

    let lines = transport.written_lines();
    let pressed = lines
        .iter()
        .take_while(|l| l.as_str() == "X:0,0,0,150,0,0,0\n")
        .count();
    assert!(pressed >= 1);
    assert_eq!(lines[pressed], ZERO_FRAME);
    assert_eq!(lines.len(), pressed + 1, "quiet after the release frame");

    manager.disconnect().await;
}

#[tokio::test(start_paused = true)]
async fn test_streams_latest_value_each_tick() {
    let (transport, manager) = setup();
    manager.connect(device()).await.unwrap();

    let agg = manager.aggregator().clone();
    agg.set_channel(0, 10).unwrap();
    // Sample between ticks
    sleep_ms(25).await;
    let before = transport.write_count();
    assert_eq!(before, 1);
    agg.set_channel(0, 20).unwrap();
    agg.set_channel(6, 30).unwrap();
    sleep_ms(50).await;

    let lines = transport.written_lines();
    assert_eq!(lines.len(), before + 1);
    assert_eq!(lines.last().unwrap(), "X:20,0,0,0,0,0,30\n");
    assert!(lines
        .iter()
        .all(|l| l.starts_with("X:") && l.ends_with('\n') && l.matches('\n').count() == 1));

    manager.disconnect().await;
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_sends_zero_frame_before_closing() {
    let (transport, manager) = setup();
    manager.connect(device()).await.unwrap();

    manager.aggregator().set_channel(5, 250).unwrap();
    sleep_ms(120).await;
    manager.disconnect().await;

    let events = transport.events();
    let disconnect_at = events
        .iter()
        .position(|e| matches!(e, TransportEvent::Disconnect(_)))
        .unwrap();
    assert_eq!(disconnect_at, events.len() - 1);
    match &events[disconnect_at - 1] {
        TransportEvent::Write { bytes, .. } => assert_eq!(bytes.as_slice(), ZERO_FRAME.as_bytes()),
        other => panic!("expected final reset frame, got {:?}", other),
    }
}

#[tokio::test(start_paused = true)]
async fn test_keepalive_failure_ends_session() {
    let (transport, manager) = setup();
    let mut status = manager.subscribe();
    manager.connect(device()).await.unwrap();
    manager.aggregator().set_channel(1, 77).unwrap();

    sleep_ms(5_100).await;
    assert_eq!(manager.current_state(), SessionState::Connected);
    assert!(status.drain().contains(&StatusEvent::KeepaliveOk));

    transport.drop_link(ADDRESS);
    sleep_ms(5_000).await;

    assert_eq!(manager.current_state(), SessionState::Idle);
    assert!(!manager.is_transmitting());
    assert!(manager.last_error().unwrap().contains("link lost"));
    assert!(status
        .drain()
        .iter()
        .any(|e| matches!(e, StatusEvent::KeepaliveFailed(_))));

    let writes = transport.write_count();
    sleep_ms(1_000).await;
    assert_eq!(transport.write_count(), writes, "no ticks after teardown");
}

#[tokio::test(start_paused = true)]
async fn test_keepalive_check_error_is_link_loss() {
    let (transport, manager) = setup();
    manager.connect(device()).await.unwrap();

    transport.fail_liveness_checks(true);
    sleep_ms(5_100).await;
    assert_eq!(manager.current_state(), SessionState::Idle);
    assert!(manager
        .messages()
        .iter()
        .any(|m| m.kind == MessageKind::System && m.text.contains("lost")));
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_racing_link_loss_tears_down_once() {
    let (transport, manager) = setup();
    let mut status = manager.subscribe();
    manager.connect(device()).await.unwrap();

    transport.drop_link(ADDRESS);
    // Wakes at the same instant as the keepalive check
    sleep_ms(5_000).await;
    manager.disconnect().await;

    assert_eq!(manager.current_state(), SessionState::Idle);
    let idle = states(&mut status)
        .into_iter()
        .filter(|s| *s == SessionState::Idle)
        .count();
    assert_eq!(idle, 1);
    assert_eq!(
        count_events(&transport, |e| matches!(e, TransportEvent::Disconnect(_))),
        1
    );

    sleep_ms(10_000).await;
    assert_eq!(manager.current_state(), SessionState::Idle);
    assert!(status.drain().is_empty());
}

/// Link loss whose final frame hangs on a stalled write, so the teardown
/// stays in `Failed` until the teardown timeout expires.
async fn slow_link_loss(transport: &MemoryTransport, manager: &SessionManager) {
    manager.connect(device()).await.unwrap();
    transport.stall_writes(true);
    transport.drop_link(ADDRESS);
    sleep_ms(5_010).await;
    assert_eq!(manager.current_state(), SessionState::Failed);
}

#[tokio::test(start_paused = true)]
async fn test_connect_waits_for_link_loss_teardown() {
    let (transport, manager) = setup();
    let mut status = manager.subscribe();
    slow_link_loss(&transport, &manager).await;
    transport.stall_writes(false);

    let started = tokio::time::Instant::now();
    manager.connect(device()).await.unwrap();
    assert!(started.elapsed() >= Duration::from_millis(900));
    assert_eq!(manager.current_state(), SessionState::Connected);
    assert_eq!(
        states(&mut status),
        vec![
            SessionState::Connecting,
            SessionState::Connected,
            SessionState::Failed,
            SessionState::Idle,
            SessionState::Connecting,
            SessionState::Connected,
        ]
    );

    manager.disconnect().await;
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_waits_for_link_loss_teardown() {
    let (transport, manager) = setup();
    let mut status = manager.subscribe();
    slow_link_loss(&transport, &manager).await;

    manager.disconnect().await;
    assert_eq!(manager.current_state(), SessionState::Idle);
    assert_eq!(
        states(&mut status),
        vec![
            SessionState::Connecting,
            SessionState::Connected,
            SessionState::Failed,
            SessionState::Idle,
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_stalled_peer_does_not_block_disconnect() {
    let (transport, manager) = setup();
    manager.connect(device()).await.unwrap();
    manager.aggregator().set_channel(0, 120).unwrap();
    sleep_ms(120).await;

    // Peer stops reading while a tick and a command are both mid-write
    transport.stall_writes(true);
    let sender = manager.command_sender();
    let pending = tokio::spawn(async move { sender.send_text("hello").await });
    sleep_ms(100).await;

    tokio::time::timeout(Duration::from_secs(5), manager.disconnect())
        .await
        .expect("disconnect did not finish");
    assert_eq!(manager.current_state(), SessionState::Idle);
    assert!(!manager.is_transmitting());
    assert!(!transport.is_open(ADDRESS));

    pending.abort();
}

#[tokio::test(start_paused = true)]
async fn test_write_failure_is_detected_by_keepalive() {
    let (transport, manager) = setup();
    let mut status = manager.subscribe();
    manager.connect(device()).await.unwrap();
    manager.aggregator().set_channel(0, 100).unwrap();

    sleep_ms(1_000).await;
    transport.fail_next_writes(1, true);
    sleep_ms(100).await;

    // Transmitter keeps going, session is still up until keepalive runs
    assert_eq!(manager.current_state(), SessionState::Connected);
    assert!(manager.is_transmitting());
    assert!(status
        .drain()
        .iter()
        .any(|e| matches!(e, StatusEvent::WriteFailed(_))));

    sleep_ms(4_000).await;
    assert_eq!(manager.current_state(), SessionState::Idle);
    assert!(!manager.is_transmitting());
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_replaces_session() {
    let (transport, manager) = setup();
    manager.connect(device()).await.unwrap();
    manager.connect(Device::new("other", "Other")).await.unwrap();

    assert_eq!(manager.current_state(), SessionState::Connected);
    assert!(!transport.is_open(ADDRESS));
    assert!(transport.is_open("other"));
    manager.disconnect().await;
}

#[tokio::test(start_paused = true)]
async fn test_commands_require_connection() {
    let (transport, manager) = setup();
    let sender = manager.command_sender();

    assert!(matches!(
        sender.send(b"ping").await,
        Err(SessionError::NotConnected)
    ));

    manager.connect(device()).await.unwrap();
    assert_eq!(sender.send_text("  hello  ").await.unwrap(), 5);
    assert_eq!(sender.send_value(42).await.unwrap(), 2);
    assert!(matches!(
        sender.send_text("   ").await,
        Err(SessionError::EmptyCommand)
    ));
    assert!(matches!(
        sender.send_value(101).await,
        Err(SessionError::ValueOutOfRange(101))
    ));

    assert_eq!(
        transport.written_lines(),
        vec!["hello".to_string(), "42".to_string()]
    );
    let sent: Vec<_> = manager
        .messages()
        .into_iter()
        .filter(|m| m.kind == MessageKind::Sent)
        .map(|m| m.text)
        .collect();
    assert_eq!(sent, vec!["hello", "Value sent: 42"]);

    manager.disconnect().await;
    assert!(matches!(
        sender.send(b"late").await,
        Err(SessionError::NotConnected)
    ));
}

#[tokio::test(start_paused = true)]
async fn test_commands_and_frames_never_interleave() {
    let (transport, manager) = setup();
    manager.connect(device()).await.unwrap();
    manager.aggregator().set_channel(2, 123).unwrap();

    let sender = manager.command_sender();
    for i in 0..20 {
        sender.send_text(&format!("cmd{}", i)).await.unwrap();
        sleep_ms(13).await;
    }
    manager.disconnect().await;

    for line in transport.written_lines() {
        let frame = line.starts_with("X:") && line.ends_with('\n');
        let command = line.starts_with("cmd") && !line.contains('\n');
        assert!(frame || command, "torn message: {:?}", line);
    }
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_ends_subscriptions() {
    let (_transport, manager) = setup();
    let mut status = manager.subscribe();
    manager.connect(device()).await.unwrap();

    manager.shutdown().await;
    assert_eq!(manager.current_state(), SessionState::Idle);

    // Buffered events are still delivered, then the stream ends
    while status.recv().await.is_some() {}
    assert!(status.recv().await.is_none());
}
