//! Stream Connection Lifecycle Tests
//!
//! Drives a real `StreamConnection` against the in-process STOMP broker and
//! checks the events it reports across sessions.

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::timeout;

use common::{FakeBroker, TOPIC, WAIT, eventually, stream_config};
use market_sync::application::ports::MarketStream;
use market_sync::domain::streaming::MessageHandler;
use market_sync::infrastructure::persistence::InMemoryTokenStore;
use market_sync::infrastructure::stomp::codec::Command;
use market_sync::infrastructure::stomp::{HeartbeatConfig, StreamConfig, StreamConnection};
use market_sync::{ConnectionState, Credential, CredentialStore, SessionId, StreamError, StreamEvent};

fn open(config: StreamConfig) -> (StreamConnection, mpsc::UnboundedReceiver<StreamEvent>) {
    let store = Arc::new(CredentialStore::open(Arc::new(
        InMemoryTokenStore::with_credential(Credential::new("good", "r1")),
    )));
    StreamConnection::new(config, store)
}

async fn next_event(events: &mut mpsc::UnboundedReceiver<StreamEvent>) -> StreamEvent {
    timeout(WAIT, events.recv())
        .await
        .expect("no stream event")
        .expect("event channel closed")
}

async fn expect_ready(events: &mut mpsc::UnboundedReceiver<StreamEvent>, expected: u64) {
    match next_event(events).await {
        StreamEvent::Ready { session } => assert_eq!(session, SessionId(expected)),
        other => panic!("expected Ready, got {other:?}"),
    }
}

/// Expect `Closed` for `session`, then a reconnect scheduled as `attempt`.
/// Returns the close reason.
async fn expect_lost(
    events: &mut mpsc::UnboundedReceiver<StreamEvent>,
    session: Option<u64>,
    attempt: u32,
) -> String {
    let reason = match next_event(events).await {
        StreamEvent::Closed {
            session: closed,
            reason,
        } => {
            assert_eq!(closed, session.map(SessionId));
            reason
        }
        other => panic!("expected Closed, got {other:?}"),
    };
    match next_event(events).await {
        StreamEvent::Reconnecting { attempt: got, .. } => assert_eq!(got, attempt),
        other => panic!("expected Reconnecting, got {other:?}"),
    }
    reason
}

#[tokio::test]
async fn connect_is_idempotent_while_live() {
    let mut broker = FakeBroker::start().await;
    let (connection, mut events) = open(stream_config(&broker.url, 5));

    connection.connect().unwrap();
    connection.connect().unwrap();
    let mut session = broker.next_session().await;
    expect_ready(&mut events, 1).await;

    connection.connect().unwrap();

    assert!(!broker.session_within(Duration::from_millis(200)).await);
    assert_eq!(connection.state(), ConnectionState::Connected);
    assert!(events.try_recv().is_err());

    connection.disconnect().await;
    session.expect(Command::Disconnect).await;
}

#[tokio::test]
async fn send_and_subscribe_on_live_session() {
    let mut broker = FakeBroker::start().await;
    let (connection, mut events) = open(stream_config(&broker.url, 5));

    connection.connect().unwrap();
    let mut session = broker.next_session().await;
    expect_ready(&mut events, 1).await;

    connection.send("/app/orders", r#"{"a":1}"#).unwrap();
    let frame = session.expect(Command::Send).await;
    assert_eq!(frame.get("destination"), Some("/app/orders"));
    assert_eq!(frame.body, r#"{"a":1}"#);

    let (delivered_tx, mut delivered) = mpsc::unbounded_channel();
    let handler: MessageHandler = Arc::new(move |message| {
        let _ = delivered_tx.send(message);
    });
    let subscription = connection.subscribe(TOPIC, handler);
    assert_eq!(subscription.session(), Some(SessionId(1)));
    let sub_id = session
        .expect(Command::Subscribe)
        .await
        .get("id")
        .unwrap()
        .to_string();

    session.publish(&sub_id, 7, "hello");
    let message = timeout(WAIT, delivered.recv()).await.unwrap().unwrap();
    assert_eq!(message.body, "hello");
    assert_eq!(message.message_id.as_deref(), Some("7"));

    subscription.unsubscribe();
    let unsubscribe = session.expect(Command::Unsubscribe).await;
    assert_eq!(unsubscribe.get("id"), Some(sub_id.as_str()));
    assert_eq!(connection.active_subscriptions(), 0);

    connection.disconnect().await;
}

#[tokio::test]
async fn silent_broker_times_out_and_reconnects() {
    let mut broker = FakeBroker::with_heartbeat("100,0").await;
    let mut config = stream_config(&broker.url, 5);
    config.heartbeat = HeartbeatConfig::new(Duration::ZERO, Duration::from_millis(100));
    let (connection, mut events) = open(config);

    connection.connect().unwrap();
    let _first = broker.next_session().await;
    expect_ready(&mut events, 1).await;

    let reason = expect_lost(&mut events, Some(1), 1).await;
    assert!(reason.contains("heart-beat timeout"), "{reason}");

    let _second = broker.next_session().await;
    expect_ready(&mut events, 2).await;

    connection.disconnect().await;
}

#[tokio::test]
async fn error_frame_ends_session_and_reconnects() {
    let mut broker = FakeBroker::start().await;
    let (connection, mut events) = open(stream_config(&broker.url, 5));

    connection.connect().unwrap();
    let first = broker.next_session().await;
    expect_ready(&mut events, 1).await;

    first.reject("bad");

    let reason = expect_lost(&mut events, Some(1), 1).await;
    assert_eq!(reason, "protocol error: bad");
    let _second = broker.next_session().await;
    expect_ready(&mut events, 2).await;

    connection.disconnect().await;
}

#[tokio::test]
async fn attempt_counter_resets_after_each_session() {
    let mut broker = FakeBroker::start().await;
    let (connection, mut events) = open(stream_config(&broker.url, 5));

    connection.connect().unwrap();
    let first = broker.next_session().await;
    expect_ready(&mut events, 1).await;

    first.drop_connection();
    expect_lost(&mut events, Some(1), 1).await;
    let second = broker.next_session().await;
    expect_ready(&mut events, 2).await;

    second.drop_connection();
    expect_lost(&mut events, Some(2), 1).await;
    let _third = broker.next_session().await;
    expect_ready(&mut events, 3).await;

    connection.disconnect().await;
}

#[tokio::test]
async fn gives_up_after_max_attempts_then_restarts_on_connect() {
    // Accepts TCP and hangs up before the WebSocket handshake.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}/ws", listener.local_addr().unwrap());
    let dials = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&dials);
    tokio::spawn(async move {
        while let Ok((tcp, _)) = listener.accept().await {
            counter.fetch_add(1, Ordering::SeqCst);
            drop(tcp);
        }
    });

    let (connection, mut events) = open(stream_config(&url, 2));
    connection.connect().unwrap();

    expect_lost(&mut events, None, 1).await;
    expect_lost(&mut events, None, 2).await;
    assert!(matches!(
        next_event(&mut events).await,
        StreamEvent::Closed { session: None, .. }
    ));
    assert!(matches!(
        next_event(&mut events).await,
        StreamEvent::Failed(StreamError::GaveUp { attempts: 2 })
    ));

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(dials.load(Ordering::SeqCst), 3);
    assert!(events.try_recv().is_err());
    assert_ne!(connection.state(), ConnectionState::Connected);

    connection.connect().unwrap();
    expect_lost(&mut events, None, 1).await;
    eventually("a fresh dial", || async { dials.load(Ordering::SeqCst) >= 4 }).await;

    connection.disconnect().await;
}
