//! STOMP-over-WebSocket Stream Connection
//!
//! Owns one physical streaming session at a time and replaces it after
//! abnormal loss, following the [`ReconnectPolicy`].
//!
//! # Lifecycle
//!
//! ```text
//! Idle --connect()--> Connecting --CONNECTED--> Connected
//!                         |                         |
//!                         +----- failure -----------+--> Closed --delay--> Connecting
//!                                                            |
//!                                                  attempts exhausted --> Failed event
//! any --disconnect()--> Idle (terminal)
//! ```
//!
//! A driver task runs the connect/reconnect loop. Each session pumps three
//! sources: outbound frames queued by `subscribe`/`send`, heart-beat events,
//! and inbound WebSocket messages. Lifecycle changes are reported on an
//! unbounded [`StreamEvent`] channel.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::http::Uri;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use super::codec::{self, Command, Frame, HEARTBEAT, HeartBeat};
use super::heartbeat::{HeartbeatConfig, HeartbeatEvent, HeartbeatManager, HeartbeatState};
use super::reconnect::{ReconnectConfig, ReconnectPolicy};
use crate::application::ports::MarketStream;
use crate::application::services::CredentialStore;
use crate::domain::streaming::{
    ConnectionState, InboundMessage, MessageHandler, SessionId, StreamError, StreamEvent,
    Subscription,
};
use crate::infrastructure::config::StreamSettings;
use crate::infrastructure::metrics;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

/// How long `disconnect` waits for the `DISCONNECT` frame to be flushed.
const DISCONNECT_FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for the stream connection.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// WebSocket URL (`ws://` or `wss://`).
    pub url: String,
    /// Value of the STOMP `host` header.
    pub host: String,
    /// Timeout for the WebSocket handshake and for `CONNECTED`.
    pub connect_timeout: Duration,
    /// Heartbeat configuration.
    pub heartbeat: HeartbeatConfig,
    /// Reconnection configuration.
    pub reconnect: ReconnectConfig,
}

impl StreamConfig {
    /// Create a configuration with defaults; `host` is taken from the URL.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        let url = url.into();
        let host = url
            .parse::<Uri>()
            .ok()
            .and_then(|uri| uri.host().map(str::to_string))
            .unwrap_or_else(|| "localhost".to_string());

        Self {
            url,
            host,
            connect_timeout: Duration::from_secs(10),
            heartbeat: HeartbeatConfig::default(),
            reconnect: ReconnectConfig::default(),
        }
    }

    /// Build from loaded stream settings.
    #[must_use]
    pub fn from_settings(settings: &StreamSettings) -> Self {
        Self {
            heartbeat: HeartbeatConfig::new(
                settings.heartbeat_outgoing,
                settings.heartbeat_incoming,
            ),
            reconnect: ReconnectConfig {
                base_delay: settings.reconnect_base_delay,
                max_attempts: settings.max_reconnect_attempts,
                jitter_factor: settings.reconnect_jitter,
            },
            ..Self::new(settings.url.as_str())
        }
    }
}

// =============================================================================
// Internal State
// =============================================================================

enum Outbound {
    Frame(Frame),
    Disconnect(oneshot::Sender<()>),
}

struct Route {
    topic: String,
    handler: MessageHandler,
}

struct Driver {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Mutable connection plumbing, guarded by one lock.
#[derive(Default)]
struct Link {
    /// Present only while a session is `Connected`.
    outbound: Option<mpsc::UnboundedSender<Outbound>>,
    /// The live session, set together with `outbound`.
    session: Option<SessionId>,
    /// Subscription id → route, for the live session only.
    routes: HashMap<String, Route>,
    /// Present while the connect/reconnect loop is running.
    driver: Option<Driver>,
}

enum SessionEnd {
    Released,
    Cancelled,
    Lost {
        session: Option<SessionId>,
        error: StreamError,
    },
}

impl SessionEnd {
    const fn lost(session: Option<SessionId>, error: StreamError) -> Self {
        Self::Lost { session, error }
    }
}

struct Inner {
    config: StreamConfig,
    policy: ReconnectPolicy,
    credentials: Arc<CredentialStore>,
    events: mpsc::UnboundedSender<StreamEvent>,
    state: RwLock<ConnectionState>,
    link: Mutex<Link>,
    released: AtomicBool,
    next_session: AtomicU64,
    next_subscription: AtomicU64,
}

// =============================================================================
// Stream Connection
// =============================================================================

/// STOMP 1.2 streaming connection with automatic reconnection.
///
/// Must be used from within a Tokio runtime.
pub struct StreamConnection {
    inner: Arc<Inner>,
}

impl StreamConnection {
    /// Create a connection and the receiver for its lifecycle events.
    #[must_use]
    pub fn new(
        config: StreamConfig,
        credentials: Arc<CredentialStore>,
    ) -> (Self, mpsc::UnboundedReceiver<StreamEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let policy = ReconnectPolicy::new(config.reconnect.clone());

        let connection = Self {
            inner: Arc::new(Inner {
                config,
                policy,
                credentials,
                events,
                state: RwLock::new(ConnectionState::Idle),
                link: Mutex::new(Link::default()),
                released: AtomicBool::new(false),
                next_session: AtomicU64::new(0),
                next_subscription: AtomicU64::new(0),
            }),
        };

        (connection, events_rx)
    }

    /// Number of subscriptions registered with the live session.
    #[must_use]
    pub fn active_subscriptions(&self) -> usize {
        self.inner.link.lock().routes.len()
    }
}

impl Drop for StreamConnection {
    fn drop(&mut self) {
        if let Some(driver) = self.inner.link.lock().driver.take() {
            driver.cancel.cancel();
        }
    }
}

#[async_trait]
impl MarketStream for StreamConnection {
    fn connect(&self) -> Result<(), StreamError> {
        if self.inner.released.load(Ordering::SeqCst) {
            return Err(StreamError::Released);
        }

        let mut link = self.inner.link.lock();
        if link.driver.is_some() {
            tracing::debug!("Stream already connecting or connected");
            return Ok(());
        }

        self.inner.set_state(ConnectionState::Connecting);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(Arc::clone(&self.inner).drive(cancel.clone()));
        link.driver = Some(Driver { cancel, handle });
        Ok(())
    }

    fn subscribe(&self, topic: &str, handler: MessageHandler) -> Subscription {
        let mut link = self.inner.link.lock();
        let (Some(outbound), Some(session)) = (link.outbound.clone(), link.session) else {
            tracing::error!(topic, "Cannot subscribe: stream is not connected");
            return Subscription::inactive();
        };

        let id = format!(
            "sub-{}",
            self.inner.next_subscription.fetch_add(1, Ordering::Relaxed)
        );
        link.routes.insert(
            id.clone(),
            Route {
                topic: topic.to_string(),
                handler,
            },
        );

        if outbound
            .send(Outbound::Frame(Frame::subscribe(&id, topic)))
            .is_err()
        {
            link.routes.remove(&id);
            tracing::error!(topic, "Cannot subscribe: session is closing");
            return Subscription::inactive();
        }
        drop(link);

        tracing::info!(topic, id = %id, %session, "Subscribed");

        let inner: Weak<Inner> = Arc::downgrade(&self.inner);
        let release_id = id.clone();
        Subscription::new(id, session, move || {
            if let Some(inner) = inner.upgrade() {
                inner.release_route(&release_id);
            }
        })
    }

    fn send(&self, destination: &str, payload: &str) -> Result<(), StreamError> {
        let link = self.inner.link.lock();
        let sent = link.outbound.as_ref().is_some_and(|outbound| {
            outbound
                .send(Outbound::Frame(Frame::send(destination, payload)))
                .is_ok()
        });

        if sent {
            Ok(())
        } else {
            tracing::error!(destination, "Cannot send: stream is not connected");
            Err(StreamError::NotConnected)
        }
    }

    async fn disconnect(&self) {
        if self.inner.released.swap(true, Ordering::SeqCst) {
            return;
        }

        let (outbound, driver, released_routes) = {
            let mut link = self.inner.link.lock();
            let released_routes = link.routes.len();
            link.routes.clear();
            link.session = None;
            (link.outbound.take(), link.driver.take(), released_routes)
        };

        if let Some(outbound) = outbound {
            let (done_tx, done_rx) = oneshot::channel();
            if outbound.send(Outbound::Disconnect(done_tx)).is_ok() {
                let _ = tokio::time::timeout(DISCONNECT_FLUSH_TIMEOUT, done_rx).await;
            }
        }

        if let Some(driver) = driver {
            driver.cancel.cancel();
            let _ = driver.handle.await;
        }

        self.inner.set_state(ConnectionState::Idle);
        tracing::info!(released_subscriptions = released_routes, "Stream disconnected");
    }

    fn state(&self) -> ConnectionState {
        *self.inner.state.read()
    }
}

// =============================================================================
// Driver
// =============================================================================

impl Inner {
    fn set_state(&self, state: ConnectionState) {
        *self.state.write() = state;
        metrics::set_stream_state(state);
    }

    fn emit(&self, event: StreamEvent) {
        let _ = self.events.send(event);
    }

    fn release_route(&self, id: &str) {
        let mut link = self.link.lock();
        if let Some(route) = link.routes.remove(id) {
            if let Some(outbound) = &link.outbound {
                let _ = outbound.send(Outbound::Frame(Frame::unsubscribe(id)));
            }
            tracing::info!(topic = %route.topic, id, "Unsubscribed");
        }
    }

    fn end_session(&self) {
        let mut link = self.link.lock();
        link.outbound = None;
        link.session = None;
        if !link.routes.is_empty() {
            tracing::debug!(count = link.routes.len(), "Dropping subscriptions of closed session");
            link.routes.clear();
        }
    }

    /// Connect/reconnect loop. Runs until released, cancelled, or out of attempts.
    async fn drive(self: Arc<Self>, cancel: CancellationToken) {
        let mut attempt: u32 = 0;

        loop {
            self.set_state(ConnectionState::Connecting);

            let (session, error) = match self.run_session(&cancel).await {
                SessionEnd::Released => {
                    self.set_state(ConnectionState::Idle);
                    return;
                }
                SessionEnd::Cancelled => return,
                SessionEnd::Lost { session, error } => (session, error),
            };

            self.end_session();
            if cancel.is_cancelled() {
                return;
            }

            if session.is_some() {
                attempt = 0;
            }

            self.set_state(ConnectionState::Closed);
            metrics::record_stream_error(error_kind(&error));
            tracing::warn!(?session, error = %error, "Stream connection lost");
            self.emit(StreamEvent::Closed {
                session,
                reason: error.to_string(),
            });

            let Some(delay) = self.policy.delay(attempt) else {
                tracing::error!(attempts = attempt, "Giving up on stream reconnection");
                self.link.lock().driver = None;
                self.emit(StreamEvent::Failed(StreamError::GaveUp { attempts: attempt }));
                return;
            };

            attempt += 1;
            let delay = self.policy.jittered(delay);
            tracing::info!(
                attempt,
                max_attempts = self.policy.max_attempts(),
                delay_ms = delay.as_millis(),
                "Reconnecting to stream"
            );
            metrics::record_reconnect();
            self.emit(StreamEvent::Reconnecting { attempt, delay });

            tokio::select! {
                () = cancel.cancelled() => return,
                () = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Establish one session and pump it until it ends.
    async fn run_session(&self, cancel: &CancellationToken) -> SessionEnd {
        tracing::info!(url = %self.config.url, "Connecting to stream");

        let handshake = tokio::time::timeout(
            self.config.connect_timeout,
            tokio_tungstenite::connect_async(self.config.url.as_str()),
        );
        let ws_stream = tokio::select! {
            () = cancel.cancelled() => return SessionEnd::Cancelled,
            result = handshake => match result {
                Ok(Ok((ws_stream, _response))) => ws_stream,
                Ok(Err(e)) => return SessionEnd::lost(None, StreamError::Transport(e.to_string())),
                Err(_) => {
                    return SessionEnd::lost(
                        None,
                        StreamError::Transport("WebSocket handshake timed out".to_string()),
                    );
                }
            },
        };

        let (mut write, mut read) = ws_stream.split();

        let client_beat = self.config.heartbeat.header();
        let token = self.credentials.access_token();
        let connect = Frame::connect(&self.config.host, client_beat, token.as_ref());
        if let Err(e) = write.send(Message::Text(connect.encode().into())).await {
            return SessionEnd::lost(None, StreamError::Transport(e.to_string()));
        }

        let awaiting = tokio::time::timeout(self.config.connect_timeout, await_connected(&mut read));
        let server_beat = tokio::select! {
            () = cancel.cancelled() => return SessionEnd::Cancelled,
            result = awaiting => match result {
                Ok(Ok(server_beat)) => server_beat,
                Ok(Err(e)) => return SessionEnd::lost(None, e),
                Err(_) => {
                    return SessionEnd::lost(
                        None,
                        StreamError::Protocol("no CONNECTED frame before timeout".to_string()),
                    );
                }
            },
        };

        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel();
        let session = {
            let mut link = self.link.lock();
            if cancel.is_cancelled() {
                return SessionEnd::Cancelled;
            }
            let session = SessionId(self.next_session.fetch_add(1, Ordering::SeqCst) + 1);
            link.outbound = Some(outbound_tx);
            link.session = Some(session);
            session
        };
        let schedule = codec::negotiate(client_beat, server_beat);
        self.set_state(ConnectionState::Connected);
        tracing::info!(
            %session,
            send_every_ms = schedule.send_every.map(|d| d.as_millis()),
            expect_every_ms = schedule.expect_every.map(|d| d.as_millis()),
            "Stream connected"
        );
        self.emit(StreamEvent::Ready { session });

        let heartbeat_state = Arc::new(HeartbeatState::new());
        let (heartbeat_tx, mut heartbeat_rx) = mpsc::channel::<HeartbeatEvent>(10);
        let heartbeat_cancel = cancel.child_token();
        let heartbeat_manager = HeartbeatManager::new(
            schedule,
            self.config.heartbeat.tolerance,
            Arc::clone(&heartbeat_state),
            heartbeat_tx,
            heartbeat_cancel.clone(),
        );
        let _heartbeat_handle = tokio::spawn(heartbeat_manager.run());

        let end = self
            .pump(
                session,
                cancel,
                &mut write,
                &mut read,
                &mut outbound_rx,
                &mut heartbeat_rx,
                &heartbeat_state,
            )
            .await;

        heartbeat_cancel.cancel();
        end
    }

    #[allow(clippy::too_many_arguments)]
    async fn pump(
        &self,
        session: SessionId,
        cancel: &CancellationToken,
        write: &mut WsSink,
        read: &mut WsSource,
        outbound_rx: &mut mpsc::UnboundedReceiver<Outbound>,
        heartbeat_rx: &mut mpsc::Receiver<HeartbeatEvent>,
        heartbeat_state: &HeartbeatState,
    ) -> SessionEnd {
        let lost = |error: StreamError| SessionEnd::lost(Some(session), error);

        loop {
            tokio::select! {
                biased;

                () = cancel.cancelled() => return SessionEnd::Cancelled,

                Some(outbound) = outbound_rx.recv() => match outbound {
                    Outbound::Frame(frame) => {
                        if let Err(e) = write.send(Message::Text(frame.encode().into())).await {
                            return lost(StreamError::Transport(e.to_string()));
                        }
                    }
                    Outbound::Disconnect(done) => {
                        let receipt = format!("disconnect-{session}");
                        let _ = write
                            .send(Message::Text(Frame::disconnect(&receipt).encode().into()))
                            .await;
                        let _ = write.close().await;
                        let _ = done.send(());
                        return SessionEnd::Released;
                    }
                },

                Some(event) = heartbeat_rx.recv() => match event {
                    HeartbeatEvent::SendBeat => {
                        if let Err(e) = write.send(Message::Text(HEARTBEAT.into())).await {
                            return lost(StreamError::Transport(e.to_string()));
                        }
                    }
                    HeartbeatEvent::Timeout(window) => {
                        return lost(StreamError::HeartbeatTimeout(window));
                    }
                },

                message = read.next() => {
                    heartbeat_state.record_inbound();
                    match message {
                        Some(Ok(Message::Text(text))) => {
                            if let Err(e) = self.dispatch(&text) {
                                return lost(e);
                            }
                        }
                        Some(Ok(Message::Ping(data))) => {
                            let _ = write.send(Message::Pong(data)).await;
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            return lost(StreamError::ClosedByServer);
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => return lost(StreamError::Transport(e.to_string())),
                    }
                }
            }
        }
    }

    /// Route inbound frames. An `ERROR` frame ends the session.
    fn dispatch(&self, text: &str) -> Result<(), StreamError> {
        let frames = match codec::decode(text) {
            Ok(frames) => frames,
            Err(e) => {
                tracing::warn!(error = %e, "Dropping malformed STOMP frame");
                metrics::record_malformed_message("frame");
                return Ok(());
            }
        };

        for frame in frames {
            match frame.command {
                Command::Message => self.deliver(frame),
                Command::Error => {
                    let reason = frame.get("message").unwrap_or("server error");
                    tracing::error!(reason, body = %frame.body, "STOMP ERROR frame");
                    return Err(StreamError::Protocol(reason.to_string()));
                }
                Command::Receipt => {
                    tracing::debug!(receipt = ?frame.get("receipt-id"), "Receipt");
                }
                other => tracing::debug!(command = %other, "Ignoring unexpected frame"),
            }
        }

        Ok(())
    }

    fn deliver(&self, frame: Frame) {
        let Some(id) = frame.get("subscription") else {
            tracing::debug!("MESSAGE frame without subscription header");
            return;
        };

        let route = self
            .link
            .lock()
            .routes
            .get(id)
            .map(|route| (route.topic.clone(), Arc::clone(&route.handler)));

        let Some((topic, handler)) = route else {
            tracing::debug!(subscription = id, "MESSAGE for unknown subscription");
            return;
        };

        let message = InboundMessage {
            destination: frame.get("destination").map_or(topic, str::to_string),
            message_id: frame.get("message-id").map(str::to_string),
            body: frame.body,
        };
        handler(message);
    }
}

/// Read until `CONNECTED`, returning the server's heart-beat header.
async fn await_connected(read: &mut WsSource) -> Result<HeartBeat, StreamError> {
    while let Some(message) = read.next().await {
        let text = match message {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => return Err(StreamError::Transport(e.to_string())),
        };

        let frames = codec::decode(&text).map_err(|e| StreamError::Protocol(e.to_string()))?;
        for frame in frames {
            match frame.command {
                Command::Connected => {
                    let server_beat = match frame.get("heart-beat") {
                        Some(value) => HeartBeat::parse(value)
                            .map_err(|e| StreamError::Protocol(e.to_string()))?,
                        None => HeartBeat::default(),
                    };
                    return Ok(server_beat);
                }
                Command::Error => {
                    let reason = frame.get("message").unwrap_or("connect rejected");
                    return Err(StreamError::Protocol(reason.to_string()));
                }
                other => tracing::debug!(command = %other, "Ignoring frame before CONNECTED"),
            }
        }
    }

    Err(StreamError::ClosedByServer)
}

const fn error_kind(error: &StreamError) -> &'static str {
    match error {
        StreamError::Transport(_) => "transport",
        StreamError::Protocol(_) => "protocol",
        StreamError::HeartbeatTimeout(_) => "heartbeat_timeout",
        StreamError::ClosedByServer => "closed_by_server",
        StreamError::NotConnected | StreamError::Released | StreamError::GaveUp { .. } => "other",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::ports::MockTokenPersistence;

    fn credentials() -> Arc<CredentialStore> {
        Arc::new(CredentialStore::new(Arc::new(MockTokenPersistence::new())))
    }

    #[test]
    fn host_is_taken_from_url() {
        assert_eq!(StreamConfig::new("wss://stream.example.com/ws").host, "stream.example.com");
        assert_eq!(StreamConfig::new("ws://127.0.0.1:9000/ws").host, "127.0.0.1");
        assert_eq!(StreamConfig::new("not a url").host, "localhost");
    }

    #[test]
    fn settings_carry_over() {
        let settings = StreamSettings {
            url: "wss://stream.example.com/ws".parse().unwrap(),
            topic: "/topic/prices".to_string(),
            heartbeat_outgoing: Duration::ZERO,
            heartbeat_incoming: Duration::from_secs(4),
            reconnect_base_delay: Duration::from_millis(500),
            max_reconnect_attempts: 3,
            reconnect_jitter: 0.2,
        };

        let config = StreamConfig::from_settings(&settings);

        assert_eq!(config.host, "stream.example.com");
        assert_eq!(config.heartbeat.header().header_value(), "0,4000");
        assert_eq!(config.reconnect.base_delay, Duration::from_millis(500));
        assert_eq!(config.reconnect.max_attempts, 3);
        assert!((config.reconnect.jitter_factor - 0.2).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn starts_idle() {
        let (connection, _events) = StreamConnection::new(StreamConfig::new("ws://127.0.0.1:1/ws"), credentials());
        assert_eq!(connection.state(), ConnectionState::Idle);
    }

    #[tokio::test]
    async fn subscribe_while_disconnected_is_inert() {
        let (connection, _events) = StreamConnection::new(StreamConfig::new("ws://127.0.0.1:1/ws"), credentials());
        let handler: MessageHandler = Arc::new(|_| {});

        let subscription = connection.subscribe("/topic/prices", handler);

        assert!(!subscription.is_active());
        assert_eq!(connection.active_subscriptions(), 0);
        subscription.unsubscribe();
    }

    #[tokio::test]
    async fn send_while_disconnected_fails() {
        let (connection, _events) = StreamConnection::new(StreamConfig::new("ws://127.0.0.1:1/ws"), credentials());
        assert_eq!(
            connection.send("/app/ping", "{}"),
            Err(StreamError::NotConnected)
        );
    }

    #[tokio::test]
    async fn connect_after_disconnect_is_rejected() {
        let (connection, _events) = StreamConnection::new(StreamConfig::new("ws://127.0.0.1:1/ws"), credentials());

        connection.disconnect().await;

        assert_eq!(connection.connect(), Err(StreamError::Released));
        assert_eq!(connection.state(), ConnectionState::Idle);
    }

    #[test]
    fn error_kinds() {
        assert_eq!(error_kind(&StreamError::ClosedByServer), "closed_by_server");
        assert_eq!(
            error_kind(&StreamError::HeartbeatTimeout(Duration::from_secs(1))),
            "heartbeat_timeout"
        );
    }
}
