//! In-process STOMP broker shared by the streaming integration tests.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use std::future::Future;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{WebSocketStream, accept_async};

use market_sync::infrastructure::stomp::codec::{self, Command, Frame};
use market_sync::infrastructure::stomp::{HeartbeatConfig, ReconnectConfig, StreamConfig};

pub const WAIT: Duration = Duration::from_secs(5);
pub const TOPIC: &str = "/topic/prices";

/// Accepts WebSocket connections and answers `CONNECT` with `CONNECTED`.
pub struct FakeBroker {
    pub url: String,
    sessions: mpsc::UnboundedReceiver<BrokerSession>,
    _accept: JoinHandle<()>,
}

/// Server side of one accepted STOMP session.
pub struct BrokerSession {
    pub connect: Frame,
    frames: mpsc::UnboundedReceiver<Frame>,
    push: mpsc::UnboundedSender<Option<String>>,
}

impl FakeBroker {
    /// Broker that opts out of heart-beats.
    pub async fn start() -> Self {
        Self::with_heartbeat("0,0").await
    }

    /// Broker that answers `CONNECT` with the given `heart-beat` header and
    /// then never sends anything unprompted.
    pub async fn with_heartbeat(heart_beat: &'static str) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}/ws", listener.local_addr().unwrap());
        let (sessions_tx, sessions) = mpsc::unbounded_channel();

        let accept = tokio::spawn(async move {
            while let Ok((tcp, _)) = listener.accept().await {
                let Ok(ws) = accept_async(tcp).await else {
                    continue;
                };
                tokio::spawn(serve(ws, heart_beat, sessions_tx.clone()));
            }
        });

        Self {
            url,
            sessions,
            _accept: accept,
        }
    }

    pub async fn next_session(&mut self) -> BrokerSession {
        timeout(WAIT, self.sessions.recv())
            .await
            .expect("no client connected")
            .expect("broker stopped")
    }

    /// Whether another session opens within `window`.
    pub async fn session_within(&mut self, window: Duration) -> bool {
        timeout(window, self.sessions.recv()).await.is_ok()
    }
}

impl BrokerSession {
    /// Wait for the next client frame with `command`, skipping others.
    pub async fn expect(&mut self, command: Command) -> Frame {
        timeout(WAIT, async {
            loop {
                let frame = self.frames.recv().await.expect("session closed");
                if frame.command == command {
                    return frame;
                }
            }
        })
        .await
        .unwrap_or_else(|_| panic!("no {command} frame"))
    }

    pub fn publish(&self, subscription: &str, message_id: u32, body: &str) {
        let frame = Frame::new(Command::Message)
            .header("subscription", subscription)
            .header("destination", TOPIC)
            .header("message-id", message_id.to_string())
            .body(body);
        self.push.send(Some(frame.encode())).unwrap();
    }

    /// Send an `ERROR` frame with the given `message` header.
    pub fn reject(&self, message: &str) {
        let frame = Frame::new(Command::Error)
            .header("message", message)
            .body("rejected by broker");
        self.push.send(Some(frame.encode())).unwrap();
    }

    /// Close the WebSocket from the server side.
    pub fn drop_connection(&self) {
        let _ = self.push.send(None);
    }
}

async fn serve(
    ws: WebSocketStream<TcpStream>,
    heart_beat: &'static str,
    sessions: mpsc::UnboundedSender<BrokerSession>,
) {
    let (mut write, mut read) = ws.split();

    let connect = loop {
        match read.next().await {
            Some(Ok(Message::Text(text))) => {
                let frames = codec::decode(&text).unwrap_or_default();
                if let Some(frame) = frames.into_iter().find(|f| f.command == Command::Connect) {
                    break frame;
                }
            }
            Some(Ok(_)) => {}
            _ => return,
        }
    };

    let connected = Frame::new(Command::Connected)
        .header("version", "1.2")
        .header("heart-beat", heart_beat);
    if write
        .send(Message::Text(connected.encode().into()))
        .await
        .is_err()
    {
        return;
    }

    let (frames_tx, frames) = mpsc::unbounded_channel();
    let (push, mut push_rx) = mpsc::unbounded_channel::<Option<String>>();
    if sessions
        .send(BrokerSession {
            connect,
            frames,
            push,
        })
        .is_err()
    {
        return;
    }

    loop {
        tokio::select! {
            message = read.next() => match message {
                Some(Ok(Message::Text(text))) => {
                    for frame in codec::decode(&text).unwrap_or_default() {
                        if frame.command == Command::Disconnect
                            && let Some(receipt) = frame.get("receipt")
                        {
                            let ack = Frame::new(Command::Receipt).header("receipt-id", receipt);
                            let _ = write.send(Message::Text(ack.encode().into())).await;
                        }
                        let _ = frames_tx.send(frame);
                    }
                }
                Some(Ok(_)) => {}
                _ => break,
            },
            push = push_rx.recv() => match push {
                Some(Some(text)) => {
                    if write.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                _ => {
                    let _ = write.send(Message::Close(None)).await;
                    break;
                }
            },
        }
    }
}

/// Stream settings for tests: no heart-beats and a 20ms reconnect base delay.
pub fn stream_config(url: &str, max_attempts: u32) -> StreamConfig {
    let mut config = StreamConfig::new(url);
    config.connect_timeout = Duration::from_secs(2);
    config.heartbeat = HeartbeatConfig::new(Duration::ZERO, Duration::ZERO);
    config.reconnect = ReconnectConfig::new(Duration::from_millis(20), max_attempts);
    config
}

pub async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + WAIT;
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}
