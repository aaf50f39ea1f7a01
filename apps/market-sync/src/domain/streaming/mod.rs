//! Streaming Session Types
//!
//! Transport-agnostic types describing a streaming session: its lifecycle
//! state, the events it reports to its owner, inbound messages, and the
//! handle returned by a topic subscription.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

// =============================================================================
// Connection State
// =============================================================================

/// Lifecycle state of a streaming connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// Not connected; either never started or cleanly disconnected.
    #[default]
    Idle,
    /// Transport or protocol handshake in progress.
    Connecting,
    /// Handshake complete, frames flowing.
    Connected,
    /// Lost abnormally; reconnection may be pending or exhausted.
    Closed,
}

impl ConnectionState {
    /// Get the state name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Closed => "closed",
        }
    }

    /// Numeric code for gauges.
    #[must_use]
    pub const fn as_code(&self) -> u8 {
        match self {
            Self::Idle => 0,
            Self::Connecting => 1,
            Self::Connected => 2,
            Self::Closed => 3,
        }
    }
}

/// Identifier of one successful connect→disconnect cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

// =============================================================================
// Events
// =============================================================================

/// Events a streaming connection reports to its owner.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// Handshake completed; a new session is live. Emitted once per session.
    Ready {
        /// The new session.
        session: SessionId,
    },
    /// The connection was lost or a connect attempt failed.
    Closed {
        /// Session that was lost, if the handshake had completed.
        session: Option<SessionId>,
        /// Human-readable cause.
        reason: String,
    },
    /// A reconnect has been scheduled.
    Reconnecting {
        /// Attempt number (1-based).
        attempt: u32,
        /// Delay before the attempt.
        delay: Duration,
    },
    /// Reconnection gave up; no further attempts will be made.
    Failed(StreamError),
}

/// Errors reported by a streaming connection.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StreamError {
    /// Operation requires a live session.
    #[error("stream is not connected")]
    NotConnected,

    /// Connection was disconnected and cannot be reused.
    #[error("stream connection has been released")]
    Released,

    /// Transport-level failure (socket, TLS, WebSocket).
    #[error("transport error: {0}")]
    Transport(String),

    /// Server sent a protocol-level error frame or an unexpected frame.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Nothing received within the negotiated heart-beat window.
    #[error("heart-beat timeout after {0:?}")]
    HeartbeatTimeout(Duration),

    /// Server closed the connection.
    #[error("connection closed by server")]
    ClosedByServer,

    /// Reconnection attempts exhausted.
    #[error("gave up reconnecting after {attempts} attempts")]
    GaveUp {
        /// Number of reconnect attempts made.
        attempts: u32,
    },
}

// =============================================================================
// Messages & Subscriptions
// =============================================================================

/// A message delivered on a subscribed topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    /// Topic the message was published on.
    pub destination: String,
    /// Server-assigned message id, if any.
    pub message_id: Option<String>,
    /// Message body.
    pub body: String,
}

/// Callback invoked once per inbound message on a topic.
pub type MessageHandler = Arc<dyn Fn(InboundMessage) + Send + Sync>;

/// Handle for an active topic subscription.
///
/// Dropping the handle does not unsubscribe; call [`Subscription::unsubscribe`].
pub struct Subscription {
    id: Option<String>,
    session: Option<SessionId>,
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    /// Create a live subscription registered on `session`, with its release action.
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        session: SessionId,
        release: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            id: Some(id.into()),
            session: Some(session),
            release: Some(Box::new(release)),
        }
    }

    /// Create a subscription that was never registered.
    #[must_use]
    pub const fn inactive() -> Self {
        Self {
            id: None,
            session: None,
            release: None,
        }
    }

    /// Subscription id, or `None` for an inactive subscription.
    #[must_use]
    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    /// Session the subscription was registered on, or `None` if inactive.
    #[must_use]
    pub const fn session(&self) -> Option<SessionId> {
        self.session
    }

    /// Whether the subscription was registered with a live session.
    #[must_use]
    pub const fn is_active(&self) -> bool {
        self.release.is_some()
    }

    /// Release the subscription. No-op for an inactive subscription.
    pub fn unsubscribe(mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("session", &self.session)
            .field("active", &self.is_active())
            .finish()
    }
}
