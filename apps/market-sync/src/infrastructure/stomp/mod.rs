//! STOMP Streaming Adapter
//!
//! STOMP 1.2 over WebSocket: frame codec, heart-beat supervision,
//! reconnection policy, and the [`StreamConnection`] that implements the
//! `MarketStream` port.

pub mod codec;
pub mod connection;
pub mod heartbeat;
pub mod reconnect;

pub use codec::{CodecError, Command, Frame, HeartBeat};
pub use connection::{StreamConfig, StreamConnection};
pub use heartbeat::HeartbeatConfig;
pub use reconnect::{ReconnectConfig, ReconnectPolicy};
