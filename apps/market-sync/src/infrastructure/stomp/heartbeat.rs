//! Heartbeat Manager
//!
//! Drives STOMP heart-beats for one session: emits a beat request at the
//! negotiated outgoing interval and flags a half-open connection when nothing
//! has arrived within the negotiated incoming interval times a tolerance.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::time::{Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::codec::{HeartBeat, HeartBeatSchedule};

/// Configuration for heartbeat behavior.
#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    /// Interval at which the client offers to send beats (0 disables).
    pub outgoing: Duration,
    /// Interval at which the client wants to receive beats (0 disables).
    pub incoming: Duration,
    /// Multiplier on the incoming interval before the link is declared dead.
    pub tolerance: u32,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            outgoing: Duration::from_secs(10),
            incoming: Duration::from_secs(10),
            tolerance: 2,
        }
    }
}

impl HeartbeatConfig {
    /// Create a new configuration with custom values.
    #[must_use]
    pub const fn new(outgoing: Duration, incoming: Duration) -> Self {
        Self {
            outgoing,
            incoming,
            tolerance: 2,
        }
    }

    /// The client's `heart-beat` header for `CONNECT`.
    #[must_use]
    pub const fn header(&self) -> HeartBeat {
        HeartBeat::new(self.outgoing, self.incoming)
    }
}

/// Events emitted by the heartbeat manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeartbeatEvent {
    /// Request to send a heart-beat EOL.
    SendBeat,
    /// Nothing received within the window; the connection should be restarted.
    Timeout(Duration),
}

/// Inbound liveness clock shared between the manager and the reader.
#[derive(Debug)]
pub struct HeartbeatState {
    last_inbound: RwLock<Instant>,
}

impl Default for HeartbeatState {
    fn default() -> Self {
        Self::new()
    }
}

impl HeartbeatState {
    /// Create new heartbeat state.
    #[must_use]
    pub fn new() -> Self {
        Self {
            last_inbound: RwLock::new(Instant::now()),
        }
    }

    /// Record that something (frame or beat) was received.
    pub fn record_inbound(&self) {
        *self.last_inbound.write() = Instant::now();
    }

    /// Get the time since anything was received.
    #[must_use]
    pub fn time_since_inbound(&self) -> Duration {
        self.last_inbound.read().elapsed()
    }
}

/// Heartbeat manager for one session.
pub struct HeartbeatManager {
    schedule: HeartBeatSchedule,
    tolerance: u32,
    state: Arc<HeartbeatState>,
    event_tx: mpsc::Sender<HeartbeatEvent>,
    cancel: CancellationToken,
}

impl HeartbeatManager {
    /// Create a new heartbeat manager.
    #[must_use]
    pub const fn new(
        schedule: HeartBeatSchedule,
        tolerance: u32,
        state: Arc<HeartbeatState>,
        event_tx: mpsc::Sender<HeartbeatEvent>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            schedule,
            tolerance,
            state,
            event_tx,
            cancel,
        }
    }

    /// Run until cancelled, the event channel closes, or a timeout is detected.
    pub async fn run(self) {
        let mut send = self.schedule.send_every.map(interval);
        let mut check = self.schedule.expect_every.map(interval);
        let window = self
            .schedule
            .expect_every
            .map(|every| every.saturating_mul(self.tolerance.max(1)));

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => {
                    tracing::debug!("Heartbeat manager cancelled");
                    break;
                }
                () = tick(&mut send) => {
                    if self.event_tx.send(HeartbeatEvent::SendBeat).await.is_err() {
                        tracing::debug!("Event channel closed, stopping heartbeat");
                        break;
                    }
                }
                () = tick(&mut check) => {
                    let Some(window) = window else { continue };
                    let elapsed = self.state.time_since_inbound();
                    if elapsed > window {
                        tracing::warn!(
                            elapsed_ms = elapsed.as_millis(),
                            window_ms = window.as_millis(),
                            "Heartbeat timeout detected"
                        );
                        let _ = self.event_tx.send(HeartbeatEvent::Timeout(window)).await;
                        break;
                    }
                }
            }
        }
    }
}

fn interval(period: Duration) -> Interval {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    interval
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schedule(send_ms: Option<u64>, expect_ms: Option<u64>) -> HeartBeatSchedule {
        HeartBeatSchedule {
            send_every: send_ms.map(Duration::from_millis),
            expect_every: expect_ms.map(Duration::from_millis),
        }
    }

    #[test]
    fn default_config_values() {
        let config = HeartbeatConfig::default();
        assert_eq!(config.outgoing, Duration::from_secs(10));
        assert_eq!(config.incoming, Duration::from_secs(10));
        assert_eq!(config.tolerance, 2);
        assert_eq!(config.header().header_value(), "10000,10000");
    }

    #[test]
    fn state_records_inbound() {
        let state = HeartbeatState::new();
        std::thread::sleep(Duration::from_millis(20));
        assert!(state.time_since_inbound() >= Duration::from_millis(20));

        state.record_inbound();
        assert!(state.time_since_inbound() < Duration::from_millis(20));
    }

    #[tokio::test]
    async fn manager_sends_beat_events() {
        let state = Arc::new(HeartbeatState::new());
        let (event_tx, mut event_rx) = mpsc::channel(10);
        let cancel = CancellationToken::new();

        let manager =
            HeartbeatManager::new(schedule(Some(50), None), 2, state, event_tx, cancel.clone());
        let handle = tokio::spawn(manager.run());

        let event = tokio::time::timeout(Duration::from_millis(200), event_rx.recv())
            .await
            .expect("should receive event")
            .expect("channel should not close");
        assert_eq!(event, HeartbeatEvent::SendBeat);

        cancel.cancel();
        handle.await.expect("task should complete");
    }

    #[tokio::test]
    async fn manager_detects_silence() {
        let state = Arc::new(HeartbeatState::new());
        let (event_tx, mut event_rx) = mpsc::channel(10);
        let cancel = CancellationToken::new();

        let manager =
            HeartbeatManager::new(schedule(None, Some(20)), 2, state, event_tx, cancel.clone());
        let handle = tokio::spawn(manager.run());

        let event = tokio::time::timeout(Duration::from_millis(500), event_rx.recv())
            .await
            .expect("should receive timeout")
            .expect("channel should not close");
        assert_eq!(event, HeartbeatEvent::Timeout(Duration::from_millis(40)));

        let _ = tokio::time::timeout(Duration::from_millis(100), handle).await;
    }

    #[tokio::test]
    async fn inbound_traffic_keeps_link_alive() {
        let state = Arc::new(HeartbeatState::new());
        let (event_tx, mut event_rx) = mpsc::channel(10);
        let cancel = CancellationToken::new();

        let manager = HeartbeatManager::new(
            schedule(None, Some(30)),
            2,
            Arc::clone(&state),
            event_tx,
            cancel.clone(),
        );
        let handle = tokio::spawn(manager.run());

        for _ in 0..10 {
            tokio::time::sleep(Duration::from_millis(15)).await;
            state.record_inbound();
        }

        assert!(event_rx.try_recv().is_err());
        cancel.cancel();
        handle.await.expect("task should complete");
    }

    #[tokio::test]
    async fn disabled_schedule_waits_for_cancellation() {
        let state = Arc::new(HeartbeatState::new());
        let (event_tx, _event_rx) = mpsc::channel(10);
        let cancel = CancellationToken::new();

        let manager = HeartbeatManager::new(schedule(None, None), 2, state, event_tx, cancel.clone());
        let handle = tokio::spawn(manager.run());

        cancel.cancel();
        let result = tokio::time::timeout(Duration::from_millis(100), handle).await;
        assert!(result.is_ok(), "manager should shut down on cancellation");
    }
}
