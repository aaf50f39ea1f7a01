//! Market Data Synchronizer
//!
//! Keeps the canonical price table current by combining a snapshot pull per
//! streaming session with the open-ended delta topic.
//!
//! # Event Loop
//!
//! A single task owns the [`PriceTable`] writer and selects over:
//!
//! - stream lifecycle events (`Ready`, `Closed`, `Reconnecting`, `Failed`)
//! - delta payloads forwarded by the topic subscription handler
//! - snapshot pull outcomes, tagged with the session that issued them
//! - commands from [`SyncHandle`]
//! - cancellation
//!
//! Because every mutation happens on this task, deltas are applied in
//! delivery order and readers never see a half-applied batch.
//!
//! # Bootstrap Bookkeeping
//!
//! The "bootstrap done" flag is set when the pull is issued, not when it
//! completes, so churn inside one session cannot issue a second pull. A
//! failed pull clears the flag only if it belongs to the current session.
//! A pull that completes after its session closed still seeds the table.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::try_join_all;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use super::requester::{AuthenticatedRequester, RequestError};
use crate::application::ports::MarketStream;
use crate::domain::market::{PriceRecord, parse_price_batch};
use crate::domain::streaming::{
    InboundMessage, MessageHandler, SessionId, StreamEvent, Subscription,
};
use crate::domain::table::{ApplyOutcome, PriceTable, PriceTableReader};
use crate::infrastructure::metrics::{self, Outcome};

// =============================================================================
// Settings & Status
// =============================================================================

/// What the synchronizer subscribes to and pulls.
#[derive(Debug, Clone)]
pub struct SyncSettings {
    /// Delta topic.
    pub topic: String,
    /// Snapshot endpoint paths, merged in order before seeding.
    pub snapshot_paths: Vec<String>,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            topic: "/topic/prices".to_string(),
            snapshot_paths: vec!["/api/prices".to_string()],
        }
    }
}

/// Externally visible synchronizer status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
    /// Waiting for the first session.
    Connecting,
    /// A session is live.
    Live {
        /// The live session.
        session: SessionId,
    },
    /// Session lost; a reconnect is scheduled.
    Reconnecting {
        /// Reconnect attempt number.
        attempt: u32,
    },
    /// Stream stopped; updates halted until an external reconnect.
    Disconnected,
    /// Snapshot pull failed authorization; login required.
    SessionInvalid,
}

impl SyncStatus {
    /// Status name for health reporting.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::Live { .. } => "live",
            Self::Reconnecting { .. } => "reconnecting",
            Self::Disconnected => "disconnected",
            Self::SessionInvalid => "session_invalid",
        }
    }
}

/// Snapshot pull failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SnapshotError {
    /// The request failed.
    #[error(transparent)]
    Request(#[from] RequestError),

    /// A snapshot body was not a valid record batch.
    #[error("malformed snapshot from {path}: {reason}")]
    Malformed {
        /// Snapshot path that returned the body.
        path: String,
        /// Parse failure.
        reason: String,
    },
}

// =============================================================================
// Handle
// =============================================================================

#[derive(Debug)]
enum SyncCommand {
    Reconnect,
}

/// Control handle for a running synchronizer.
#[derive(Debug, Clone)]
pub struct SyncHandle {
    commands: mpsc::UnboundedSender<SyncCommand>,
    status: watch::Receiver<SyncStatus>,
    table: PriceTableReader,
}

impl SyncHandle {
    /// Ask the synchronizer to reconnect the stream (after a terminal failure).
    ///
    /// Returns `false` if the synchronizer has stopped.
    pub fn reconnect(&self) -> bool {
        self.commands.send(SyncCommand::Reconnect).is_ok()
    }

    /// Current status.
    #[must_use]
    pub fn status(&self) -> SyncStatus {
        *self.status.borrow()
    }

    /// Watch status changes.
    #[must_use]
    pub fn watch_status(&self) -> watch::Receiver<SyncStatus> {
        self.status.clone()
    }

    /// Read handle to the price table.
    #[must_use]
    pub fn table(&self) -> PriceTableReader {
        self.table.clone()
    }
}

// =============================================================================
// Synchronizer
// =============================================================================

struct SnapshotOutcome {
    session: SessionId,
    elapsed: Duration,
    result: Result<Vec<PriceRecord>, SnapshotError>,
}

/// Single writer of the canonical price table.
pub struct MarketDataSynchronizer {
    core: SyncCore,
    stream_events: mpsc::UnboundedReceiver<StreamEvent>,
    deltas: mpsc::UnboundedReceiver<InboundMessage>,
    snapshots: mpsc::UnboundedReceiver<SnapshotOutcome>,
    commands: mpsc::UnboundedReceiver<SyncCommand>,
    commands_tx: mpsc::UnboundedSender<SyncCommand>,
}

struct SyncCore {
    stream: Arc<dyn MarketStream>,
    requester: AuthenticatedRequester,
    table: PriceTable,
    settings: SyncSettings,
    status: watch::Sender<SyncStatus>,
    deltas_tx: mpsc::UnboundedSender<InboundMessage>,
    snapshots_tx: mpsc::UnboundedSender<SnapshotOutcome>,
    current_session: Option<SessionId>,
    bootstrap_done: bool,
    subscription: Option<(SessionId, Subscription)>,
}

impl MarketDataSynchronizer {
    /// Create a synchronizer.
    ///
    /// `stream_events` must be the event channel of `stream`.
    #[must_use]
    pub fn new(
        stream: Arc<dyn MarketStream>,
        stream_events: mpsc::UnboundedReceiver<StreamEvent>,
        requester: AuthenticatedRequester,
        table: PriceTable,
        settings: SyncSettings,
    ) -> Self {
        let (deltas_tx, deltas) = mpsc::unbounded_channel();
        let (snapshots_tx, snapshots) = mpsc::unbounded_channel();
        let (commands_tx, commands) = mpsc::unbounded_channel();
        let (status, _) = watch::channel(SyncStatus::Connecting);

        Self {
            core: SyncCore {
                stream,
                requester,
                table,
                settings,
                status,
                deltas_tx,
                snapshots_tx,
                current_session: None,
                bootstrap_done: false,
                subscription: None,
            },
            stream_events,
            deltas,
            snapshots,
            commands,
            commands_tx,
        }
    }

    /// Read handle to the price table.
    #[must_use]
    pub fn reader(&self) -> PriceTableReader {
        self.core.table.reader()
    }

    /// Control handle usable after [`Self::run`] takes ownership.
    #[must_use]
    pub fn handle(&self) -> SyncHandle {
        SyncHandle {
            commands: self.commands_tx.clone(),
            status: self.core.status.subscribe(),
            table: self.core.table.reader(),
        }
    }

    /// Connect the stream and process events until `cancel` fires.
    ///
    /// Disconnects the stream before returning.
    pub async fn run(self, cancel: CancellationToken) {
        let Self {
            mut core,
            mut stream_events,
            mut deltas,
            mut snapshots,
            mut commands,
            commands_tx: _commands_tx,
        } = self;

        tracing::info!(
            topic = %core.settings.topic,
            snapshot_sources = core.settings.snapshot_paths.len(),
            merge = ?core.table.policy(),
            "Market data synchronizer started"
        );

        core.connect();

        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    tracing::info!("Market data synchronizer cancelled");
                    break;
                }
                Some(event) = stream_events.recv() => core.on_stream_event(event),
                Some(message) = deltas.recv() => core.on_delta(&message),
                Some(outcome) = snapshots.recv() => core.on_snapshot(outcome),
                Some(command) = commands.recv() => core.on_command(command),
                else => break,
            }
        }

        if let Some((_, subscription)) = core.subscription.take() {
            subscription.unsubscribe();
        }
        core.stream.disconnect().await;
        core.publish(SyncStatus::Disconnected);
    }
}

impl SyncCore {
    fn publish(&self, status: SyncStatus) {
        self.status.send_replace(status);
    }

    fn connect(&self) {
        if let Err(e) = self.stream.connect() {
            tracing::error!(error = %e, "Failed to start stream connection");
        }
    }

    fn on_stream_event(&mut self, event: StreamEvent) {
        match event {
            StreamEvent::Ready { session } => self.on_ready(session),
            StreamEvent::Closed { session, reason } => {
                tracing::info!(?session, %reason, "Stream session closed");
                self.current_session = None;
                self.bootstrap_done = false;
                let outlived = self
                    .subscription
                    .as_ref()
                    .is_some_and(|(tag, _)| session.is_some_and(|closed| closed >= *tag));
                if outlived {
                    self.subscription = None;
                }
            }
            StreamEvent::Reconnecting { attempt, delay } => {
                tracing::debug!(attempt, delay_ms = delay.as_millis(), "Stream reconnecting");
                self.publish(SyncStatus::Reconnecting { attempt });
            }
            StreamEvent::Failed(e) => {
                tracing::error!(error = %e, "Stream failed; updates halted until reconnect");
                self.publish(SyncStatus::Disconnected);
            }
        }
    }

    fn on_ready(&mut self, session: SessionId) {
        self.current_session = Some(session);
        self.publish(SyncStatus::Live { session });

        // A lagging Ready may be handled after the connection has moved on, so
        // the subscription is tagged with the session it actually landed on.
        let subscribed = self
            .subscription
            .as_ref()
            .is_some_and(|(tag, _)| *tag >= session);
        if !subscribed {
            let deltas = self.deltas_tx.clone();
            let handler: MessageHandler = Arc::new(move |message| {
                let _ = deltas.send(message);
            });
            let subscription = self.stream.subscribe(&self.settings.topic, handler);
            let tag = subscription.session().unwrap_or(session);
            self.subscription = Some((tag, subscription));
        }

        if !self.bootstrap_done {
            self.bootstrap_done = true;
            self.start_bootstrap(session);
        }
    }

    fn start_bootstrap(&self, session: SessionId) {
        tracing::info!(%session, "Pulling snapshot");

        let requester = self.requester.clone();
        let paths = self.settings.snapshot_paths.clone();
        let outcomes = self.snapshots_tx.clone();

        tokio::spawn(async move {
            let started = Instant::now();
            let result = pull_snapshot(&requester, &paths).await;
            let _ = outcomes.send(SnapshotOutcome {
                session,
                elapsed: started.elapsed(),
                result,
            });
        });
    }

    fn on_snapshot(&mut self, outcome: SnapshotOutcome) {
        metrics::record_snapshot_pull(Outcome::of(&outcome.result), outcome.elapsed);

        match outcome.result {
            Ok(records) => {
                let written = self.table.seed(records);
                metrics::set_table_size(self.table.reader().len());
                tracing::info!(
                    session = %outcome.session,
                    records = written,
                    elapsed_ms = outcome.elapsed.as_millis(),
                    "Snapshot applied"
                );
            }
            Err(e) => {
                tracing::warn!(session = %outcome.session, error = %e, "Snapshot pull failed");

                if self.current_session == Some(outcome.session) {
                    self.bootstrap_done = false;
                }
                if matches!(e, SnapshotError::Request(RequestError::SessionInvalid)) {
                    self.publish(SyncStatus::SessionInvalid);
                }
            }
        }
    }

    fn on_delta(&mut self, message: &InboundMessage) {
        let records = match parse_price_batch(&message.body) {
            Ok(records) => records,
            Err(e) => {
                tracing::warn!(
                    destination = %message.destination,
                    error = %e,
                    "Dropping malformed delta"
                );
                metrics::record_malformed_message("delta");
                return;
            }
        };

        let mut applied = 0_u64;
        for record in records {
            match self.table.apply(record) {
                ApplyOutcome::Inserted | ApplyOutcome::Replaced => applied += 1,
                ApplyOutcome::RejectedStale => metrics::record_delta_rejected_stale(),
            }
        }

        metrics::record_deltas_applied(applied);
        metrics::set_table_size(self.table.reader().len());
    }

    fn on_command(&self, command: SyncCommand) {
        match command {
            SyncCommand::Reconnect => {
                tracing::info!("Reconnect requested");
                self.publish(SyncStatus::Connecting);
                self.connect();
            }
        }
    }
}

/// Fetch every snapshot source concurrently and merge them in path order.
async fn pull_snapshot(
    requester: &AuthenticatedRequester,
    paths: &[String],
) -> Result<Vec<PriceRecord>, SnapshotError> {
    let bodies = try_join_all(paths.iter().map(|path| requester.get_text(path))).await?;

    let mut merged = Vec::new();
    for (path, body) in paths.iter().zip(bodies) {
        let records = parse_price_batch(&body).map_err(|e| SnapshotError::Malformed {
            path: path.clone(),
            reason: e.to_string(),
        })?;
        merged.extend(records);
    }

    Ok(merged)
}
