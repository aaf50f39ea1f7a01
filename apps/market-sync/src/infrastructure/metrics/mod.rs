//! Prometheus Metrics Module
//!
//! Exposes application metrics via Prometheus format for monitoring.
//!
//! # Metrics Categories
//!
//! - **Table**: Deltas applied, stale deltas rejected, table size
//! - **Messages**: Malformed payloads dropped
//! - **Bootstrap**: Snapshot pulls by outcome and duration
//! - **Session**: Token refreshes and invalidations
//! - **Connection**: Stream state and reconnect attempts
//!
//! # Integration
//!
//! Metrics are exposed at `/metrics` on the health server port.

use std::sync::OnceLock;
use std::time::Duration;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

use crate::domain::streaming::ConnectionState;

// =============================================================================
// Global Metrics Handle
// =============================================================================

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Initialize the Prometheus metrics recorder.
///
/// Subsequent calls return the handle installed by the first one.
///
/// # Errors
///
/// Returns `BuildError` if the global recorder cannot be installed.
pub fn init_metrics() -> Result<PrometheusHandle, BuildError> {
    if let Some(handle) = PROMETHEUS_HANDLE.get() {
        return Ok(handle.clone());
    }

    let handle = PrometheusBuilder::new().install_recorder()?;
    register_metrics();
    Ok(PROMETHEUS_HANDLE.get_or_init(|| handle).clone())
}

/// Get the Prometheus handle for rendering metrics.
///
/// Returns `None` if metrics have not been initialized.
#[must_use]
pub fn get_metrics_handle() -> Option<PrometheusHandle> {
    PROMETHEUS_HANDLE.get().cloned()
}

// =============================================================================
// Metric Registration
// =============================================================================

fn register_metrics() {
    // Table
    describe_counter!(
        "market_sync_deltas_applied_total",
        "Total delta records applied to the price table"
    );
    describe_counter!(
        "market_sync_deltas_rejected_stale_total",
        "Total delta records dropped as older than the stored record"
    );
    describe_counter!(
        "market_sync_messages_malformed_total",
        "Total inbound payloads dropped as malformed"
    );
    describe_gauge!(
        "market_sync_table_instruments",
        "Number of instruments held in the price table"
    );

    // Bootstrap
    describe_counter!(
        "market_sync_snapshot_pulls_total",
        "Total snapshot pulls by outcome"
    );
    describe_histogram!(
        "market_sync_snapshot_pull_seconds",
        "Snapshot pull duration"
    );

    // Session
    describe_counter!(
        "market_sync_token_refreshes_total",
        "Total token refreshes by outcome"
    );
    describe_counter!(
        "market_sync_session_invalidations_total",
        "Total session invalidations"
    );

    // Connection
    describe_gauge!(
        "market_sync_stream_state",
        "Stream state (0=idle, 1=connecting, 2=connected, 3=closed)"
    );
    describe_counter!(
        "market_sync_reconnects_total",
        "Total stream reconnection attempts"
    );
    describe_counter!(
        "market_sync_stream_errors_total",
        "Total stream errors by type"
    );
}

// =============================================================================
// Metric Recording Functions
// =============================================================================

/// Outcome label for pulls and refreshes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Completed successfully.
    Success,
    /// Failed.
    Failure,
}

impl Outcome {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure => "failure",
        }
    }

    /// Outcome of a `Result`.
    #[must_use]
    pub const fn of<T, E>(result: &Result<T, E>) -> Self {
        if result.is_ok() {
            Self::Success
        } else {
            Self::Failure
        }
    }
}

/// Record delta records applied to the table.
pub fn record_deltas_applied(count: u64) {
    counter!("market_sync_deltas_applied_total").increment(count);
}

/// Record a delta dropped by the stale guard.
pub fn record_delta_rejected_stale() {
    counter!("market_sync_deltas_rejected_stale_total").increment(1);
}

/// Record a malformed inbound payload.
pub fn record_malformed_message(source: &'static str) {
    counter!("market_sync_messages_malformed_total", "source" => source).increment(1);
}

/// Update the table size gauge.
#[allow(clippy::cast_precision_loss)]
pub fn set_table_size(count: usize) {
    gauge!("market_sync_table_instruments").set(count as f64);
}

/// Record a finished snapshot pull.
pub fn record_snapshot_pull(outcome: Outcome, duration: Duration) {
    counter!("market_sync_snapshot_pulls_total", "outcome" => outcome.as_str()).increment(1);
    histogram!("market_sync_snapshot_pull_seconds", "outcome" => outcome.as_str())
        .record(duration.as_secs_f64());
}

/// Record a finished token refresh.
pub fn record_refresh(outcome: Outcome) {
    counter!("market_sync_token_refreshes_total", "outcome" => outcome.as_str()).increment(1);
}

/// Record a session invalidation.
pub fn record_session_invalidated() {
    counter!("market_sync_session_invalidations_total").increment(1);
}

/// Update the stream state gauge.
pub fn set_stream_state(state: ConnectionState) {
    gauge!("market_sync_stream_state").set(f64::from(state.as_code()));
}

/// Record a stream reconnection attempt.
pub fn record_reconnect() {
    counter!("market_sync_reconnects_total").increment(1);
}

/// Record a stream error.
pub fn record_stream_error(error_type: &'static str) {
    counter!("market_sync_stream_errors_total", "error_type" => error_type).increment(1);
}

// =============================================================================
// Tests
// =============================================================================
