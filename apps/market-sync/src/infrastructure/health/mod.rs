//! Health Check and Metrics Endpoint
//!
//! HTTP endpoint for health checks, synchronizer status reporting, and
//! Prometheus metrics.
//!
//! # Endpoints
//!
//! - `GET /health` - Returns JSON health status
//! - `GET /healthz` - Liveness probe (simple OK)
//! - `GET /readyz` - Readiness probe (table seeded by a snapshot)
//! - `GET /metrics` - Prometheus metrics in text format

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::{Json, Router, extract::State, http::StatusCode, response::IntoResponse, routing::get};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::application::ports::MarketStream;
use crate::application::services::{SyncHandle, SyncStatus};
use crate::infrastructure::metrics::get_metrics_handle;

// =============================================================================
// Health Response Types
// =============================================================================

/// Health check response.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Overall status.
    pub status: HealthStatus,
    /// Service version.
    pub version: String,
    /// Server uptime in seconds.
    pub uptime_secs: u64,
    /// Current time.
    pub current_time: DateTime<Utc>,
    /// Synchronizer status.
    pub sync: SyncInfo,
    /// Price table status.
    pub table: TableInfo,
}

/// Overall health status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Live and seeded.
    Healthy,
    /// Serving, but stale or not yet seeded.
    Degraded,
    /// Updates halted until operator action.
    Unhealthy,
}

/// Synchronizer and stream status.
#[derive(Debug, Clone, Serialize)]
pub struct SyncInfo {
    /// Synchronizer status name.
    pub status: &'static str,
    /// Stream connection state name.
    pub connection: &'static str,
    /// Live session, if any.
    pub session: Option<String>,
    /// Current reconnect attempt (0 unless reconnecting).
    pub reconnect_attempt: u32,
}

/// Price table status.
#[derive(Debug, Clone, Serialize)]
pub struct TableInfo {
    /// Whether a snapshot has seeded the table.
    pub initialized: bool,
    /// Number of instruments held.
    pub instruments: usize,
    /// Time of the last seed or applied delta.
    pub last_updated: Option<DateTime<Utc>>,
}

// =============================================================================
// Health Server State
// =============================================================================

/// Shared state for the health server.
pub struct HealthServerState {
    version: String,
    started_at: Instant,
    sync: SyncHandle,
    stream: Arc<dyn MarketStream>,
}

impl HealthServerState {
    /// Create new health server state.
    #[must_use]
    pub fn new(version: String, sync: SyncHandle, stream: Arc<dyn MarketStream>) -> Self {
        Self {
            version,
            started_at: Instant::now(),
            sync,
            stream,
        }
    }
}

// =============================================================================
// Health Server
// =============================================================================

/// Health check HTTP server.
pub struct HealthServer {
    port: u16,
    state: Arc<HealthServerState>,
    cancel: CancellationToken,
}

impl HealthServer {
    /// Create a new health server.
    #[must_use]
    pub const fn new(port: u16, state: Arc<HealthServerState>, cancel: CancellationToken) -> Self {
        Self {
            port,
            state,
            cancel,
        }
    }

    /// Run the health server until cancelled.
    ///
    /// # Errors
    ///
    /// Returns `HealthServerError` if binding fails or the HTTP server
    /// encounters a fatal error while running.
    pub async fn run(self) -> Result<(), HealthServerError> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| HealthServerError::BindFailed(self.port, e.to_string()))?;

        tracing::info!(port = self.port, "Health server listening");
        self.serve(listener).await
    }

    /// Serve on an already bound listener until cancelled.
    ///
    /// # Errors
    ///
    /// Returns `HealthServerError` if the HTTP server fails while running.
    pub async fn serve(self, listener: TcpListener) -> Result<(), HealthServerError> {
        let app = Router::new()
            .route("/health", get(health_handler))
            .route("/healthz", get(liveness_handler))
            .route("/readyz", get(readiness_handler))
            .route("/metrics", get(metrics_handler))
            .with_state(self.state);

        axum::serve(listener, app)
            .with_graceful_shutdown(self.cancel.cancelled_owned())
            .await
            .map_err(|e| HealthServerError::ServerFailed(e.to_string()))?;

        tracing::info!("Health server stopped");
        Ok(())
    }
}

// =============================================================================
// HTTP Handlers
// =============================================================================

async fn health_handler(State(state): State<Arc<HealthServerState>>) -> impl IntoResponse {
    let response = build_health_response(&state);
    let status_code = match response.status {
        HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };
    (status_code, Json(response))
}

async fn liveness_handler() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

async fn readiness_handler(State(state): State<Arc<HealthServerState>>) -> impl IntoResponse {
    if state.sync.table().is_initialized() {
        (StatusCode::OK, "READY")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "NOT READY")
    }
}

async fn metrics_handler() -> impl IntoResponse {
    get_metrics_handle().map_or_else(
        || {
            (
                StatusCode::SERVICE_UNAVAILABLE,
                [("content-type", "text/plain")],
                "Metrics not initialized".to_string(),
            )
        },
        |handle| {
            (
                StatusCode::OK,
                [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
                handle.render(),
            )
        },
    )
}

fn build_health_response(state: &HealthServerState) -> HealthResponse {
    let status = state.sync.status();
    let table = state.sync.table();

    let sync = SyncInfo {
        status: status.as_str(),
        connection: state.stream.state().as_str(),
        session: match status {
            SyncStatus::Live { session } => Some(session.to_string()),
            _ => None,
        },
        reconnect_attempt: match status {
            SyncStatus::Reconnecting { attempt } => attempt,
            _ => 0,
        },
    };

    let table = TableInfo {
        initialized: table.is_initialized(),
        instruments: table.len(),
        last_updated: table.last_updated(),
    };

    HealthResponse {
        status: determine_health_status(status, table.initialized),
        version: state.version.clone(),
        uptime_secs: state.started_at.elapsed().as_secs(),
        current_time: Utc::now(),
        sync,
        table,
    }
}

const fn determine_health_status(status: SyncStatus, initialized: bool) -> HealthStatus {
    match status {
        SyncStatus::Live { .. } if initialized => HealthStatus::Healthy,
        SyncStatus::Live { .. } | SyncStatus::Connecting | SyncStatus::Reconnecting { .. } => {
            HealthStatus::Degraded
        }
        SyncStatus::Disconnected | SyncStatus::SessionInvalid => HealthStatus::Unhealthy,
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Health server errors.
#[derive(Debug, thiserror::Error)]
pub enum HealthServerError {
    /// Failed to bind to port.
    #[error("failed to bind to port {0}: {1}")]
    BindFailed(u16, String),

    /// Server error.
    #[error("server error: {0}")]
    ServerFailed(String),
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::streaming::SessionId;
    use test_case::test_case;

    #[test]
    fn health_status_serialization() {
        assert_eq!(
            serde_json::to_string(&HealthStatus::Healthy).unwrap(),
            "\"healthy\""
        );
        assert_eq!(
            serde_json::to_string(&HealthStatus::Degraded).unwrap(),
            "\"degraded\""
        );
        assert_eq!(
            serde_json::to_string(&HealthStatus::Unhealthy).unwrap(),
            "\"unhealthy\""
        );
    }

    #[test_case(SyncStatus::Live { session: SessionId(1) }, true => HealthStatus::Healthy ; "live and seeded")]
    #[test_case(SyncStatus::Live { session: SessionId(1) }, false => HealthStatus::Degraded ; "live awaiting snapshot")]
    #[test_case(SyncStatus::Reconnecting { attempt: 2 }, true => HealthStatus::Degraded ; "reconnecting")]
    #[test_case(SyncStatus::Connecting, false => HealthStatus::Degraded ; "connecting")]
    #[test_case(SyncStatus::Disconnected, true => HealthStatus::Unhealthy ; "gave up")]
    #[test_case(SyncStatus::SessionInvalid, true => HealthStatus::Unhealthy ; "logged out")]
    fn status_mapping(status: SyncStatus, initialized: bool) -> HealthStatus {
        determine_health_status(status, initialized)
    }

    #[test]
    fn response_shape() {
        let response = HealthResponse {
            status: HealthStatus::Healthy,
            version: "0.1.0".to_string(),
            uptime_secs: 5,
            current_time: Utc::now(),
            sync: SyncInfo {
                status: "live",
                connection: "connected",
                session: Some("session-1".to_string()),
                reconnect_attempt: 0,
            },
            table: TableInfo {
                initialized: true,
                instruments: 2,
                last_updated: None,
            },
        };

        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["status"], "healthy");
        assert_eq!(json["sync"]["session"], "session-1");
        assert_eq!(json["table"]["instruments"], 2);
    }
}
