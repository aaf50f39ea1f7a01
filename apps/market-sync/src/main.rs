//! Market Sync Binary
//!
//! Keeps a local price table in sync with the backend and serves its health.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin market-sync
//! ```
//!
//! # Environment Variables
//!
//! ## Required
//! - `MARKET_SYNC_API_BASE_URL`: REST API base URL
//! - `MARKET_SYNC_STREAM_URL`: STOMP-over-WebSocket URL
//!
//! ## Optional
//! - `MARKET_SYNC_ACCESS_TOKEN` / `MARKET_SYNC_REFRESH_TOKEN`: Login seed
//! - `MARKET_SYNC_TOKEN_STORE_PATH`: JSON token file (default: in-memory)
//! - `MARKET_SYNC_HEALTH_PORT`: Health check HTTP port (default: 8083)
//! - `OTEL_ENABLED`: Enable OpenTelemetry (default: true)
//! - `RUST_LOG`: Log filter (default: `market_sync=info`)
//!
//! See `SyncConfig` for the full list.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use market_sync::application::ports::{HttpTransport, MarketStream, TokenPersistence};
use market_sync::application::services::{
    AuthenticatedRequester, CredentialStore, MarketDataSynchronizer, RefreshCoordinator,
    SessionEvent, SyncSettings,
};
use market_sync::domain::table::PriceTable;
use market_sync::infrastructure::health::{HealthServer, HealthServerState};
use market_sync::infrastructure::http::{HttpRefreshClient, ReqwestTransport};
use market_sync::infrastructure::persistence::{FileTokenStore, InMemoryTokenStore};
use market_sync::infrastructure::stomp::{StreamConfig, StreamConnection};
use market_sync::infrastructure::telemetry;
use market_sync::{SyncConfig, init_metrics};
use tokio::signal;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

/// Graceful shutdown timeout.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        eprintln!("rustls crypto provider already installed");
    }

    load_dotenv();

    let telemetry_guard = telemetry::init();

    tracing::info!(
        otel_export = telemetry_guard.is_exporting(),
        "Starting market sync"
    );

    if let Err(e) = init_metrics() {
        tracing::warn!(error = %e, "Prometheus recorder not installed, metrics disabled");
    }

    let config = SyncConfig::from_env().context("invalid configuration")?;
    log_config(&config);

    // Credentials
    let persistence: Arc<dyn TokenPersistence> = match &config.credentials.token_store_path {
        Some(path) => Arc::new(FileTokenStore::new(path)),
        None => Arc::new(InMemoryTokenStore::new()),
    };
    let store = Arc::new(CredentialStore::open(persistence));
    if let Some(seed) = config.credentials.seed.clone() {
        store.replace(seed);
    }
    if !store.is_logged_in() {
        tracing::warn!("No stored credential, authenticated calls will fail until login");
    }

    // REST side
    let transport: Arc<dyn HttpTransport> = Arc::new(
        ReqwestTransport::from_settings(&config.api).context("failed to build HTTP client")?,
    );
    let refresh_client = Arc::new(HttpRefreshClient::new(
        Arc::clone(&transport),
        config.api.refresh_path.clone(),
    ));
    let coordinator = RefreshCoordinator::new(Arc::clone(&store), refresh_client);
    let requester = AuthenticatedRequester::new(transport, coordinator.clone());

    // Streaming side
    let (connection, stream_events) = StreamConnection::new(
        StreamConfig::from_settings(&config.stream),
        Arc::clone(&store),
    );
    let stream: Arc<dyn MarketStream> = Arc::new(connection);

    let synchronizer = MarketDataSynchronizer::new(
        Arc::clone(&stream),
        stream_events,
        requester,
        PriceTable::new(config.merge),
        SyncSettings {
            topic: config.stream.topic.clone(),
            snapshot_paths: config.api.snapshot_paths.clone(),
        },
    );
    let handle = synchronizer.handle();

    let shutdown_token = CancellationToken::new();

    // Health server
    let health_state = Arc::new(HealthServerState::new(
        env!("CARGO_PKG_VERSION").to_string(),
        handle,
        stream,
    ));
    let health_server = HealthServer::new(
        config.server.health_port,
        health_state,
        shutdown_token.clone(),
    );
    tokio::spawn(async move {
        if let Err(e) = health_server.run().await {
            tracing::error!(error = %e, "Health server error");
        }
    });

    tokio::spawn(log_session_events(coordinator.subscribe_session_events()));

    let sync_task = tokio::spawn(synchronizer.run(shutdown_token.clone()));

    tracing::info!("Market sync ready");

    await_shutdown(shutdown_token).await;

    match tokio::time::timeout(SHUTDOWN_TIMEOUT, sync_task).await {
        Ok(Ok(())) => tracing::info!("Market sync stopped"),
        Ok(Err(e)) => tracing::error!(error = %e, "Synchronizer task failed"),
        Err(_) => tracing::warn!(
            timeout_secs = SHUTDOWN_TIMEOUT.as_secs(),
            "Synchronizer did not stop in time"
        ),
    }

    Ok(())
}

/// Surface credential lifecycle changes in the logs.
async fn log_session_events(mut events: broadcast::Receiver<SessionEvent>) {
    loop {
        match events.recv().await {
            Ok(SessionEvent::Refreshed) => tracing::info!("Access token refreshed"),
            Ok(SessionEvent::Invalidated { reason }) => {
                tracing::warn!(%reason, "Session invalidated, login required");
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::debug!(skipped, "Session event log lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// Load .env file from current or ancestor directories.
fn load_dotenv() {
    if dotenvy::dotenv().is_ok() {
        return;
    }

    if let Ok(cwd) = std::env::current_dir() {
        let mut dir = cwd.as_path();
        while let Some(parent) = dir.parent() {
            let env_path = parent.join(".env");
            if env_path.exists() {
                let _ = dotenvy::from_path(&env_path);
                return;
            }
            dir = parent;
        }
    }
}

/// Log the parsed configuration.
fn log_config(config: &SyncConfig) {
    tracing::info!(
        api = %config.api.base_url,
        stream = %config.stream.url,
        topic = %config.stream.topic,
        snapshot_paths = ?config.api.snapshot_paths,
        merge = ?config.merge,
        health_port = config.server.health_port,
        "Configuration loaded"
    );
    tracing::debug!(
        heartbeat_outgoing_ms = config.stream.heartbeat_outgoing.as_millis(),
        heartbeat_incoming_ms = config.stream.heartbeat_incoming.as_millis(),
        reconnect_base_delay_ms = config.stream.reconnect_base_delay.as_millis(),
        max_reconnect_attempts = config.stream.max_reconnect_attempts,
        "Stream settings"
    );
}

/// Wait for shutdown signal (SIGTERM or SIGINT), then cancel `shutdown_token`.
async fn await_shutdown(shutdown_token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Ctrl+C handler unavailable");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "SIGTERM handler unavailable");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
    }

    shutdown_token.cancel();
}
