#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::float_cmp,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::needless_pass_by_value,
        clippy::items_after_statements
    )
)]

//! Market Sync - Live Market Data Synchronization Core
//!
//! Maintains a consistent in-memory price table by combining a one-shot
//! snapshot pull per streaming session with an open-ended delta feed over
//! STOMP, while every authenticated call shares a single-flight token refresh.
//!
//! # Layers (inside → outside)
//!
//! - **Domain**: Core types with no I/O
//!   - `market`: Price records and batch parsing
//!   - `table`: Canonical price table (single writer, many readers)
//!   - `credentials`: Access/refresh tokens
//!   - `streaming`: Connection states, events, subscriptions
//!
//! - **Application**: Use cases and port definitions
//!   - `ports`: HTTP transport, refresh client, token persistence, market stream
//!   - `services`: Credential store, refresh coordinator, authenticated
//!     requester, market data synchronizer
//!
//! - **Infrastructure**: Adapters and external integrations
//!   - `stomp`: STOMP-over-WebSocket connection with heart-beats and reconnect
//!   - `http`: reqwest transport and refresh client
//!   - `persistence`: In-memory and JSON-file token stores
//!   - `config`: Environment configuration
//!   - `health`: Health check HTTP endpoint
//!
//! # Data Flow
//!
//! ```text
//!                 Ready(session)
//! StreamConnection ───────────────► Synchronizer ──snapshot pull──► REST API
//!        │                              │   ▲                        (401 → refresh
//!        │ MESSAGE /topic/prices        │   │ seed                     → retry once)
//!        └──────────── deltas ──────────┘   │
//!                                     PriceTable ──► readers
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

/// Domain layer - Core types with no external I/O.
pub mod domain;

/// Application layer - Use cases and port definitions.
pub mod application;

/// Infrastructure layer - Adapters and external integrations.
pub mod infrastructure;

// =============================================================================
// Re-exports
// =============================================================================

// Domain types
pub use domain::credentials::{AccessToken, Credential, RefreshToken, TokenPair};
pub use domain::market::{PriceRecord, RecordError, parse_price_batch};
pub use domain::streaming::{ConnectionState, SessionId, StreamError, StreamEvent, Subscription};
pub use domain::table::{ApplyOutcome, MergePolicy, PriceTable, PriceTableReader};

// Services
pub use application::services::{
    AuthenticatedRequester, CredentialStore, MarketDataSynchronizer, RefreshCoordinator,
    RequestError, SessionEvent, SyncHandle, SyncSettings, SyncStatus,
};

// Infrastructure config
pub use infrastructure::config::{
    ApiSettings, ConfigError, CredentialSettings, ServerSettings, StreamSettings, SyncConfig,
};

// Health server
pub use infrastructure::health::{HealthServer, HealthServerError, HealthServerState};

// Metrics
pub use infrastructure::metrics::init_metrics;

// Telemetry
pub use infrastructure::telemetry::{TelemetryConfig, TelemetryGuard, init as init_telemetry};
