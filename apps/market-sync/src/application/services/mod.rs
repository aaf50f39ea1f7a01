//! Application Services
//!
//! Services that orchestrate domain logic and coordinate between ports.
//!
//! - `CredentialStore`: Holds the access and refresh tokens
//! - `RefreshCoordinator`: Single-flight token refresh
//! - `AuthenticatedRequester`: API calls with refresh-and-retry on 401
//! - `MarketDataSynchronizer`: Snapshot + delta merge into the price table

pub mod credentials;
pub mod refresh;
pub mod requester;
pub mod synchronizer;

pub use credentials::CredentialStore;
pub use refresh::{RefreshCoordinator, SessionEvent};
pub use requester::{AuthenticatedRequester, RequestError};
pub use synchronizer::{
    MarketDataSynchronizer, SnapshotError, SyncHandle, SyncSettings, SyncStatus,
};
