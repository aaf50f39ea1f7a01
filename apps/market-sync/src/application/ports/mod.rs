//! Port Interfaces
//!
//! Defines the interfaces (ports) for external systems following
//! the Hexagonal Architecture pattern. These are the contracts that
//! infrastructure adapters must implement.
//!
//! ## Driven Ports (Outbound)
//!
//! - `HttpTransport`: Executes one HTTP request against the backend API
//! - `RefreshClient`: Exchanges a refresh token for a new access token
//! - `TokenPersistence`: Client-local storage for the credential
//! - `MarketStream`: Pub/sub streaming session (connect, subscribe, send)

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use thiserror::Error;

use crate::domain::credentials::{AccessToken, Credential, RefreshToken, TokenPair};
use crate::domain::streaming::{ConnectionState, MessageHandler, StreamError, Subscription};

// =============================================================================
// HTTP Transport
// =============================================================================

/// HTTP method of an API request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    /// `GET`
    Get,
    /// `POST`
    Post,
}

/// One outbound API request, independent of the HTTP client used.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiRequest {
    /// HTTP method.
    pub method: HttpMethod,
    /// Path relative to the API base URL (e.g. `/api/prices`).
    pub path: String,
    /// Optional JSON body.
    pub body: Option<serde_json::Value>,
    /// Bearer token to attach, if any.
    pub bearer: Option<AccessToken>,
}

impl ApiRequest {
    /// Build a `GET` request.
    #[must_use]
    pub fn get(path: impl Into<String>) -> Self {
        Self {
            method: HttpMethod::Get,
            path: path.into(),
            body: None,
            bearer: None,
        }
    }

    /// Build a `POST` request with a JSON body.
    #[must_use]
    pub fn post(path: impl Into<String>, body: serde_json::Value) -> Self {
        Self {
            method: HttpMethod::Post,
            path: path.into(),
            body: Some(body),
            bearer: None,
        }
    }

    /// Replace the bearer token.
    #[must_use]
    pub fn with_bearer(mut self, bearer: Option<AccessToken>) -> Self {
        self.bearer = bearer;
        self
    }
}

/// Status and body of a completed API call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiResponse {
    /// HTTP status code.
    pub status: u16,
    /// Raw response body.
    pub body: String,
}

impl ApiResponse {
    /// Create a response.
    #[must_use]
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    /// Whether the status is 2xx.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.status >= 200 && self.status < 300
    }

    /// Whether the server rejected the bearer token.
    #[must_use]
    pub const fn is_unauthorized(&self) -> bool {
        self.status == 401
    }

    /// Decode the body as JSON.
    ///
    /// # Errors
    ///
    /// Returns `serde_json::Error` if the body does not match `T`.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_str(&self.body)
    }
}

/// Failure to complete an HTTP exchange at all.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// Request URL could not be built.
    #[error("invalid request url: {0}")]
    InvalidUrl(String),

    /// Connection, TLS, or timeout failure.
    #[error("network error: {0}")]
    Network(String),
}

/// Executes API requests.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait HttpTransport: Send + Sync {
    /// Execute one request. Any HTTP status is a successful exchange.
    ///
    /// # Errors
    ///
    /// Returns `TransportError` if no response was received.
    async fn execute(&self, request: ApiRequest) -> Result<ApiResponse, TransportError>;
}

// =============================================================================
// Token Refresh
// =============================================================================

/// Outcome of a failed token refresh.
///
/// `Clone` so a single in-flight refresh can hand the same error to every waiter.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RefreshError {
    /// No refresh token is stored.
    #[error("no refresh token available")]
    NoRefreshToken,

    /// Refresh endpoint rejected the refresh token.
    #[error("refresh rejected with status {status}")]
    Rejected {
        /// HTTP status returned by the refresh endpoint.
        status: u16,
    },

    /// Refresh endpoint could not be reached.
    #[error("refresh transport error: {0}")]
    Transport(String),

    /// Refresh endpoint answered with an unexpected status or body.
    #[error("invalid refresh response: {0}")]
    InvalidResponse(String),
}

impl RefreshError {
    /// Whether the credential is unrecoverable and the session must be invalidated.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::NoRefreshToken | Self::Rejected { .. })
    }
}

/// Exchanges a refresh token for a new token pair.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RefreshClient: Send + Sync {
    /// Perform one refresh call.
    ///
    /// # Errors
    ///
    /// Returns `RefreshError` describing why no token pair was obtained.
    async fn refresh(
        &self,
        refresh_token: RefreshToken,
        access_token: Option<AccessToken>,
    ) -> Result<TokenPair, RefreshError>;
}

// =============================================================================
// Token Persistence
// =============================================================================

/// Failure of the client-local credential store.
#[derive(Debug, Error)]
pub enum PersistenceError {
    /// Underlying storage failed.
    #[error("token store I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Stored data could not be encoded or decoded.
    #[error("token store encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
}

/// Client-local key-value storage for the credential.
#[cfg_attr(test, mockall::automock)]
pub trait TokenPersistence: Send + Sync {
    /// Load the stored credential, if any.
    ///
    /// # Errors
    ///
    /// Returns `PersistenceError` if the store cannot be read.
    fn load(&self) -> Result<Option<Credential>, PersistenceError>;

    /// Store the credential, replacing any previous one.
    ///
    /// # Errors
    ///
    /// Returns `PersistenceError` if the store cannot be written.
    fn save(&self, credential: &Credential) -> Result<(), PersistenceError>;

    /// Remove the stored credential.
    ///
    /// # Errors
    ///
    /// Returns `PersistenceError` if the store cannot be written.
    fn clear(&self) -> Result<(), PersistenceError>;
}

// =============================================================================
// Market Stream
// =============================================================================

/// A pub/sub streaming session with automatic reconnection.
///
/// Lifecycle events are delivered on the channel handed out when the
/// adapter is constructed.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MarketStream: Send + Sync {
    /// Start connecting. No-op while connecting or connected.
    ///
    /// # Errors
    ///
    /// Returns `StreamError::Released` after `disconnect`.
    fn connect(&self) -> Result<(), StreamError>;

    /// Register `handler` for every message on `topic`.
    ///
    /// Returns an inactive subscription when not connected.
    fn subscribe(&self, topic: &str, handler: MessageHandler) -> Subscription;

    /// Publish `payload` to `destination` without awaiting acknowledgement.
    ///
    /// # Errors
    ///
    /// Returns `StreamError::NotConnected` when no session is live.
    fn send(&self, destination: &str, payload: &str) -> Result<(), StreamError>;

    /// Close the session and release all subscriptions. Terminal.
    async fn disconnect(&self);

    /// Current lifecycle state.
    fn state(&self) -> ConnectionState;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn response_status_classes() {
        assert!(ApiResponse::new(200, "").is_success());
        assert!(ApiResponse::new(204, "").is_success());
        assert!(!ApiResponse::new(301, "").is_success());
        assert!(ApiResponse::new(401, "").is_unauthorized());
        assert!(!ApiResponse::new(403, "").is_unauthorized());
    }

    #[test]
    fn response_json_decoding() {
        let response = ApiResponse::new(200, r#"{"ok":true}"#);
        let value: serde_json::Value = response.json().unwrap();
        assert_eq!(value["ok"], true);
    }

    #[test]
    fn request_builders() {
        let get = ApiRequest::get("/api/prices").with_bearer(Some(AccessToken::new("t")));
        assert_eq!(get.method, HttpMethod::Get);
        assert!(get.body.is_none());
        assert_eq!(get.bearer.unwrap().expose(), "t");

        let post = ApiRequest::post("/api/auth/refresh", serde_json::json!({"a": 1}));
        assert_eq!(post.method, HttpMethod::Post);
        assert!(post.body.is_some());
    }

    #[test]
    fn only_credential_failures_are_terminal() {
        assert!(RefreshError::NoRefreshToken.is_terminal());
        assert!(RefreshError::Rejected { status: 401 }.is_terminal());
        assert!(!RefreshError::Transport("reset".into()).is_terminal());
        assert!(!RefreshError::InvalidResponse("500".into()).is_terminal());
    }
}
