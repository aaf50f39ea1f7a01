//! Authenticated Requester
//!
//! Wraps every outbound API call with the current bearer token. A 401
//! triggers one refresh through the [`RefreshCoordinator`] and one retry
//! with the new token; a second 401 invalidates the session. There is no
//! third attempt.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use thiserror::Error;

use super::refresh::RefreshCoordinator;
use crate::application::ports::{
    ApiRequest, ApiResponse, HttpTransport, RefreshError, TransportError,
};

/// Errors returned by [`AuthenticatedRequester`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RequestError {
    /// Request never completed.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Authorization failed after a refresh; the user must log in again.
    #[error("session is invalid; login required")]
    SessionInvalid,

    /// Refresh failed for a non-terminal reason; the credential is kept.
    #[error("token refresh failed: {0}")]
    Refresh(RefreshError),

    /// Server answered with a non-success status.
    #[error("request failed with status {status}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Response body.
        body: String,
    },

    /// Response body did not match the expected shape.
    #[error("failed to decode response: {0}")]
    Decode(String),
}

impl RequestError {
    /// Whether this error ended the session.
    #[must_use]
    pub const fn is_session_invalid(&self) -> bool {
        matches!(self, Self::SessionInvalid)
    }
}

/// Executes API calls with automatic refresh-and-retry on 401.
#[derive(Clone)]
pub struct AuthenticatedRequester {
    transport: Arc<dyn HttpTransport>,
    coordinator: RefreshCoordinator,
}

impl std::fmt::Debug for AuthenticatedRequester {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthenticatedRequester")
            .field("coordinator", &self.coordinator)
            .finish_non_exhaustive()
    }
}

impl AuthenticatedRequester {
    /// Create a requester.
    #[must_use]
    pub fn new(transport: Arc<dyn HttpTransport>, coordinator: RefreshCoordinator) -> Self {
        Self {
            transport,
            coordinator,
        }
    }

    /// The coordinator used for refreshes.
    #[must_use]
    pub const fn coordinator(&self) -> &RefreshCoordinator {
        &self.coordinator
    }

    /// Execute `request` with the current token, refreshing once on 401.
    ///
    /// Any status other than 401 is returned as-is.
    ///
    /// # Errors
    ///
    /// - `Transport` if the exchange failed; passed through unmodified.
    /// - `SessionInvalid` if the retry was also unauthorized or the refresh
    ///   failed terminally.
    /// - `Refresh` if the refresh failed for a non-terminal reason.
    pub async fn call(&self, request: ApiRequest) -> Result<ApiResponse, RequestError> {
        let token = self.coordinator.store().access_token();
        let response = self
            .transport
            .execute(request.clone().with_bearer(token))
            .await?;

        if !response.is_unauthorized() {
            return Ok(response);
        }

        tracing::debug!(path = %request.path, "Request unauthorized; refreshing token");

        let token = match self.coordinator.refresh().await {
            Ok(token) => token,
            Err(e) if e.is_terminal() => return Err(RequestError::SessionInvalid),
            Err(e) => return Err(RequestError::Refresh(e)),
        };

        let path = request.path.clone();
        let response = self
            .transport
            .execute(request.with_bearer(Some(token)))
            .await?;

        if response.is_unauthorized() {
            tracing::warn!(%path, "Request unauthorized after refresh");
            self.coordinator.invalidate("unauthorized after token refresh");
            return Err(RequestError::SessionInvalid);
        }

        Ok(response)
    }

    /// `GET` a path and return the body of a 2xx response.
    ///
    /// # Errors
    ///
    /// As [`Self::call`], plus `Status` for non-2xx responses.
    pub async fn get_text(&self, path: &str) -> Result<String, RequestError> {
        let response = self.call(ApiRequest::get(path)).await?;
        if !response.is_success() {
            return Err(RequestError::Status {
                status: response.status,
                body: response.body,
            });
        }
        Ok(response.body)
    }

    /// `GET` a path and decode the 2xx body as JSON.
    ///
    /// # Errors
    ///
    /// As [`Self::get_text`], plus `Decode` if the body does not match `T`.
    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, RequestError> {
        let body = self.get_text(path).await?;
        serde_json::from_str(&body).map_err(|e| RequestError::Decode(e.to_string()))
    }
}
