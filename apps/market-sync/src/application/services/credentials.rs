//! Credential Store
//!
//! Holds the current access and refresh tokens in memory and mirrors every
//! change to a [`TokenPersistence`] backend. The in-memory value is
//! authoritative: a persistence failure is logged and never loses it.

use std::sync::Arc;

use parking_lot::RwLock;

use crate::application::ports::TokenPersistence;
use crate::domain::credentials::{AccessToken, Credential, RefreshToken};

/// Process-wide holder of the logged-in user's credential.
pub struct CredentialStore {
    current: RwLock<Option<Credential>>,
    persistence: Arc<dyn TokenPersistence>,
}

impl std::fmt::Debug for CredentialStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialStore")
            .field("logged_in", &self.is_logged_in())
            .finish_non_exhaustive()
    }
}

impl CredentialStore {
    /// Create an empty store without reading the backend.
    #[must_use]
    pub fn new(persistence: Arc<dyn TokenPersistence>) -> Self {
        Self {
            current: RwLock::new(None),
            persistence,
        }
    }

    /// Create a store initialized from whatever the backend holds.
    #[must_use]
    pub fn open(persistence: Arc<dyn TokenPersistence>) -> Self {
        let loaded = match persistence.load() {
            Ok(credential) => credential,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to load stored credential");
                None
            }
        };

        tracing::debug!(found = loaded.is_some(), "Credential store opened");

        Self {
            current: RwLock::new(loaded),
            persistence,
        }
    }

    /// Current credential, if logged in.
    #[must_use]
    pub fn get(&self) -> Option<Credential> {
        self.current.read().clone()
    }

    /// Current access token, if logged in.
    #[must_use]
    pub fn access_token(&self) -> Option<AccessToken> {
        self.current
            .read()
            .as_ref()
            .map(|credential| credential.access_token.clone())
    }

    /// Current refresh token, if logged in.
    #[must_use]
    pub fn refresh_token(&self) -> Option<RefreshToken> {
        self.current
            .read()
            .as_ref()
            .map(|credential| credential.refresh_token.clone())
    }

    /// Whether a credential is held.
    #[must_use]
    pub fn is_logged_in(&self) -> bool {
        self.current.read().is_some()
    }

    /// Replace the credential (login or successful refresh).
    ///
    /// The backend write happens under the same lock as the in-memory one, so
    /// a concurrent [`clear`](Self::clear) cannot leave the two disagreeing.
    pub fn replace(&self, credential: Credential) {
        let mut current = self.current.write();
        if let Err(e) = self.persistence.save(&credential) {
            tracing::warn!(error = %e, "Failed to persist credential");
        }
        *current = Some(credential);
    }

    /// Remove the credential (logout or unrecoverable refresh failure).
    ///
    /// Returns `true` if a credential was held, so concurrent callers can
    /// tell which of them actually performed the clear.
    pub fn clear(&self) -> bool {
        let mut current = self.current.write();
        let cleared = current.take().is_some();

        if cleared {
            if let Err(e) = self.persistence.clear() {
                tracing::warn!(error = %e, "Failed to clear persisted credential");
            }
        }

        cleared
    }
}
