//! Refresh Coordinator
//!
//! Single-flight token refresh. While a refresh is running, every caller of
//! [`RefreshCoordinator::refresh`] awaits the same shared future and observes
//! the same outcome. The slot is emptied when the refresh completes, so the
//! next authorization failure starts a fresh one.
//!
//! Terminal refresh failures invalidate the session: the credential store is
//! cleared and a single [`SessionEvent::Invalidated`] is broadcast.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use parking_lot::Mutex;
use tokio::sync::broadcast;

use super::credentials::CredentialStore;
use crate::application::ports::{RefreshClient, RefreshError};
use crate::domain::credentials::{AccessToken, Credential};
use crate::infrastructure::metrics::{self, Outcome};

/// Capacity of the session event channel.
const SESSION_EVENT_CAPACITY: usize = 16;

type SharedRefresh = Shared<BoxFuture<'static, Result<AccessToken, RefreshError>>>;

/// Session-level signals for the rest of the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// A refresh succeeded and new tokens are stored.
    Refreshed,
    /// Credentials were cleared; the user must log in again.
    Invalidated {
        /// Why the session was invalidated.
        reason: String,
    },
}

struct InFlight {
    generation: u64,
    future: SharedRefresh,
}

struct Inner {
    store: Arc<CredentialStore>,
    client: Arc<dyn RefreshClient>,
    in_flight: Mutex<Option<InFlight>>,
    generation: AtomicU64,
    events: broadcast::Sender<SessionEvent>,
}

/// Coordinates token refreshes across all callers in the process.
#[derive(Clone)]
pub struct RefreshCoordinator {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for RefreshCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RefreshCoordinator")
            .field("refreshing", &self.is_refreshing())
            .finish_non_exhaustive()
    }
}

impl RefreshCoordinator {
    /// Create a coordinator over a credential store and refresh endpoint.
    #[must_use]
    pub fn new(store: Arc<CredentialStore>, client: Arc<dyn RefreshClient>) -> Self {
        let (events, _) = broadcast::channel(SESSION_EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                store,
                client,
                in_flight: Mutex::new(None),
                generation: AtomicU64::new(0),
                events,
            }),
        }
    }

    /// The credential store this coordinator writes to.
    #[must_use]
    pub fn store(&self) -> &Arc<CredentialStore> {
        &self.inner.store
    }

    /// Subscribe to session events.
    #[must_use]
    pub fn subscribe_session_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    /// Whether a refresh is currently in flight.
    #[must_use]
    pub fn is_refreshing(&self) -> bool {
        self.inner.in_flight.lock().is_some()
    }

    /// Refresh the access token, joining the in-flight refresh if one exists.
    ///
    /// # Errors
    ///
    /// Returns the shared `RefreshError` of the refresh this call joined.
    pub async fn refresh(&self) -> Result<AccessToken, RefreshError> {
        let future = {
            let mut slot = self.inner.in_flight.lock();
            match slot.as_ref() {
                Some(in_flight) => {
                    tracing::debug!(
                        generation = in_flight.generation,
                        "Joining in-flight token refresh"
                    );
                    in_flight.future.clone()
                }
                None => {
                    let generation = self.inner.generation.fetch_add(1, Ordering::Relaxed);
                    let inner = Arc::clone(&self.inner);
                    let future = async move {
                        let result = inner.run_refresh().await;
                        inner.finish(generation);
                        result
                    }
                    .boxed()
                    .shared();

                    *slot = Some(InFlight {
                        generation,
                        future: future.clone(),
                    });
                    future
                }
            }
        };

        future.await
    }

    /// Clear credentials and broadcast a session-invalid signal.
    ///
    /// Returns `true` if this call performed the clear; concurrent callers
    /// after the first get `false` and emit nothing.
    pub fn invalidate(&self, reason: &str) -> bool {
        self.inner.invalidate(reason)
    }
}

impl Inner {
    async fn run_refresh(&self) -> Result<AccessToken, RefreshError> {
        let Some(refresh_token) = self.store.refresh_token() else {
            self.invalidate("no refresh token");
            metrics::record_refresh(Outcome::Failure);
            return Err(RefreshError::NoRefreshToken);
        };

        tracing::info!("Refreshing access token");

        let result = self
            .client
            .refresh(refresh_token.clone(), self.store.access_token())
            .await;
        metrics::record_refresh(Outcome::of(&result));

        match result {
            Ok(pair) => {
                let access_token = pair.access_token;
                self.store.replace(Credential {
                    access_token: access_token.clone(),
                    refresh_token: pair.refresh_token.unwrap_or(refresh_token),
                });
                tracing::info!("Access token refreshed");
                let _ = self.events.send(SessionEvent::Refreshed);
                Ok(access_token)
            }
            Err(e) => {
                if e.is_terminal() {
                    self.invalidate(&e.to_string());
                } else {
                    tracing::warn!(error = %e, "Token refresh failed; keeping credential");
                }
                Err(e)
            }
        }
    }

    fn finish(&self, generation: u64) {
        let mut slot = self.in_flight.lock();
        if slot
            .as_ref()
            .is_some_and(|in_flight| in_flight.generation == generation)
        {
            *slot = None;
        }
    }

    fn invalidate(&self, reason: &str) -> bool {
        if !self.store.clear() {
            return false;
        }

        tracing::warn!(reason, "Session invalidated; credentials cleared");
        metrics::record_session_invalidated();
        let _ = self.events.send(SessionEvent::Invalidated {
            reason: reason.to_string(),
        });
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::ports::{MockRefreshClient, MockTokenPersistence};
    use crate::domain::credentials::{RefreshToken, TokenPair};

    fn store_with(credential: Option<Credential>) -> Arc<CredentialStore> {
        let mut persistence = MockTokenPersistence::new();
        persistence.expect_load().return_once(move || Ok(credential));
        persistence.expect_save().returning(|_| Ok(()));
        persistence.expect_clear().returning(|| Ok(()));
        Arc::new(CredentialStore::open(Arc::new(persistence)))
    }

    #[tokio::test]
    async fn success_replaces_tokens_and_emits_refreshed() {
        let store = store_with(Some(Credential::new("old", "r1")));
        let mut client = MockRefreshClient::new();
        client
            .expect_refresh()
            .withf(|refresh, access| {
                refresh.expose() == "r1" && access.as_ref().is_some_and(|a| a.expose() == "old")
            })
            .times(1)
            .returning(|_, _| {
                Ok(TokenPair {
                    access_token: AccessToken::new("new"),
                    refresh_token: Some(RefreshToken::new("r2")),
                })
            });

        let coordinator = RefreshCoordinator::new(Arc::clone(&store), Arc::new(client));
        let mut events = coordinator.subscribe_session_events();

        let token = coordinator.refresh().await.unwrap();

        assert_eq!(token.expose(), "new");
        assert_eq!(store.get(), Some(Credential::new("new", "r2")));
        assert_eq!(events.try_recv().unwrap(), SessionEvent::Refreshed);
        assert!(!coordinator.is_refreshing());
    }

    #[tokio::test]
    async fn missing_rotation_keeps_refresh_token() {
        let store = store_with(Some(Credential::new("old", "r1")));
        let mut client = MockRefreshClient::new();
        client.expect_refresh().returning(|_, _| {
            Ok(TokenPair {
                access_token: AccessToken::new("new"),
                refresh_token: None,
            })
        });

        let coordinator = RefreshCoordinator::new(Arc::clone(&store), Arc::new(client));
        coordinator.refresh().await.unwrap();

        assert_eq!(store.refresh_token().unwrap().expose(), "r1");
    }

    #[tokio::test]
    async fn rejection_invalidates_once() {
        let store = store_with(Some(Credential::new("old", "r1")));
        let mut client = MockRefreshClient::new();
        client
            .expect_refresh()
            .returning(|_, _| Err(RefreshError::Rejected { status: 401 }));

        let coordinator = RefreshCoordinator::new(Arc::clone(&store), Arc::new(client));
        let mut events = coordinator.subscribe_session_events();

        let err = coordinator.refresh().await.unwrap_err();
        assert_eq!(err, RefreshError::Rejected { status: 401 });
        assert!(!store.is_logged_in());

        let err = coordinator.refresh().await.unwrap_err();
        assert_eq!(err, RefreshError::NoRefreshToken);

        assert!(matches!(
            events.try_recv().unwrap(),
            SessionEvent::Invalidated { .. }
        ));
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn transport_failure_keeps_credential() {
        let store = store_with(Some(Credential::new("old", "r1")));
        let mut client = MockRefreshClient::new();
        client
            .expect_refresh()
            .times(2)
            .returning(|_, _| Err(RefreshError::Transport("connection reset".into())));

        let coordinator = RefreshCoordinator::new(Arc::clone(&store), Arc::new(client));

        assert!(coordinator.refresh().await.is_err());
        assert!(store.is_logged_in());

        // Slot was cleared, so a second call performs a second refresh.
        assert!(coordinator.refresh().await.is_err());
    }

    #[tokio::test]
    async fn no_refresh_token_is_terminal_without_signal() {
        let store = store_with(None);
        let client = MockRefreshClient::new();
        let coordinator = RefreshCoordinator::new(store, Arc::new(client));
        let mut events = coordinator.subscribe_session_events();

        assert_eq!(
            coordinator.refresh().await.unwrap_err(),
            RefreshError::NoRefreshToken
        );
        assert!(events.try_recv().is_err());
    }

    struct SlowClient {
        calls: std::sync::atomic::AtomicUsize,
    }

    #[async_trait::async_trait]
    impl RefreshClient for SlowClient {
        async fn refresh(
            &self,
            _refresh_token: RefreshToken,
            _access_token: Option<AccessToken>,
        ) -> Result<TokenPair, RefreshError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            Ok(TokenPair {
                access_token: AccessToken::new("shared"),
                refresh_token: None,
            })
        }
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_refresh() {
        let store = store_with(Some(Credential::new("old", "r1")));
        let client = Arc::new(SlowClient {
            calls: std::sync::atomic::AtomicUsize::new(0),
        });
        let coordinator = RefreshCoordinator::new(store, Arc::clone(&client) as Arc<dyn RefreshClient>);

        let results = futures::future::join_all((0..8).map(|_| coordinator.refresh())).await;

        assert_eq!(client.calls.load(Ordering::SeqCst), 1);
        for result in results {
            assert_eq!(result.unwrap().expose(), "shared");
        }
        assert!(!coordinator.is_refreshing());
    }
}
