//! In-memory token store.

use parking_lot::Mutex;

use crate::application::ports::{PersistenceError, TokenPersistence};
use crate::domain::credentials::Credential;

/// In-memory implementation of `TokenPersistence`.
///
/// Nothing survives a restart. Used when no token file is configured.
#[derive(Debug, Default)]
pub struct InMemoryTokenStore {
    credential: Mutex<Option<Credential>>,
}

impl InMemoryTokenStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store already holding a credential.
    #[must_use]
    pub fn with_credential(credential: Credential) -> Self {
        Self {
            credential: Mutex::new(Some(credential)),
        }
    }
}

impl TokenPersistence for InMemoryTokenStore {
    fn load(&self) -> Result<Option<Credential>, PersistenceError> {
        Ok(self.credential.lock().clone())
    }

    fn save(&self, credential: &Credential) -> Result<(), PersistenceError> {
        *self.credential.lock() = Some(credential.clone());
        Ok(())
    }

    fn clear(&self) -> Result<(), PersistenceError> {
        *self.credential.lock() = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn save_load_clear() {
        let store = InMemoryTokenStore::new();
        assert!(store.load().unwrap().is_none());

        store.save(&Credential::new("a", "r")).unwrap();
        assert_eq!(store.load().unwrap(), Some(Credential::new("a", "r")));

        store.clear().unwrap();
        assert!(store.load().unwrap().is_none());
    }

    #[test]
    fn starts_with_credential() {
        let store = InMemoryTokenStore::with_credential(Credential::new("a", "r"));
        assert!(store.load().unwrap().is_some());
    }
}
