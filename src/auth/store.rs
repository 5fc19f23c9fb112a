// Credential store seam

use parking_lot::RwLock;

use super::types::CredentialPair;

/// Durable home of the access/refresh token pair.
///
/// Operations are atomic with respect to each other; a reader never sees
/// half of a concurrent write.
pub trait CredentialStore: Send + Sync {
    fn get(&self) -> Option<CredentialPair>;

    fn set(&self, pair: CredentialPair);

    fn clear(&self);

    /// Current access token, if any
    fn access_token(&self) -> Option<String> {
        self.get().map(|pair| pair.access_token().to_string())
    }

    /// Current refresh token, if any
    fn refresh_token(&self) -> Option<String> {
        self.get().map(|pair| pair.refresh_token().to_string())
    }
}

/// Process-local store, used by tests and short-lived tools
#[derive(Debug, Default)]
pub struct MemoryCredentialStore {
    pair: RwLock<Option<CredentialPair>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_pair(pair: CredentialPair) -> Self {
        Self {
            pair: RwLock::new(Some(pair)),
        }
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn get(&self) -> Option<CredentialPair> {
        self.pair.read().clone()
    }

    fn set(&self, pair: CredentialPair) {
        *self.pair.write() = Some(pair);
    }

    fn clear(&self) {
        *self.pair.write() = None;
    }
}
