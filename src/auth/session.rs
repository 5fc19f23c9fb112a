// Process-wide session state and the invalidation sink

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;

use super::store::CredentialStore;
use super::types::CredentialPair;

/// Receives the session-invalidated signal from the refresh coordinator.
///
/// Invoked at most once per failed refresh; implementations must be
/// idempotent since concurrent failures may still be draining.
pub trait SessionInvalidator: Send + Sync {
    fn on_session_invalidated(&self);
}

/// Authentication state as seen by the UI layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    /// No session, or the user logged out
    SignedOut,
    Authenticated,
    /// The refresh token was rejected; the user must sign in again
    Expired,
}

/// Authenticated flag plus a change feed for the UI.
///
/// Status changes go out over a `watch` channel so a navigation layer can
/// route back to the login flow when the session expires.
pub struct SessionState {
    store: Arc<dyn CredentialStore>,
    status: watch::Sender<SessionStatus>,
    invalidations: AtomicU64,
}

impl SessionState {
    /// Start in `Authenticated` if the store already holds a pair
    pub fn new(store: Arc<dyn CredentialStore>) -> Self {
        let initial = if store.get().is_some() {
            SessionStatus::Authenticated
        } else {
            SessionStatus::SignedOut
        };
        let (status, _) = watch::channel(initial);

        Self {
            store,
            status,
            invalidations: AtomicU64::new(0),
        }
    }

    /// Store a pair obtained by a login flow and mark the session live
    pub fn establish(&self, pair: CredentialPair) {
        self.store.set(pair);
        self.status.send_replace(SessionStatus::Authenticated);
        tracing::info!("Session established");
    }

    /// User-initiated sign out
    pub fn sign_out(&self) {
        self.store.clear();
        self.status.send_replace(SessionStatus::SignedOut);
        tracing::info!("Signed out");
    }

    pub fn status(&self) -> SessionStatus {
        *self.status.borrow()
    }

    pub fn is_authenticated(&self) -> bool {
        self.status() == SessionStatus::Authenticated
    }

    /// Subscribe to status changes
    pub fn subscribe(&self) -> watch::Receiver<SessionStatus> {
        self.status.subscribe()
    }

    /// Number of invalidation signals received so far
    pub fn invalidations(&self) -> u64 {
        self.invalidations.load(Ordering::SeqCst)
    }
}

impl SessionInvalidator for SessionState {
    fn on_session_invalidated(&self) {
        self.invalidations.fetch_add(1, Ordering::SeqCst);

        let changed = self.status.send_if_modified(|status| {
            if *status == SessionStatus::Expired {
                return false;
            }
            *status = SessionStatus::Expired;
            true
        });

        if changed {
            tracing::warn!("Session invalidated, sign-in required");
        } else {
            tracing::debug!("Session already invalidated");
        }
    }
}
