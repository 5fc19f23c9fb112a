use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

use super::refresh::TokenRefresher;
use super::session::SessionInvalidator;
use super::store::CredentialStore;
use super::types::{token_preview, CredentialPair};
use crate::error::RefreshError;

type RefreshOutcome = Result<String, RefreshError>;
type Waiter = oneshot::Sender<RefreshOutcome>;

/// Refresh state machine.
///
/// The waiter list is only non-empty while `Refreshing`; it is drained in
/// full on the way back to `Idle`.
enum RefreshState {
    Idle,
    Refreshing(Vec<Waiter>),
}

/// Refresh coordinator
/// Guarantees at most one refresh call in flight and fans its outcome out
/// to every caller that asked while it was running
#[derive(Clone)]
pub struct RefreshCoordinator {
    inner: Arc<Inner>,
}

struct Inner {
    /// Credential store (refresh token source, new pair sink)
    store: Arc<dyn CredentialStore>,

    /// Performs the actual refresh call
    refresher: Arc<dyn TokenRefresher>,

    /// Told once per failed refresh
    invalidator: Arc<dyn SessionInvalidator>,

    /// Idle / Refreshing with queued waiters
    state: Mutex<RefreshState>,

    /// Upper bound for one refresh call
    refresh_timeout: Duration,
}

impl RefreshCoordinator {
    pub fn new(
        store: Arc<dyn CredentialStore>,
        refresher: Arc<dyn TokenRefresher>,
        invalidator: Arc<dyn SessionInvalidator>,
        refresh_timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                refresher,
                invalidator,
                state: Mutex::new(RefreshState::Idle),
                refresh_timeout,
            }),
        }
    }

    /// Get a freshly refreshed access token.
    ///
    /// The first caller while `Idle` becomes the leader and starts the refresh
    /// call; callers arriving while it runs join the queue. Every caller of
    /// one cycle receives the same token or the same error.
    pub async fn ensure_valid_token(&self) -> RefreshOutcome {
        let (tx, rx) = oneshot::channel();

        let leader = {
            let mut state = self.inner.state.lock();
            match &mut *state {
                RefreshState::Idle => {
                    *state = RefreshState::Refreshing(vec![tx]);
                    true
                }
                RefreshState::Refreshing(waiters) => {
                    waiters.push(tx);
                    tracing::debug!(waiters = waiters.len(), "Refresh in progress, waiting");
                    false
                }
            }
        };

        if leader {
            // The call runs on its own task so that a cancelled leader cannot
            // strand the followers
            let cycle = RefreshCycle::new(Arc::clone(&self.inner));
            tokio::spawn(cycle.run());
        }

        rx.await.unwrap_or(Err(RefreshError::Interrupted))
    }

    /// Recover from a 401 received for `rejected`.
    ///
    /// If the store already holds a different access token and no refresh is
    /// running, an earlier refresh has already replaced the rejected token and
    /// the stored one is returned without a new refresh call.
    pub async fn recover_from_rejection(&self, rejected: Option<&str>) -> RefreshOutcome {
        {
            let state = self.inner.state.lock();
            if matches!(*state, RefreshState::Idle) {
                if let Some(current) = self.inner.store.access_token() {
                    if Some(current.as_str()) != rejected {
                        tracing::debug!(
                            token = %token_preview(&current),
                            "Token already replaced, reusing stored token"
                        );
                        return Ok(current);
                    }
                }
            }
        }

        self.ensure_valid_token().await
    }

    /// Whether a refresh call is currently in flight
    pub fn is_refreshing(&self) -> bool {
        matches!(*self.inner.state.lock(), RefreshState::Refreshing(_))
    }

    /// Number of callers waiting on the current refresh (leader included)
    pub fn pending_waiters(&self) -> usize {
        match &*self.inner.state.lock() {
            RefreshState::Idle => 0,
            RefreshState::Refreshing(waiters) => waiters.len(),
        }
    }
}

/// One refresh cycle, owned by the spawned task.
///
/// Dropped without settling (the refresher panicked, or the runtime shut
/// down mid-call) it returns the state to `Idle` and releases every waiter
/// with `RefreshError::Interrupted`. Stored credentials are left untouched.
struct RefreshCycle {
    inner: Arc<Inner>,
    settled: bool,
}

impl RefreshCycle {
    fn new(inner: Arc<Inner>) -> Self {
        Self {
            inner,
            settled: false,
        }
    }

    /// Run the refresh call and settle every waiter
    async fn run(mut self) {
        let outcome = self.inner.refresh_once().await;

        match &outcome {
            Ok(token) => {
                tracing::info!(token = %token_preview(token), "Token refresh succeeded");
            }
            Err(e) => {
                tracing::error!("Token refresh failed: {}", e);
                self.inner.store.clear();
            }
        }

        let waiters = self.inner.take_waiters();
        self.settled = true;

        tracing::debug!(waiters = waiters.len(), "Releasing refresh waiters");

        if outcome.is_err() {
            self.inner.invalidator.on_session_invalidated();
        }

        for waiter in waiters {
            // A waiter whose caller went away is simply skipped
            let _ = waiter.send(outcome.clone());
        }
    }
}

impl Drop for RefreshCycle {
    fn drop(&mut self) {
        if self.settled {
            return;
        }

        let waiters = self.inner.take_waiters();
        tracing::error!(
            waiters = waiters.len(),
            "Token refresh interrupted before it settled"
        );

        for waiter in waiters {
            let _ = waiter.send(Err(RefreshError::Interrupted));
        }
    }
}

impl Inner {
    /// Move back to `Idle`, handing over the queued waiters
    fn take_waiters(&self) -> Vec<Waiter> {
        let mut state = self.state.lock();
        match std::mem::replace(&mut *state, RefreshState::Idle) {
            RefreshState::Refreshing(waiters) => waiters,
            RefreshState::Idle => Vec::new(),
        }
    }

    /// Perform the refresh call and persist the new pair
    async fn refresh_once(&self) -> RefreshOutcome {
        // Read exactly once; nothing else writes the pair while we are Refreshing
        let refresh_token = match self.store.refresh_token() {
            Some(token) => token,
            None => {
                tracing::warn!("No refresh token stored, skipping refresh call");
                return Err(RefreshError::NoRefreshToken);
            }
        };

        let tokens = tokio::time::timeout(
            self.refresh_timeout,
            self.refresher.refresh(&refresh_token),
        )
        .await
        .map_err(|_| RefreshError::Timeout(self.refresh_timeout))??;

        let refresh_token = tokens.refresh_token.unwrap_or(refresh_token);
        let pair = CredentialPair::new(tokens.access_token, refresh_token).ok_or_else(|| {
            RefreshError::InvalidResponse("refresh produced an empty token".to_string())
        })?;

        let access_token = pair.access_token().to_string();
        self.store.set(pair);

        Ok(access_token)
    }
}
