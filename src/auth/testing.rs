// Test doubles for the refresh path

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::Notify;

use super::manager::RefreshCoordinator;
use super::refresh::TokenRefresher;
use super::session::SessionInvalidator;
use super::types::RefreshedTokens;
use crate::error::RefreshError;

/// Refresher returning a fixed outcome, optionally held until released
pub struct GatedRefresher {
    outcome: Result<RefreshedTokens, RefreshError>,
    gate: Option<Notify>,
    calls: AtomicUsize,
    seen: Mutex<Vec<String>>,
}

impl GatedRefresher {
    /// Settles as soon as it is called
    pub fn immediate(outcome: Result<RefreshedTokens, RefreshError>) -> Self {
        Self {
            outcome,
            gate: None,
            calls: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
        }
    }

    /// Settles only after `release`
    pub fn gated(outcome: Result<RefreshedTokens, RefreshError>) -> Self {
        Self {
            gate: Some(Notify::new()),
            ..Self::immediate(outcome)
        }
    }

    pub fn release(&self) {
        if let Some(gate) = &self.gate {
            gate.notify_one();
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Refresh tokens passed in, in call order
    pub fn seen_tokens(&self) -> Vec<String> {
        self.seen.lock().clone()
    }
}

#[async_trait]
impl TokenRefresher for GatedRefresher {
    async fn refresh(&self, refresh_token: &str) -> Result<RefreshedTokens, RefreshError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen.lock().push(refresh_token.to_string());

        if let Some(gate) = &self.gate {
            gate.notified().await;
        }

        self.outcome.clone()
    }
}

/// Invalidator that only counts
#[derive(Default)]
pub struct RecordingInvalidator {
    count: AtomicUsize,
}

impl RecordingInvalidator {
    pub fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }
}

impl SessionInvalidator for RecordingInvalidator {
    fn on_session_invalidated(&self) {
        self.count.fetch_add(1, Ordering::SeqCst);
    }
}

/// Yield until `expected` callers are queued on the current refresh
pub async fn wait_for_waiters(coordinator: &RefreshCoordinator, expected: usize) {
    for _ in 0..10_000 {
        if coordinator.pending_waiters() >= expected {
            return;
        }
        tokio::task::yield_now().await;
    }
    panic!(
        "expected {} refresh waiters, saw {}",
        expected,
        coordinator.pending_waiters()
    );
}
