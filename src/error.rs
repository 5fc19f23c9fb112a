// Error handling module
// Defines the dispatcher and refresh error taxonomy

use std::time::Duration;
use thiserror::Error;

/// Failures of the shared token refresh.
///
/// Cloneable so that one failure can be handed to every caller waiting
/// on the same refresh cycle.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RefreshError {
    /// The credential store holds no refresh token
    #[error("No refresh token available")]
    NoRefreshToken,

    /// The identity backend answered the refresh call with an error status
    #[error("Refresh rejected by backend: {status} - {message}")]
    RefreshRejected { status: u16, message: String },

    /// The refresh call did not settle in time
    #[error("Refresh timed out after {0:?}")]
    Timeout(Duration),

    /// No response was received for the refresh call
    #[error("Refresh transport error: {0}")]
    Transport(String),

    /// The backend answered 2xx with an unusable body
    #[error("Invalid refresh response: {0}")]
    InvalidResponse(String),

    /// The refresh task ended without settling its waiters
    #[error("Refresh was interrupted")]
    Interrupted,
}

/// Errors surfaced to callers of the request dispatcher
#[derive(Error, Debug)]
pub enum DispatchError {
    /// Transport failure that survived the single network retry
    #[error("Network error: {0}")]
    Network(String),

    /// 401 that could not be recovered.
    ///
    /// Carries the refresh failure when the request gave up because the
    /// shared refresh failed; `None` when the request had already used its
    /// refresh retry or was sent without authentication.
    #[error("Unauthenticated{}", .0.as_ref().map(|e| format!(": {}", e)).unwrap_or_default())]
    Unauthenticated(Option<RefreshError>),

    /// Any other error status, returned untouched
    #[error("HTTP error: {status} - {body}")]
    Status { status: u16, body: String },

    /// The request could not be built
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// The response body could not be decoded
    #[error("Decode error: {0}")]
    Decode(String),
}

impl DispatchError {
    /// The refresh failure behind an `Unauthenticated` error, if any
    pub fn refresh_error(&self) -> Option<&RefreshError> {
        match self {
            DispatchError::Unauthenticated(cause) => cause.as_ref(),
            _ => None,
        }
    }

    /// Whether this error means the user has to sign in again
    pub fn is_session_expired(&self) -> bool {
        matches!(self, DispatchError::Unauthenticated(_))
    }
}

/// Result type alias for dispatcher operations
pub type Result<T> = std::result::Result<T, DispatchError>;
