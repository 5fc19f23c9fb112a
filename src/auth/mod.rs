// Authentication module
// Credential storage, token refresh coordination and session state

mod credentials;
mod manager;
mod refresh;
mod session;
mod store;
mod types;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use credentials::SqliteCredentialStore;
pub use manager::RefreshCoordinator;
pub use refresh::{HttpTokenRefresher, TokenRefresher, REFRESH_PATH};
pub use session::{SessionInvalidator, SessionState, SessionStatus};
pub use store::{CredentialStore, MemoryCredentialStore};
pub use types::{token_preview, CredentialPair, RefreshedTokens};

pub(crate) use types::LogoutRequest;
