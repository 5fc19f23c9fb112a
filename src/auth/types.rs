// Authentication types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Access/refresh token pair.
///
/// Both fields are always non-empty; a partial pair cannot be constructed.
#[derive(Clone, PartialEq, Eq)]
pub struct CredentialPair {
    access_token: String,
    refresh_token: String,
}

impl CredentialPair {
    /// Build a pair, returning `None` if either token is empty
    pub fn new(access_token: impl Into<String>, refresh_token: impl Into<String>) -> Option<Self> {
        let access_token = access_token.into();
        let refresh_token = refresh_token.into();

        if access_token.is_empty() || refresh_token.is_empty() {
            return None;
        }

        Some(Self {
            access_token,
            refresh_token,
        })
    }

    pub fn access_token(&self) -> &str {
        &self.access_token
    }

    pub fn refresh_token(&self) -> &str {
        &self.refresh_token
    }
}

// Tokens never show up in debug output
impl std::fmt::Debug for CredentialPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialPair")
            .field("access_token", &token_preview(&self.access_token))
            .field("refresh_token", &token_preview(&self.refresh_token))
            .finish()
    }
}

/// Short, log-safe prefix of a token
pub fn token_preview(token: &str) -> String {
    let prefix: String = token.chars().take(6).collect();
    format!("{}...", prefix)
}

/// Tokens returned by a successful refresh call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshedTokens {
    pub access_token: String,
    /// Rotated refresh token; `None` keeps the stored one
    pub refresh_token: Option<String>,
}

/// Refresh request body
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshRequest<'a> {
    pub refresh_token: &'a str,
}

/// Refresh response body
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshResponse {
    #[serde(default)]
    pub access_token: String,
    pub refresh_token: Option<String>,
}

/// Logout request body
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LogoutRequest<'a> {
    pub refresh_token: &'a str,
}

/// Token record as persisted by the SQLite store
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredTokens {
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub updated_at: Option<DateTime<Utc>>,
}
