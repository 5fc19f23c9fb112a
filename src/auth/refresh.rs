// Token refresh call against the identity backend

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;

use super::types::{RefreshRequest, RefreshResponse, RefreshedTokens};
use crate::error::RefreshError;

/// Path of the refresh endpoint, relative to the API base URL
pub const REFRESH_PATH: &str = "/auth/refresh";

/// Exchanges a refresh token for a new access token.
///
/// One call per invocation; retry policy belongs to the caller.
#[async_trait]
pub trait TokenRefresher: Send + Sync {
    async fn refresh(&self, refresh_token: &str) -> std::result::Result<RefreshedTokens, RefreshError>;
}

/// Refresher that POSTs to `{base_url}/auth/refresh`
pub struct HttpTokenRefresher {
    client: Client,
    url: String,

    /// Client-side timeout, reported as `RefreshError::Timeout` when hit
    request_timeout: Option<Duration>,
}

impl HttpTokenRefresher {
    pub fn new(base_url: &str, request_timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(request_timeout)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            request_timeout: Some(request_timeout),
            ..Self::with_client(client, base_url)
        })
    }

    pub fn with_client(client: Client, base_url: &str) -> Self {
        Self {
            client,
            url: get_refresh_url(base_url),
            request_timeout: None,
        }
    }
}

/// Build the refresh URL for a base URL
fn get_refresh_url(base_url: &str) -> String {
    format!("{}{}", base_url.trim_end_matches('/'), REFRESH_PATH)
}

#[async_trait]
impl TokenRefresher for HttpTokenRefresher {
    async fn refresh(&self, refresh_token: &str) -> std::result::Result<RefreshedTokens, RefreshError> {
        tracing::info!("Refreshing access token...");

        let response = self
            .client
            .post(&self.url)
            .json(&RefreshRequest { refresh_token })
            .send()
            .await
            .map_err(|e| {
                tracing::warn!(error = %e, url = %self.url, "Refresh request failed to send");
                match self.request_timeout {
                    Some(timeout) if e.is_timeout() => RefreshError::Timeout(timeout),
                    _ => RefreshError::Transport(e.to_string()),
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            tracing::error!(
                status = status.as_u16(),
                body = %error_text,
                "Token refresh rejected"
            );
            return Err(RefreshError::RefreshRejected {
                status: status.as_u16(),
                message: error_text,
            });
        }

        let data: RefreshResponse = response
            .json()
            .await
            .map_err(|e| RefreshError::InvalidResponse(e.to_string()))?;

        if data.access_token.is_empty() {
            return Err(RefreshError::InvalidResponse(
                "response does not contain accessToken".to_string(),
            ));
        }

        tracing::info!(
            rotated = data.refresh_token.is_some(),
            "Access token refreshed"
        );

        Ok(RefreshedTokens {
            access_token: data.access_token,
            refresh_token: data.refresh_token.filter(|t| !t.is_empty()),
        })
    }
}
