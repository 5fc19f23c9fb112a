use anyhow::Context;
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Client, Method, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::auth::{
    token_preview, CredentialStore, HttpTokenRefresher, LogoutRequest, RefreshCoordinator,
    SessionState,
};
use crate::config::{Config, NetworkRetryPolicy};
use crate::error::{DispatchError, Result};

/// Header carrying the per-install device identifier
pub const DEVICE_ID_HEADER: &str = "x-device-id";

/// Path of the logout endpoint, relative to the API base URL
pub const LOGOUT_PATH: &str = "/auth/logout";

/// One outbound call plus its one-shot retry flags.
///
/// Owned by the call site and consumed by [`ApiClient::send`]; the flags
/// only ever go from `false` to `true`, and only the dispatcher sets them.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    method: Method,
    path: String,
    headers: HeaderMap,
    body: Option<Bytes>,
    auth: bool,
    network_retried: bool,
    auth_retried: bool,
}

impl ApiRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            headers: HeaderMap::new(),
            body: None,
            auth: true,
            network_retried: false,
            auth_retried: false,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    pub fn put(path: impl Into<String>) -> Self {
        Self::new(Method::PUT, path)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::DELETE, path)
    }

    /// Attach a JSON body
    pub fn json<T: Serialize + ?Sized>(mut self, body: &T) -> Result<Self> {
        let bytes =
            serde_json::to_vec(body).map_err(|e| DispatchError::InvalidRequest(e.to_string()))?;
        self.headers
            .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        self.body = Some(Bytes::from(bytes));
        Ok(self)
    }

    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Send without a bearer token; a 401 is then final
    pub fn without_auth(mut self) -> Self {
        self.auth = false;
        self
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn requires_auth(&self) -> bool {
        self.auth
    }

    pub fn network_retried(&self) -> bool {
        self.network_retried
    }

    pub fn auth_retried(&self) -> bool {
        self.auth_retried
    }
}

/// Fully buffered response
#[derive(Debug, Clone)]
pub struct ApiResponse {
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
}

impl ApiResponse {
    pub fn new(status: StatusCode, headers: HeaderMap, body: Bytes) -> Self {
        Self {
            status,
            headers,
            body,
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_slice(&self.body).map_err(|e| DispatchError::Decode(e.to_string()))
    }
}

/// No response was received
#[derive(Error, Debug, Clone)]
pub enum TransportError {
    #[error("timeout: {0}")]
    Timeout(String),

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("{0}")]
    Other(String),
}

impl TransportError {
    /// Short category for log fields
    pub fn kind(&self) -> &'static str {
        match self {
            TransportError::Timeout(_) => "timeout",
            TransportError::Connect(_) => "connection_failed",
            TransportError::Other(_) => "request_error",
        }
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            TransportError::Timeout(err.to_string())
        } else if err.is_connect() {
            TransportError::Connect(err.to_string())
        } else {
            TransportError::Other(err.to_string())
        }
    }
}

/// Sends a single request; no retries, no auth handling
#[async_trait]
pub trait Transport: Send + Sync {
    async fn execute(&self, request: reqwest::Request)
        -> std::result::Result<ApiResponse, TransportError>;
}

/// Pooled reqwest transport
pub struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    pub fn new(
        max_connections: usize,
        connect_timeout: u64,
        request_timeout: u64,
    ) -> anyhow::Result<Self> {
        let client = Client::builder()
            .pool_max_idle_per_host(max_connections)
            .connect_timeout(Duration::from_secs(connect_timeout))
            .timeout(Duration::from_secs(request_timeout))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self { client })
    }

    /// Get the underlying HTTP client
    pub fn client(&self) -> &Client {
        &self.client
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn execute(
        &self,
        request: reqwest::Request,
    ) -> std::result::Result<ApiResponse, TransportError> {
        let response = self.client.execute(request).await?;

        let status = response.status();
        let headers = response.headers().clone();

        // A body cut off mid-read counts as no response
        let body = response.bytes().await?;

        Ok(ApiResponse::new(status, headers, body))
    }
}

/// What the dispatcher does with one attempt's outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Hand the response to the caller
    Return,
    /// Resend once after a transport failure
    RetryNetwork,
    /// Refresh the token, then resend once
    RefreshAndRetry,
    FailNetwork,
    FailUnauthenticated,
    /// Error status other than 401, surfaced untouched
    FailStatus,
}

/// Retry classifier.
///
/// `status` is `None` when no response was received.
pub fn classify(
    status: Option<StatusCode>,
    request: &ApiRequest,
    policy: NetworkRetryPolicy,
) -> RetryDecision {
    match status {
        None if !request.network_retried && policy.allows(&request.method) => {
            RetryDecision::RetryNetwork
        }
        None => RetryDecision::FailNetwork,
        Some(status) if status.as_u16() < 400 => RetryDecision::Return,
        Some(status) if status == StatusCode::UNAUTHORIZED => {
            if request.auth && !request.auth_retried {
                RetryDecision::RefreshAndRetry
            } else {
                RetryDecision::FailUnauthenticated
            }
        }
        Some(_) => RetryDecision::FailStatus,
    }
}

/// Request dispatcher
/// Attaches the bearer token, retries once on transport failure and once
/// through the refresh coordinator on 401
pub struct ApiClient {
    /// Sends the actual HTTP requests
    transport: Arc<dyn Transport>,

    /// Source of the current access token
    store: Arc<dyn CredentialStore>,

    /// Shared single-flight refresh
    coordinator: RefreshCoordinator,

    /// Base URL the request paths are appended to
    base_url: String,

    /// Value of the device id header
    device_id: String,

    /// Which methods may be resent after a transport failure
    retry_policy: NetworkRetryPolicy,
}

impl ApiClient {
    pub fn new(
        transport: Arc<dyn Transport>,
        store: Arc<dyn CredentialStore>,
        coordinator: RefreshCoordinator,
        base_url: impl Into<String>,
    ) -> Self {
        Self {
            transport,
            store,
            coordinator,
            base_url: base_url.into(),
            device_id: uuid::Uuid::new_v4().to_string(),
            retry_policy: NetworkRetryPolicy::Always,
        }
    }

    /// Wire the full pipeline from configuration
    pub fn from_config(
        config: &Config,
        store: Arc<dyn CredentialStore>,
        session: Arc<SessionState>,
    ) -> anyhow::Result<Self> {
        let transport = Arc::new(ReqwestTransport::new(
            config.http_max_connections,
            config.http_connect_timeout,
            config.http_request_timeout,
        )?);

        let refresher = Arc::new(HttpTokenRefresher::new(
            &config.api_base_url,
            Duration::from_secs(config.refresh_timeout),
        )?);

        let coordinator = RefreshCoordinator::new(
            store.clone(),
            refresher,
            session,
            Duration::from_secs(config.refresh_timeout),
        );

        Ok(Self::new(transport, store, coordinator, config.api_base_url.clone())
            .with_device_id(config.device_id.clone())
            .with_retry_policy(config.network_retry))
    }

    pub fn with_device_id(mut self, device_id: impl Into<String>) -> Self {
        self.device_id = device_id.into();
        self
    }

    pub fn with_retry_policy(mut self, retry_policy: NetworkRetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    pub fn coordinator(&self) -> &RefreshCoordinator {
        &self.coordinator
    }

    /// Send a GET request
    pub async fn get(&self, path: &str) -> Result<ApiResponse> {
        self.send(ApiRequest::get(path)).await
    }

    /// Send a POST request with a JSON body
    pub async fn post<B: Serialize + ?Sized>(&self, path: &str, body: &B) -> Result<ApiResponse> {
        self.send(ApiRequest::post(path).json(body)?).await
    }

    /// Dispatch a request.
    ///
    /// Handles:
    /// - transport failure: resend once
    /// - 401: refresh through the coordinator and resend once
    /// - any other error status: fail immediately
    pub async fn send(&self, mut request: ApiRequest) -> Result<ApiResponse> {
        let url = self.url_for(&request.path)?;
        let method = request.method.clone();

        // Token handed back by the coordinator for the auth retry
        let mut refreshed: Option<String> = None;

        loop {
            let token = if !request.auth {
                None
            } else if refreshed.is_some() {
                refreshed.clone()
            } else {
                self.store.access_token()
            };

            let http_request = self.build(&request, &url, token.as_deref())?;

            tracing::debug!(
                method = %method,
                url = %url,
                authenticated = token.is_some(),
                network_retried = request.network_retried,
                auth_retried = request.auth_retried,
                "Sending HTTP request"
            );

            let outcome = self.transport.execute(http_request).await;
            let status = outcome.as_ref().ok().map(ApiResponse::status);

            match (classify(status, &request, self.retry_policy), outcome) {
                (RetryDecision::Return, Ok(response)) => {
                    tracing::debug!(status = %response.status(), "Request successful");
                    return Ok(response);
                }

                (RetryDecision::RetryNetwork, Err(e)) => {
                    tracing::warn!(
                        error_kind = e.kind(),
                        error = %e,
                        url = %url,
                        "Request failed, retrying once"
                    );
                    request.network_retried = true;
                }

                (RetryDecision::RefreshAndRetry, Ok(_)) => {
                    tracing::warn!(url = %url, "Received 401, refreshing token and retrying...");
                    request.auth_retried = true;

                    match self.coordinator.recover_from_rejection(token.as_deref()).await {
                        Ok(new_token) => {
                            tracing::debug!(
                                token = %token_preview(&new_token),
                                "Retrying with refreshed token"
                            );
                            refreshed = Some(new_token);
                        }
                        Err(e) => {
                            tracing::error!(url = %url, "Token refresh failed: {}", e);
                            return Err(DispatchError::Unauthenticated(Some(e)));
                        }
                    }
                }

                (RetryDecision::FailUnauthenticated, _) => {
                    tracing::warn!(
                        url = %url,
                        auth_retried = request.auth_retried,
                        "Request unauthenticated"
                    );
                    return Err(DispatchError::Unauthenticated(None));
                }

                (_, Ok(response)) => {
                    let error_text = response.text();
                    tracing::error!(
                        status = response.status().as_u16(),
                        url = %url,
                        response_body = %error_text,
                        "HTTP request failed with error response"
                    );
                    return Err(DispatchError::Status {
                        status: response.status().as_u16(),
                        body: error_text,
                    });
                }

                (_, Err(e)) => {
                    tracing::error!(
                        error_kind = e.kind(),
                        error = %e,
                        url = %url,
                        network_retried = request.network_retried,
                        "HTTP request failed"
                    );
                    return Err(DispatchError::Network(e.to_string()));
                }
            }
        }
    }

    /// Best-effort server logout, then always drop the local session
    pub async fn logout(&self, session: &SessionState) {
        if let Some(refresh_token) = self.store.refresh_token() {
            let request = ApiRequest::post(LOGOUT_PATH)
                .without_auth()
                .json(&LogoutRequest {
                    refresh_token: &refresh_token,
                });

            let result = match request {
                Ok(request) => self.send(request).await.map(|_| ()),
                Err(e) => Err(e),
            };

            if let Err(e) = result {
                tracing::warn!("Logout error: {}", e);
            }
        }

        session.sign_out();
    }

    /// Resolve a request path against the base URL.
    ///
    /// Absolute URLs are accepted only on the base URL's origin, so the
    /// bearer token never leaves the API host.
    fn url_for(&self, path: &str) -> Result<Url> {
        let absolute = path.starts_with("http://") || path.starts_with("https://");
        let raw = if absolute {
            path.to_string()
        } else {
            format!(
                "{}/{}",
                self.base_url.trim_end_matches('/'),
                path.trim_start_matches('/')
            )
        };

        let url = Url::parse(&raw)
            .map_err(|e| DispatchError::InvalidRequest(format!("{}: {}", raw, e)))?;

        if absolute {
            let base = Url::parse(&self.base_url).map_err(|e| {
                DispatchError::InvalidRequest(format!("{}: {}", self.base_url, e))
            })?;
            if url.origin() != base.origin() {
                tracing::warn!(url = %url, "Refusing request outside the API origin");
                return Err(DispatchError::InvalidRequest(format!(
                    "{} is outside the API origin",
                    url
                )));
            }
        }

        Ok(url)
    }

    fn build(&self, request: &ApiRequest, url: &Url, token: Option<&str>) -> Result<reqwest::Request> {
        let mut http_request = reqwest::Request::new(request.method.clone(), url.clone());

        let headers = http_request.headers_mut();
        headers.extend(request.headers.clone());

        if let Ok(value) = HeaderValue::from_str(&self.device_id) {
            headers.insert(HeaderName::from_static(DEVICE_ID_HEADER), value);
        }

        if let Some(token) = token {
            let value = HeaderValue::from_str(&format!("Bearer {}", token))
                .map_err(|e| DispatchError::InvalidRequest(format!("bad token: {}", e)))?;
            headers.insert(AUTHORIZATION, value);
        }

        if let Some(body) = &request.body {
            *http_request.body_mut() = Some(reqwest::Body::from(body.clone()));
        }

        Ok(http_request)
    }
}

/// Scriptable transport for dispatcher tests
#[cfg(any(test, feature = "test-utils"))]
pub mod testing {
    use super::*;
    use parking_lot::Mutex;

    /// What a [`MockTransport`] saw for one call
    #[derive(Debug, Clone)]
    pub struct RecordedRequest {
        pub method: Method,
        pub url: String,
        pub authorization: Option<String>,
        pub device_id: Option<String>,
        pub body: Option<Vec<u8>>,
    }

    type Responder =
        dyn Fn(&RecordedRequest, usize) -> std::result::Result<ApiResponse, TransportError>
            + Send
            + Sync;

    /// Transport answering through a closure of (request, call index)
    pub struct MockTransport {
        responder: Box<Responder>,
        calls: Mutex<Vec<RecordedRequest>>,
    }

    impl MockTransport {
        pub fn new<F>(responder: F) -> Self
        where
            F: Fn(&RecordedRequest, usize) -> std::result::Result<ApiResponse, TransportError>
                + Send
                + Sync
                + 'static,
        {
            Self {
                responder: Box::new(responder),
                calls: Mutex::new(Vec::new()),
            }
        }

        /// 200 for `Bearer <valid>`, 401 otherwise
        pub fn accepting(valid: &str) -> Self {
            let expected = format!("Bearer {}", valid);
            Self::new(move |request, _| {
                if request.authorization.as_deref() == Some(expected.as_str()) {
                    Ok(respond(200, "ok"))
                } else {
                    Ok(respond(401, "unauthorized"))
                }
            })
        }

        pub fn calls(&self) -> Vec<RecordedRequest> {
            self.calls.lock().clone()
        }

        pub fn call_count(&self) -> usize {
            self.calls.lock().len()
        }
    }

    #[async_trait]
    impl Transport for MockTransport {
        async fn execute(
            &self,
            request: reqwest::Request,
        ) -> std::result::Result<ApiResponse, TransportError> {
            let recorded = {
                let header = |name: &str| {
                    request
                        .headers()
                        .get(name)
                        .and_then(|v| v.to_str().ok())
                        .map(str::to_string)
                };

                RecordedRequest {
                    method: request.method().clone(),
                    url: request.url().to_string(),
                    authorization: header(AUTHORIZATION.as_str()),
                    device_id: header(DEVICE_ID_HEADER),
                    body: request
                        .body()
                        .and_then(|b| b.as_bytes())
                        .map(|b| b.to_vec()),
                }
            };

            let index = {
                let mut calls = self.calls.lock();
                calls.push(recorded.clone());
                calls.len() - 1
            };

            // Let concurrent callers interleave like real I/O would
            tokio::task::yield_now().await;

            (self.responder)(&recorded, index)
        }
    }

    /// Build a plain-text response
    pub fn respond(status: u16, body: &str) -> ApiResponse {
        ApiResponse::new(
            StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            HeaderMap::new(),
            Bytes::from(body.to_string()),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{respond, MockTransport};
    use super::*;
    use crate::auth::testing::{wait_for_waiters, GatedRefresher, RecordingInvalidator};
    use crate::auth::{CredentialPair, MemoryCredentialStore, RefreshedTokens};
    use crate::error::RefreshError;
    use futures::future::join_all;
    use proptest::prelude::*;
    use tokio_test::{assert_err, assert_ok};

    struct Harness {
        client: Arc<ApiClient>,
        transport: Arc<MockTransport>,
        store: Arc<MemoryCredentialStore>,
        refresher: Arc<GatedRefresher>,
        invalidator: Arc<RecordingInvalidator>,
    }

    fn harness(
        pair: Option<(&str, &str)>,
        transport: MockTransport,
        refresher: GatedRefresher,
    ) -> Harness {
        let store = Arc::new(match pair {
            Some((access, refresh)) => {
                MemoryCredentialStore::with_pair(CredentialPair::new(access, refresh).unwrap())
            }
            None => MemoryCredentialStore::new(),
        });
        let transport = Arc::new(transport);
        let refresher = Arc::new(refresher);
        let invalidator = Arc::new(RecordingInvalidator::default());

        let coordinator = RefreshCoordinator::new(
            store.clone(),
            refresher.clone(),
            invalidator.clone(),
            Duration::from_secs(5),
        );
        let client = Arc::new(
            ApiClient::new(
                transport.clone(),
                store.clone(),
                coordinator,
                "http://api.test/api",
            )
            .with_device_id("device-1"),
        );

        Harness {
            client,
            transport,
            store,
            refresher,
            invalidator,
        }
    }

    fn refreshed(access: &str) -> RefreshedTokens {
        RefreshedTokens {
            access_token: access.to_string(),
            refresh_token: None,
        }
    }

    fn timeout() -> TransportError {
        TransportError::Timeout("operation timed out".to_string())
    }

    #[tokio::test]
    async fn test_attaches_bearer_and_device_id() {
        let h = harness(
            Some(("A1", "R1")),
            MockTransport::accepting("A1"),
            GatedRefresher::immediate(Ok(refreshed("A2"))),
        );

        let response = assert_ok!(h.client.get("/sessions/active").await);
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.text(), "ok");

        let calls = h.transport.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].url, "http://api.test/api/sessions/active");
        assert_eq!(calls[0].authorization.as_deref(), Some("Bearer A1"));
        assert_eq!(calls[0].device_id.as_deref(), Some("device-1"));
        assert_eq!(h.refresher.calls(), 0);
    }

    #[tokio::test]
    async fn test_missing_token_sends_without_header() {
        let h = harness(
            None,
            MockTransport::new(|_, _| Ok(respond(200, "public"))),
            GatedRefresher::immediate(Ok(refreshed("A2"))),
        );

        assert_ok!(h.client.get("/health").await);
        assert_eq!(h.transport.calls()[0].authorization, None);
    }

    #[tokio::test]
    async fn test_redirect_class_status_is_success() {
        let h = harness(
            Some(("A1", "R1")),
            MockTransport::new(|_, _| Ok(respond(304, ""))),
            GatedRefresher::immediate(Ok(refreshed("A2"))),
        );

        let response = assert_ok!(h.client.get("/wallet").await);
        assert_eq!(response.status(), StatusCode::NOT_MODIFIED);
    }

    #[tokio::test]
    async fn test_single_network_failure_is_retried() {
        let h = harness(
            Some(("A1", "R1")),
            MockTransport::new(|_, index| {
                if index == 0 {
                    Err(timeout())
                } else {
                    Ok(respond(200, "ok"))
                }
            }),
            GatedRefresher::immediate(Ok(refreshed("A2"))),
        );

        assert_ok!(h.client.get("/wallet").await);
        assert_eq!(h.transport.call_count(), 2);
    }

    #[tokio::test]
    async fn test_two_network_failures_fail_as_network() {
        let h = harness(
            Some(("A1", "R1")),
            MockTransport::new(|_, _| Err(timeout())),
            GatedRefresher::immediate(Ok(refreshed("A2"))),
        );

        let err = assert_err!(h.client.get("/wallet").await);
        assert!(matches!(err, DispatchError::Network(_)));
        assert_eq!(h.transport.call_count(), 2);
    }

    #[tokio::test]
    async fn test_idempotent_policy_skips_post_retry() {
        let h = harness(
            Some(("A1", "R1")),
            MockTransport::new(|_, _| {
                Err(TransportError::Connect("connection reset".to_string()))
            }),
            GatedRefresher::immediate(Ok(refreshed("A2"))),
        );
        let client = Arc::try_unwrap(h.client)
            .ok()
            .unwrap()
            .with_retry_policy(NetworkRetryPolicy::IdempotentOnly);

        let err = assert_err!(client.post("/payments", &serde_json::json!({"amount": 5})).await);
        assert!(matches!(err, DispatchError::Network(_)));
        assert_eq!(h.transport.call_count(), 1);

        assert_err!(client.get("/payments").await);
        assert_eq!(h.transport.call_count(), 3);
    }

    #[tokio::test]
    async fn test_other_error_status_is_not_retried() {
        let h = harness(
            Some(("A1", "R1")),
            MockTransport::new(|_, _| Ok(respond(503, "maintenance"))),
            GatedRefresher::immediate(Ok(refreshed("A2"))),
        );

        let err = assert_err!(h.client.get("/wallet").await);
        match err {
            DispatchError::Status { status, body } => {
                assert_eq!(status, 503);
                assert_eq!(body, "maintenance");
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert_eq!(h.transport.call_count(), 1);
        assert_eq!(h.refresher.calls(), 0);
    }

    #[tokio::test]
    async fn test_401_refreshes_and_retries_with_new_token() {
        let h = harness(
            Some(("A1", "R1")),
            MockTransport::accepting("A2"),
            GatedRefresher::immediate(Ok(refreshed("A2"))),
        );

        assert_ok!(h.client.get("/garage").await);

        let calls = h.transport.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].authorization.as_deref(), Some("Bearer A1"));
        assert_eq!(calls[1].authorization.as_deref(), Some("Bearer A2"));
        assert_eq!(h.refresher.calls(), 1);
    }

    #[tokio::test]
    async fn test_second_401_does_not_refresh_again() {
        let h = harness(
            Some(("A1", "R1")),
            MockTransport::accepting("never"),
            GatedRefresher::immediate(Ok(refreshed("A2"))),
        );

        let err = assert_err!(h.client.get("/garage").await);
        assert!(matches!(err, DispatchError::Unauthenticated(None)));
        assert_eq!(h.transport.call_count(), 2);
        assert_eq!(h.refresher.calls(), 1);
        assert_eq!(h.invalidator.count(), 0);
    }

    #[tokio::test]
    async fn test_401_without_auth_is_final() {
        let h = harness(
            Some(("A1", "R1")),
            MockTransport::new(|_, _| Ok(respond(401, "bad otp"))),
            GatedRefresher::immediate(Ok(refreshed("A2"))),
        );

        let err = assert_err!(
            h.client
                .send(ApiRequest::post("/auth/otp-verify").without_auth())
                .await
        );
        assert!(matches!(err, DispatchError::Unauthenticated(None)));
        assert_eq!(h.transport.calls()[0].authorization, None);
        assert_eq!(h.refresher.calls(), 0);
    }

    #[tokio::test]
    async fn test_network_then_401_uses_both_retries() {
        let h = harness(
            Some(("A1", "R1")),
            MockTransport::new(|request, index| match index {
                0 => Err(timeout()),
                _ if request.authorization.as_deref() == Some("Bearer A2") => {
                    Ok(respond(200, "ok"))
                }
                _ => Ok(respond(401, "expired")),
            }),
            GatedRefresher::immediate(Ok(refreshed("A2"))),
        );

        assert_ok!(h.client.get("/wallet").await);
        assert_eq!(h.transport.call_count(), 3);
        assert_eq!(h.refresher.calls(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_401s_share_one_refresh() {
        let h = harness(
            Some(("A1", "R1")),
            MockTransport::accepting("A2"),
            GatedRefresher::gated(Ok(refreshed("A2"))),
        );

        let requests: Vec<_> = ["/x", "/y", "/z"]
            .into_iter()
            .map(|path| {
                let client = h.client.clone();
                tokio::spawn(async move { client.get(path).await })
            })
            .collect();

        wait_for_waiters(h.client.coordinator(), 3).await;
        h.refresher.release();

        for result in join_all(requests).await {
            assert_ok!(result.unwrap());
        }

        assert_eq!(h.refresher.calls(), 1);
        assert_eq!(h.refresher.seen_tokens(), vec!["R1".to_string()]);
        let retried: Vec<_> = h
            .transport
            .calls()
            .into_iter()
            .filter(|c| c.authorization.as_deref() == Some("Bearer A2"))
            .collect();
        assert_eq!(retried.len(), 3);
        assert_eq!(h.store.access_token().as_deref(), Some("A2"));
    }

    #[tokio::test]
    async fn test_concurrent_401s_share_one_failure() {
        let rejection = RefreshError::RefreshRejected {
            status: 400,
            message: "expired".to_string(),
        };
        let h = harness(
            Some(("A1", "R1")),
            MockTransport::accepting("A2"),
            GatedRefresher::gated(Err(rejection.clone())),
        );

        let requests: Vec<_> = ["/x", "/y", "/z"]
            .into_iter()
            .map(|path| {
                let client = h.client.clone();
                tokio::spawn(async move { client.get(path).await })
            })
            .collect();

        wait_for_waiters(h.client.coordinator(), 3).await;
        h.refresher.release();

        for result in join_all(requests).await {
            let err = assert_err!(result.unwrap());
            assert_eq!(err.refresh_error(), Some(&rejection));
        }

        assert_eq!(h.refresher.calls(), 1);
        assert_eq!(h.invalidator.count(), 1);
        assert!(h.store.get().is_none());
        assert_eq!(h.transport.call_count(), 3);
    }

    #[tokio::test]
    async fn test_401_without_refresh_token() {
        let h = harness(
            None,
            MockTransport::accepting("A2"),
            GatedRefresher::immediate(Ok(refreshed("A2"))),
        );

        let err = assert_err!(h.client.get("/wallet").await);
        assert_eq!(err.refresh_error(), Some(&RefreshError::NoRefreshToken));
        assert_eq!(h.refresher.calls(), 0);
        assert_eq!(h.invalidator.count(), 1);
    }

    #[tokio::test]
    async fn test_json_body_is_sent() {
        let h = harness(
            Some(("A1", "R1")),
            MockTransport::accepting("A1"),
            GatedRefresher::immediate(Ok(refreshed("A2"))),
        );

        assert_ok!(
            h.client
                .post("/sessions", &serde_json::json!({"zone": "Z1"}))
                .await
        );

        let body = h.transport.calls()[0].body.clone().unwrap();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["zone"], "Z1");
    }

    #[tokio::test]
    async fn test_logout_clears_even_when_server_fails() {
        let h = harness(
            Some(("A1", "R1")),
            MockTransport::new(|_, _| Ok(respond(500, "down"))),
            GatedRefresher::immediate(Ok(refreshed("A2"))),
        );
        let session = SessionState::new(h.store.clone());
        assert!(session.is_authenticated());

        h.client.logout(&session).await;

        let calls = h.transport.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].url, "http://api.test/api/auth/logout");
        assert_eq!(calls[0].authorization, None);
        assert!(h.store.get().is_none());
        assert!(!session.is_authenticated());
    }

    #[test]
    fn test_url_for() {
        let h = harness(
            None,
            MockTransport::accepting("A1"),
            GatedRefresher::immediate(Ok(refreshed("A2"))),
        );

        assert_eq!(
            h.client.url_for("wallet").unwrap().as_str(),
            "http://api.test/api/wallet"
        );
        assert_eq!(
            h.client.url_for("http://api.test/api/wallet").unwrap().as_str(),
            "http://api.test/api/wallet"
        );
        assert!(h.client.url_for("https://other.test/x").is_err());
        assert!(h.client.url_for("https://api.test/api/wallet").is_err());
    }

    #[tokio::test]
    async fn test_foreign_origin_is_refused_before_sending() {
        let h = harness(
            Some(("A1", "R1")),
            MockTransport::accepting("A1"),
            GatedRefresher::immediate(Ok(refreshed("A2"))),
        );

        let err = assert_err!(h.client.get("https://collector.test/collect").await);

        assert!(matches!(err, DispatchError::InvalidRequest(_)));
        assert_eq!(h.transport.call_count(), 0);
        assert_eq!(h.refresher.calls(), 0);
    }

    #[test]
    fn test_classify_table() {
        let policy = NetworkRetryPolicy::Always;
        let fresh = ApiRequest::get("/x");
        let mut spent = ApiRequest::get("/x");
        spent.network_retried = true;
        spent.auth_retried = true;

        assert_eq!(
            classify(Some(StatusCode::OK), &fresh, policy),
            RetryDecision::Return
        );
        assert_eq!(classify(None, &fresh, policy), RetryDecision::RetryNetwork);
        assert_eq!(classify(None, &spent, policy), RetryDecision::FailNetwork);
        assert_eq!(
            classify(Some(StatusCode::UNAUTHORIZED), &fresh, policy),
            RetryDecision::RefreshAndRetry
        );
        assert_eq!(
            classify(Some(StatusCode::UNAUTHORIZED), &spent, policy),
            RetryDecision::FailUnauthenticated
        );
        assert_eq!(
            classify(Some(StatusCode::FORBIDDEN), &fresh, policy),
            RetryDecision::FailStatus
        );
    }

    proptest! {
        #[test]
        fn prop_error_statuses_other_than_401_fail_immediately(
            code in 400u16..600,
            network_retried: bool,
            auth_retried: bool,
        ) {
            prop_assume!(code != 401);
            let mut request = ApiRequest::get("/x");
            request.network_retried = network_retried;
            request.auth_retried = auth_retried;

            let status = StatusCode::from_u16(code).unwrap();
            prop_assert_eq!(
                classify(Some(status), &request, NetworkRetryPolicy::Always),
                RetryDecision::FailStatus
            );
        }

        #[test]
        fn prop_statuses_below_400_are_returned(
            code in 100u16..400,
            network_retried: bool,
            auth_retried: bool,
        ) {
            let mut request = ApiRequest::get("/x");
            request.network_retried = network_retried;
            request.auth_retried = auth_retried;

            let status = StatusCode::from_u16(code).unwrap();
            prop_assert_eq!(
                classify(Some(status), &request, NetworkRetryPolicy::IdempotentOnly),
                RetryDecision::Return
            );
        }
    }
}
