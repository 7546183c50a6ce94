//! Authenticated upstream client.
//!
//! The collector only sees the [`ApiClient`] trait; [`HttpApiClient`] is the
//! reqwest-backed implementation used in production. Retries are not done
//! here, every call is exactly one request.

use async_trait::async_trait;
use bytes::Bytes;
use once_cell::sync::OnceCell;
use reqwest::header::{HeaderMap, ACCEPT, USER_AGENT};
use reqwest::{Client, StatusCode};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// HTTP connect timeout (seconds) - time to establish TCP connection
const HTTP_CONNECT_TIMEOUT_SECS: u64 = 10;
/// HTTP request timeout (seconds) - overall time for the entire request
const HTTP_REQUEST_TIMEOUT_SECS: u64 = 30;

const DEFAULT_USER_AGENT: &str = concat!("stateful-collector/", env!("CARGO_PKG_VERSION"));

/// Process-wide HTTP client, so every collector shares one connection pool.
static GLOBAL_HTTP_CLIENT: OnceCell<Arc<Client>> = OnceCell::new();

/// Get (building on first use) the shared HTTP client.
pub fn global_http_client() -> Result<Arc<Client>, TransportError> {
    GLOBAL_HTTP_CLIENT
        .get_or_try_init(|| {
            Client::builder()
                .connect_timeout(Duration::from_secs(HTTP_CONNECT_TIMEOUT_SECS))
                .timeout(Duration::from_secs(HTTP_REQUEST_TIMEOUT_SECS))
                .build()
                .map(Arc::new)
                .map_err(|e| TransportError::Setup(format!("failed to build HTTP client: {e}")))
        })
        .cloned()
}

/// Failure to obtain any HTTP response.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    /// The request did not finish in time
    #[error("request timed out: {0}")]
    Timeout(String),

    /// No connection could be established
    #[error("connection failed: {0}")]
    Connect(String),

    /// Any other failure while sending or reading the body
    #[error("request failed: {0}")]
    Request(String),

    /// The client could not be constructed
    #[error("client setup failed: {0}")]
    Setup(String),
}

impl From<reqwest::Error> for TransportError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout(e.to_string())
        } else if e.is_connect() {
            Self::Connect(e.to_string())
        } else {
            Self::Request(e.to_string())
        }
    }
}

/// A complete upstream response, body included.
#[derive(Debug, Clone)]
pub struct ApiResponse {
    /// Status code
    pub status: StatusCode,
    /// Final URL (after redirects)
    pub url: String,
    /// Response headers
    pub headers: HeaderMap,
    /// Body bytes
    pub body: Bytes,
}

impl ApiResponse {
    /// Build a response with no headers.
    pub fn new(status: StatusCode, url: impl Into<String>, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            url: url.into(),
            headers: HeaderMap::new(),
            body: body.into(),
        }
    }

    /// Replace the headers.
    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }
}

/// One GET against the upstream API.
#[async_trait]
pub trait ApiClient: Send + Sync {
    /// Issue `GET {base}/{path}?{query}`.
    async fn get(&self, path: &str, query: &[(String, String)]) -> Result<ApiResponse, TransportError>;
}

/// reqwest implementation of [`ApiClient`] with bearer authentication.
pub struct HttpApiClient {
    client: Arc<Client>,
    base_url: String,
    token: Option<String>,
}

impl HttpApiClient {
    /// Create a client for `base_url` on the shared connection pool.
    pub fn new(base_url: impl Into<String>) -> Result<Self, TransportError> {
        Ok(Self::with_client(global_http_client()?, base_url))
    }

    /// Create a client on a caller-provided reqwest client.
    pub fn with_client(client: Arc<Client>, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: None,
        }
    }

    /// Send `Authorization: Bearer <token>` with every request.
    pub fn with_token(mut self, token: Option<String>) -> Self {
        self.token = token.filter(|t| !t.is_empty());
        self
    }

    /// Base URL requests are resolved against
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url_for(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            path.to_string()
        } else {
            format!("{}/{}", self.base_url, path.trim_start_matches('/'))
        }
    }
}

#[async_trait]
impl ApiClient for HttpApiClient {
    async fn get(&self, path: &str, query: &[(String, String)]) -> Result<ApiResponse, TransportError> {
        let url = self.url_for(path);
        debug!(url = %url, params = query.len(), "GET");

        let mut request = self
            .client
            .get(&url)
            .query(query)
            .header(USER_AGENT, DEFAULT_USER_AGENT)
            .header(ACCEPT, "application/json");
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        let status = response.status();
        let final_url = response.url().to_string();
        let headers = response.headers().clone();
        let body = response.bytes().await?;

        Ok(ApiResponse {
            status,
            url: final_url,
            headers,
            body,
        })
    }
}
