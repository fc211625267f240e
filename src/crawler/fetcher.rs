//! HTTP transport
//!
//! The engine talks to the network only through the [`Transport`] trait:
//! send one request, get a status and body back or a transport failure.
//! [`HttpTransport`] implements it over reqwest, keeping one client per
//! proxy binding owner so that each binding gets its own connection pool and
//! a rotated binding replaces its predecessor's client.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{redirect::Policy, Client};
use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;

/// A fully prepared request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundRequest {
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub proxy: Option<String>,

    /// Who the proxy is bound to, and since when
    pub proxy_owner: Option<ProxyOwner>,
}

/// The credential a proxy binding belongs to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyOwner {
    pub credential: String,
    pub bound_at: DateTime<Utc>,
}

/// Status and body of a completed exchange
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

/// Broad class of a transport failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    Timeout,
    Connect,
    Other,

    /// The request task panicked or was cancelled
    Aborted,
}

/// The request never produced a response
#[derive(Debug, Clone, Error)]
#[error("{kind:?}: {message}")]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub message: String,
}

impl TransportError {
    pub fn new(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    fn from_reqwest(error: reqwest::Error) -> Self {
        let kind = if error.is_timeout() {
            TransportErrorKind::Timeout
        } else if error.is_connect() {
            TransportErrorKind::Connect
        } else {
            TransportErrorKind::Other
        };
        Self::new(kind, error.to_string())
    }
}

/// How the engine treats a response status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusClass {
    /// 2xx
    Success,

    /// 401 or 403; counts against the credential
    AuthRejected,

    /// Anything else; retried without touching credential health
    Retryable,
}

/// Classifies an HTTP status code
///
/// | Status | Class |
/// |--------|-------|
/// | 2xx | Success |
/// | 401, 403 | AuthRejected |
/// | other (3xx redirects included) | Retryable |
pub fn classify_status(status: u16) -> StatusClass {
    match status {
        200..=299 => StatusClass::Success,
        401 | 403 => StatusClass::AuthRejected,
        _ => StatusClass::Retryable,
    }
}

/// Issues requests on behalf of the engine
#[async_trait]
pub trait Transport: fmt::Debug + Send + Sync {
    async fn execute(&self, request: OutboundRequest)
        -> Result<TransportResponse, TransportError>;
}

/// Builds an HTTP client, optionally routed through a proxy
///
/// Redirects are not followed; a 3xx comes back as a plain status.
pub fn build_http_client(timeout: Duration, proxy: Option<&str>) -> Result<Client, reqwest::Error> {
    let mut builder = Client::builder()
        .timeout(timeout)
        .connect_timeout(Duration::from_secs(10))
        .redirect(Policy::none())
        .gzip(true)
        .brotli(true);

    if let Some(proxy) = proxy {
        builder = builder.proxy(reqwest::Proxy::all(proxy)?);
    }

    builder.build()
}

/// Client for the current binding of one owner
#[derive(Debug)]
struct BoundClient {
    uri: String,
    bound_at: Option<DateTime<Utc>>,
    client: Client,
}

/// reqwest-backed transport with a client per proxy binding owner
///
/// A request carrying a newer binding than the cached one replaces it, so
/// the cache holds at most one proxied client per owner. Requests still in
/// flight for a superseded binding get a one-off client.
#[derive(Debug)]
pub struct HttpTransport {
    timeout: Duration,
    direct: Client,
    proxied: Mutex<HashMap<String, BoundClient>>,
}

impl HttpTransport {
    /// Creates the transport and its direct (proxy-less) client
    pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
        Ok(Self {
            timeout,
            direct: build_http_client(timeout, None)?,
            proxied: Mutex::new(HashMap::new()),
        })
    }

    fn client_for(&self, request: &OutboundRequest) -> Result<Client, TransportError> {
        let Some(uri) = request.proxy.as_deref() else {
            return Ok(self.direct.clone());
        };
        let owner = request
            .proxy_owner
            .as_ref()
            .map_or(uri, |owner| owner.credential.as_str());
        let bound_at = request.proxy_owner.as_ref().map(|owner| owner.bound_at);

        let mut proxied = self
            .proxied
            .lock()
            .map_err(|_| TransportError::new(TransportErrorKind::Other, "client cache poisoned"))?;

        if let Some(cached) = proxied.get(owner) {
            if cached.uri == uri {
                return Ok(cached.client.clone());
            }
        }

        let client = build_http_client(self.timeout, Some(uri)).map_err(|e| {
            TransportError::new(
                TransportErrorKind::Connect,
                format!("invalid proxy endpoint: {}", e),
            )
        })?;

        let superseded = proxied
            .get(owner)
            .map_or(false, |cached| cached.bound_at > bound_at);
        if superseded {
            tracing::debug!(owner, "Request for a rotated-out proxy, using an uncached client");
            return Ok(client);
        }

        if proxied
            .insert(
                owner.to_string(),
                BoundClient {
                    uri: uri.to_string(),
                    bound_at,
                    client: client.clone(),
                },
            )
            .is_some()
        {
            tracing::debug!(owner, "Replaced client of rotated proxy");
        }
        Ok(client)
    }

    /// Number of cached clients, the direct one included
    pub fn client_count(&self) -> usize {
        1 + self.proxied.lock().map(|proxied| proxied.len()).unwrap_or(0)
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn execute(
        &self,
        request: OutboundRequest,
    ) -> Result<TransportResponse, TransportError> {
        let client = self.client_for(&request)?;

        let mut builder = client.get(&request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        let response = builder.send().await.map_err(TransportError::from_reqwest)?;
        let status = response.status().as_u16();
        let body = response
            .bytes()
            .await
            .map_err(TransportError::from_reqwest)?
            .to_vec();

        Ok(TransportResponse { status, body })
    }
}
