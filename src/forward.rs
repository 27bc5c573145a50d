//! Downstream forwarding client
//!
//! One pooled `reqwest` client serves every downstream call. Redirects are
//! handed back to the caller untouched and nothing is kept between calls
//! (no cookie store). Calls in flight are bounded per origin and across
//! all origins, so one slow target cannot take every slot.

use std::sync::Arc;
use std::time::Duration;

use axum::http::{HeaderMap, Method, StatusCode, header};
use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::Semaphore;
use tracing::debug;
use url::Url;

use crate::Result;
use crate::config::HttpConfig;

/// Header naming the logical target app
pub const TARGET_APP: &str = "target-app";
/// Optional header overriding the namespace lookup
pub const TARGET_NAMESPACE: &str = "target-namespace";
/// Header switching to redirect-only mode; its value is the destination base URL
pub const TARGET_ONLY_REDIRECT: &str = "target-only-redirect";

/// Placeholder origin for resolving an inbound path on its own
const NORMALIZING_ORIGIN: &str = "http://downstream.invalid";

/// Inbound headers never passed downstream
const BLOCKED_REQUEST_HEADERS: &[&str] = &[
    TARGET_APP,
    TARGET_NAMESPACE,
    TARGET_ONLY_REDIRECT,
    "host",
    "authorization",
];

/// Downstream headers never passed back (RFC 7230 §6.1 hop-by-hop set,
/// plus `content-length` which is recomputed for the rebuilt body)
const BLOCKED_RESPONSE_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "content-length",
    "upgrade",
];

/// A call to send downstream
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    /// Same method as the inbound call
    pub method: Method,
    /// Absolute URL: base URL followed by the inbound path and query
    pub url: String,
    /// Filtered inbound headers plus the exchanged `Authorization`
    pub headers: HeaderMap,
    /// Inbound body, verbatim
    pub body: Bytes,
}

/// A downstream response, fully buffered
#[derive(Debug, Clone)]
pub struct OutboundResponse {
    /// Downstream status
    pub status: StatusCode,
    /// Downstream headers
    pub headers: HeaderMap,
    /// Downstream body, verbatim
    pub body: Bytes,
}

/// Why a downstream call produced no response
#[derive(Debug, thiserror::Error)]
pub enum ForwardError {
    /// Connect, TLS, timeout or body transfer failure
    #[error("Failed call to {url}: {source}")]
    Transport {
        /// Destination
        url: String,
        /// Underlying client error
        #[source]
        source: reqwest::Error,
    },

    /// The in-flight limiter was shut down
    #[error("Forwarding client is shutting down")]
    Closed,
}

/// Sends requests downstream
#[async_trait::async_trait]
pub trait Forwarder: Send + Sync + 'static {
    /// Send one request and buffer the response
    async fn send(&self, request: OutboundRequest) -> std::result::Result<OutboundResponse, ForwardError>;
}

/// `reqwest` backed forwarder
pub struct HttpForwarder {
    client: reqwest::Client,
    permits: Semaphore,
    route_permits: DashMap<String, Arc<Semaphore>>,
    max_per_route: usize,
}

impl HttpForwarder {
    /// Build the pooled client from configuration
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Http`] if the TLS backend fails to initialise.
    pub fn new(config: &HttpConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout)
            .pool_max_idle_per_host(config.max_idle_per_host)
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_nodelay(true)
            .redirect(reqwest::redirect::Policy::none())
            .build()?;

        Ok(Self {
            client,
            permits: Semaphore::new(config.max_in_flight.max(1)),
            route_permits: DashMap::new(),
            max_per_route: config.max_per_route.max(1),
        })
    }

    /// Limiter shared by every call to the origin of `url`
    pub fn route_permits(&self, url: &str) -> Arc<Semaphore> {
        let route = Url::parse(url)
            .map(|u| u.origin().ascii_serialization())
            .unwrap_or_default();
        let entry = self
            .route_permits
            .entry(route)
            .or_insert_with(|| Arc::new(Semaphore::new(self.max_per_route)));
        Arc::clone(entry.value())
    }
}

#[async_trait::async_trait]
impl Forwarder for HttpForwarder {
    async fn send(&self, request: OutboundRequest) -> std::result::Result<OutboundResponse, ForwardError> {
        // per-origin first, so calls queued on a slow target hold no global slot
        let route = self.route_permits(&request.url);
        let _route_permit = route.acquire().await.map_err(|_| ForwardError::Closed)?;
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| ForwardError::Closed)?;

        let OutboundRequest {
            method,
            url,
            headers,
            body,
        } = request;
        debug!(%method, url, "Forwarding");

        let transport = |source| ForwardError::Transport {
            url: url.clone(),
            source,
        };

        let response = self
            .client
            .request(method, &url)
            .headers(headers)
            .body(body)
            .send()
            .await
            .map_err(transport)?;

        let status = response.status();
        let headers = response.headers().clone();
        let body = response.bytes().await.map_err(transport)?;

        Ok(OutboundResponse {
            status,
            headers,
            body,
        })
    }
}

/// Inbound path and query resolved the way the downstream client will send
/// them: dot-segments (`..`, `%2e%2e`) collapsed
///
/// Whitelisting and forwarding must both use the result so the checked path
/// is the path sent. `None` if the target is not a valid URL path.
pub fn normalized_target(path_and_query: &str) -> Option<Url> {
    if !path_and_query.starts_with('/') {
        return None;
    }
    Url::parse(&format!("{NORMALIZING_ORIGIN}{path_and_query}")).ok()
}

/// Inbound headers minus the proxy's own and hop-specific ones
pub fn strip_request_headers(headers: &HeaderMap) -> HeaderMap {
    filter_headers(headers, BLOCKED_REQUEST_HEADERS)
}

/// Downstream headers minus hop-by-hop ones
pub fn strip_response_headers(headers: &HeaderMap) -> HeaderMap {
    filter_headers(headers, BLOCKED_RESPONSE_HEADERS)
}

fn filter_headers(headers: &HeaderMap, blocked: &[&str]) -> HeaderMap {
    let mut out = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        // HeaderName is always lowercase
        if !blocked.contains(&name.as_str()) {
            out.append(name.clone(), value.clone());
        }
    }
    out
}

/// Forwarding headers for a call carrying `token`
pub fn forwarding_headers(inbound: &HeaderMap, token: Option<&str>) -> HeaderMap {
    let mut headers = strip_request_headers(inbound);
    if let Some(token) = token {
        if let Ok(value) = format!("Bearer {token}").parse() {
            headers.insert(header::AUTHORIZATION, value);
        }
    }
    headers
}
