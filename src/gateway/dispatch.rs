//! Request dispatch
//!
//! Every proxied call walks the same steps and stops at the first failure:
//! target header, target resolution, whitelist, authentication, token
//! exchange, forwarding (GET retried once on transport failure) and
//! telemetry. Calls carrying `target-only-redirect` skip everything but
//! authentication.

use axum::body::{Body, Bytes};
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode, Uri, header};
use axum::response::{IntoResponse, Response};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use url::Position;

use super::AppState;
use crate::diagnostics::{describe_request, describe_response};
use crate::forward::{
    ForwardError, OutboundRequest, OutboundResponse, TARGET_APP, TARGET_NAMESPACE,
    TARGET_ONLY_REDIRECT, forwarding_headers, normalized_target, strip_response_headers,
};
use crate::metrics::{self, CallTiming, ForwardedCall};
use crate::target::Target;
use crate::token::TokenType;
use crate::whitelist::{dry_run_report, find_scope};

/// An inbound call, body fully buffered
#[derive(Debug, Clone)]
pub struct Inbound {
    /// Request method
    pub method: Method,
    /// Request URI as received (origin form)
    pub uri: Uri,
    /// Request headers
    pub headers: HeaderMap,
    /// Request body
    pub body: Bytes,
}

impl Inbound {
    fn path(&self) -> &str {
        self.uri.path()
    }

    fn path_and_query(&self) -> &str {
        self.uri
            .path_and_query()
            .map_or_else(|| self.uri.path(), |pq| pq.as_str())
    }

    fn header(&self, name: &str) -> Option<&str> {
        header_str(&self.headers, name)
    }
}

/// Reply sent back to the caller
#[derive(Debug)]
pub struct ProxyReply {
    /// Status code
    pub status: StatusCode,
    /// Headers
    pub headers: HeaderMap,
    /// Body
    pub body: Bytes,
}

impl ProxyReply {
    /// Plain-text reply produced by the proxy itself
    pub fn text(status: StatusCode, body: impl Into<String>) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("text/plain; charset=utf-8"),
        );
        Self {
            status,
            headers,
            body: Bytes::from(body.into()),
        }
    }

    /// Downstream response passed back verbatim, minus hop-by-hop headers
    pub fn downstream(response: OutboundResponse) -> Self {
        Self {
            status: response.status,
            headers: strip_response_headers(&response.headers),
            body: response.body,
        }
    }
}

impl IntoResponse for ProxyReply {
    fn into_response(self) -> Response {
        let mut response = Response::new(Body::from(self.body));
        *response.status_mut() = self.status;
        *response.headers_mut() = self.headers;
        response
    }
}

/// Dispatch one proxied call
pub async fn proxy(state: &AppState, request: Inbound) -> ProxyReply {
    let started = Instant::now();
    let app = request.header(TARGET_APP);
    metrics::record_api_call(app.unwrap_or_default(), request.path());

    if let Some(destination) = request.header(TARGET_ONLY_REDIRECT) {
        return redirect_only(state, destination, &request).await;
    }

    let Some(app) = app else {
        info!(method = %request.method, path = request.path(), "Proxy: Bad request - missing target-app header");
        state
            .diagnostics
            .write(
                "missingheader",
                &describe_request(&request.method, request.path_and_query(), &request.headers),
            )
            .await;
        return ProxyReply::text(StatusCode::BAD_REQUEST, "Proxy: Bad request - missing header");
    };

    let target = match Target::resolve(
        app,
        request.header(TARGET_NAMESPACE),
        &state.rules,
        &state.ingresses,
        &state.cluster,
    ) {
        Ok(target) => target,
        Err(e) => {
            error!(app, error = %e, "Failed to resolve target");
            return ProxyReply::text(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Proxy: Configuration error - {e}"),
            );
        }
    };

    let Some(normalized) = normalized_target(request.path_and_query()) else {
        info!(app, path = request.path(), "Proxy: Bad request - invalid path");
        return ProxyReply::text(StatusCode::BAD_REQUEST, "Proxy: Bad request - invalid path");
    };
    // checked and forwarded alike
    let path = normalized.path();
    let path_and_query = &normalized[Position::BeforePath..];
    let approved =
        state
            .rules
            .matching_rules(app, &target.namespace, &request.method, path);
    if approved.is_empty() {
        info!(app, namespace = %target.namespace, method = %request.method, path, "Proxy: Bad request - not whitelisted path");
        state
            .diagnostics
            .write(
                &format!("notwhitelisted-{app}"),
                &describe_request(&request.method, path_and_query, &request.headers),
            )
            .await;
        return ProxyReply::text(
            StatusCode::BAD_REQUEST,
            format!("Proxy: Bad request - {path} is not whitelisted"),
        );
    }
    let scope = find_scope(approved);

    let Some(inbound) = state.verifier.first_valid_token(&request.headers).await else {
        info!(app, "Proxy: Not authorized");
        metrics::record_no_auth(app);
        state
            .diagnostics
            .write(
                &format!("noauth-{app}"),
                &describe_request(&request.method, request.path_and_query(), &request.headers),
            )
            .await;
        return ProxyReply::text(StatusCode::UNAUTHORIZED, "Proxy: Not authorized");
    };
    debug!(app, caller = inbound.claim_str("azp_name").unwrap_or("unknown"), "Authenticated");

    let exchanged = match state.provider.exchange(&inbound, &target.alias, scope).await {
        Ok(exchanged) => exchanged,
        Err(e) => {
            error!(app, alias = %target.alias, error = %e, "Token exchange failed");
            return ProxyReply::text(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Proxy: Token exchange failed - {e}"),
            );
        }
    };

    let outbound = OutboundRequest {
        method: request.method.clone(),
        url: format!("{}{path_and_query}", target.base_url),
        headers: forwarding_headers(&request.headers, Some(&exchanged.access_token)),
        body: request.body.clone(),
    };

    let call = Call {
        state,
        target: &target,
        path,
        token_type: exchanged.token_type,
        started,
    };
    call.forward(outbound).await
}

/// Forward to the URL named by the caller, authenticating only
async fn redirect_only(state: &AppState, destination: &str, request: &Inbound) -> ProxyReply {
    if state.verifier.first_valid_token(&request.headers).await.is_none() {
        info!(destination, "Proxy: Not authorized - redirect only");
        return ProxyReply::text(StatusCode::UNAUTHORIZED, "Proxy: Not authorized");
    }

    let outbound = OutboundRequest {
        method: request.method.clone(),
        url: format!("{destination}{}", request.path_and_query()),
        headers: forwarding_headers(&request.headers, None),
        body: request.body.clone(),
    };
    let url = outbound.url.clone();

    match state.forwarder.send(outbound).await {
        Ok(response) => {
            info!(status = response.status.as_u16(), url, "Forwarded call");
            ProxyReply::downstream(response)
        }
        Err(e) => {
            error!(url, error = %e, "Redirect failed");
            ProxyReply::text(StatusCode::INTERNAL_SERVER_ERROR, format!("Proxy: {e}"))
        }
    }
}

/// Context of an authorized call on its way downstream
struct Call<'a> {
    state: &'a AppState,
    target: &'a Target,
    path: &'a str,
    token_type: TokenType,
    started: Instant,
}

impl Call<'_> {
    async fn forward(&self, outbound: OutboundRequest) -> ProxyReply {
        let before_call = Instant::now();
        match self.state.forwarder.send(outbound.clone()).await {
            Ok(response) => self.delivered(&outbound, response, before_call).await,
            Err(e) => self.failed(outbound, e).await,
        }
    }

    async fn delivered(
        &self,
        outbound: &OutboundRequest,
        response: OutboundResponse,
        before_call: Instant,
    ) -> ProxyReply {
        let now = Instant::now();
        let downstream = now.duration_since(before_call);
        let total = now.duration_since(self.started);
        let handling = total.saturating_sub(downstream);
        let app = self.target.app.as_str();

        info!(
            status = response.status.as_u16(),
            method = %outbound.method,
            url = %outbound.url,
            alias = %self.target.alias,
            total_ms = total.as_millis(),
            handling_ms = handling.as_millis(),
            downstream_ms = downstream.as_millis(),
            "Forwarded call"
        );

        if self.state.diagnostics.records_status(response.status) {
            let described = describe_response(response.status, &response.headers, &response.body);
            self.state
                .diagnostics
                .write(
                    &format!("latest-{app}-{}", response.status.as_u16()),
                    &exchange_report(outbound, &described),
                )
                .await;
        }

        self.record(
            response.status.as_u16().to_string(),
            Some(CallTiming { total, handling }),
        );

        if let Err(e) = self
            .state
            .store
            .record_last_seen(&self.target.namespace, app)
            .await
        {
            error!(app, error = %e, "Could not store timestamp for app call");
        }

        ProxyReply::downstream(response)
    }

    async fn failed(&self, outbound: OutboundRequest, first: ForwardError) -> ProxyReply {
        let app = self.target.app.as_str();
        error!(url = %outbound.url, alias = %self.target.alias, error = %first, "Failed call");
        self.state
            .diagnostics
            .write(
                &format!("latest-{app}-EXCEPTION"),
                &exchange_report(&outbound, &first.to_string()),
            )
            .await;

        if outbound.method != Method::GET {
            self.record("500".to_string(), None);
            return ProxyReply::text(StatusCode::INTERNAL_SERVER_ERROR, format!("Proxy: {first}"));
        }

        warn!(url = %outbound.url, "Retrying GET once");
        match self.state.forwarder.send(outbound).await {
            Ok(response) => {
                self.record(format!("retry-{}", response.status.as_u16()), None);
                ProxyReply::downstream(response)
            }
            Err(e) => {
                error!(error = %e, "Retry failed");
                self.record("retry-500".to_string(), None);
                ProxyReply::text(StatusCode::INTERNAL_SERVER_ERROR, format!("Proxy: {e}"))
            }
        }
    }

    fn record(&self, status: String, timing: Option<CallTiming>) {
        metrics::record_forwarded_call(&ForwardedCall {
            target_app: &self.target.app,
            path: self.path,
            ingress: self.target.ingress.as_deref().unwrap_or_default(),
            token_type: self.token_type.metric_label(),
            status,
            timing,
        });
    }
}

/// Dry-run the whitelist for a call to `/internal/test/{rest}`
pub async fn dry_run(state: &AppState, method: &Method, rest: &str, headers: &HeaderMap) -> ProxyReply {
    let path = format!("/{rest}");
    metrics::record_test_api_call(&path);
    info!(path, "Test url called");

    let Some(app) = header_str(headers, TARGET_APP) else {
        return ProxyReply::text(StatusCode::BAD_REQUEST, "Proxy: Missing target-app header");
    };

    let target = match Target::resolve(
        app,
        header_str(headers, TARGET_NAMESPACE),
        &state.rules,
        &state.ingresses,
        &state.cluster,
    ) {
        Ok(target) => target,
        Err(e) => {
            error!(app, error = %e, "Failed to resolve target");
            return ProxyReply::text(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Proxy: Configuration error - {e}"),
            );
        }
    };

    let rules = state.rules.rules_of(app, &target.namespace);
    if rules.is_empty() {
        return ProxyReply::text(
            StatusCode::NON_AUTHORITATIVE_INFORMATION,
            "App not found in rules. Not approved",
        );
    }

    let (_, report) = dry_run_report(rules, &target.describe(), method, &path);
    ProxyReply::text(StatusCode::OK, report)
}

/// Non-empty header value as text
fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
}

fn exchange_report(outbound: &OutboundRequest, response: &str) -> String {
    format!(
        "REDIRECT:\n{}\nRESPONSE:\n{response}",
        describe_request(&outbound.method, &outbound.url, &outbound.headers)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_header_counts_as_missing() {
        let mut headers = HeaderMap::new();
        headers.insert(TARGET_APP, HeaderValue::from_static(""));
        assert_eq!(header_str(&headers, TARGET_APP), None);

        headers.insert(TARGET_APP, HeaderValue::from_static("sf-arkiv"));
        assert_eq!(header_str(&headers, TARGET_APP), Some("sf-arkiv"));
    }

    #[test]
    fn path_and_query_keeps_query() {
        let request = Inbound {
            method: Method::GET,
            uri: "/api/v1/sak?fom=2024-05-16".parse().unwrap(),
            headers: HeaderMap::new(),
            body: Bytes::new(),
        };
        assert_eq!(request.path(), "/api/v1/sak");
        assert_eq!(request.path_and_query(), "/api/v1/sak?fom=2024-05-16");
    }

    #[test]
    fn downstream_reply_drops_hop_by_hop_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(header::TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let reply = ProxyReply::downstream(OutboundResponse {
            status: StatusCode::CREATED,
            headers,
            body: Bytes::from_static(b"{}"),
        });

        assert_eq!(reply.status, StatusCode::CREATED);
        assert!(reply.headers.get(header::TRANSFER_ENCODING).is_none());
        assert_eq!(reply.body, Bytes::from_static(b"{}"));
    }

    #[test]
    fn report_redacts_forwarded_token() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer secret"));
        let outbound = OutboundRequest {
            method: Method::POST,
            url: "http://sf-arkiv.teamcrm/arkiv".to_string(),
            headers,
            body: Bytes::new(),
        };

        let text = exchange_report(&outbound, "boom");
        assert!(!text.contains("secret"));
        assert!(text.contains("POST http://sf-arkiv.teamcrm/arkiv"));
        assert!(text.ends_with("boom"));
    }
}
