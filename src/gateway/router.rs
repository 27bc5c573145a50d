//! HTTP router and handlers

use std::sync::Arc;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{DefaultBodyLimit, Path, State},
    http::{HeaderMap, Method, StatusCode, Uri, header},
    response::IntoResponse,
    routing::{any, get},
};
use tower_http::{catch_panic::CatchPanicLayer, trace::TraceLayer};
use tracing::error;

use super::dispatch::{self, Inbound, ProxyReply};
use crate::diagnostics::Diagnostics;
use crate::forward::Forwarder;
use crate::ingress::IngressSet;
use crate::metrics;
use crate::token::{TokenProvider, TokenStore, TokenVerifier};
use crate::whitelist::RuleSet;

/// Shared application state
pub struct AppState {
    /// Compiled whitelist
    pub rules: Arc<RuleSet>,
    /// Ingress table
    pub ingresses: Arc<IngressSet>,
    /// Cluster the proxy runs in, used for token aliases
    pub cluster: String,
    /// Inbound token validation
    pub verifier: Arc<dyn TokenVerifier>,
    /// Outbound token exchange
    pub provider: Arc<dyn TokenProvider>,
    /// Token cache, also holds last-seen timestamps
    pub store: Arc<dyn TokenStore>,
    /// Downstream client
    pub forwarder: Arc<dyn Forwarder>,
    /// Diagnostic artifact writer
    pub diagnostics: Diagnostics,
    /// Largest accepted request body in bytes
    pub max_body_size: usize,
}

/// Create the router
pub fn create_router(state: Arc<AppState>) -> Router {
    let body_limit = state.max_body_size;

    Router::new()
        .route("/internal/isAlive", get(is_alive_handler))
        .route("/internal/isReady", get(is_ready_handler))
        .route("/internal/metrics", get(metrics_handler))
        .route("/internal/lastseen", get(last_seen_handler))
        .route("/internal/test/", any(dry_run_root_handler))
        .route("/internal/test/{*rest}", any(dry_run_handler))
        .fallback(proxy_handler)
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(CatchPanicLayer::new())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn is_alive_handler() -> StatusCode {
    StatusCode::OK
}

/// Ready once the token store answers and the identity provider's keys
/// have been fetched
async fn is_ready_handler(State(state): State<Arc<AppState>>) -> StatusCode {
    if state.store.is_ready().await && state.verifier.is_ready().await {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

async fn metrics_handler() -> impl IntoResponse {
    match metrics::render() {
        Some(text) if !text.is_empty() => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
            text,
        )
            .into_response(),
        _ => StatusCode::NO_CONTENT.into_response(),
    }
}

async fn last_seen_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.store.last_seen().await {
        Ok(seen) => Json(seen).into_response(),
        Err(e) => {
            error!(error = %e, "Failed to read last seen");
            ProxyReply::text(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Proxy: Failed to read last seen - {e}"),
            )
            .into_response()
        }
    }
}

async fn dry_run_handler(
    State(state): State<Arc<AppState>>,
    Path(rest): Path<String>,
    method: Method,
    headers: HeaderMap,
) -> ProxyReply {
    dispatch::dry_run(&state, &method, &rest, &headers).await
}

async fn dry_run_root_handler(
    State(state): State<Arc<AppState>>,
    method: Method,
    headers: HeaderMap,
) -> ProxyReply {
    dispatch::dry_run(&state, &method, "", &headers).await
}

async fn proxy_handler(
    State(state): State<Arc<AppState>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> ProxyReply {
    dispatch::proxy(
        &state,
        Inbound {
            method,
            uri,
            headers,
            body,
        },
    )
    .await
}
