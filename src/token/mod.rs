//! Inbound token validation and outbound token exchange
//!
//! Three seams keep the dispatcher independent of the identity provider:
//!
//! - [`TokenVerifier`] picks the first valid bearer token off a request.
//! - [`TokenProvider`] turns that token into one for the target app.
//! - [`TokenStore`] caches exchanged tokens (in process or in Redis).

pub mod exchange;
pub mod redis_store;
pub mod store;
pub mod validator;

use std::collections::BTreeMap;

use axum::http::{HeaderMap, header};
use base64::Engine;
use serde_json::{Map, Value};

pub use exchange::TokenExchanger;
pub use redis_store::RedisTokenStore;
pub use store::{MemoryTokenStore, TokenStore};
pub use validator::OidcTokenValidator;

use crate::Result;

/// `namespace → app → unix seconds` of the last forwarded call
pub type LastSeen = BTreeMap<String, BTreeMap<String, i64>>;

/// A validated inbound bearer token
#[derive(Debug, Clone)]
pub struct InboundToken {
    /// The encoded JWT as received
    pub raw: String,
    /// Verified claims
    pub claims: Map<String, Value>,
}

impl InboundToken {
    /// Create from an encoded token and its verified claims
    pub fn new(raw: impl Into<String>, claims: Map<String, Value>) -> Self {
        Self {
            raw: raw.into(),
            claims,
        }
    }

    /// Whether the token was issued on behalf of a user
    ///
    /// `user_claim` names the claim only user tokens carry.
    pub fn is_delegated(&self, user_claim: &str) -> bool {
        self.claims.contains_key(user_claim)
    }

    /// String claim by name
    pub fn claim_str(&self, name: &str) -> Option<&str> {
        self.claims.get(name).and_then(Value::as_str)
    }
}

/// Token flavour requested from the identity provider
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenType {
    /// On-behalf-of exchange of a user token
    Obo,
    /// Client credentials (machine to machine)
    M2m,
}

impl TokenType {
    /// Short name used in diagnostics and `token_fetch_fail`
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Obo => "obo",
            Self::M2m => "m2m",
        }
    }

    /// Label used on `forwarded_calls` and the latency histograms
    pub fn metric_label(self) -> &'static str {
        match self {
            Self::Obo => "proxy:obo",
            Self::M2m => "proxy:m2m",
        }
    }
}

impl std::fmt::Display for TokenType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An access token for a downstream app
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangedToken {
    /// Encoded access token
    pub access_token: String,
    /// Flow that produced it
    pub token_type: TokenType,
}

/// Finds the first valid bearer token on a request
#[async_trait::async_trait]
pub trait TokenVerifier: Send + Sync + 'static {
    /// First candidate in header order that validates, if any
    async fn first_valid_token(&self, headers: &HeaderMap) -> Option<InboundToken>;

    /// Whether the verifier can reach its key material
    async fn is_ready(&self) -> bool;
}

/// Exchanges an inbound token for one addressed to a target app
#[async_trait::async_trait]
pub trait TokenProvider: Send + Sync + 'static {
    /// Token for `alias` with `scope`
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::TokenExchange`] if the identity provider does
    /// not hand out a token.
    async fn exchange(
        &self,
        inbound: &InboundToken,
        alias: &str,
        scope: &str,
    ) -> Result<ExchangedToken>;
}

/// Bearer candidates from every `Authorization` header, in order
///
/// A header may carry several comma-separated values; the `Bearer ` prefix
/// is matched case-insensitively.
pub fn bearer_candidates(headers: &HeaderMap) -> Vec<&str> {
    headers
        .get_all(header::AUTHORIZATION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|v| {
            let v = v.trim();
            let (scheme, token) = v.split_at_checked(7)?;
            scheme
                .eq_ignore_ascii_case("bearer ")
                .then(|| token.trim())
        })
        .filter(|t| !t.is_empty())
        .collect()
}

/// Decode the payload of a JWT without verifying it
///
/// Used for tokens the identity provider just handed us, where only the
/// `exp` claim is needed.
pub fn unverified_claims(token: &str) -> Option<Map<String, Value>> {
    let payload = token.split('.').nth(1)?;
    let bytes = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .ok()?;
    serde_json::from_slice(&bytes).ok()
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    fn headers(values: &[&'static str]) -> HeaderMap {
        let mut headers = HeaderMap::new();
        for v in values {
            headers.append(header::AUTHORIZATION, HeaderValue::from_static(v));
        }
        headers
    }

    #[test]
    fn candidates_in_order_across_headers() {
        let h = headers(&["Bearer a, bearer b", "BEARER c"]);
        assert_eq!(bearer_candidates(&h), vec!["a", "b", "c"]);
    }

    #[test]
    fn non_bearer_values_are_skipped() {
        let h = headers(&["Basic dXNlcjpwYXNz", "Bearer ", "Bearer x"]);
        assert_eq!(bearer_candidates(&h), vec!["x"]);
        assert!(bearer_candidates(&HeaderMap::new()).is_empty());
    }

    #[test]
    fn delegated_token_carries_user_claim() {
        let user = InboundToken::new("t", json!({"NAVident": "Z999999"}).as_object().cloned().unwrap());
        let app = InboundToken::new("t", json!({"azp": "app"}).as_object().cloned().unwrap());

        assert!(user.is_delegated("NAVident"));
        assert!(!app.is_delegated("NAVident"));
        assert_eq!(user.claim_str("NAVident"), Some("Z999999"));
    }

    #[test]
    fn unverified_payload_is_decoded() {
        // {"alg":"none"} . {"exp":1700000000} . signature
        let token = "eyJhbGciOiJub25lIn0.eyJleHAiOjE3MDAwMDAwMDB9.c2ln";
        let claims = unverified_claims(token).unwrap();
        assert_eq!(claims["exp"], json!(1_700_000_000));

        assert!(unverified_claims("not-a-jwt").is_none());
    }

    #[test]
    fn token_type_labels() {
        assert_eq!(TokenType::Obo.metric_label(), "proxy:obo");
        assert_eq!(TokenType::M2m.to_string(), "m2m");
    }
}
