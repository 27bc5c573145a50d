//! OAuth2 token exchange with the identity provider
//!
//! A delegated (user) token is exchanged with the on-behalf-of flow; any
//! other token gets a client-credentials token for the target. Both are
//! cached in the [`TokenStore`] for their lifetime minus a small margin.

use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;

use backon::{ConstantBuilder, Retryable};
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::{
    ExchangedToken, InboundToken, TokenProvider, TokenStore, TokenType, unverified_claims,
};
use crate::config::IdentityConfig;
use crate::diagnostics::Diagnostics;
use crate::metrics;
use crate::whitelist::DEFAULT_SCOPE;
use crate::{Error, Result};

/// Seconds shaved off a token's lifetime before caching it; a token with
/// no more than this left after shaving is not cached at all
pub const CACHE_MARGIN_SECS: i64 = 3;

const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";

/// Ask for group and role claims in on-behalf-of tokens
const OBO_CLAIMS: &str =
    r#"{"access_token":{"groups":{"essential":true},"roles":{"essential":true}}}"#;

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
    #[serde(default)]
    expires_in: Option<Value>,
}

/// Why one attempt against the token endpoint failed
#[derive(Debug, thiserror::Error)]
enum AttemptError {
    #[error("{0}")]
    Transport(#[from] reqwest::Error),
    #[error("504 Gateway Timeout")]
    GatewayTimeout,
    #[error("Token client is shutting down")]
    Closed,
}

impl AttemptError {
    fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(e) => e.is_connect() || e.is_timeout() || e.is_request(),
            Self::GatewayTimeout => true,
            Self::Closed => false,
        }
    }
}

/// Token provider backed by the identity provider's token endpoint
pub struct TokenExchanger {
    http: reqwest::Client,
    token_endpoint: String,
    client_id: String,
    client_secret: String,
    user_claim: String,
    retry_attempts: usize,
    retry_delay: Duration,
    permits: Semaphore,
    store: Arc<dyn TokenStore>,
    diagnostics: Diagnostics,
}

impl TokenExchanger {
    /// Create an exchanger using `http` for identity provider calls
    pub fn new(
        http: reqwest::Client,
        config: &IdentityConfig,
        store: Arc<dyn TokenStore>,
        diagnostics: Diagnostics,
    ) -> Self {
        Self {
            http,
            token_endpoint: config.token_endpoint.clone(),
            client_id: config.client_id.clone(),
            client_secret: config.client_secret.clone(),
            user_claim: config.user_claim.clone(),
            retry_attempts: config.retry_attempts.max(1),
            retry_delay: config.retry_delay,
            permits: Semaphore::new(config.max_in_flight.max(1)),
            store,
            diagnostics,
        }
    }

    /// Client for identity provider calls, with its own short timeouts
    ///
    /// # Errors
    ///
    /// Returns [`Error::Http`] if the TLS backend fails to initialise.
    pub fn idp_client(config: &IdentityConfig) -> Result<reqwest::Client> {
        Ok(reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()?)
    }

    async fn cached(&self, key: &str) -> Option<String> {
        let start = Instant::now();
        let result = self.store.get(key).await;
        metrics::record_cache_fetch(start.elapsed());
        match result {
            Ok(hit) => hit,
            Err(e) => {
                error!(error = %e, "Token cache read failed, treating as miss");
                None
            }
        }
    }

    /// Cache a fresh token unless it is too close to expiry
    async fn store(&self, key: &str, token: &str, seconds_to_live: i64, token_type: TokenType) {
        let ttl = seconds_to_live - CACHE_MARGIN_SECS;
        if ttl <= CACHE_MARGIN_SECS {
            warn!(
                exchange_token_ttl = seconds_to_live,
                %token_type,
                "Skipping caching token that would have been stored less than {CACHE_MARGIN_SECS} seconds"
            );
            self.diagnostics
                .write(
                    &format!("badmargin-{token_type}"),
                    &format!("Token lifetime {seconds_to_live} s"),
                )
                .await;
            return;
        }

        let start = Instant::now();
        #[allow(clippy::cast_sign_loss)]
        let result = self
            .store
            .put(key, token, Duration::from_secs(ttl as u64))
            .await;
        metrics::record_cache_store(start.elapsed());
        if let Err(e) = result {
            error!(error = %e, "Token cache write failed");
        }
    }

    /// POST the form to the token endpoint, retrying transient failures
    async fn request_token(
        &self,
        form: &[(&str, &str)],
    ) -> std::result::Result<reqwest::Response, AttemptError> {
        let http = &self.http;
        let permits = &self.permits;
        let endpoint = self.token_endpoint.as_str();
        let attempt = || async move {
            let _permit = permits.acquire().await.map_err(|_| AttemptError::Closed)?;
            let response = http.post(endpoint).form(form).send().await?;
            if response.status() == StatusCode::GATEWAY_TIMEOUT {
                return Err(AttemptError::GatewayTimeout);
            }
            Ok(response)
        };

        attempt
            .retry(
                ConstantBuilder::default()
                    .with_delay(self.retry_delay)
                    .with_max_times(self.retry_attempts - 1),
            )
            .when(AttemptError::is_retryable)
            .notify(|e, delay| {
                warn!(error = %e, delay_ms = delay.as_millis(), "Token request failed, retrying");
            })
            .await
    }

    async fn fetch(
        &self,
        alias: &str,
        token_type: TokenType,
        form: &[(&str, &str)],
    ) -> Result<(String, Option<i64>)> {
        let reason = match self.try_fetch(form).await {
            Ok(fetched) => return Ok(fetched),
            Err(reason) => reason,
        };

        metrics::record_token_fetch_fail(alias, token_type.as_str());
        error!(alias, %token_type, %reason, "Failed to fetch access token");
        self.diagnostics
            .write(
                &format!("failedExtractAccessToken-{alias}-{token_type}"),
                &describe_form(&self.token_endpoint, form, &reason),
            )
            .await;
        Err(Error::TokenExchange {
            alias: alias.to_string(),
            token_type: token_type.as_str(),
            reason,
        })
    }

    /// Access token and `expires_in` from the endpoint, or why there is none
    async fn try_fetch(
        &self,
        form: &[(&str, &str)],
    ) -> std::result::Result<(String, Option<i64>), String> {
        let response = self.request_token(form).await.map_err(|e| e.to_string())?;
        let status = response.status();
        let body = response.text().await.map_err(|e| e.to_string())?;

        match serde_json::from_str::<TokenResponse>(&body) {
            Ok(TokenResponse {
                access_token: Some(token),
                expires_in,
            }) if status.is_success() => {
                Ok((token, expires_in.as_ref().and_then(parse_expires_in)))
            }
            _ => Err(format!("{status} {body}")),
        }
    }
}

#[async_trait::async_trait]
impl TokenProvider for TokenExchanger {
    async fn exchange(
        &self,
        inbound: &InboundToken,
        alias: &str,
        scope: &str,
    ) -> Result<ExchangedToken> {
        let token_type = if inbound.is_delegated(&self.user_claim) {
            TokenType::Obo
        } else {
            TokenType::M2m
        };

        let key = match token_type {
            TokenType::Obo => format!("{alias}{}", inbound.raw),
            TokenType::M2m => alias.to_string(),
        };

        if let Some(access_token) = self.cached(&key).await {
            debug!(alias, %token_type, "Token cache hit");
            return Ok(ExchangedToken {
                access_token,
                token_type,
            });
        }

        let scope = format!("api://{alias}/{}", requested_scope(scope));
        info!(alias, %token_type, "Requesting token");

        let form: Vec<(&str, &str)> = match token_type {
            TokenType::Obo => vec![
                ("grant_type", JWT_BEARER_GRANT),
                ("assertion", &inbound.raw),
                ("client_id", &self.client_id),
                ("client_secret", &self.client_secret),
                ("scope", &scope),
                ("requested_token_use", "on_behalf_of"),
                ("claims", OBO_CLAIMS),
            ],
            TokenType::M2m => vec![
                ("grant_type", "client_credentials"),
                ("client_id", &self.client_id),
                ("client_secret", &self.client_secret),
                ("scope", &scope),
            ],
        };

        let (access_token, expires_in) = self.fetch(alias, token_type, &form).await?;

        match seconds_to_live(&access_token, expires_in) {
            Some(secs) => self.store(&key, &access_token, secs, token_type).await,
            None => warn!(alias, "Token carries no expiry, not caching"),
        }

        Ok(ExchangedToken {
            access_token,
            token_type,
        })
    }
}

/// Scope segment sent to the identity provider
///
/// The implicit default scope is requested as `.default` in both flows.
pub fn requested_scope(scope: &str) -> &str {
    if scope == DEFAULT_SCOPE { ".default" } else { scope }
}

/// Seconds until the token expires, from its `exp` claim or `expires_in`
pub fn seconds_to_live(token: &str, expires_in: Option<i64>) -> Option<i64> {
    let now = chrono::Utc::now().timestamp();
    unverified_claims(token)
        .and_then(|claims| claims.get("exp").and_then(Value::as_i64))
        .map(|exp| exp - now)
        .or(expires_in)
}

fn parse_expires_in(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

/// Token request for a diagnostic artifact, secrets left out
fn describe_form(endpoint: &str, form: &[(&str, &str)], reason: &str) -> String {
    let mut out = format!("REQUEST:\nPOST {endpoint}\n");
    for (name, value) in form {
        let value = match *name {
            "client_secret" | "assertion" => "<redacted>",
            _ => value,
        };
        let _ = writeln!(out, "{name}={value}");
    }
    out.push_str("\nRESPONSE:\n");
    out.push_str(reason);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_scope_becomes_dot_default() {
        assert_eq!(requested_scope("defaultaccess"), ".default");
        assert_eq!(requested_scope("custom"), "custom");
    }

    #[test]
    fn lifetime_from_exp_claim_wins() {
        use base64::Engine;

        let exp = chrono::Utc::now().timestamp() + 3600;
        let payload = base64::engine::general_purpose::URL_SAFE_NO_PAD
            .encode(format!(r#"{{"exp":{exp}}}"#));
        let token = format!("eyJhbGciOiJub25lIn0.{payload}.sig");

        let secs = seconds_to_live(&token, Some(60)).unwrap();
        assert!((3598..=3600).contains(&secs));
    }

    #[test]
    fn lifetime_falls_back_to_expires_in() {
        assert_eq!(seconds_to_live("opaque-token", Some(60)), Some(60));
        assert_eq!(seconds_to_live("opaque-token", None), None);
    }

    #[test]
    fn expires_in_as_string_or_number() {
        assert_eq!(parse_expires_in(&serde_json::json!(3599)), Some(3599));
        assert_eq!(parse_expires_in(&serde_json::json!("3599")), Some(3599));
        assert_eq!(parse_expires_in(&serde_json::json!(null)), None);
    }

    #[test]
    fn form_description_hides_secrets() {
        let text = describe_form(
            "https://idp/token",
            &[("client_secret", "s3cret"), ("assertion", "jwt"), ("scope", "api://x/.default")],
            "400 Bad Request",
        );
        assert!(!text.contains("s3cret"));
        assert!(!text.contains("=jwt"));
        assert!(text.contains("scope=api://x/.default"));
        assert!(text.ends_with("400 Bad Request"));
    }
}
