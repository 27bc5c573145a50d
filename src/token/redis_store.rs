//! Redis/Valkey backed token store
//!
//! Tokens are written with `SETEX`, so key expiry is the only eviction
//! mechanism and no read margin is applied. Last-seen timestamps live under
//! `last_seen:{namespace}:{app}` with a 90 day TTL.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use url::Url;

use super::{LastSeen, TokenStore};
use crate::config::RedisConfig;
use crate::{Error, Result};

const LAST_SEEN_PREFIX: &str = "last_seen:";
const LAST_SEEN_TTL_SECS: u64 = 90 * 24 * 60 * 60;
const SCAN_COUNT: usize = 500;

/// Token store backed by a shared Redis/Valkey instance
pub struct RedisTokenStore {
    manager: ConnectionManager,
    probe_timeout: Duration,
    ready: AtomicBool,
}

impl RedisTokenStore {
    /// Connect using the configured host and credentials
    ///
    /// # Errors
    ///
    /// Returns [`Error::Cache`] if the URL is invalid or the first
    /// connection cannot be established.
    pub async fn connect(config: &RedisConfig) -> Result<Self> {
        let url = connection_url(config)?;
        let client = redis::Client::open(url.as_str())?;
        let manager = client.get_connection_manager().await?;
        info!(host = %config.host, port = config.port, tls = config.tls, "Connected to token cache");
        Ok(Self {
            manager,
            probe_timeout: config.probe_timeout,
            ready: AtomicBool::new(false),
        })
    }
}

#[async_trait::async_trait]
impl TokenStore for RedisTokenStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut con = self.manager.clone();
        Ok(con.get(key).await?)
    }

    async fn put(&self, key: &str, token: &str, ttl: Duration) -> Result<()> {
        let mut con = self.manager.clone();
        let () = con.set_ex(key, token, ttl.as_secs()).await?;
        Ok(())
    }

    async fn is_ready(&self) -> bool {
        if self.ready.load(Ordering::Relaxed) {
            return true;
        }

        let mut con = self.manager.clone();
        let start = Instant::now();
        let probe = tokio::time::timeout(
            self.probe_timeout,
            con.get::<_, Option<String>>("dummy"),
        )
        .await;

        match probe {
            Ok(Ok(_)) => {
                info!(query_ms = start.elapsed().as_millis(), "Token cache ready");
                self.ready.store(true, Ordering::Relaxed);
                true
            }
            Ok(Err(e)) => {
                warn!(error = %e, "Token cache readiness probe failed");
                false
            }
            Err(_) => {
                debug!(timeout_ms = self.probe_timeout.as_millis(), "Token cache probe too slow");
                false
            }
        }
    }

    async fn record_last_seen(&self, namespace: &str, app: &str) -> Result<()> {
        let mut con = self.manager.clone();
        let now = chrono::Utc::now().timestamp();
        let () = con
            .set_ex(last_seen_key(namespace, app), now, LAST_SEEN_TTL_SECS)
            .await?;
        debug!(namespace, app, now, "Updated last seen");
        Ok(())
    }

    async fn last_seen(&self) -> Result<LastSeen> {
        let mut con = self.manager.clone();
        let mut out = LastSeen::new();
        let mut cursor: u64 = 0;

        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(format!("{LAST_SEEN_PREFIX}*"))
                .arg("COUNT")
                .arg(SCAN_COUNT)
                .query_async(&mut con)
                .await?;

            for key in keys {
                let Some((namespace, app)) = parse_last_seen_key(&key) else {
                    continue;
                };
                let value: Option<String> = con.get(&key).await?;
                if let Some(ts) = value.and_then(|v| v.parse::<i64>().ok()) {
                    out.entry(namespace.to_string())
                        .or_default()
                        .insert(app.to_string(), ts);
                }
            }

            if next == 0 {
                break;
            }
            cursor = next;
        }
        Ok(out)
    }
}

/// Build the connection URL (`redis://` or `rediss://`) from settings
///
/// # Errors
///
/// Returns [`Error::Cache`] if the host does not form a valid URL.
pub fn connection_url(config: &RedisConfig) -> Result<Url> {
    let scheme = if config.tls { "rediss" } else { "redis" };
    let mut url = Url::parse(&format!("{scheme}://{}:{}", config.host, config.port))
        .map_err(|e| Error::Cache(format!("invalid cache address: {e}")))?;

    if let Some(username) = config.username.as_deref().filter(|u| !u.is_empty()) {
        url.set_username(username)
            .map_err(|()| Error::Cache("cannot set cache username".to_string()))?;
    }
    if let Some(password) = config.password.as_deref().filter(|p| !p.is_empty()) {
        url.set_password(Some(password))
            .map_err(|()| Error::Cache("cannot set cache password".to_string()))?;
    }
    Ok(url)
}

fn last_seen_key(namespace: &str, app: &str) -> String {
    format!("{LAST_SEEN_PREFIX}{namespace}:{app}")
}

fn parse_last_seen_key(key: &str) -> Option<(&str, &str)> {
    let rest = key.strip_prefix(LAST_SEEN_PREFIX)?;
    let (namespace, app) = rest.split_once(':')?;
    Some((namespace, app.split(':').next().unwrap_or(app)))
}
