//! Token store: cache of exchanged access tokens
//!
//! The [`TokenStore`] trait abstracts over storage backends. Keys are the
//! target alias for service tokens and the alias followed by the inbound
//! token for on-behalf-of tokens. Writers decide the TTL; readers only see
//! live entries.

use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;
use tracing::debug;

use super::LastSeen;
use crate::Result;

/// Trait abstracting the token cache backend.
///
/// Implementations must be `Send + Sync` because the store is shared
/// across request tasks.
#[async_trait::async_trait]
pub trait TokenStore: Send + Sync + 'static {
    /// Cached token for `key`, `None` on miss or expiry
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Cache `token` under `key` for `ttl`, overwriting any previous entry
    async fn put(&self, key: &str, token: &str, ttl: Duration) -> Result<()>;

    /// Whether the backend is reachable
    async fn is_ready(&self) -> bool;

    /// Note that `app` in `namespace` was just called
    async fn record_last_seen(&self, namespace: &str, app: &str) -> Result<()>;

    /// Last call time per app
    async fn last_seen(&self) -> Result<LastSeen>;
}

struct CachedToken {
    token: String,
    expires_at: Instant,
}

/// In-process token store backed by a `DashMap`
///
/// An entry is served only while more than `read_margin` of its lifetime
/// remains, so a token handed out is never about to expire in flight.
pub struct MemoryTokenStore {
    entries: DashMap<String, CachedToken>,
    last_seen: DashMap<(String, String), i64>,
    read_margin: Duration,
}

impl MemoryTokenStore {
    /// Create an empty store
    pub fn new(read_margin: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            last_seen: DashMap::new(),
            read_margin,
        }
    }

    /// Number of cached entries, expired ones included
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the store holds no entries
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for MemoryTokenStore {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

#[async_trait::async_trait]
impl TokenStore for MemoryTokenStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let Some(entry) = self.entries.get(key) else {
            return Ok(None);
        };

        let remaining = entry.expires_at.saturating_duration_since(Instant::now());
        if remaining > self.read_margin {
            return Ok(Some(entry.token.clone()));
        }

        drop(entry);
        // a fresh token written since the check above must survive
        let evicted = self.entries.remove_if(key, |_, cached| {
            cached.expires_at.saturating_duration_since(Instant::now()) <= self.read_margin
        });
        if evicted.is_some() {
            debug!(remaining_ms = remaining.as_millis(), "Evicted token close to expiry");
        }
        Ok(None)
    }

    async fn put(&self, key: &str, token: &str, ttl: Duration) -> Result<()> {
        self.entries.insert(
            key.to_string(),
            CachedToken {
                token: token.to_string(),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn is_ready(&self) -> bool {
        true
    }

    async fn record_last_seen(&self, namespace: &str, app: &str) -> Result<()> {
        self.last_seen.insert(
            (namespace.to_string(), app.to_string()),
            chrono::Utc::now().timestamp(),
        );
        Ok(())
    }

    async fn last_seen(&self) -> Result<LastSeen> {
        let mut out = LastSeen::new();
        for entry in &self.last_seen {
            let (namespace, app) = entry.key();
            out.entry(namespace.clone())
                .or_default()
                .insert(app.clone(), *entry.value());
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn entry_is_served_until_read_margin() {
        // GIVEN: a token cached for 60 s with a 10 s read margin
        let store = MemoryTokenStore::new(Duration::from_secs(10));
        store.put("alias", "tok", Duration::from_secs(60)).await.unwrap();

        // WHEN: 49 s pass, 11 s remain
        tokio::time::advance(Duration::from_secs(49)).await;

        // THEN: still served
        assert_eq!(store.get("alias").await.unwrap().as_deref(), Some("tok"));

        // WHEN: one more second passes, 10 s remain
        tokio::time::advance(Duration::from_secs(1)).await;

        // THEN: treated as a miss and evicted
        assert_eq!(store.get("alias").await.unwrap(), None);
        assert!(store.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn short_ttl_is_never_served() {
        let store = MemoryTokenStore::default();
        store.put("k", "t", Duration::from_secs(5)).await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn put_overwrites() {
        let store = MemoryTokenStore::default();
        store.put("k", "old", Duration::from_secs(3600)).await.unwrap();
        store.put("k", "new", Duration::from_secs(3600)).await.unwrap();

        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("new"));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn eviction_never_drops_a_concurrent_fresh_write() {
        let store = std::sync::Arc::new(MemoryTokenStore::default());

        for _ in 0..200 {
            // GIVEN: a stale entry
            store.put("k", "stale", Duration::ZERO).await.unwrap();

            // WHEN: a reader evicts it while a writer replaces it
            let reader = tokio::spawn({
                let store = std::sync::Arc::clone(&store);
                async move { store.get("k").await.unwrap() }
            });
            let writer = tokio::spawn({
                let store = std::sync::Arc::clone(&store);
                async move { store.put("k", "fresh", Duration::from_secs(3600)).await.unwrap() }
            });
            let seen = reader.await.unwrap();
            writer.await.unwrap();

            // THEN: the reader saw either outcome, the fresh token stays
            assert!(seen.is_none() || seen.as_deref() == Some("fresh"));
            assert_eq!(store.get("k").await.unwrap().as_deref(), Some("fresh"));
        }
    }

    #[tokio::test]
    async fn miss_on_unknown_key() {
        let store = MemoryTokenStore::default();
        assert_eq!(store.get("nope").await.unwrap(), None);
        assert!(store.is_ready().await);
    }

    #[tokio::test]
    async fn last_seen_groups_by_namespace() {
        let store = MemoryTokenStore::default();
        store.record_last_seen("teamcrm", "sf-arkiv").await.unwrap();
        store.record_last_seen("teamcrm", "sf-henvendelse").await.unwrap();
        store.record_last_seen("teamnks", "sf-arkiv").await.unwrap();

        let seen = store.last_seen().await.unwrap();

        assert_eq!(seen.len(), 2);
        assert_eq!(seen["teamcrm"].len(), 2);
        assert!(seen["teamnks"]["sf-arkiv"] > 0);
    }
}
