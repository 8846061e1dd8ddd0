//! Time-bounded cache of service-account access tokens.

use crate::client::KeycloakClient;
use crate::error::KeycloakResult;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct CachedServiceToken {
    pub access_token: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl CachedServiceToken {
    /// `None` unless `ttl_seconds` is positive and the expiry is representable.
    pub fn new(access_token: String, ttl_seconds: i64) -> Option<Self> {
        if ttl_seconds <= 0 {
            return None;
        }
        let created_at = Utc::now();
        let expires_at = Duration::try_seconds(ttl_seconds)
            .and_then(|ttl| created_at.checked_add_signed(ttl))?;

        Some(Self {
            access_token,
            created_at,
            expires_at,
        })
    }

    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }
}

/// Cache lifetime for a token the provider says lives `expires_in` seconds.
pub fn safe_ttl_seconds(expires_in: u64, ratio: f64) -> i64 {
    (expires_in as f64 * ratio).floor() as i64
}

/// Storage for cached service tokens, keyed by user id.
#[async_trait]
pub trait TokenStore: Send + Sync {
    /// Returns the token for `user_id` unless it is missing or expired.
    async fn get(&self, user_id: &str) -> KeycloakResult<Option<CachedServiceToken>>;

    async fn insert(&self, user_id: &str, token: CachedServiceToken) -> KeycloakResult<()>;

    async fn cleanup_expired(&self) -> KeycloakResult<usize>;
}

#[derive(Default)]
pub struct InMemoryTokenStore {
    tokens: DashMap<String, CachedServiceToken>,
}

impl InMemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TokenStore for InMemoryTokenStore {
    async fn get(&self, user_id: &str) -> KeycloakResult<Option<CachedServiceToken>> {
        // Expired entries are evicted on read
        let removed = self
            .tokens
            .remove_if(user_id, |_, token| token.is_expired());
        if removed.is_some() {
            debug!(user_id, "Evicted expired service token");
            return Ok(None);
        }

        Ok(self.tokens.get(user_id).map(|entry| entry.value().clone()))
    }

    async fn insert(&self, user_id: &str, token: CachedServiceToken) -> KeycloakResult<()> {
        self.tokens.insert(user_id.to_string(), token);
        Ok(())
    }

    async fn cleanup_expired(&self) -> KeycloakResult<usize> {
        let before = self.tokens.len();
        self.tokens.retain(|_, token| !token.is_expired());
        Ok(before.saturating_sub(self.tokens.len()))
    }
}

/// Hands out service-account tokens per user, fetching on a cache miss.
///
/// Concurrent misses for the same user may each fetch; the last write wins.
#[derive(Clone)]
pub struct ServiceTokenCache {
    client: KeycloakClient,
    store: Arc<dyn TokenStore>,
    ttl_ratio: f64,
}

impl ServiceTokenCache {
    pub fn new(client: KeycloakClient, store: Arc<dyn TokenStore>) -> Self {
        let ttl_ratio = client.config().service_token_ttl_ratio;
        Self {
            client,
            store,
            ttl_ratio,
        }
    }

    pub fn store(&self) -> &Arc<dyn TokenStore> {
        &self.store
    }

    /// Returns a service token for `user_id`.
    ///
    /// `Ok(None)` means the provider did not issue a token with a lifetime;
    /// configuration problems are errors. A lifetime too short or too large
    /// to cache still yields the token.
    pub async fn get_or_fetch_service_token(&self, user_id: &str) -> KeycloakResult<Option<String>> {
        if let Some(cached) = self.store.get(user_id).await? {
            info!(user_id, "Service user access token retrieved from cache");
            return Ok(Some(cached.access_token));
        }

        let fetched = self.client.fetch_service_user_access_token().await?;
        let (Some(access_token), Some(expires_in)) = (fetched.access_token, fetched.expires_in)
        else {
            debug!(user_id, "No service user access token with a lifetime");
            return Ok(None);
        };

        let ttl = safe_ttl_seconds(expires_in, self.ttl_ratio);
        match CachedServiceToken::new(access_token.clone(), ttl) {
            Some(cached) => {
                self.store.insert(user_id, cached).await?;
                debug!(user_id, ttl_seconds = ttl, "Cached service user access token");
            }
            None => warn!(user_id, expires_in, "Service token lifetime is not cacheable"),
        }

        Ok(Some(access_token))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_safe_ttl_rounds_down() {
        assert_eq!(safe_ttl_seconds(1000, 0.9), 900);
        assert_eq!(safe_ttl_seconds(299, 0.9), 269);
        assert_eq!(safe_ttl_seconds(1, 0.9), 0);
        assert_eq!(safe_ttl_seconds(300, 0.5), 150);
    }

    #[test]
    fn test_uncacheable_lifetimes() {
        assert!(CachedServiceToken::new("t".to_string(), 0).is_none());
        assert!(CachedServiceToken::new("t".to_string(), -5).is_none());
        assert!(CachedServiceToken::new("t".to_string(), i64::MAX).is_none());
        assert!(CachedServiceToken::new("t".to_string(), safe_ttl_seconds(u64::MAX, 0.9)).is_none());
        // Past the representable date range but within Duration bounds
        assert!(CachedServiceToken::new("t".to_string(), 10_000_000_000_000).is_none());

        let cached = CachedServiceToken::new("t".to_string(), 900).unwrap();
        assert_eq!(cached.expires_at - cached.created_at, Duration::seconds(900));
    }

    #[tokio::test]
    async fn test_in_memory_token_store() {
        let store = InMemoryTokenStore::new();
        store
            .insert("user-1", CachedServiceToken::new("token".to_string(), 60).unwrap())
            .await
            .unwrap();

        let cached = store.get("user-1").await.unwrap().unwrap();
        assert_eq!(cached.access_token, "token");
        assert!(store.get("user-2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_expired_tokens_are_not_returned() {
        let store = InMemoryTokenStore::new();
        let mut token = CachedServiceToken::new("stale".to_string(), 60).unwrap();
        token.expires_at = Utc::now() - Duration::seconds(1);
        store.insert("user-1", token).await.unwrap();

        assert!(store.get("user-1").await.unwrap().is_none());
        assert_eq!(store.cleanup_expired().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_expired_token_cleanup() {
        let store = InMemoryTokenStore::new();
        let mut token = CachedServiceToken::new("stale".to_string(), 60).unwrap();
        token.expires_at = Utc::now() - Duration::minutes(1);
        store.insert("stale-user", token).await.unwrap();
        store
            .insert("fresh-user", CachedServiceToken::new("fresh".to_string(), 60).unwrap())
            .await
            .unwrap();

        assert_eq!(store.cleanup_expired().await.unwrap(), 1);
        assert!(store.get("fresh-user").await.unwrap().is_some());
    }
}
