//! Two-tier cache: in-process map in front of an optional durable store.

pub mod durable;
pub mod memory;

pub use durable::{DurableEntry, DurableStore, SqliteStore};
pub use memory::MemoryCache;

use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

use crate::clock::Clock;

pub struct CacheStore {
    memory: MemoryCache,
    durable: Option<Arc<dyn DurableStore>>,
    clock: Arc<dyn Clock>,
}

impl CacheStore {
    pub fn new(clock: Arc<dyn Clock>, durable: Option<Arc<dyn DurableStore>>) -> Self {
        Self {
            memory: MemoryCache::new(clock.clone()),
            durable,
            clock,
        }
    }

    pub fn has_durable_tier(&self) -> bool {
        self.durable.is_some()
    }

    /// Look up `key`, memory first. Either tier only answers with a value
    /// younger than `ttl`, and the memory tier also honours the TTL the entry
    /// was written with. A durable hit is copied back into memory with its
    /// age preserved. Durable failures are logged and read as a miss.
    pub async fn get(&self, key: &str, ttl: Duration) -> Option<Value> {
        if let Some(value) = self.memory.get_within(key, ttl) {
            return Some(value);
        }

        let durable = self.durable.as_ref()?;
        let wall = self.clock.wall();
        let max_age = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
        let not_before = wall.checked_sub_signed(max_age).unwrap_or(chrono::DateTime::<chrono::Utc>::MIN_UTC);

        match durable.get(key, not_before).await {
            Ok(Some(entry)) => {
                let age = (wall - entry.stored_at).to_std().unwrap_or(Duration::ZERO);
                if age < ttl {
                    self.memory.restore(key, entry.value.clone(), ttl, age);
                }
                tracing::debug!(key, backend = durable.backend_name(), "Durable cache hit");
                Some(entry.value)
            }
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(key, backend = durable.backend_name(), error = %e, "Durable cache unavailable, treating as miss");
                None
            }
        }
    }

    /// Store in memory and, when configured, in the durable tier.
    pub async fn put(&self, key: &str, value: Value, ttl: Duration) {
        if let Some(durable) = &self.durable {
            if let Err(e) = durable.put(key, &value, self.clock.wall()).await {
                tracing::warn!(key, backend = durable.backend_name(), error = %e, "Durable cache write failed");
            }
        }
        self.memory.put(key, value, ttl);
    }

    pub async fn remove(&self, key: &str) {
        self.memory.remove(key);
        if let Some(durable) = &self.durable {
            if let Err(e) = durable.remove(key).await {
                tracing::warn!(key, backend = durable.backend_name(), error = %e, "Durable cache delete failed");
            }
        }
    }

    pub fn purge_expired(&self) -> usize {
        self.memory.purge_expired()
    }

    /// Entries held by the in-process tier.
    pub fn len(&self) -> usize {
        self.memory.len()
    }

    pub fn is_empty(&self) -> bool {
        self.memory.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::error::CacheError;
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use serde_json::json;

    struct UnreachableStore;

    #[async_trait]
    impl DurableStore for UnreachableStore {
        async fn get(&self, _key: &str, _not_before: DateTime<Utc>) -> Result<Option<DurableEntry>, CacheError> {
            Err(CacheError::Unavailable(sqlx::Error::PoolClosed))
        }

        async fn put(&self, _key: &str, _value: &Value, _stored_at: DateTime<Utc>) -> Result<(), CacheError> {
            Err(CacheError::Unavailable(sqlx::Error::PoolClosed))
        }

        async fn remove(&self, _key: &str) -> Result<(), CacheError> {
            Err(CacheError::Unavailable(sqlx::Error::PoolClosed))
        }

        fn backend_name(&self) -> &'static str {
            "unreachable"
        }
    }

    #[tokio::test]
    async fn test_durable_hit_survives_restart_and_repopulates_memory() {
        let clock = ManualClock::new();
        let store: Arc<dyn DurableStore> = Arc::new(SqliteStore::connect("sqlite::memory:").await.unwrap());
        let ttl = Duration::from_secs(600);

        let first = CacheStore::new(Arc::new(clock.clone()), Some(store.clone()));
        first.put("search:apple", json!(["AAPL"]), ttl).await;

        clock.advance(Duration::from_secs(100));

        // A fresh process: empty memory tier, same durable store.
        let second = CacheStore::new(Arc::new(clock.clone()), Some(store));
        assert!(second.is_empty());
        assert_eq!(second.get("search:apple", ttl).await, Some(json!(["AAPL"])));
        assert_eq!(second.len(), 1);

        // The copy in memory expires with the original entry, not a fresh TTL.
        clock.advance(Duration::from_secs(499));
        assert!(second.get("search:apple", ttl).await.is_some());
        clock.advance(Duration::from_secs(2));
        assert!(second.get("search:apple", ttl).await.is_none());
    }

    #[tokio::test]
    async fn test_both_tiers_honour_the_readers_ttl() {
        let clock = ManualClock::new();
        let store: Arc<dyn DurableStore> = Arc::new(SqliteStore::connect("sqlite::memory:").await.unwrap());

        let warm = CacheStore::new(Arc::new(clock.clone()), Some(store.clone()));
        warm.put("details:KO", json!({"sic": "2086"}), Duration::from_secs(3600)).await;
        clock.advance(Duration::from_secs(120));

        let cold = CacheStore::new(Arc::new(clock.clone()), Some(store));
        for cache in [&warm, &cold] {
            assert_eq!(cache.get("details:KO", Duration::from_secs(60)).await, None);
        }
        for cache in [&warm, &cold] {
            assert!(cache.get("details:KO", Duration::from_secs(3600)).await.is_some());
        }
    }

    #[tokio::test]
    async fn test_unavailable_durable_tier_degrades_to_memory() {
        let clock = ManualClock::new();
        let cache = CacheStore::new(Arc::new(clock), Some(Arc::new(UnreachableStore)));

        assert_eq!(cache.get("k", Duration::from_secs(60)).await, None);

        cache.put("k", json!(42), Duration::from_secs(60)).await;
        assert_eq!(cache.get("k", Duration::from_secs(60)).await, Some(json!(42)));

        cache.remove("k").await;
        assert_eq!(cache.get("k", Duration::from_secs(60)).await, None);
    }

    #[tokio::test]
    async fn test_memory_only_store() {
        let clock = ManualClock::new();
        let cache = CacheStore::new(Arc::new(clock.clone()), None);
        assert!(!cache.has_durable_tier());

        cache.put("k", json!("v"), Duration::from_secs(1)).await;
        clock.advance(Duration::from_secs(2));
        assert_eq!(cache.get("k", Duration::from_secs(1)).await, None);
        assert_eq!(cache.purge_expired(), 1);
    }
}
