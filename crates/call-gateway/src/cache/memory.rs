use dashmap::DashMap;
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::clock::Clock;

/// Internal cache entry with insertion time. `aged` is how old the value
/// already was when it entered this tier.
#[derive(Debug, Clone)]
struct CacheEntry {
    value: Value,
    stored_at: Instant,
    aged: Duration,
    ttl: Duration,
}

impl CacheEntry {
    fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.stored_at).saturating_add(self.aged)
    }

    fn is_fresh(&self, now: Instant) -> bool {
        self.age(now) < self.ttl
    }
}

/// In-process tier. Expired entries read as misses and stay until the next
/// `put` for the same key or an explicit `purge_expired`.
pub struct MemoryCache {
    entries: DashMap<String, CacheEntry>,
    clock: Arc<dyn Clock>,
}

impl MemoryCache {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            clock,
        }
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        let entry = self.entries.get(key)?;
        if entry.is_fresh(self.clock.now()) {
            Some(entry.value.clone())
        } else {
            None
        }
    }

    /// Like `get`, but the entry must also be younger than `max_age`.
    pub fn get_within(&self, key: &str, max_age: Duration) -> Option<Value> {
        let entry = self.entries.get(key)?;
        let now = self.clock.now();
        if entry.is_fresh(now) && entry.age(now) < max_age {
            Some(entry.value.clone())
        } else {
            None
        }
    }

    pub fn put(&self, key: &str, value: Value, ttl: Duration) {
        self.restore(key, value, ttl, Duration::ZERO);
    }

    /// Insert a value that is already `age` old, e.g. one read back from the
    /// durable tier. It expires once `age` plus time spent here reaches `ttl`.
    pub fn restore(&self, key: &str, value: Value, ttl: Duration, age: Duration) {
        self.entries.insert(
            key.to_string(),
            CacheEntry {
                value,
                stored_at: self.clock.now(),
                aged: age,
                ttl,
            },
        );
    }

    pub fn remove(&self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    /// Drop expired entries; returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.is_fresh(now));
        before.saturating_sub(self.entries.len())
    }

    /// Entries currently held, fresh or not.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use serde_json::json;

    #[test]
    fn test_ttl_boundary() {
        let clock = ManualClock::new();
        let cache = MemoryCache::new(Arc::new(clock.clone()));
        let ttl = Duration::from_secs(10);
        let epsilon = Duration::from_millis(1);

        cache.put("prev_close:AAPL", json!(189.5), ttl);

        clock.advance(ttl - epsilon);
        assert_eq!(cache.get("prev_close:AAPL"), Some(json!(189.5)));

        clock.advance(epsilon * 2);
        assert_eq!(cache.get("prev_close:AAPL"), None);
    }

    #[test]
    fn test_stale_entry_overwritten_by_put() {
        let clock = ManualClock::new();
        let cache = MemoryCache::new(Arc::new(clock.clone()));

        cache.put("k", json!(1), Duration::from_secs(1));
        clock.advance(Duration::from_secs(2));
        assert_eq!(cache.get("k"), None);
        assert_eq!(cache.len(), 1);

        cache.put("k", json!(2), Duration::from_secs(1));
        assert_eq!(cache.get("k"), Some(json!(2)));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_get_within_bounds_age_by_caller() {
        let clock = ManualClock::new();
        let cache = MemoryCache::new(Arc::new(clock.clone()));

        cache.put("k", json!(1), Duration::from_secs(3600));
        clock.advance(Duration::from_secs(120));

        assert_eq!(cache.get("k"), Some(json!(1)));
        assert_eq!(cache.get_within("k", Duration::from_secs(60)), None);
        assert_eq!(cache.get_within("k", Duration::from_secs(300)), Some(json!(1)));
    }

    #[test]
    fn test_restored_entry_keeps_its_age() {
        let clock = ManualClock::new();
        let cache = MemoryCache::new(Arc::new(clock.clone()));

        cache.restore("k", json!(1), Duration::from_secs(60), Duration::from_secs(50));
        assert_eq!(cache.get("k"), Some(json!(1)));
        assert_eq!(cache.get_within("k", Duration::from_secs(30)), None);

        clock.advance(Duration::from_secs(10));
        assert_eq!(cache.get("k"), None);
    }

    #[test]
    fn test_purge_expired() {
        let clock = ManualClock::new();
        let cache = MemoryCache::new(Arc::new(clock.clone()));

        cache.put("short", json!("a"), Duration::from_secs(1));
        cache.put("long", json!("b"), Duration::from_secs(60));
        clock.advance(Duration::from_secs(5));

        assert_eq!(cache.purge_expired(), 1);
        assert_eq!(cache.len(), 1);
        assert!(cache.get("long").is_some());
        assert!(cache.remove("long"));
        assert!(cache.is_empty());
    }
}
