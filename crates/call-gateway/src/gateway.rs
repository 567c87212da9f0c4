use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::cache::{CacheStore, DurableStore, SqliteStore};
use crate::clock::{Clock, SystemClock};
use crate::config::GatewayConfig;
use crate::error::{ConfigError, GatewayError, ProducerError};
use crate::limiter::RateLimiter;
use crate::retry::{RetryExecutor, RetryPolicy};

/// Snapshot of a gateway's cache and limiter state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayStats {
    pub name: String,
    pub cache_hits: u64,
    pub cache_misses: u64,
    /// Producer invocations, retries included.
    pub producer_calls: u64,
    pub memory_entries: usize,
    pub calls_in_window: usize,
    pub max_calls: usize,
    pub window: Duration,
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    producer_calls: AtomicU64,
}

/// Rate-limited, cached, retrying entry point for downstream calls.
///
/// Owns its limiter and cache. Share one instance per downstream provider
/// by handing out `Arc<Gateway>`; independent gateways never interfere.
pub struct Gateway {
    name: String,
    cache: CacheStore,
    limiter: Arc<RateLimiter>,
    executor: RetryExecutor,
    default_policy: RetryPolicy,
    default_ttl: Duration,
    counters: Counters,
}

impl Gateway {
    pub fn builder() -> GatewayBuilder {
        GatewayBuilder::default()
    }

    /// Memory-only gateway on the system clock.
    pub fn new(config: GatewayConfig) -> Result<Self, ConfigError> {
        Self::builder().config(config).build()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn default_policy(&self) -> &RetryPolicy {
        &self.default_policy
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Return the cached value for `key`, or run `producer` under the default
    /// retry policy and cache its result for `ttl`.
    pub async fn fetch<T, F, Fut>(&self, key: &str, ttl: Duration, producer: F) -> Result<T, GatewayError>
    where
        T: Serialize + DeserializeOwned,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ProducerError>>,
    {
        self.fetch_with_policy(key, ttl, &self.default_policy, producer).await
    }

    /// `fetch` with an explicit retry policy.
    ///
    /// A hit consumes no permit. Failures are never cached. Concurrent misses
    /// on the same key each run the producer; the last write wins.
    pub async fn fetch_with_policy<T, F, Fut>(
        &self,
        key: &str,
        ttl: Duration,
        policy: &RetryPolicy,
        mut producer: F,
    ) -> Result<T, GatewayError>
    where
        T: Serialize + DeserializeOwned,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ProducerError>>,
    {
        if let Some(cached) = self.cache.get(key, ttl).await {
            match serde_json::from_value::<T>(cached) {
                Ok(value) => {
                    self.counters.hits.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(gateway = %self.name, key, "Cache hit");
                    return Ok(value);
                }
                Err(e) => {
                    tracing::warn!(gateway = %self.name, key, error = %e, "Cached value does not decode, refetching");
                }
            }
        }
        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(gateway = %self.name, key, "Cache miss");

        let counters = &self.counters;
        let value = self
            .executor
            .execute(key, policy, || {
                counters.producer_calls.fetch_add(1, Ordering::Relaxed);
                producer()
            })
            .await?;

        match serde_json::to_value(&value) {
            Ok(json) => self.cache.put(key, json, ttl).await,
            Err(e) => tracing::warn!(gateway = %self.name, key, error = %e, "Value not cacheable, returning uncached"),
        }

        Ok(value)
    }

    /// Drop `key` from both cache tiers.
    pub async fn invalidate(&self, key: &str) {
        self.cache.remove(key).await;
    }

    /// Drop expired in-process entries; returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        self.cache.purge_expired()
    }

    pub async fn stats(&self) -> GatewayStats {
        GatewayStats {
            name: self.name.clone(),
            cache_hits: self.counters.hits.load(Ordering::Relaxed),
            cache_misses: self.counters.misses.load(Ordering::Relaxed),
            producer_calls: self.counters.producer_calls.load(Ordering::Relaxed),
            memory_entries: self.cache.len(),
            calls_in_window: self.limiter.in_window().await,
            max_calls: self.limiter.max_calls(),
            window: self.limiter.window(),
        }
    }
}

/// Builder for [`Gateway`]. Defaults: `GatewayConfig::default()`, system clock,
/// no durable tier.
pub struct GatewayBuilder {
    name: String,
    config: GatewayConfig,
    clock: Option<Arc<dyn Clock>>,
    durable: Option<Arc<dyn DurableStore>>,
}

impl Default for GatewayBuilder {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            config: GatewayConfig::default(),
            clock: None,
            durable: None,
        }
    }
}

impl GatewayBuilder {
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn config(mut self, config: GatewayConfig) -> Self {
        self.config = config;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn durable_store(mut self, store: Arc<dyn DurableStore>) -> Self {
        self.durable = Some(store);
        self
    }

    /// Open the SQLite store named by `config.durable_cache_url`, if any.
    /// An unreachable store is logged and the gateway runs memory-only.
    pub async fn connect_durable(mut self) -> Self {
        if self.durable.is_some() {
            return self;
        }
        if let Some(url) = self.config.durable_cache_url.clone() {
            match SqliteStore::connect(&url).await {
                Ok(store) => self.durable = Some(Arc::new(store)),
                Err(e) => {
                    tracing::warn!(gateway = %self.name, url = %url, error = %e, "Durable cache unavailable, continuing in-process only")
                }
            }
        }
        self
    }

    pub fn build(self) -> Result<Gateway, ConfigError> {
        self.config.validate()?;

        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock::new()));
        let limiter = Arc::new(RateLimiter::new(&self.config.limiter, clock.clone()));

        tracing::info!(
            gateway = %self.name,
            max_calls = self.config.limiter.max_calls,
            window_secs = self.config.limiter.window.as_secs_f64(),
            durable = self.durable.is_some(),
            "Gateway ready"
        );

        Ok(Gateway {
            name: self.name,
            cache: CacheStore::new(clock.clone(), self.durable),
            executor: RetryExecutor::new(limiter.clone(), clock),
            limiter,
            default_policy: self.config.retry,
            default_ttl: self.config.default_ttl,
            counters: Counters::default(),
        })
    }
}
