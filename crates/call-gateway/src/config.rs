use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;
use crate::retry::RetryPolicy;

/// Rate limiter settings: at most `max_calls` per rolling `window`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LimiterConfig {
    pub max_calls: usize,
    pub window: Duration,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        // Polygon Starter plan allowance.
        Self {
            max_calls: 500,
            window: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub limiter: LimiterConfig,
    /// Policy used by `Gateway::fetch` when the caller passes none.
    pub retry: RetryPolicy,
    /// TTL for callers that do not pick a class-specific one.
    pub default_ttl: Duration,
    /// SQLite URL of the durable tier; `None` keeps the cache in-process only.
    pub durable_cache_url: Option<String>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            limiter: LimiterConfig::default(),
            retry: RetryPolicy::default(),
            default_ttl: Duration::from_secs(300),
            durable_cache_url: None,
        }
    }
}

impl GatewayConfig {
    /// Read overrides from `<PREFIX>_*` environment variables. Unset variables
    /// keep their defaults.
    pub fn from_env(prefix: &str) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let max_calls = env_or(prefix, "RATE_LIMIT", defaults.limiter.max_calls)?;
        let window_secs = env_or(prefix, "RATE_WINDOW_SECS", defaults.limiter.window.as_secs_f64())?;
        let max_attempts = env_or(prefix, "MAX_ATTEMPTS", defaults.retry.max_attempts)?;
        let base_ms = env_or(prefix, "RETRY_BASE_MS", defaults.retry.base_delay.as_millis() as u64)?;
        let max_ms = env_or(prefix, "RETRY_MAX_MS", defaults.retry.max_delay.as_millis() as u64)?;
        let ttl_secs = env_or(prefix, "CACHE_TTL_SECS", defaults.default_ttl.as_secs())?;
        let durable_cache_url = env::var(format!("{}_CACHE_DB", prefix))
            .ok()
            .filter(|v| !v.trim().is_empty());

        let window = match Duration::try_from_secs_f64(window_secs) {
            Ok(window) if !window.is_zero() => window,
            _ => {
                return Err(ConfigError::Invalid {
                    field: "limiter.window",
                    requirement: "a positive, representable number of seconds",
                })
            }
        };

        let config = Self {
            limiter: LimiterConfig { max_calls, window },
            retry: defaults
                .retry
                .with_max_attempts(max_attempts)
                .with_base_delay(Duration::from_millis(base_ms))
                .with_max_delay(Duration::from_millis(max_ms)),
            default_ttl: Duration::from_secs(ttl_secs),
            durable_cache_url,
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.limiter.max_calls == 0 {
            return Err(ConfigError::Invalid {
                field: "limiter.max_calls",
                requirement: "at least 1",
            });
        }
        if self.limiter.window.is_zero() {
            return Err(ConfigError::Invalid {
                field: "limiter.window",
                requirement: "greater than zero",
            });
        }
        self.retry.validate()
    }
}

fn env_or<T: FromStr>(prefix: &str, suffix: &str, default: T) -> Result<T, ConfigError> {
    let name = format!("{}_{}", prefix, suffix);
    match env::var(&name) {
        Ok(value) => value.trim().parse().map_err(|_| ConfigError::Env { name, value }),
        Err(_) => Ok(default),
    }
}
