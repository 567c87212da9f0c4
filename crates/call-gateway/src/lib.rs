//! Rate-limited, cached, retrying gateway for downstream API calls.
//!
//! ```rust,no_run
//! use call_gateway::{http, CacheKey, Gateway, GatewayConfig};
//! use std::time::Duration;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let gateway = Gateway::builder()
//!     .name("polygon")
//!     .config(GatewayConfig::from_env("POLYGON")?)
//!     .build()?;
//!
//! let client = reqwest::Client::new();
//! let key = CacheKey::new("prev_close").param("AAPL");
//! let body: serde_json::Value = gateway
//!     .fetch(key.as_str(), Duration::from_secs(300), || {
//!         http::send_json(client.get("https://api.polygon.io/v2/aggs/ticker/AAPL/prev"))
//!     })
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod clock;
pub mod config;
pub mod error;
pub mod gateway;
pub mod http;
pub mod key;
pub mod limiter;
pub mod retry;

pub use cache::{DurableStore, SqliteStore};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{GatewayConfig, LimiterConfig};
pub use error::{CacheError, ConfigError, GatewayError, ProducerError};
pub use gateway::{Gateway, GatewayBuilder, GatewayStats};
pub use key::CacheKey;
pub use limiter::{Permit, RateLimiter};
pub use retry::{Backoff, RetryExecutor, RetryPolicy};
