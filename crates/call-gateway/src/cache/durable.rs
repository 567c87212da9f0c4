//! Durable cache tier: survives process restarts.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::FromRow;
use std::str::FromStr;

use crate::error::CacheError;

/// A row read back from the durable tier.
#[derive(Debug, Clone, PartialEq)]
pub struct DurableEntry {
    pub value: Value,
    pub stored_at: DateTime<Utc>,
}

/// Keyed store with insertion timestamps.
#[async_trait]
pub trait DurableStore: Send + Sync {
    /// Entry for `key` stored strictly after `not_before`, if any.
    async fn get(&self, key: &str, not_before: DateTime<Utc>) -> Result<Option<DurableEntry>, CacheError>;

    /// Insert or replace the entry for `key`.
    async fn put(&self, key: &str, value: &Value, stored_at: DateTime<Utc>) -> Result<(), CacheError>;

    async fn remove(&self, key: &str) -> Result<(), CacheError>;

    fn backend_name(&self) -> &'static str;
}

#[derive(Debug, FromRow)]
struct CacheRow {
    payload: String,
    timestamp: i64,
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS gateway_cache (
    cache_key TEXT PRIMARY KEY NOT NULL,
    payload TEXT NOT NULL,
    timestamp INTEGER NOT NULL
)
"#;

/// SQLite-backed durable tier. Timestamps are epoch milliseconds.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (creating if missing) the database at `database_url` and ensure the schema.
    pub async fn connect(database_url: &str) -> Result<Self, CacheError> {
        let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);

        // Every connection to an in-memory database is a separate database,
        // so keep exactly one and never recycle it.
        let pool = if database_url.contains(":memory:") {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(5)
        }
        .connect_with(options)
        .await?;

        Self::from_pool(pool).await
    }

    /// Reuse an existing pool; the cache table is created if absent.
    pub async fn from_pool(pool: SqlitePool) -> Result<Self, CacheError> {
        sqlx::query(SCHEMA).execute(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Delete rows stored at or before `cutoff`; returns rows removed.
    pub async fn purge_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, CacheError> {
        let result = sqlx::query("DELETE FROM gateway_cache WHERE timestamp <= ?")
            .bind(cutoff.timestamp_millis())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl DurableStore for SqliteStore {
    async fn get(&self, key: &str, not_before: DateTime<Utc>) -> Result<Option<DurableEntry>, CacheError> {
        let row: Option<CacheRow> = sqlx::query_as(
            r#"
            SELECT payload, timestamp
            FROM gateway_cache
            WHERE cache_key = ? AND timestamp > ?
            "#,
        )
        .bind(key)
        .bind(not_before.timestamp_millis())
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let value: Value = serde_json::from_str(&row.payload)?;
        let stored_at = DateTime::from_timestamp_millis(row.timestamp).unwrap_or(not_before);
        Ok(Some(DurableEntry { value, stored_at }))
    }

    async fn put(&self, key: &str, value: &Value, stored_at: DateTime<Utc>) -> Result<(), CacheError> {
        let payload = serde_json::to_string(value)?;

        sqlx::query(
            r#"
            INSERT INTO gateway_cache (cache_key, payload, timestamp)
            VALUES (?, ?, ?)
            ON CONFLICT(cache_key) DO UPDATE SET
                payload = excluded.payload,
                timestamp = excluded.timestamp
            "#,
        )
        .bind(key)
        .bind(&payload)
        .bind(stored_at.timestamp_millis())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), CacheError> {
        sqlx::query("DELETE FROM gateway_cache WHERE cache_key = ?")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "sqlite"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    async fn store() -> SqliteStore {
        SqliteStore::connect("sqlite::memory:").await.unwrap()
    }

    #[tokio::test]
    async fn test_put_then_get() {
        let store = store().await;
        let now = Utc::now();

        store.put("peers:AAPL", &json!(["MSFT", "GOOGL"]), now).await.unwrap();

        let entry = store
            .get("peers:AAPL", now - Duration::minutes(5))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(entry.value, json!(["MSFT", "GOOGL"]));
        assert_eq!(entry.stored_at.timestamp_millis(), now.timestamp_millis());
    }

    #[tokio::test]
    async fn test_rows_older_than_cutoff_are_filtered() {
        let store = store().await;
        let stored_at = Utc::now() - Duration::hours(2);

        store.put("k", &json!(1), stored_at).await.unwrap();

        assert!(store.get("k", Utc::now() - Duration::hours(1)).await.unwrap().is_none());
        assert!(store.get("k", Utc::now() - Duration::hours(3)).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_upsert_replaces_row() {
        let store = store().await;
        let earlier = Utc::now() - Duration::hours(2);
        let now = Utc::now();

        store.put("k", &json!("old"), earlier).await.unwrap();
        store.put("k", &json!("new"), now).await.unwrap();

        let entry = store.get("k", now - Duration::minutes(1)).await.unwrap().unwrap();
        assert_eq!(entry.value, json!("new"));

        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM gateway_cache")
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn test_remove_and_purge() {
        let store = store().await;
        let now = Utc::now();

        store.put("a", &json!(1), now - Duration::days(2)).await.unwrap();
        store.put("b", &json!(2), now).await.unwrap();
        store.put("c", &json!(3), now).await.unwrap();

        assert_eq!(store.purge_older_than(now - Duration::days(1)).await.unwrap(), 1);
        store.remove("b").await.unwrap();

        let far_past = now - Duration::days(30);
        assert!(store.get("a", far_past).await.unwrap().is_none());
        assert!(store.get("b", far_past).await.unwrap().is_none());
        assert!(store.get("c", far_past).await.unwrap().is_some());
    }
}
