//! Store backend dispatch: local DashMap or Redis.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use deadpool_redis::Pool;
use redis::AsyncCommands;

use super::local::LocalStore;

/// Errors raised by the ephemeral store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// No connection could be obtained from the pool.
    #[error("ephemeral store unavailable: {0}")]
    Unavailable(String),

    #[error("ephemeral store command failed: {0}")]
    Command(#[from] redis::RedisError),

    #[error("key '{key}' holds a value of the wrong type")]
    WrongType { key: String },

    #[error("invalid key pattern '{pattern}': {message}")]
    Pattern { pattern: String, message: String },
}

impl StoreError {
    #[must_use]
    pub fn wrong_type(key: impl Into<String>) -> Self {
        Self::WrongType { key: key.into() }
    }

    #[must_use]
    pub fn pattern(pattern: impl Into<String>, err: impl std::fmt::Display) -> Self {
        Self::Pattern {
            pattern: pattern.into(),
            message: err.to_string(),
        }
    }

    /// Returns `true` when the store itself could not be reached.
    #[must_use]
    pub fn is_unavailable(&self) -> bool {
        match self {
            Self::Unavailable(_) => true,
            Self::Command(e) => e.is_io_error() || e.is_connection_dropped() || e.is_timeout(),
            _ => false,
        }
    }
}

/// Ephemeral store used for quota counters and cached responses.
#[derive(Clone)]
pub enum EphemeralStore {
    /// Single instance: process-local map
    Local(Arc<LocalStore>),

    /// Multi-instance: Redis
    Redis {
        pool: Pool,
        /// COUNT hint passed to every SCAN call
        scan_batch: usize,
    },
}

impl std::fmt::Debug for EphemeralStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.mode())
    }
}

impl EphemeralStore {
    pub fn new_local() -> Self {
        EphemeralStore::Local(Arc::new(LocalStore::new()))
    }

    pub fn new_redis(pool: Pool, scan_batch: usize) -> Self {
        EphemeralStore::Redis {
            pool,
            scan_batch: scan_batch.max(1),
        }
    }

    pub fn mode(&self) -> &'static str {
        match self {
            EphemeralStore::Local(_) => "local",
            EphemeralStore::Redis { .. } => "redis",
        }
    }

    async fn connection(pool: &Pool) -> Result<deadpool_redis::Connection, StoreError> {
        pool.get()
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))
    }

    /// Atomically increments `key` and (re)sets its expiry to `deadline`.
    ///
    /// Both commands run in one MULTI/EXEC block, so a counter never exists
    /// without an expiry.
    pub async fn incr_expiring_at(
        &self,
        key: &str,
        deadline: DateTime<Utc>,
    ) -> Result<i64, StoreError> {
        match self {
            EphemeralStore::Local(store) => store.incr_expiring_at(key, deadline),
            EphemeralStore::Redis { pool, .. } => {
                let mut conn = Self::connection(pool).await?;
                let (count,): (i64,) = redis::pipe()
                    .atomic()
                    .incr(key, 1)
                    .expire_at(key, deadline.timestamp())
                    .ignore()
                    .query_async(&mut conn)
                    .await?;
                Ok(count)
            }
        }
    }

    pub async fn get_counter(&self, key: &str) -> Result<Option<i64>, StoreError> {
        match self {
            EphemeralStore::Local(store) => store.get_counter(key),
            EphemeralStore::Redis { pool, .. } => {
                let mut conn = Self::connection(pool).await?;
                let count: Option<i64> = conn.get(key).await?;
                Ok(count)
            }
        }
    }

    pub async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        match self {
            EphemeralStore::Local(store) => store.get(key),
            EphemeralStore::Redis { pool, .. } => {
                let mut conn = Self::connection(pool).await?;
                let data: Option<Vec<u8>> = conn.get(key).await?;
                Ok(data)
            }
        }
    }

    pub async fn set_ex(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), StoreError> {
        match self {
            EphemeralStore::Local(store) => {
                store.set_ex(key, value, ttl);
                Ok(())
            }
            EphemeralStore::Redis { pool, .. } => {
                let mut conn = Self::connection(pool).await?;
                conn.set_ex::<_, _, ()>(key, value, ttl.as_secs().max(1))
                    .await?;
                Ok(())
            }
        }
    }

    /// Collects every key matching `pattern` using incremental iteration.
    pub async fn scan(&self, pattern: &str) -> Result<Vec<String>, StoreError> {
        match self {
            EphemeralStore::Local(store) => store.scan(pattern),
            EphemeralStore::Redis { pool, scan_batch } => {
                let mut conn = Self::connection(pool).await?;
                let mut keys = Vec::new();
                let mut cursor: u64 = 0;
                loop {
                    let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                        .arg(cursor)
                        .arg("MATCH")
                        .arg(pattern)
                        .arg("COUNT")
                        .arg(*scan_batch)
                        .query_async(&mut conn)
                        .await?;
                    keys.extend(batch);
                    if next == 0 {
                        break;
                    }
                    cursor = next;
                }
                // SCAN may return a key more than once
                keys.sort();
                keys.dedup();
                Ok(keys)
            }
        }
    }

    /// Deletes every key matching `pattern`, one SCAN batch at a time.
    ///
    /// Returns the number of keys removed.
    pub async fn delete_matching(&self, pattern: &str) -> Result<u64, StoreError> {
        match self {
            EphemeralStore::Local(store) => store.delete_matching(pattern),
            EphemeralStore::Redis { pool, scan_batch } => {
                let mut conn = Self::connection(pool).await?;
                let mut deleted = 0u64;
                let mut cursor: u64 = 0;
                loop {
                    let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                        .arg(cursor)
                        .arg("MATCH")
                        .arg(pattern)
                        .arg("COUNT")
                        .arg(*scan_batch)
                        .query_async(&mut conn)
                        .await?;
                    if !batch.is_empty() {
                        let removed: u64 = redis::cmd("UNLINK")
                            .arg(&batch)
                            .query_async(&mut conn)
                            .await?;
                        deleted += removed;
                    }
                    if next == 0 {
                        break;
                    }
                    cursor = next;
                }
                tracing::debug!(pattern, deleted, "pattern delete (redis)");
                Ok(deleted)
            }
        }
    }

    /// Check if the backing store answers (for health checks).
    pub async fn ping(&self) -> bool {
        match self {
            EphemeralStore::Local(_) => true,
            EphemeralStore::Redis { pool, .. } => match pool.get().await {
                Ok(mut conn) => {
                    let pong: Result<String, _> =
                        redis::cmd("PING").query_async(&mut conn).await;
                    pong.is_ok()
                }
                Err(_) => false,
            },
        }
    }
}
