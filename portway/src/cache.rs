//! Distributed counter store access
//!
//! The gateway keeps no durable state of its own; everything shared across
//! instances (rate-limit windows, credential records, lookup tables, token
//! blacklists) lives in the counter store behind the two traits below. The
//! Redis implementations back production; the in-memory implementations back
//! tests and cache-less single-instance runs.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use deadpool_redis::{Config as DeadpoolConfig, Pool, Runtime};
use std::ops::DerefMut;
use std::time::Duration;

use crate::{
    config::RedisConfig,
    error::{Error, Result},
};

/// Create a Redis connection pool with retry logic
///
/// Uses exponential backoff between attempts.
pub async fn create_pool(config: &RedisConfig) -> Result<Pool> {
    let mut attempt = 0;
    let base_delay = Duration::from_secs(config.retry_delay_secs);

    loop {
        match try_create_pool(config).await {
            Ok(pool) => {
                if attempt > 0 {
                    tracing::info!("Redis connection established after {} attempt(s)", attempt + 1);
                } else {
                    tracing::info!(
                        "Redis connection pool created: max_connections={}",
                        config.max_connections
                    );
                }
                return Ok(pool);
            }
            Err(e) => {
                attempt += 1;

                if attempt > config.max_retries {
                    tracing::error!(
                        "Failed to connect to Redis after {} attempts: {}",
                        config.max_retries + 1,
                        e
                    );
                    return Err(e);
                }

                let delay_multiplier = 2_u32.pow(attempt.saturating_sub(1));
                let delay = base_delay * delay_multiplier;

                tracing::warn!(
                    "Redis connection attempt {} failed: {}. Retrying in {:?}...",
                    attempt,
                    e,
                    delay
                );

                tokio::time::sleep(delay).await;
            }
        }
    }
}

/// Attempt to create a Redis pool (single try)
async fn try_create_pool(config: &RedisConfig) -> Result<Pool> {
    let cfg = DeadpoolConfig::from_url(&config.url);

    let pool = cfg
        .builder()
        .map_err(|e| Error::Internal(format!("Failed to build Redis pool: {}", e)))?
        .max_size(config.max_connections)
        .runtime(Runtime::Tokio1)
        .build()
        .map_err(|e| Error::Internal(format!("Failed to create Redis pool: {}", e)))?;

    // Test the connection
    let conn = pool
        .get()
        .await
        .map_err(|e| Error::Internal(format!("Failed to get Redis connection: {}", e)))?;
    drop(conn);

    Ok(pool)
}

// ============================================================================
// Counter store (string values with TTL)
// ============================================================================

/// Key/value access with TTL over the distributed store
///
/// Used for credential records (`apikey:{hash}`), token blacklists
/// (`token:blacklist:{jti}`) and replicated lookup tables
/// (`lookup:{table}:{key}`).
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Fetch the value at `key`, if present
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Store `value` at `key`; `ttl = None` means no expiry
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()>;

    /// Remove `key`
    async fn delete(&self, key: &str) -> Result<()>;
}

/// Redis-backed counter store
#[derive(Clone)]
pub struct RedisCounterStore {
    pool: Pool,
}

impl RedisCounterStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    async fn conn(&self) -> Result<deadpool_redis::Connection> {
        self.pool
            .get()
            .await
            .map_err(|e| Error::Internal(format!("Failed to get Redis connection: {}", e)))
    }
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        use deadpool_redis::redis::AsyncCommands;

        let mut conn = self.conn().await?;
        let value: Option<String> = conn.get(key).await.map_err(Error::from)?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        use deadpool_redis::redis::AsyncCommands;

        let mut conn = self.conn().await?;
        match ttl {
            Some(ttl) => {
                conn.set_ex::<_, _, ()>(key, value, ttl.as_secs().max(1))
                    .await
                    .map_err(Error::from)?;
            }
            None => {
                conn.set::<_, _, ()>(key, value).await.map_err(Error::from)?;
            }
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        use deadpool_redis::redis::AsyncCommands;

        let mut conn = self.conn().await?;
        conn.del::<_, ()>(key).await.map_err(Error::from)?;
        Ok(())
    }
}

/// In-memory counter store for tests and cache-less runs
///
/// TTLs are honored lazily on read.
#[derive(Default)]
pub struct MemoryCounterStore {
    entries: DashMap<String, (String, Option<DateTime<Utc>>)>,
}

impl MemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        if let Some(entry) = self.entries.get(key) {
            let (value, expires) = entry.value();
            if let Some(expires) = expires {
                if *expires < Utc::now() {
                    drop(entry);
                    self.entries.remove(key);
                    return Ok(None);
                }
            }
            return Ok(Some(value.clone()));
        }
        Ok(None)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let expires = ttl.and_then(|ttl| {
            ChronoDuration::from_std(ttl)
                .ok()
                .map(|ttl| Utc::now() + ttl)
        });
        self.entries.insert(key.to_string(), (value.to_string(), expires));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.remove(key);
        Ok(())
    }
}

// ============================================================================
// Sliding-window store (sorted timestamp sets with TTL)
// ============================================================================

/// The state of a window after an operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowSample {
    /// Samples currently inside the window (including the one just recorded)
    pub count: u32,

    /// Oldest sample still inside the window, in epoch milliseconds
    pub oldest_ms: Option<i64>,
}

/// Sliding-window sample sets over the distributed store
///
/// Each key holds a set of timestamped members; `record` prunes samples
/// older than the window, appends one, and returns the resulting count
/// atomically, so the limiter's decision is based on a single round trip.
#[async_trait]
pub trait WindowStore: Send + Sync {
    /// Prune, append `member` at `now`, and return the window state.
    ///
    /// The key's TTL must exceed `window` so idle keys expire on their own.
    async fn record(
        &self,
        key: &str,
        member: &str,
        now: DateTime<Utc>,
        window: Duration,
        ttl: Duration,
    ) -> Result<WindowSample>;

    /// Withdraw a previously recorded member (used when an admission is
    /// rolled back after a reject decision)
    async fn forget(&self, key: &str, member: &str) -> Result<()>;

    /// Count samples inside the window without recording one
    async fn peek(&self, key: &str, now: DateTime<Utc>, window: Duration) -> Result<WindowSample>;

    /// Drop the whole window
    async fn reset(&self, key: &str) -> Result<()>;
}

/// Redis-backed window store using sorted sets
#[derive(Clone)]
pub struct RedisWindowStore {
    pool: Pool,
}

impl RedisWindowStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    async fn conn(&self) -> Result<deadpool_redis::Connection> {
        self.pool
            .get()
            .await
            .map_err(|e| Error::Internal(format!("Failed to get Redis connection: {}", e)))
    }

    async fn oldest(&self, conn: &mut deadpool_redis::Connection, key: &str) -> Result<Option<i64>> {
        use deadpool_redis::redis::AsyncCommands;

        let oldest: Vec<(String, i64)> = conn
            .zrange_withscores(key, 0, 0)
            .await
            .map_err(Error::from)?;
        Ok(oldest.first().map(|(_, score)| *score))
    }
}

#[async_trait]
impl WindowStore for RedisWindowStore {
    async fn record(
        &self,
        key: &str,
        member: &str,
        now: DateTime<Utc>,
        window: Duration,
        ttl: Duration,
    ) -> Result<WindowSample> {
        let mut conn = self.conn().await?;
        let now_ms = now.timestamp_millis();
        let cutoff_ms = now_ms - window.as_millis() as i64;

        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("ZREMRANGEBYSCORE")
            .arg(key)
            .arg("-inf")
            .arg(cutoff_ms)
            .ignore()
            .cmd("ZADD")
            .arg(key)
            .arg(now_ms)
            .arg(member)
            .ignore()
            .cmd("ZCARD")
            .arg(key)
            .cmd("EXPIRE")
            .arg(key)
            .arg(ttl.as_secs().max(1))
            .ignore();

        let (count,): (u32,) = pipe
            .query_async(conn.deref_mut())
            .await
            .map_err(Error::from)?;

        let oldest_ms = self.oldest(&mut conn, key).await?;
        Ok(WindowSample { count, oldest_ms })
    }

    async fn forget(&self, key: &str, member: &str) -> Result<()> {
        use deadpool_redis::redis::AsyncCommands;

        let mut conn = self.conn().await?;
        conn.zrem::<_, _, ()>(key, member).await.map_err(Error::from)?;
        Ok(())
    }

    async fn peek(&self, key: &str, now: DateTime<Utc>, window: Duration) -> Result<WindowSample> {
        let mut conn = self.conn().await?;
        let cutoff_ms = now.timestamp_millis() - window.as_millis() as i64;

        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("ZREMRANGEBYSCORE")
            .arg(key)
            .arg("-inf")
            .arg(cutoff_ms)
            .ignore()
            .cmd("ZCARD")
            .arg(key);

        let (count,): (u32,) = pipe
            .query_async(conn.deref_mut())
            .await
            .map_err(Error::from)?;

        let oldest_ms = self.oldest(&mut conn, key).await?;
        Ok(WindowSample { count, oldest_ms })
    }

    async fn reset(&self, key: &str) -> Result<()> {
        use deadpool_redis::redis::AsyncCommands;

        let mut conn = self.conn().await?;
        conn.del::<_, ()>(key).await.map_err(Error::from)?;
        Ok(())
    }
}

/// In-memory window store for tests and cache-less runs
#[derive(Default)]
pub struct MemoryWindowStore {
    windows: DashMap<String, Vec<(String, i64)>>,
}

impl MemoryWindowStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn sample(samples: &[(String, i64)]) -> WindowSample {
        WindowSample {
            count: samples.len() as u32,
            oldest_ms: samples.iter().map(|(_, ts)| *ts).min(),
        }
    }
}

#[async_trait]
impl WindowStore for MemoryWindowStore {
    async fn record(
        &self,
        key: &str,
        member: &str,
        now: DateTime<Utc>,
        window: Duration,
        _ttl: Duration,
    ) -> Result<WindowSample> {
        let now_ms = now.timestamp_millis();
        let cutoff_ms = now_ms - window.as_millis() as i64;

        let mut entry = self.windows.entry(key.to_string()).or_default();
        entry.retain(|(_, ts)| *ts > cutoff_ms);
        entry.push((member.to_string(), now_ms));
        Ok(Self::sample(&entry))
    }

    async fn forget(&self, key: &str, member: &str) -> Result<()> {
        if let Some(mut entry) = self.windows.get_mut(key) {
            entry.retain(|(m, _)| m != member);
        }
        Ok(())
    }

    async fn peek(&self, key: &str, now: DateTime<Utc>, window: Duration) -> Result<WindowSample> {
        let cutoff_ms = now.timestamp_millis() - window.as_millis() as i64;

        match self.windows.get_mut(key) {
            Some(mut entry) => {
                entry.retain(|(_, ts)| *ts > cutoff_ms);
                Ok(Self::sample(&entry))
            }
            None => Ok(WindowSample {
                count: 0,
                oldest_ms: None,
            }),
        }
    }

    async fn reset(&self, key: &str) -> Result<()> {
        self.windows.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_counter_roundtrip() {
        let store = MemoryCounterStore::new();
        store.set("k", "v", None).await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some("v".to_string()));

        store.delete("k").await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_memory_counter_ttl_expiry() {
        let store = MemoryCounterStore::new();
        store
            .set("k", "v", Some(Duration::from_millis(1)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_memory_window_counts_and_prunes() {
        let store = MemoryWindowStore::new();
        let window = Duration::from_secs(60);
        let ttl = Duration::from_secs(90);
        let t0 = Utc::now();

        let s1 = store.record("k", "a", t0, window, ttl).await.unwrap();
        assert_eq!(s1.count, 1);

        let s2 = store.record("k", "b", t0, window, ttl).await.unwrap();
        assert_eq!(s2.count, 2);
        assert_eq!(s2.oldest_ms, Some(t0.timestamp_millis()));

        // A peek past the window prunes everything
        let later = t0 + ChronoDuration::seconds(61);
        let s3 = store.peek("k", later, window).await.unwrap();
        assert_eq!(s3.count, 0);
        assert_eq!(s3.oldest_ms, None);
    }

    #[tokio::test]
    async fn test_memory_window_forget() {
        let store = MemoryWindowStore::new();
        let window = Duration::from_secs(60);
        let ttl = Duration::from_secs(90);
        let t0 = Utc::now();

        store.record("k", "a", t0, window, ttl).await.unwrap();
        store.record("k", "b", t0, window, ttl).await.unwrap();
        store.forget("k", "b").await.unwrap();

        let sample = store.peek("k", t0, window).await.unwrap();
        assert_eq!(sample.count, 1);
    }

    #[tokio::test]
    async fn test_memory_window_reset() {
        let store = MemoryWindowStore::new();
        let window = Duration::from_secs(60);
        let t0 = Utc::now();

        store
            .record("k", "a", t0, window, Duration::from_secs(90))
            .await
            .unwrap();
        store.reset("k").await.unwrap();

        let sample = store.peek("k", t0, window).await.unwrap();
        assert_eq!(sample.count, 0);
    }
}
