// src/store/mod.rs
//! Key/value and sorted-set primitives the queue is built on.
//!
//! [`Store`] mirrors the handful of Redis commands
//! the engine issues so that any backend offering the same atomicity (an
//! indivisible pop-min and an indivisible member move) can stand in for Redis.

use crate::Result;
use async_trait::async_trait;
use std::time::Duration;
use tokio::time::Instant;

pub mod memory;
pub mod redis_store;

pub use self::memory::MemoryStore;
pub use self::redis_store::RedisStore;

/// Interval used by the polling fallback of [`Store::bzpopmin`].
pub const BLOCKING_POP_POLL: Duration = Duration::from_millis(50);

#[async_trait]
pub trait Store: Send + Sync + 'static {
    /// SET key value EX ttl
    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;

    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Deletes keys of any kind, returning how many existed.
    async fn del(&self, keys: &[String]) -> Result<usize>;

    async fn exists(&self, key: &str) -> Result<bool>;

    /// INCRBY; a negative delta decrements.
    async fn incr(&self, key: &str, delta: i64) -> Result<i64>;

    /// Upserts `member` with `score`.
    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<()>;

    /// Atomically removes and returns the lowest-scored member.
    async fn zpopmin(&self, key: &str) -> Result<Option<(String, f64)>>;

    /// Like [`Store::zpopmin`] but waits up to `timeout` for a member to appear.
    async fn bzpopmin(&self, key: &str, timeout: Duration) -> Result<Option<(String, f64)>> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(hit) = self.zpopmin(key).await? {
                return Ok(Some(hit));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(BLOCKING_POP_POLL.min(deadline - now)).await;
        }
    }

    /// Members with `min <= score <= max`, lowest score first.
    async fn zrangebyscore(&self, key: &str, min: f64, max: f64) -> Result<Vec<String>>;

    /// Every member with its score, lowest score first.
    async fn zrange_withscores(&self, key: &str) -> Result<Vec<(String, f64)>>;

    /// Returns whether the member was present.
    async fn zrem(&self, key: &str, member: &str) -> Result<bool>;

    async fn zcard(&self, key: &str) -> Result<usize>;

    async fn zscore(&self, key: &str, member: &str) -> Result<Option<f64>>;

    /// Atomically removes `member` from `src` and, only if it was there, adds
    /// it to `dst` with `score`. Returns whether the move happened.
    async fn zmove(&self, src: &str, dst: &str, member: &str, score: f64) -> Result<bool>;
}
