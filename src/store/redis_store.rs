// src/store/redis_store.rs
use super::Store;
use crate::{PressqError, RedisConfig, Result, lua::LuaScripts};
use async_trait::async_trait;
use redis::{AsyncCommands, Client as RedisClient, aio::MultiplexedConnection};
use std::time::Duration;
use tracing::{info, instrument};

/// [`Store`] backed by a Redis server.
///
/// All commands share one multiplexed connection. The blocking pop uses the
/// polling fallback of [`Store::bzpopmin`] rather than `BZPOPMIN`, which would
/// stall every other command pipelined on the shared connection.
#[derive(Clone)]
pub struct RedisStore {
    client: RedisClient,
    conn: MultiplexedConnection,
    scripts: std::sync::Arc<LuaScripts>,
}

impl RedisStore {
    #[instrument(skip_all)]
    pub async fn connect(config: &RedisConfig) -> Result<Self> {
        let client = RedisClient::open(config.connection_info()?)?;
        let conn = tokio::time::timeout(
            config.connect_timeout(),
            client.get_multiplexed_async_connection(),
        )
        .await
        .map_err(|_| {
            PressqError::StoreUnavailable(format!(
                "timed out connecting to Redis after {:?}",
                config.connect_timeout()
            ))
        })??;
        info!(host = %config.host, database = config.database, "connected to Redis");

        Ok(Self::with_connection(client, conn))
    }

    pub async fn open(url: &str) -> Result<Self> {
        Self::connect(&RedisConfig::with_url(url)).await
    }

    pub fn with_connection(client: RedisClient, conn: MultiplexedConnection) -> Self {
        Self {
            client,
            conn,
            scripts: std::sync::Arc::new(LuaScripts::new()),
        }
    }

    pub fn client(&self) -> &RedisClient {
        &self.client
    }

    fn con(&self) -> MultiplexedConnection {
        self.conn.clone()
    }
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("scripts", &self.scripts)
            .finish_non_exhaustive()
    }
}

/// Score bound as Redis spells it; infinities become `-inf`/`+inf`.
fn score_bound(score: f64) -> String {
    if score == f64::NEG_INFINITY {
        "-inf".to_string()
    } else if score == f64::INFINITY {
        "+inf".to_string()
    } else {
        score.to_string()
    }
}

#[async_trait]
impl Store for RedisStore {
    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let seconds = ttl.as_secs().max(1);
        let _: () = self.con().set_ex(key, value, seconds).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let value: Option<String> = self.con().get(key).await?;
        Ok(value)
    }

    async fn del(&self, keys: &[String]) -> Result<usize> {
        if keys.is_empty() {
            return Ok(0);
        }
        let removed: usize = self.con().del(keys).await?;
        Ok(removed)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let exists: bool = self.con().exists(key).await?;
        Ok(exists)
    }

    async fn incr(&self, key: &str, delta: i64) -> Result<i64> {
        let value: i64 = self.con().incr(key, delta).await?;
        Ok(value)
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<()> {
        let _: i64 = self.con().zadd(key, member, score).await?;
        Ok(())
    }

    async fn zpopmin(&self, key: &str) -> Result<Option<(String, f64)>> {
        let popped: Vec<(String, f64)> = self.con().zpopmin(key, 1).await?;
        Ok(popped.into_iter().next())
    }

    async fn zrangebyscore(&self, key: &str, min: f64, max: f64) -> Result<Vec<String>> {
        let members: Vec<String> = self
            .con()
            .zrangebyscore(key, score_bound(min), score_bound(max))
            .await?;
        Ok(members)
    }

    async fn zrange_withscores(&self, key: &str) -> Result<Vec<(String, f64)>> {
        let members: Vec<(String, f64)> = self.con().zrange_withscores(key, 0, -1).await?;
        Ok(members)
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<bool> {
        let removed: i64 = self.con().zrem(key, member).await?;
        Ok(removed > 0)
    }

    async fn zcard(&self, key: &str) -> Result<usize> {
        let count: usize = self.con().zcard(key).await?;
        Ok(count)
    }

    async fn zscore(&self, key: &str, member: &str) -> Result<Option<f64>> {
        let score: Option<f64> = self.con().zscore(key, member).await?;
        Ok(score)
    }

    async fn zmove(&self, src: &str, dst: &str, member: &str, score: f64) -> Result<bool> {
        let moved: i64 = self
            .scripts
            .move_member
            .key(src)
            .key(dst)
            .arg(member)
            .arg(score)
            .invoke_async(&mut self.con())
            .await?;
        Ok(moved == 1)
    }
}
