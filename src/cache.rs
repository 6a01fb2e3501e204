use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, RedisResult};

const TTL_SECS: i64 = 30 * 24 * 60 * 60;

/// Remembers which listing items were already relayed.
///
/// The bus delivers at least once, so skipping seen items is up to the scraper.
#[async_trait]
pub trait SeenCache: Send + Sync {
    /// Remember `item` under `cache_name`. True if it was not there yet.
    async fn remember(&self, cache_name: &str, item: &str) -> RedisResult<bool>;

    async fn exists(&self, cache_name: &str) -> RedisResult<bool>;
}

/// Sorted set per listing scored by insertion time, trimmed to the newest `max_size`.
#[derive(Clone)]
pub struct RedisSeenCache {
    conn: ConnectionManager,
    max_size: usize,
}

impl RedisSeenCache {
    pub async fn connect(redis_url: &str, max_size: usize) -> RedisResult<Self> {
        let client = redis::Client::open(redis_url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self { conn, max_size })
    }

    async fn trim(&self, cache_name: &str) -> RedisResult<()> {
        let mut conn = self.conn.clone();
        let size: usize = conn.zcard(cache_name).await?;
        if size > self.max_size {
            let _: () = conn.zpopmin(cache_name, (size - self.max_size) as isize).await?;
        }
        let _: () = conn.expire(cache_name, TTL_SECS).await?;
        Ok(())
    }
}

#[async_trait]
impl SeenCache for RedisSeenCache {
    async fn remember(&self, cache_name: &str, item: &str) -> RedisResult<bool> {
        let mut conn = self.conn.clone();
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or_default();
        let added: i64 = conn.zadd(cache_name, item, now).await?;
        self.trim(cache_name).await?;
        Ok(added > 0)
    }

    async fn exists(&self, cache_name: &str) -> RedisResult<bool> {
        let mut conn = self.conn.clone();
        conn.exists(cache_name).await
    }
}
