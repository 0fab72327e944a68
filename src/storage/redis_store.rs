//! Redis 离线消息存储（`redis` feature）
//! Redis-backed offline store

use super::traits::{OfflineStore, StoreError, StoreResult};
use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use std::time::Duration;

pub struct RedisOfflineStore {
    conn: MultiplexedConnection,
}

impl RedisOfflineStore {
    pub async fn connect(url: &str) -> StoreResult<Self> {
        let client = redis::Client::open(url).map_err(unavailable)?;
        let mut conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(unavailable)?;
        let _: String = redis::cmd("PING").query_async(&mut conn).await.map_err(unavailable)?;
        tracing::info!("✅ redis offline store connected: {}", url);
        Ok(Self { conn })
    }
}

fn unavailable(e: redis::RedisError) -> StoreError {
    StoreError::Unavailable(format!("redis: {}", e))
}

#[async_trait]
impl OfflineStore for RedisOfflineStore {
    async fn push_capped(&self, key: &str, value: String, cap: usize, ttl: Duration) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        // MULTI/EXEC：中断的写入不会留下没有过期时间的键
        let _: () = redis::pipe()
            .atomic()
            .lpush(key, value)
            .ignore()
            .ltrim(key, 0, cap as isize - 1)
            .ignore()
            .expire(key, ttl.as_secs() as i64)
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(unavailable)?;
        Ok(())
    }

    async fn range_all(&self, key: &str) -> StoreResult<Vec<String>> {
        let mut conn = self.conn.clone();
        conn.lrange(key, 0, -1).await.map_err(unavailable)
    }

    async fn remove_oldest(&self, key: &str, count: usize) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        // 新消息从头部插入，回放期间到达的条目不受影响
        let _: () = conn
            .ltrim(key, 0, -(count as isize) - 1)
            .await
            .map_err(unavailable)?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.del(key).await.map_err(unavailable)?;
        Ok(())
    }

    async fn len(&self, key: &str) -> StoreResult<usize> {
        let mut conn = self.conn.clone();
        conn.llen(key).await.map_err(unavailable)
    }
}
