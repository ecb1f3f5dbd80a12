use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use swell_runtime::{SessionStore, StoreError};

/// Session snapshots in redis, one key per session, expiring after `ttl_seconds`.
#[derive(Clone)]
pub struct RedisSessionStore {
    redis: ConnectionManager,
    ttl_seconds: u64,
}

impl RedisSessionStore {
    pub async fn connect(redis_url: &str, ttl_seconds: u64) -> anyhow::Result<Self> {
        let client = Client::open(redis_url)?;
        let redis = ConnectionManager::new(client).await?;
        Ok(Self { redis, ttl_seconds })
    }
}

fn key(id: &str) -> String {
    format!("swell:session:{id}")
}

fn backend(err: redis::RedisError) -> StoreError {
    StoreError::Backend(err.to_string())
}

#[async_trait]
impl SessionStore for RedisSessionStore {
    async fn load(&self, id: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let mut conn = self.redis.clone();
        conn.get::<_, Option<Vec<u8>>>(key(id)).await.map_err(backend)
    }

    async fn save(&self, id: &str, bytes: Vec<u8>) -> Result<(), StoreError> {
        let mut conn = self.redis.clone();
        redis::cmd("SETEX")
            .arg(key(id))
            .arg(self.ttl_seconds)
            .arg(bytes)
            .query_async::<()>(&mut conn)
            .await
            .map_err(backend)
    }

    async fn remove(&self, id: &str) -> Result<(), StoreError> {
        let mut conn = self.redis.clone();
        conn.del::<_, ()>(key(id)).await.map_err(backend)
    }
}
