//! Redis-backed store client.
//!
//! One [`RedisStore`] talks to one endpoint. The connection is established
//! on first use and cached; [`StoreClient::reset`] drops it so a forked
//! child opens its own socket instead of sharing the parent's.

use std::sync::Arc;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use tokio::sync::Mutex;
use tracing::debug;

use super::{prefixed, Connector, StoreClient};
use crate::config::ShardConfig;
use crate::error::StoreError;

/// A lazily connected Redis endpoint.
pub struct RedisStore {
    client: redis::Client,
    endpoint: String,
    prefix: String,
    /// Cached connection, `None` until first use or after a reset.
    connection: Mutex<Option<ConnectionManager>>,
}

impl RedisStore {
    /// Creates a client for `shard`. No connection is opened yet.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Connection` if the shard does not form a valid
    /// connection URL.
    pub fn new(shard: &ShardConfig, prefix: impl Into<String>) -> Result<Self, StoreError> {
        let client = redis::Client::open(shard.url())
            .map_err(|e| StoreError::Connection(format!("{}: {}", shard.address(), e)))?;

        Ok(Self {
            client,
            endpoint: shard.address(),
            prefix: prefix.into(),
            connection: Mutex::new(None),
        })
    }

    /// Returns the cached connection, connecting first if needed.
    async fn connection(&self) -> Result<ConnectionManager, StoreError> {
        let mut guard = self.connection.lock().await;
        if let Some(conn) = guard.as_ref() {
            return Ok(conn.clone());
        }

        debug!(endpoint = %self.endpoint, "Connecting to Redis");
        let conn = ConnectionManager::new(self.client.clone())
            .await
            .map_err(|e| StoreError::Connection(format!("{}: {}", self.endpoint, e)))?;
        *guard = Some(conn.clone());
        Ok(conn)
    }

    fn key(&self, key: &str) -> String {
        prefixed(&self.prefix, key)
    }

    async fn query<T: redis::FromRedisValue>(&self, cmd: &redis::Cmd) -> Result<T, StoreError> {
        let mut conn = self.connection().await?;
        Ok(cmd.query_async::<_, T>(&mut conn).await?)
    }
}

#[async_trait]
impl StoreClient for RedisStore {
    fn prefix(&self) -> &str {
        &self.prefix
    }

    fn endpoint(&self) -> String {
        self.endpoint.clone()
    }

    async fn rpush(&self, key: &str, value: &str) -> Result<u64, StoreError> {
        self.query(redis::cmd("RPUSH").arg(self.key(key)).arg(value)).await
    }

    async fn lpop(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.query(redis::cmd("LPOP").arg(self.key(key))).await
    }

    async fn rpop(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.query(redis::cmd("RPOP").arg(self.key(key))).await
    }

    async fn blpop(
        &self,
        keys: &[String],
        timeout_secs: u64,
    ) -> Result<Option<(String, String)>, StoreError> {
        let mut cmd = redis::cmd("BLPOP");
        for key in keys {
            cmd.arg(self.key(key));
        }
        cmd.arg(timeout_secs);
        self.query(&cmd).await
    }

    async fn rpoplpush(
        &self,
        source: &str,
        destination: &str,
    ) -> Result<Option<String>, StoreError> {
        self.query(
            redis::cmd("RPOPLPUSH")
                .arg(self.key(source))
                .arg(self.key(destination)),
        )
        .await
    }

    async fn llen(&self, key: &str) -> Result<u64, StoreError> {
        self.query(redis::cmd("LLEN").arg(self.key(key))).await
    }

    async fn lrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>, StoreError> {
        self.query(redis::cmd("LRANGE").arg(self.key(key)).arg(start).arg(stop))
            .await
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        let added: u64 = self
            .query(redis::cmd("SADD").arg(self.key(key)).arg(member))
            .await?;
        Ok(added > 0)
    }

    async fn srem(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        let removed: u64 = self
            .query(redis::cmd("SREM").arg(self.key(key)).arg(member))
            .await?;
        Ok(removed > 0)
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>, StoreError> {
        self.query(redis::cmd("SMEMBERS").arg(self.key(key))).await
    }

    async fn zcard(&self, key: &str) -> Result<u64, StoreError> {
        self.query(redis::cmd("ZCARD").arg(self.key(key))).await
    }

    async fn del(&self, key: &str) -> Result<u64, StoreError> {
        self.query(redis::cmd("DEL").arg(self.key(key))).await
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.query(redis::cmd("GET").arg(self.key(key))).await
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.query(redis::cmd("SET").arg(self.key(key)).arg(value)).await
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        let count: u64 = self.query(redis::cmd("EXISTS").arg(self.key(key))).await?;
        Ok(count > 0)
    }

    async fn incr_by(&self, key: &str, delta: i64) -> Result<i64, StoreError> {
        self.query(redis::cmd("INCRBY").arg(self.key(key)).arg(delta))
            .await
    }

    async fn execute(&self, command: &str, args: &[String]) -> Result<redis::Value, StoreError> {
        let mut cmd = redis::cmd(command);
        for arg in args {
            cmd.arg(arg);
        }
        self.query(&cmd).await
    }

    async fn reset(&self) {
        let mut guard = self.connection.lock().await;
        if guard.take().is_some() {
            debug!(endpoint = %self.endpoint, "Dropped cached Redis connection");
        }
    }
}

/// Opens a [`RedisStore`] per shard, all sharing one key prefix.
#[derive(Debug, Clone)]
pub struct RedisConnector {
    prefix: String,
}

impl RedisConnector {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }
}

impl Connector for RedisConnector {
    fn connect(&self, shard: &ShardConfig) -> Result<Arc<dyn StoreClient>, StoreError> {
        Ok(Arc::new(RedisStore::new(shard, self.prefix.clone())?))
    }
}
