//! Store client abstraction.
//!
//! The queue engine and the cluster router talk to the backing store only
//! through [`StoreClient`]. Keys are always passed unprefixed; each client
//! applies its deployment prefix to every key argument it sends, including
//! the destination of `rpoplpush`. The one place a fully-qualified key leaks
//! back out is [`StoreClient::blpop`], which reports the key it popped from
//! exactly as the server named it.
//!
//! - [`RedisStore`]: one lazily connected Redis endpoint
//! - [`MemoryStore`]: in-process store with the same semantics

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::ShardConfig;
use crate::error::StoreError;

pub mod memory;
pub mod redis;

pub use self::memory::{MemoryConnector, MemoryStore};
pub use self::redis::{RedisConnector, RedisStore};

/// Primitive operations against one store endpoint (or a router over many).
#[async_trait]
pub trait StoreClient: Send + Sync {
    /// Deployment prefix applied to every key.
    fn prefix(&self) -> &str;

    /// Human-readable endpoint name for logs.
    fn endpoint(&self) -> String;

    /// Appends to the tail of a list, returning the new length.
    async fn rpush(&self, key: &str, value: &str) -> Result<u64, StoreError>;

    /// Removes and returns the head of a list.
    async fn lpop(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Removes and returns the tail of a list.
    async fn rpop(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Blocking head-pop across `keys`, waiting up to `timeout_secs`
    /// (0 waits forever). Returns the fully-qualified key and the value.
    async fn blpop(
        &self,
        keys: &[String],
        timeout_secs: u64,
    ) -> Result<Option<(String, String)>, StoreError>;

    /// Atomically pops the tail of `source` and pushes it onto the head of
    /// `destination`.
    async fn rpoplpush(&self, source: &str, destination: &str)
        -> Result<Option<String>, StoreError>;

    async fn llen(&self, key: &str) -> Result<u64, StoreError>;

    async fn lrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>, StoreError>;

    async fn sadd(&self, key: &str, member: &str) -> Result<bool, StoreError>;

    async fn srem(&self, key: &str, member: &str) -> Result<bool, StoreError>;

    async fn smembers(&self, key: &str) -> Result<Vec<String>, StoreError>;

    async fn zcard(&self, key: &str) -> Result<u64, StoreError>;

    /// Deletes a key, returning how many keys were removed.
    async fn del(&self, key: &str) -> Result<u64, StoreError>;

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;

    async fn exists(&self, key: &str) -> Result<bool, StoreError>;

    async fn incr_by(&self, key: &str, delta: i64) -> Result<i64, StoreError>;

    /// Sends an arbitrary command. Arguments are passed through verbatim,
    /// without key prefixing.
    async fn execute(&self, command: &str, args: &[String]) -> Result<::redis::Value, StoreError>;

    /// Returns the client that owns `key` when this handle spans several
    /// endpoints. Multi-key sequences that must stay on one endpoint (such as
    /// a queue scan and its buffers) run against the pinned client.
    fn pin(&self, _key: &str) -> Option<Arc<dyn StoreClient>> {
        None
    }

    /// Drops any cached connection so the next call reconnects. Must be
    /// called before forking.
    async fn reset(&self) {}
}

/// Creates store clients for shard descriptors.
pub trait Connector: Send + Sync {
    fn connect(&self, shard: &ShardConfig) -> Result<Arc<dyn StoreClient>, StoreError>;
}

/// Prepends `prefix` to `key`.
pub fn prefixed(prefix: &str, key: &str) -> String {
    let mut full = String::with_capacity(prefix.len() + key.len());
    full.push_str(prefix);
    full.push_str(key);
    full
}
