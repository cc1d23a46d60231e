//! Cluster router with consistent hashing and read/write splitting.
//!
//! The router owns one store client per shard and decides, per command,
//! which shard serves it:
//!
//! 1. With a master configured, anything that is not a read-only command
//!    goes to the master.
//! 2. Otherwise a single-shard ring, a hash-exempt administrative command or
//!    a command without a key goes to ring shard 0.
//! 3. Everything else goes to the shard owning the key on the hash ring.
//!
//! [`ClusterRouter`] implements [`StoreClient`] itself, so the queue engine
//! runs unchanged on top of one server or a whole cluster.

use std::collections::HashMap;
use std::sync::Arc;

use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use super::ring::HashRing;
use crate::config::ShardConfig;
use crate::error::{StoreError, TopologyError};
use crate::store::{prefixed, Connector, StoreClient};

/// Poll interval of a blocking pop whose keys live on different shards.
const CROSS_SHARD_POLL: Duration = Duration::from_millis(100);

/// Commands that never hash; they go to ring shard 0 when not sent to the
/// master.
const HASH_EXEMPT_COMMANDS: &[&str] = &[
    "RANDOMKEY", "DBSIZE", "PIPELINE", "EXEC", "SELECT", "MOVE", "FLUSHDB", "FLUSHALL", "SAVE",
    "BGSAVE", "LASTSAVE", "SHUTDOWN", "INFO", "MONITOR", "SLAVEOF",
];

/// Commands that may be served by any shard. Everything else is a write.
const READ_ONLY_COMMANDS: &[&str] = &[
    "DBSIZE", "INFO", "MONITOR", "EXISTS", "TYPE", "KEYS", "SCAN", "RANDOMKEY", "TTL", "GET",
    "MGET", "SUBSTR", "STRLEN", "GETRANGE", "GETBIT", "LLEN", "LRANGE", "LINDEX", "SCARD",
    "SISMEMBER", "SINTER", "SUNION", "SDIFF", "SMEMBERS", "SSCAN", "SRANDMEMBER", "ZRANGE",
    "ZREVRANGE", "ZRANGEBYSCORE", "ZREVRANGEBYSCORE", "ZCARD", "ZSCORE", "ZCOUNT", "ZRANK",
    "ZREVRANK", "ZSCAN", "HGET", "HMGET", "HEXISTS", "HLEN", "HKEYS", "HVALS", "HGETALL", "HSCAN",
    "PING", "AUTH", "SELECT", "ECHO", "QUIT", "OBJECT", "BITCOUNT", "TIME", "SORT",
];

/// Whether `command` can be served by a replica.
pub fn is_read_only(command: &str) -> bool {
    READ_ONLY_COMMANDS
        .iter()
        .any(|known| known.eq_ignore_ascii_case(command))
}

/// Whether `command` bypasses key hashing.
pub fn is_hash_exempt(command: &str) -> bool {
    HASH_EXEMPT_COMMANDS
        .iter()
        .any(|known| known.eq_ignore_ascii_case(command))
}

/// A shard descriptor paired with its client.
#[derive(Clone)]
pub struct Shard {
    pub config: ShardConfig,
    pub client: Arc<dyn StoreClient>,
}

impl std::fmt::Debug for Shard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Shard")
            .field("address", &self.config.address())
            .field("master", &self.config.master)
            .field("write_only", &self.config.write_only)
            .finish()
    }
}

/// Routes store commands across a set of shards.
pub struct ClusterRouter {
    /// Shards on the hash ring; ring indices point into this list.
    ring_shards: Vec<Shard>,
    /// Write-only master, kept off the ring.
    write_only_master: Option<Shard>,
    master: Option<Arc<dyn StoreClient>>,
    aliases: HashMap<String, Arc<dyn StoreClient>>,
    ring: HashRing,
    prefix: String,
}

impl ClusterRouter {
    /// Builds a router over `shards`, creating one client per shard through
    /// `connector`.
    ///
    /// # Errors
    ///
    /// Returns `TopologyError::EmptyCluster` for an empty shard list and
    /// `TopologyError::Store` if a client cannot be created.
    pub fn new(
        shards: Vec<ShardConfig>,
        replicas: usize,
        connector: &dyn Connector,
    ) -> Result<Self, TopologyError> {
        if shards.is_empty() {
            return Err(TopologyError::EmptyCluster);
        }

        let mut ring_shards = Vec::with_capacity(shards.len());
        let mut write_only_master = None;
        let mut master: Option<Arc<dyn StoreClient>> = None;
        let mut aliases = HashMap::new();

        for config in shards {
            let client = connector.connect(&config)?;
            if let Some(alias) = &config.alias {
                aliases.insert(alias.clone(), Arc::clone(&client));
            }
            let shard = Shard { config, client };

            if shard.config.master {
                master = Some(Arc::clone(&shard.client));
                if shard.config.write_only {
                    write_only_master = Some(shard);
                    continue;
                }
            }
            ring_shards.push(shard);
        }

        if let Some(master) = &master {
            aliases
                .entry("master".to_string())
                .or_insert_with(|| Arc::clone(master));
        }

        // A lone write-only master still has to serve reads.
        if ring_shards.is_empty() {
            if let Some(shard) = write_only_master.take() {
                warn!(
                    shard = %shard.config.address(),
                    "Write-only master is the only shard, adding it to the hash ring"
                );
                ring_shards.push(shard);
            }
        }

        let addresses: Vec<String> = ring_shards.iter().map(|s| s.config.address()).collect();
        let ring = HashRing::new(&addresses, replicas);
        let prefix = ring_shards
            .first()
            .map(|s| s.client.prefix().to_string())
            .unwrap_or_default();

        info!(
            shards = ring_shards.len(),
            ring_points = ring.len(),
            has_master = master.is_some(),
            write_only_master = write_only_master.is_some(),
            "Cluster router built"
        );

        Ok(Self {
            ring_shards,
            write_only_master,
            master,
            aliases,
            ring,
            prefix,
        })
    }

    /// Picks the client that serves `command` for `key`.
    pub fn route(&self, command: &str, key: Option<&str>) -> &Arc<dyn StoreClient> {
        if let Some(master) = &self.master {
            if !is_read_only(command) {
                return master;
            }
        }

        match key {
            Some(key) if self.ring_shards.len() > 1 && !is_hash_exempt(command) => self.by_hash(key),
            _ => &self.ring_shards[0].client,
        }
    }

    /// Index of the ring shard that owns `key`.
    pub fn hash(&self, key: &str) -> usize {
        self.ring.lookup(key).unwrap_or(0)
    }

    /// Client of the ring shard that owns `key`.
    pub fn by_hash(&self, key: &str) -> &Arc<dyn StoreClient> {
        &self.ring_shards[self.hash(key)].client
    }

    /// Client at a ring index.
    pub fn client(&self, index: usize) -> Result<&Arc<dyn StoreClient>, TopologyError> {
        self.ring_shards
            .get(index)
            .map(|shard| &shard.client)
            .ok_or_else(|| TopologyError::UnknownClient(index.to_string()))
    }

    /// Client registered under `alias`.
    pub fn client_by_alias(&self, alias: &str) -> Result<&Arc<dyn StoreClient>, TopologyError> {
        self.aliases
            .get(alias)
            .ok_or_else(|| TopologyError::UnknownClient(alias.to_string()))
    }

    /// The master client, if one is configured.
    pub fn master(&self) -> Option<&Arc<dyn StoreClient>> {
        self.master.as_ref()
    }

    /// Shards on the hash ring, in ring-index order.
    pub fn ring_shards(&self) -> &[Shard] {
        &self.ring_shards
    }

    /// Every shard: the ring shards followed by a write-only master.
    pub fn shards(&self) -> impl Iterator<Item = &Shard> {
        self.ring_shards.iter().chain(self.write_only_master.iter())
    }

    pub fn ring(&self) -> &HashRing {
        &self.ring
    }

    /// Sends a raw command to the shard chosen by [`ClusterRouter::route`],
    /// using the first argument as the key.
    pub async fn call(&self, command: &str, args: &[String]) -> Result<redis::Value, StoreError> {
        let client = self.route(command, args.first().map(String::as_str));
        debug!(command, shard = %client.endpoint(), "Routing command");
        client.execute(command, args).await
    }

    /// Sends a raw command to every shard, returning results in shard order.
    pub async fn all(&self, command: &str, args: &[String]) -> Result<Vec<redis::Value>, StoreError> {
        let calls = self.shards().map(|shard| shard.client.execute(command, args));
        join_all(calls).await.into_iter().collect()
    }
}

impl std::fmt::Debug for ClusterRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterRouter")
            .field("ring_shards", &self.ring_shards)
            .field("write_only_master", &self.write_only_master)
            .field("ring_points", &self.ring.len())
            .finish()
    }
}

#[async_trait]
impl StoreClient for ClusterRouter {
    fn prefix(&self) -> &str {
        &self.prefix
    }

    fn endpoint(&self) -> String {
        let addresses: Vec<String> = self.shards().map(|s| s.config.address()).collect();
        format!("cluster[{}]", addresses.join(","))
    }

    async fn rpush(&self, key: &str, value: &str) -> Result<u64, StoreError> {
        self.route("RPUSH", Some(key)).rpush(key, value).await
    }

    async fn lpop(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.route("LPOP", Some(key)).lpop(key).await
    }

    async fn rpop(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.route("RPOP", Some(key)).rpop(key).await
    }

    async fn blpop(
        &self,
        keys: &[String],
        timeout_secs: u64,
    ) -> Result<Option<(String, String)>, StoreError> {
        let owners: Vec<&Arc<dyn StoreClient>> = keys
            .iter()
            .map(|key| self.route("BLPOP", Some(key)))
            .collect();
        if owners.windows(2).all(|pair| Arc::ptr_eq(pair[0], pair[1])) {
            let client = self.route("BLPOP", keys.first().map(String::as_str));
            return client.blpop(keys, timeout_secs).await;
        }

        // Keys span shards: sweep them in priority order until the deadline.
        debug!(keys = keys.len(), "Blocking pop spans shards, polling");
        let deadline =
            (timeout_secs > 0).then(|| Instant::now() + Duration::from_secs(timeout_secs));
        loop {
            for (key, client) in keys.iter().zip(&owners) {
                if let Some(value) = client.lpop(key).await? {
                    return Ok(Some((prefixed(&self.prefix, key), value)));
                }
            }

            let pause = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(None);
                    }
                    CROSS_SHARD_POLL.min(deadline - now)
                }
                None => CROSS_SHARD_POLL,
            };
            sleep(pause).await;
        }
    }

    async fn rpoplpush(
        &self,
        source: &str,
        destination: &str,
    ) -> Result<Option<String>, StoreError> {
        self.route("RPOPLPUSH", Some(source))
            .rpoplpush(source, destination)
            .await
    }

    async fn llen(&self, key: &str) -> Result<u64, StoreError> {
        self.route("LLEN", Some(key)).llen(key).await
    }

    async fn lrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>, StoreError> {
        self.route("LRANGE", Some(key)).lrange(key, start, stop).await
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        self.route("SADD", Some(key)).sadd(key, member).await
    }

    async fn srem(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        self.route("SREM", Some(key)).srem(key, member).await
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>, StoreError> {
        self.route("SMEMBERS", Some(key)).smembers(key).await
    }

    async fn zcard(&self, key: &str) -> Result<u64, StoreError> {
        self.route("ZCARD", Some(key)).zcard(key).await
    }

    async fn del(&self, key: &str) -> Result<u64, StoreError> {
        self.route("DEL", Some(key)).del(key).await
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.route("GET", Some(key)).get(key).await
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.route("SET", Some(key)).set(key, value).await
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        self.route("EXISTS", Some(key)).exists(key).await
    }

    async fn incr_by(&self, key: &str, delta: i64) -> Result<i64, StoreError> {
        self.route("INCRBY", Some(key)).incr_by(key, delta).await
    }

    async fn execute(&self, command: &str, args: &[String]) -> Result<redis::Value, StoreError> {
        self.call(command, args).await
    }

    fn pin(&self, key: &str) -> Option<Arc<dyn StoreClient>> {
        // Pinned sequences mix reads and writes, so they follow the writes.
        Some(Arc::clone(self.route("RPOPLPUSH", Some(key))))
    }

    async fn reset(&self) {
        for shard in self.shards() {
            shard.client.reset().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryConnector;

    fn shard(i: u8) -> ShardConfig {
        ShardConfig::new(format!("10.0.0.{i}"), 6379)
    }

    fn endpoint_of(client: &Arc<dyn StoreClient>) -> String {
        client.endpoint()
    }

    #[test]
    fn test_command_sets() {
        assert!(is_read_only("get"));
        assert!(is_read_only("LRANGE"));
        assert!(is_read_only("SMEMBERS"));
        assert!(!is_read_only("RPUSH"));
        assert!(!is_read_only("BLPOP"));
        assert!(!is_read_only("RPOPLPUSH"));

        assert!(is_hash_exempt("flushdb"));
        assert!(is_hash_exempt("INFO"));
        assert!(!is_hash_exempt("GET"));
    }

    #[test]
    fn test_empty_cluster_is_rejected() {
        let connector = MemoryConnector::new("");
        let result = ClusterRouter::new(Vec::new(), 128, &connector);
        assert!(matches!(result, Err(TopologyError::EmptyCluster)));
    }

    #[test]
    fn test_single_shard_serves_everything() {
        let connector = MemoryConnector::new("");
        let router = ClusterRouter::new(vec![shard(1)], 128, &connector).unwrap();

        for key in ["a", "b", "queue:emails"] {
            assert_eq!(endpoint_of(router.route("GET", Some(key))), "10.0.0.1:6379");
            assert_eq!(endpoint_of(router.route("RPUSH", Some(key))), "10.0.0.1:6379");
        }
    }

    #[test]
    fn test_reads_and_writes_hash_without_master() {
        let connector = MemoryConnector::new("");
        let router = ClusterRouter::new(vec![shard(1), shard(2), shard(3)], 128, &connector).unwrap();

        for i in 0..200 {
            let key = format!("queue:{i}");
            let expected = router.ring_shards()[router.hash(&key)].config.address();
            assert_eq!(endpoint_of(router.route("LLEN", Some(&key))), expected);
            assert_eq!(endpoint_of(router.route("RPUSH", Some(&key))), expected);
            assert_eq!(endpoint_of(router.by_hash(&key)), expected);
        }
    }

    #[test]
    fn test_exempt_and_keyless_commands_go_to_first_shard() {
        let connector = MemoryConnector::new("");
        let router = ClusterRouter::new(vec![shard(1), shard(2), shard(3)], 128, &connector).unwrap();

        assert_eq!(endpoint_of(router.route("DBSIZE", Some("anything"))), "10.0.0.1:6379");
        assert_eq!(endpoint_of(router.route("FLUSHDB", None)), "10.0.0.1:6379");
        assert_eq!(endpoint_of(router.route("GET", None)), "10.0.0.1:6379");
    }

    #[test]
    fn test_writes_go_to_master() {
        let connector = MemoryConnector::new("");
        let shards = vec![shard(1), shard(2), shard(3).as_master()];
        let router = ClusterRouter::new(shards, 128, &connector).unwrap();

        for i in 0..100 {
            let key = format!("queue:{i}");
            assert_eq!(endpoint_of(router.route("RPUSH", Some(&key))), "10.0.0.3:6379");
            assert_eq!(endpoint_of(router.route("BLPOP", Some(&key))), "10.0.0.3:6379");
        }
        // The master is a regular ring member for reads.
        assert_eq!(router.ring_shards().len(), 3);
        let read_targets: std::collections::HashSet<String> = (0..500)
            .map(|i| endpoint_of(router.route("GET", Some(&format!("k{i}")))))
            .collect();
        assert_eq!(read_targets.len(), 3);
    }

    #[test]
    fn test_write_only_master_is_off_the_ring() {
        let connector = MemoryConnector::new("");
        let shards = vec![shard(1), shard(2), shard(3).as_master().write_only(true)];
        let router = ClusterRouter::new(shards, 128, &connector).unwrap();

        assert_eq!(router.ring_shards().len(), 2);
        assert_eq!(router.shards().count(), 3);
        for i in 0..500 {
            let key = format!("k{i}");
            assert_ne!(endpoint_of(router.route("GET", Some(&key))), "10.0.0.3:6379");
            assert_eq!(endpoint_of(router.route("SET", Some(&key))), "10.0.0.3:6379");
        }
    }

    #[test]
    fn test_lone_write_only_master_still_serves_reads() {
        let connector = MemoryConnector::new("");
        let shards = vec![shard(9).as_master().write_only(true)];
        let router = ClusterRouter::new(shards, 128, &connector).unwrap();

        assert_eq!(router.ring_shards().len(), 1);
        assert_eq!(endpoint_of(router.route("GET", Some("k"))), "10.0.0.9:6379");
        assert_eq!(endpoint_of(router.route("SET", Some("k"))), "10.0.0.9:6379");
    }

    #[test]
    fn test_direct_addressing() {
        let connector = MemoryConnector::new("");
        let shards = vec![shard(1).with_alias("cache"), shard(2).as_master()];
        let router = ClusterRouter::new(shards, 128, &connector).unwrap();

        assert_eq!(endpoint_of(router.client(1).unwrap()), "10.0.0.2:6379");
        assert_eq!(endpoint_of(router.client_by_alias("cache").unwrap()), "10.0.0.1:6379");
        assert_eq!(endpoint_of(router.client_by_alias("master").unwrap()), "10.0.0.2:6379");
        assert!(matches!(router.client(7), Err(TopologyError::UnknownClient(_))));
        assert!(matches!(
            router.client_by_alias("nope"),
            Err(TopologyError::UnknownClient(_))
        ));
    }

    #[test]
    fn test_explicit_master_alias_is_kept() {
        let connector = MemoryConnector::new("");
        let shards = vec![shard(1).with_alias("master"), shard(2).as_master()];
        let router = ClusterRouter::new(shards, 128, &connector).unwrap();
        assert_eq!(endpoint_of(router.client_by_alias("master").unwrap()), "10.0.0.1:6379");
    }

    #[tokio::test]
    async fn test_store_operations_land_on_owning_shard() {
        let connector = MemoryConnector::new("resque:");
        let router = ClusterRouter::new(vec![shard(1), shard(2)], 128, &connector).unwrap();

        for i in 0..50 {
            router.rpush(&format!("queue:{i}"), "job").await.unwrap();
        }
        for i in 0..50 {
            let key = format!("queue:{i}");
            let owner = router.ring_shards()[router.hash(&key)].config.address();
            let store = connector.store(&owner).expect("shard connected");
            assert_eq!(store.list(&key).await, vec!["job"]);
            assert_eq!(router.llen(&key).await.unwrap(), 1);
        }
        assert_eq!(router.prefix(), "resque:");
    }

    /// A queue key owned by a different ring shard than `other`.
    fn key_on_other_shard(router: &ClusterRouter, other: &str) -> String {
        (0..)
            .map(|i| format!("queue:low{i}"))
            .find(|key| router.hash(key) != router.hash(other))
            .expect("three shards split the key space")
    }

    #[tokio::test]
    async fn test_blocking_pop_across_shards() {
        let connector = MemoryConnector::new("resque:");
        let router = ClusterRouter::new(vec![shard(1), shard(2), shard(3)], 128, &connector).unwrap();
        let high = "queue:high".to_string();
        let low = key_on_other_shard(&router, &high);

        router.rpush(&low, "job").await.unwrap();
        let popped = router.blpop(&[high.clone(), low.clone()], 1).await.unwrap();
        assert_eq!(popped, Some((format!("resque:{low}"), "job".to_string())));

        // Priority order holds across shards.
        router.rpush(&low, "low-job").await.unwrap();
        router.rpush(&high, "high-job").await.unwrap();
        let popped = router.blpop(&[high.clone(), low.clone()], 1).await.unwrap();
        assert_eq!(popped, Some(("resque:queue:high".to_string(), "high-job".to_string())));
    }

    #[tokio::test]
    async fn test_blocking_pop_across_shards_times_out() {
        let connector = MemoryConnector::new("");
        let router = ClusterRouter::new(vec![shard(1), shard(2), shard(3)], 128, &connector).unwrap();
        let high = "queue:high".to_string();
        let low = key_on_other_shard(&router, &high);

        let started = std::time::Instant::now();
        assert_eq!(router.blpop(&[high, low], 1).await.unwrap(), None);
        assert!(started.elapsed() >= Duration::from_millis(900));
    }

    #[tokio::test]
    async fn test_blocking_pop_across_shards_wakes_on_push() {
        let connector = MemoryConnector::new("");
        let router =
            Arc::new(ClusterRouter::new(vec![shard(1), shard(2), shard(3)], 128, &connector).unwrap());
        let high = "queue:high".to_string();
        let low = key_on_other_shard(&router, &high);

        let pusher = Arc::clone(&router);
        let target = low.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(200)).await;
            pusher.rpush(&target, "late").await.unwrap();
        });

        let popped = router.blpop(&[high, low.clone()], 5).await.unwrap();
        assert_eq!(popped, Some((low, "late".to_string())));
    }

    #[tokio::test]
    async fn test_broadcast_reaches_every_shard_in_order() {
        let connector = MemoryConnector::new("");
        let shards = vec![shard(1), shard(2), shard(3).as_master().write_only(true)];
        let router = ClusterRouter::new(shards, 16, &connector).unwrap();

        let echoed = router.all("ECHO", &["hello".to_string()]).await.unwrap();
        assert_eq!(echoed.len(), 3);

        let results = router.all("DBSIZE", &[]).await.unwrap();
        assert_eq!(results, vec![redis::Value::Int(0); 3]);

        router.set("k", "v").await.unwrap();
        let master = connector.store("10.0.0.3:6379").unwrap();
        assert_eq!(master.get("k").await.unwrap(), Some("v".to_string()));
        let results = router.all("DBSIZE", &[]).await.unwrap();
        assert_eq!(
            results,
            vec![redis::Value::Int(0), redis::Value::Int(0), redis::Value::Int(1)]
        );
    }

    #[tokio::test]
    async fn test_call_routes_raw_commands() {
        let connector = MemoryConnector::new("");
        let router = ClusterRouter::new(vec![shard(1), shard(2)], 16, &connector).unwrap();
        let pong = router.call("PING", &[]).await.unwrap();
        assert_eq!(pong, redis::Value::Status("PONG".to_string()));
        assert!(router.call("SENTINEL", &["masters".to_string()]).await.is_err());
    }

    #[test]
    fn test_pin_follows_writes() {
        let connector = MemoryConnector::new("");
        let router = ClusterRouter::new(vec![shard(1), shard(2), shard(3).as_master()], 16, &connector)
            .unwrap();
        let pinned = router.pin("queue:emails").expect("router pins");
        assert_eq!(pinned.endpoint(), "10.0.0.3:6379");

        let router = ClusterRouter::new(vec![shard(1), shard(2)], 16, &connector).unwrap();
        let pinned = router.pin("queue:emails").expect("router pins");
        assert_eq!(pinned.endpoint(), endpoint_of(router.by_hash("queue:emails")));
    }
}
