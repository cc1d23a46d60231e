//! Sentinel topology discovery.
//!
//! A sentinel reports the current master and replicas of a named service.
//! [`Sentinel::create_cluster`] turns that report into a [`ClusterRouter`]
//! with the master tagged for writes and the working replicas serving reads.
//!
//! Discovered topology is not watched. After a failover callers must
//! [`Sentinel::forget`] the cached router and build a new one.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use rand::seq::IndexedRandom;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::router::ClusterRouter;
use crate::config::{SentinelOptions, ShardConfig};
use crate::error::{StoreError, TopologyError};
use crate::store::{Connector, RedisConnector, RedisStore, StoreClient};

/// Sends `SENTINEL <args>` to a sentinel endpoint.
#[async_trait]
pub trait SentinelTransport: Send + Sync {
    async fn sentinel(&self, args: &[String]) -> Result<redis::Value, StoreError>;

    /// Plain `PING` to the sentinel itself.
    async fn ping(&self) -> Result<redis::Value, StoreError>;

    /// Endpoint name for logs.
    fn endpoint(&self) -> String;
}

#[async_trait]
impl SentinelTransport for RedisStore {
    async fn sentinel(&self, args: &[String]) -> Result<redis::Value, StoreError> {
        self.execute("SENTINEL", args).await
    }

    async fn ping(&self) -> Result<redis::Value, StoreError> {
        self.execute("PING", &[]).await
    }

    fn endpoint(&self) -> String {
        StoreClient::endpoint(self)
    }
}

/// One master or replica row of a sentinel reply.
///
/// Rows are flat field/value sequences; values are read by position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeInfo {
    pub name: String,
    pub ip: String,
    pub port: u16,
    pub flags: String,
    /// The raw row.
    pub fields: Vec<String>,
}

const NAME_FIELD: usize = 1;
const IP_FIELD: usize = 3;
const PORT_FIELD: usize = 5;
const FLAGS_FIELD: usize = 9;

impl NodeInfo {
    /// Parses a positional sentinel row.
    ///
    /// # Errors
    ///
    /// Returns `TopologyError::MalformedReply` if the row is too short or the
    /// port is not a number.
    pub fn from_fields(fields: Vec<String>) -> Result<Self, TopologyError> {
        let field = |index: usize| {
            fields.get(index).cloned().ok_or_else(|| {
                TopologyError::MalformedReply(format!(
                    "row has {} fields, expected field {}",
                    fields.len(),
                    index
                ))
            })
        };

        let port = field(PORT_FIELD)?;
        let port = port
            .parse::<u16>()
            .map_err(|_| TopologyError::MalformedReply(format!("invalid port '{port}'")))?;

        Ok(Self {
            name: field(NAME_FIELD)?,
            ip: field(IP_FIELD)?,
            port,
            flags: field(FLAGS_FIELD)?,
            fields,
        })
    }

    /// Whether the sentinel considers the node down or unreachable.
    pub fn is_flagged(&self) -> bool {
        self.flags.contains("s_down") || self.flags.contains("disconnected")
    }

    /// Shard descriptor for this node.
    pub fn shard(&self, options: &SentinelOptions) -> ShardConfig {
        discovered_shard(self.ip.clone(), self.port, options)
    }
}

/// Shard for a sentinel-reported address, carrying the deployment's db and
/// credentials.
fn discovered_shard(ip: String, port: u16, options: &SentinelOptions) -> ShardConfig {
    let shard = ShardConfig::new(ip, port).with_db(options.db);
    match &options.password {
        Some(password) => shard.with_password(password.clone()),
        None => shard,
    }
}

fn malformed(error: redis::RedisError) -> TopologyError {
    TopologyError::MalformedReply(error.to_string())
}

/// Client for one sentinel endpoint.
pub struct Sentinel {
    transport: Arc<dyn SentinelTransport>,
    connector: Arc<dyn Connector>,
    clusters: Mutex<HashMap<String, Arc<ClusterRouter>>>,
}

impl Sentinel {
    pub fn new(transport: Arc<dyn SentinelTransport>, connector: Arc<dyn Connector>) -> Self {
        Self {
            transport,
            connector,
            clusters: Mutex::new(HashMap::new()),
        }
    }

    /// Sentinel at `address` handing out Redis clients with `prefix`.
    ///
    /// # Errors
    ///
    /// Returns `TopologyError::Store` if the address is not a valid endpoint.
    pub fn connect(address: &ShardConfig, prefix: impl Into<String>) -> Result<Self, TopologyError> {
        let transport = RedisStore::new(address, "")?;
        Ok(Self::new(
            Arc::new(transport),
            Arc::new(RedisConnector::new(prefix)),
        ))
    }

    async fn command(&self, args: &[&str]) -> Result<redis::Value, TopologyError> {
        let args: Vec<String> = args.iter().map(|a| a.to_string()).collect();
        debug!(sentinel = %self.transport.endpoint(), args = ?args, "Querying sentinel");
        Ok(self.transport.sentinel(&args).await?)
    }

    /// Every master the sentinel monitors.
    pub async fn masters(&self) -> Result<Vec<NodeInfo>, TopologyError> {
        let reply = self.command(&["masters"]).await?;
        let rows: Vec<Vec<String>> = redis::from_redis_value(&reply).map_err(malformed)?;
        rows.into_iter().map(NodeInfo::from_fields).collect()
    }

    /// Replicas of the master `name`.
    pub async fn slaves(&self, name: &str) -> Result<Vec<NodeInfo>, TopologyError> {
        let reply = self.command(&["slaves", name]).await?;
        let rows: Vec<Vec<String>> = redis::from_redis_value(&reply).map_err(malformed)?;
        rows.into_iter().map(NodeInfo::from_fields).collect()
    }

    /// State of the master `name`.
    pub async fn master(&self, name: &str) -> Result<NodeInfo, TopologyError> {
        let reply = self.command(&["master", name]).await?;
        let fields: Vec<String> = redis::from_redis_value(&reply).map_err(malformed)?;
        NodeInfo::from_fields(fields)
    }

    /// `(ip, port)` of the current master, `None` if the name is unknown.
    pub async fn get_master_addr_by_name(
        &self,
        name: &str,
    ) -> Result<Option<(String, u16)>, TopologyError> {
        let reply = self.command(&["get-master-addr-by-name", name]).await?;
        let address: Option<Vec<String>> = redis::from_redis_value(&reply).map_err(malformed)?;
        match address.as_deref() {
            None | Some([]) => Ok(None),
            Some([ip, port, ..]) => {
                let port = port
                    .parse::<u16>()
                    .map_err(|_| TopologyError::MalformedReply(format!("invalid port '{port}'")))?;
                Ok(Some((ip.clone(), port)))
            }
            Some(other) => Err(TopologyError::MalformedReply(format!(
                "expected an address pair, got {other:?}"
            ))),
        }
    }

    /// Whether the sentinel answers `PONG`.
    pub async fn ping(&self) -> Result<bool, TopologyError> {
        match self.transport.ping().await? {
            redis::Value::Status(status) => Ok(status == "PONG"),
            redis::Value::Data(data) => Ok(data == b"PONG"),
            _ => Ok(false),
        }
    }

    /// Forces a failover of the master `name`.
    pub async fn failover(&self, name: &str) -> Result<(), TopologyError> {
        self.command(&["failover", name]).await?;
        info!(service = name, "Requested sentinel failover");
        Ok(())
    }

    /// Client for the current master of `name`.
    pub async fn master_client(
        &self,
        name: &str,
        options: &SentinelOptions,
    ) -> Result<Arc<dyn StoreClient>, TopologyError> {
        let (ip, port) = self
            .get_master_addr_by_name(name)
            .await?
            .ok_or_else(|| TopologyError::MasterNotFound(name.to_string()))?;
        Ok(self.connector.connect(&discovered_shard(ip, port, options))?)
    }

    /// Clients for every working replica of `name`.
    pub async fn slave_clients(
        &self,
        name: &str,
        options: &SentinelOptions,
    ) -> Result<Vec<Arc<dyn StoreClient>>, TopologyError> {
        let mut clients = Vec::new();
        for slave in self.slaves(name).await? {
            if slave.is_flagged() {
                continue;
            }
            clients.push(self.connector.connect(&slave.shard(options))?);
        }
        Ok(clients)
    }

    /// Builds a router over the master and working replicas of `name`.
    ///
    /// # Errors
    ///
    /// Returns `TopologyError::MasterDown` if the master is flagged down or
    /// disconnected.
    pub async fn create_cluster(
        &self,
        name: &str,
        options: &SentinelOptions,
    ) -> Result<ClusterRouter, TopologyError> {
        let master = self.master(name).await?;
        if master.is_flagged() {
            return Err(TopologyError::MasterDown(name.to_string()));
        }

        let mut working = Vec::new();
        for slave in self.slaves(name).await? {
            if slave.is_flagged() {
                warn!(
                    service = name,
                    shard = %format!("{}:{}", slave.ip, slave.port),
                    flags = %slave.flags,
                    "Skipping flagged replica"
                );
                continue;
            }
            working.push(slave.shard(options));
        }

        let mut shards = Vec::new();
        if !working.is_empty() {
            if options.select_random_slave {
                if !options.write_only {
                    working.push(master.shard(options));
                }
                if let Some(chosen) = working.choose(&mut rand::rng()) {
                    shards.push(chosen.clone());
                }
            } else {
                shards = working;
            }
        }
        shards.push(master.shard(options).as_master().write_only(options.write_only));

        info!(
            service = name,
            master = %format!("{}:{}", master.ip, master.port),
            shards = shards.len(),
            "Discovered sentinel topology"
        );
        ClusterRouter::new(shards, options.replicas, self.connector.as_ref())
    }

    /// Cached router for `name`, built on first request.
    pub async fn cluster(
        &self,
        name: &str,
        options: &SentinelOptions,
    ) -> Result<Arc<ClusterRouter>, TopologyError> {
        let mut clusters = self.clusters.lock().await;
        if let Some(router) = clusters.get(name) {
            return Ok(Arc::clone(router));
        }
        let router = Arc::new(self.create_cluster(name, options).await?);
        clusters.insert(name.to_string(), Arc::clone(&router));
        Ok(router)
    }

    /// Drops the cached router for `name`. Returns whether one existed.
    pub async fn forget(&self, name: &str) -> bool {
        self.clusters.lock().await.remove(name).is_some()
    }
}
