//! Process-wide store handle.
//!
//! [`Backend`] owns the configuration and the store built from it. The store
//! is created on first use and kept until [`Backend::set_backend`] swaps the
//! configuration or [`Backend::reset`] drops it. Components receive the
//! store (or a [`JobQueue`] over it) explicitly; nothing here is global.

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::info;

use crate::cluster::{ClusterRouter, Sentinel};
use crate::config::{BackendConfig, Topology};
use crate::error::QueueError;
use crate::scheduler::{Hooks, JobQueue};
use crate::store::{Connector, RedisConnector, RedisStore, StoreClient};

struct State {
    config: BackendConfig,
    store: Option<Arc<dyn StoreClient>>,
}

/// Lazily built store for one deployment.
pub struct Backend {
    state: Mutex<State>,
    /// Overrides the Redis connector built from the configured prefix.
    connector: Option<Arc<dyn Connector>>,
}

impl Backend {
    /// Backend connecting to Redis.
    pub fn new(config: BackendConfig) -> Self {
        Self {
            state: Mutex::new(State {
                config,
                store: None,
            }),
            connector: None,
        }
    }

    /// Backend creating shard clients through `connector`. The connector's
    /// prefix applies instead of the configured one.
    pub fn with_connector(config: BackendConfig, connector: Arc<dyn Connector>) -> Self {
        Self {
            connector: Some(connector),
            ..Self::new(config)
        }
    }

    pub async fn config(&self) -> BackendConfig {
        self.state.lock().await.config.clone()
    }

    /// The store, built on first call.
    ///
    /// # Errors
    ///
    /// Returns `QueueError::Topology` if the cluster or sentinel topology
    /// cannot be resolved.
    pub async fn store(&self) -> Result<Arc<dyn StoreClient>, QueueError> {
        let mut state = self.state.lock().await;
        if let Some(store) = &state.store {
            return Ok(Arc::clone(store));
        }

        let store = self.build(&state.config).await?;
        info!(endpoint = %store.endpoint(), prefix = %store.prefix(), "Store backend ready");
        state.store = Some(Arc::clone(&store));
        Ok(store)
    }

    /// A queue over the store with `hooks` registered.
    pub async fn queue(&self, hooks: Hooks) -> Result<JobQueue, QueueError> {
        Ok(JobQueue::new(self.store().await?).with_hooks(hooks))
    }

    /// Replaces the configuration. The next [`Backend::store`] call builds a
    /// new store.
    pub async fn set_backend(&self, config: BackendConfig) {
        let mut state = self.state.lock().await;
        if let Some(store) = state.store.take() {
            store.reset().await;
        }
        state.config = config;
    }

    /// Drops cached connections. Call before forking.
    pub async fn reset(&self) {
        let mut state = self.state.lock().await;
        if let Some(store) = state.store.take() {
            store.reset().await;
            info!(endpoint = %store.endpoint(), "Store backend reset");
        }
    }

    /// Whether a store is currently built.
    pub async fn is_connected(&self) -> bool {
        self.state.lock().await.store.is_some()
    }

    async fn build(&self, config: &BackendConfig) -> Result<Arc<dyn StoreClient>, QueueError> {
        let connector: Arc<dyn Connector> = match &self.connector {
            Some(connector) => Arc::clone(connector),
            None => Arc::new(RedisConnector::new(config.prefix.clone())),
        };

        match &config.topology {
            Topology::Single(shard) => Ok(connector.connect(shard)?),
            Topology::Cluster { shards, replicas } => {
                let router = ClusterRouter::new(shards.clone(), *replicas, connector.as_ref())?;
                Ok(Arc::new(router))
            }
            Topology::Sentinel {
                sentinel,
                service,
                options,
            } => {
                let transport = RedisStore::new(sentinel, "")?;
                let sentinel = Sentinel::new(Arc::new(transport), connector);
                let router = sentinel.create_cluster(service, options).await?;
                Ok(Arc::new(router))
            }
        }
    }
}

impl std::fmt::Debug for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backend")
            .field("custom_connector", &self.connector.is_some())
            .finish_non_exhaustive()
    }
}
