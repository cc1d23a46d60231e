//! resque-cluster: Redis-backed job queue with cluster routing.
//!
//! This library provides a Resque-compatible job queue, a sharded store
//! router with master/replica split, and sentinel discovery.

// Core modules
pub mod backend;
pub mod cli;
pub mod cluster;
pub mod config;
pub mod error;
pub mod scheduler;
pub mod store;

pub use backend::Backend;
pub use config::{BackendConfig, SentinelOptions, ShardConfig, Topology};

// Re-export commonly used error types
pub use error::{JobError, QueueError, StoreError, TopologyError};
