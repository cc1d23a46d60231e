//! Cluster access layer.
//!
//! - [`ring`]: consistent-hash ring over shard addresses
//! - [`router`]: command routing with master/replica read-write split
//! - [`sentinel`]: topology discovery from a Redis sentinel

pub mod ring;
pub mod router;
pub mod sentinel;

pub use ring::HashRing;
pub use router::{ClusterRouter, Shard};
pub use sentinel::{NodeInfo, Sentinel, SentinelTransport};
