//! Job queue engine and job lifecycle.
//!
//! - **JobQueue**: push/pop, blocking multi-queue pop, enqueue with hooks,
//!   selective dequeue, queue registry
//! - **Job**: one reserved payload and its perform/fail/recreate lifecycle
//! - **WorkerPool**: in-process workers reserving and running jobs
//!
//! # Architecture
//!
//! ```text
//!                      ┌──────────────┐
//!                      │   Producer   │
//!                      │ (enqueue)    │
//!                      └──────┬───────┘
//!                             │
//!                      ┌──────▼───────┐
//!                      │ StoreClient  │
//!                      │ (one server  │
//!                      │  or cluster) │
//!                      └──────┬───────┘
//!                             │
//!         ┌───────────────────┼───────────────────┐
//!         │                   │                   │
//!         ▼                   ▼                   ▼
//!    ┌─────────┐         ┌─────────┐         ┌─────────┐
//!    │ Worker 1│         │ Worker 2│         │ Worker N│
//!    └─────────┘         └─────────┘         └─────────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use resque_cluster::scheduler::{JobQueue, JobRegistry, WorkerConfig, WorkerPool};
//! use resque_cluster::store::MemoryStore;
//! use std::sync::Arc;
//!
//! let queue = Arc::new(JobQueue::new(Arc::new(MemoryStore::new("resque:"))));
//! queue.enqueue("emails", "SendWelcome", json!({"to": "a@b.com"}), true).await?;
//!
//! let mut registry = JobRegistry::new();
//! registry.register("SendWelcome", || SendWelcome);
//!
//! let mut pool = WorkerPool::new(WorkerConfig::new(["emails"]), queue, Arc::new(registry));
//! pool.start()?;
//! pool.shutdown().await?;
//! ```
//!
//! # Delivery
//!
//! Delivery is at least once. A job is removed from its queue when reserved;
//! a worker that dies mid-job loses it, and a retried job may run twice.

pub mod failure;
pub mod hooks;
pub mod job;
pub mod matcher;
pub mod queue;
pub mod registry;
pub mod status;
pub mod worker;

pub use failure::FailureRecord;
pub use hooks::{EnqueueEvent, HookOutcome, Hooks};
pub use job::{Job, JobOutcome, Payload, PerformOutcome};
pub use matcher::MatchSpec;
pub use queue::{Enqueued, JobQueue, PoppedItem, QueueScan, ScanPhase};
pub use registry::{JobRegistry, JobUnit};
pub use status::JobStatus;
pub use worker::{PoolError, Worker, WorkerConfig, WorkerPool, WorkerStats};
