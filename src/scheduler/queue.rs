//! Redis-backed job queue.
//!
//! # Key layout
//!
//! All keys live under the store's prefix (`resque:` by default):
//!
//! - `queues`: set of known queue names
//! - `queue:<name>`: list of JSON payloads, consumed from the head
//! - `queue:<name>:temp:<epoch>` and `…:requeue`: scan buffers used by
//!   selective dequeue
//! - `job:<id>:status`: status of tracked jobs
//! - `failed`, `stat:failed`, `stat:failed:<worker>`: failure log and counters
//! - `delayed_queue_schedule`: sorted set kept by an external scheduler
//!
//! The engine holds no locks of its own. Each operation relies on the
//! atomicity of single store commands, so a selective dequeue can race with
//! producers and consumers of the same queue.

use std::sync::Arc;

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::failure::{self, FailureRecord};
use super::hooks::{EnqueueEvent, Hooks};
use super::job::{Job, Payload};
use super::matcher::{match_item, MatchSpec};
use super::status::{self, JobStatus};
use crate::error::QueueError;
use crate::store::StoreClient;

const QUEUES_KEY: &str = "queues";
const DELAYED_SCHEDULE_KEY: &str = "delayed_queue_schedule";

fn queue_key(queue: &str) -> String {
    format!("queue:{queue}")
}

/// Recovers the queue name from a fully-qualified list key.
fn queue_from_key(prefix: &str, key: &str) -> Result<String, QueueError> {
    let expected = format!("{prefix}queue:");
    match key.strip_prefix(&expected) {
        Some(queue) => Ok(queue.to_string()),
        None => Err(QueueError::UnexpectedKey {
            key: key.to_string(),
            prefix: expected,
        }),
    }
}

/// New 32-hex-character job id.
pub fn generate_job_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Result of [`JobQueue::enqueue`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Enqueued {
    Created(String),
    /// A `before_enqueue` hook vetoed the job; nothing was queued.
    Vetoed,
}

impl Enqueued {
    pub fn id(&self) -> Option<&str> {
        match self {
            Enqueued::Created(id) => Some(id),
            Enqueued::Vetoed => None,
        }
    }
}

/// Item returned by a blocking pop.
#[derive(Debug, Clone, PartialEq)]
pub struct PoppedItem {
    pub queue: String,
    pub payload: Value,
}

/// Job queue over any [`StoreClient`], single endpoint or cluster.
#[derive(Clone)]
pub struct JobQueue {
    store: Arc<dyn StoreClient>,
    hooks: Hooks,
}

impl JobQueue {
    pub fn new(store: Arc<dyn StoreClient>) -> Self {
        Self {
            store,
            hooks: Hooks::default(),
        }
    }

    pub fn with_hooks(mut self, hooks: Hooks) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn store(&self) -> &Arc<dyn StoreClient> {
        &self.store
    }

    pub fn hooks(&self) -> &Hooks {
        &self.hooks
    }

    /// Registers `queue` and appends `item` to it.
    pub async fn push<T: Serialize + ?Sized>(&self, queue: &str, item: &T) -> Result<bool, QueueError> {
        let encoded = serde_json::to_string(item)?;
        self.store.sadd(QUEUES_KEY, queue).await?;
        let length = self.store.rpush(&queue_key(queue), &encoded).await?;
        debug!(queue, length, "Pushed item");
        Ok(length >= 1)
    }

    /// Removes and decodes the head of `queue`.
    pub async fn pop(&self, queue: &str) -> Result<Option<Value>, QueueError> {
        match self.store.lpop(&queue_key(queue)).await? {
            Some(raw) => Ok(Some(decode(queue, raw)?)),
            None => Ok(None),
        }
    }

    /// Waits up to `timeout_secs` for an item on any of `queues`, checked in
    /// order. A timeout of 0 waits forever.
    pub async fn blocking_pop<S: AsRef<str>>(
        &self,
        queues: &[S],
        timeout_secs: u64,
    ) -> Result<Option<PoppedItem>, QueueError> {
        match self.blocking_pop_raw(queues, timeout_secs).await? {
            Some((queue, raw)) => {
                let payload = decode(&queue, raw)?;
                Ok(Some(PoppedItem { queue, payload }))
            }
            None => Ok(None),
        }
    }

    async fn blocking_pop_raw<S: AsRef<str>>(
        &self,
        queues: &[S],
        timeout_secs: u64,
    ) -> Result<Option<(String, String)>, QueueError> {
        if queues.is_empty() {
            return Err(QueueError::Validation(
                "blocking pop needs at least one queue".to_string(),
            ));
        }

        let keys: Vec<String> = queues.iter().map(|q| queue_key(q.as_ref())).collect();
        match self.store.blpop(&keys, timeout_secs).await? {
            Some((key, raw)) => Ok(Some((queue_from_key(self.store.prefix(), &key)?, raw))),
            None => Ok(None),
        }
    }

    /// Creates a job unless a `before_enqueue` hook vetoes it.
    ///
    /// `args` must be a JSON object or null.
    pub async fn enqueue(
        &self,
        queue: &str,
        class: &str,
        args: Value,
        track_status: bool,
    ) -> Result<Enqueued, QueueError> {
        validate(queue, class, &args)?;

        let id = generate_job_id();
        let event = EnqueueEvent {
            class,
            args: &args,
            queue,
            id: &id,
        };
        if self.hooks.before_enqueue(&event).is_veto() {
            warn!(queue, class, job_id = %id, "before_enqueue vetoed job");
            return Ok(Enqueued::Vetoed);
        }

        self.create(queue, class, args.clone(), track_status, Some(id.clone()))
            .await?;
        self.hooks.after_enqueue(&event);
        Ok(Enqueued::Created(id))
    }

    /// Queues a job without running enqueue hooks. Returns its id.
    pub async fn create(
        &self,
        queue: &str,
        class: &str,
        args: Value,
        track_status: bool,
        id: Option<String>,
    ) -> Result<String, QueueError> {
        validate(queue, class, &args)?;

        let id = id.unwrap_or_else(generate_job_id);
        let payload = Payload::new(class, args, id.clone());
        self.push(queue, &payload).await?;
        if track_status {
            status::create(self.store.as_ref(), &id).await?;
        }
        debug!(queue, class, job_id = %id, tracked = track_status, "Created job");
        Ok(id)
    }

    /// Takes the next job off `queue` without blocking.
    pub async fn reserve(&self, queue: &str) -> Result<Option<Job>, QueueError> {
        match self.store.lpop(&queue_key(queue)).await? {
            Some(raw) => Ok(Some(Job::new(queue, decode(queue, raw)?))),
            None => Ok(None),
        }
    }

    /// Waits for the next job on any of `queues`.
    pub async fn reserve_blocking<S: AsRef<str>>(
        &self,
        queues: &[S],
        timeout_secs: u64,
    ) -> Result<Option<Job>, QueueError> {
        match self.blocking_pop_raw(queues, timeout_secs).await? {
            Some((queue, raw)) => {
                let payload = decode(&queue, raw)?;
                Ok(Some(Job::new(queue, payload)))
            }
            None => Ok(None),
        }
    }

    pub async fn size(&self, queue: &str) -> Result<u64, QueueError> {
        Ok(self.store.llen(&queue_key(queue)).await?)
    }

    /// Known queue names, sorted.
    pub async fn queues(&self) -> Result<Vec<String>, QueueError> {
        let mut queues = self.store.smembers(QUEUES_KEY).await?;
        queues.sort();
        Ok(queues)
    }

    /// Removes jobs from `queue`.
    ///
    /// Without specs the whole list is deleted and its prior length returned.
    /// With specs only matching jobs are removed, the rest keep their order.
    pub async fn dequeue(&self, queue: &str, specs: &[MatchSpec]) -> Result<u64, QueueError> {
        if specs.is_empty() {
            return self.remove_list(queue).await;
        }
        self.scan(queue, specs).run().await
    }

    /// Selective dequeue as a resumable scan.
    pub fn scan(&self, queue: &str, specs: &[MatchSpec]) -> QueueScan {
        QueueScan::new(&self.store, queue, specs.to_vec())
    }

    /// Deletes `queue` and drops it from the registry. Returns the number of
    /// removed jobs.
    pub async fn remove_queue(&self, queue: &str) -> Result<u64, QueueError> {
        let removed = self.remove_list(queue).await?;
        self.store.srem(QUEUES_KEY, queue).await?;
        info!(queue, removed, "Removed queue");
        Ok(removed)
    }

    async fn remove_list(&self, queue: &str) -> Result<u64, QueueError> {
        let key = queue_key(queue);
        let size = self.store.llen(&key).await?;
        let deleted = self.store.del(&key).await?;
        Ok(if deleted == 1 { size } else { 0 })
    }

    /// Status of a tracked job.
    pub async fn status(&self, id: &str) -> Result<Option<JobStatus>, QueueError> {
        let record = status::get(self.store.as_ref(), id).await?;
        Ok(record.and_then(|record| record.status()))
    }

    /// Jobs waiting in the delayed schedule.
    pub async fn delayed_jobs_count(&self) -> Result<u64, QueueError> {
        Ok(self.store.zcard(DELAYED_SCHEDULE_KEY).await?)
    }

    pub async fn failed_count(&self) -> Result<u64, QueueError> {
        failure::count(self.store.as_ref()).await
    }

    /// The oldest `limit` failure records.
    pub async fn failures(&self, limit: usize) -> Result<Vec<FailureRecord>, QueueError> {
        failure::peek(self.store.as_ref(), limit).await
    }
}

impl std::fmt::Debug for JobQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobQueue")
            .field("store", &self.store.endpoint())
            .field("hooks", &self.hooks)
            .finish()
    }
}

/// Decodes an item already removed from `queue`. On failure the raw item is
/// logged and carried in the error.
fn decode<T: DeserializeOwned>(queue: &str, raw: String) -> Result<T, QueueError> {
    serde_json::from_str(&raw).map_err(|source| {
        warn!(queue, raw = %raw, error = %source, "Dropped malformed queue item");
        QueueError::MalformedItem {
            queue: queue.to_string(),
            raw,
            source,
        }
    })
}

fn validate(queue: &str, class: &str, args: &Value) -> Result<(), QueueError> {
    if queue.is_empty() {
        return Err(QueueError::Validation("queue name must not be empty".to_string()));
    }
    if class.is_empty() {
        return Err(QueueError::Validation("job class must not be empty".to_string()));
    }
    if !matches!(args, Value::Object(_) | Value::Null) {
        return Err(QueueError::Validation(format!(
            "job arguments must be an object, got {args}"
        )));
    }
    Ok(())
}

/// Progress of a selective dequeue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanPhase {
    /// Moving items from the queue into the temp buffer one at a time.
    Scanning,
    /// Moving kept items from the requeue buffer back into the queue.
    Requeuing,
    /// Deleting the buffers.
    Cleanup,
    Done,
}

/// Non-destructive scan that removes matching jobs from a queue.
///
/// Each [`QueueScan::step`] is one or two store round trips. A scan that is
/// abandoned part way leaves jobs in [`QueueScan::temp_key`] or
/// [`QueueScan::requeue_key`].
pub struct QueueScan {
    store: Arc<dyn StoreClient>,
    specs: Vec<MatchSpec>,
    source: String,
    temp: String,
    requeue: String,
    phase: ScanPhase,
    removed: u64,
}

impl QueueScan {
    /// Starts a scan of `queue`. All buffers live on the endpoint owning
    /// the queue.
    pub fn new(store: &Arc<dyn StoreClient>, queue: &str, specs: Vec<MatchSpec>) -> Self {
        let source = queue_key(queue);
        let temp = format!("{source}:temp:{}", Utc::now().timestamp());
        let requeue = format!("{temp}:requeue");
        let store = store.pin(&source).unwrap_or_else(|| Arc::clone(store));

        Self {
            store,
            specs,
            source,
            temp,
            requeue,
            phase: ScanPhase::Scanning,
            removed: 0,
        }
    }

    pub fn phase(&self) -> ScanPhase {
        self.phase
    }

    /// Matching jobs removed so far.
    pub fn removed(&self) -> u64 {
        self.removed
    }

    pub fn temp_key(&self) -> &str {
        &self.temp
    }

    pub fn requeue_key(&self) -> &str {
        &self.requeue
    }

    /// Advances the scan by one item or phase transition.
    pub async fn step(&mut self) -> Result<ScanPhase, QueueError> {
        match self.phase {
            ScanPhase::Scanning => {
                match self.store.rpoplpush(&self.source, &self.temp).await? {
                    Some(item) if match_item(&item, &self.specs) => {
                        self.store.rpop(&self.temp).await?;
                        self.removed += 1;
                    }
                    Some(_) => {
                        self.store.rpoplpush(&self.temp, &self.requeue).await?;
                    }
                    None => self.phase = ScanPhase::Requeuing,
                }
            }
            ScanPhase::Requeuing => {
                if self
                    .store
                    .rpoplpush(&self.requeue, &self.source)
                    .await?
                    .is_none()
                {
                    self.phase = ScanPhase::Cleanup;
                }
            }
            ScanPhase::Cleanup => {
                self.store.del(&self.requeue).await?;
                self.store.del(&self.temp).await?;
                self.phase = ScanPhase::Done;
            }
            ScanPhase::Done => {}
        }
        Ok(self.phase)
    }

    /// Runs the scan to completion, returning the number of removed jobs.
    pub async fn run(mut self) -> Result<u64, QueueError> {
        while self.step().await? != ScanPhase::Done {}
        debug!(queue = %self.source, removed = self.removed, "Selective dequeue finished");
        Ok(self.removed)
    }
}
