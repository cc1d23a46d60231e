//! Reserved jobs and their execution lifecycle.
//!
//! A [`Job`] wraps one payload taken off a queue. Running it goes through
//!
//! ```text
//! before_perform -> RUNNING -> set_up -> perform -> tear_down -> after_perform -> COMPLETE
//! ```
//!
//! A veto from a hook or `set_up` ends the run as [`PerformOutcome::Skipped`]
//! without recording a failure. Any error fails the job: `on_failure` hooks
//! fire, the status becomes FAILED, a failure record is written and the
//! failure counters are bumped.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, error, info, warn};

use super::failure::{self, FailureRecord};
use super::hooks::HookOutcome;
use super::queue::JobQueue;
use super::registry::{JobRegistry, JobUnit};
use super::status::{self, JobStatus};
use crate::error::{JobError, QueueError};

/// Worker name recorded for jobs run outside a worker.
const UNKNOWN_WORKER: &str = "unknown";

/// Serialized form of a queued job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payload {
    pub class: String,
    /// One-element sequence holding the argument mapping.
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Epoch seconds at enqueue time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue_time: Option<f64>,
}

impl Payload {
    pub fn new(class: impl Into<String>, args: Value, id: impl Into<String>) -> Self {
        Self {
            class: class.into(),
            args: vec![args],
            id: Some(id.into()),
            queue_time: Some(Utc::now().timestamp_micros() as f64 / 1_000_000.0),
        }
    }
}

/// How a run ended when no error was raised.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PerformOutcome {
    Completed,
    /// A hook or `set_up` vetoed the run.
    Skipped,
}

/// Result of [`Job::process`].
#[derive(Debug)]
pub enum JobOutcome {
    Completed,
    Skipped,
    Failed(JobError),
}

/// A job reserved from a queue.
#[derive(Debug, Clone)]
pub struct Job {
    queue: String,
    payload: Payload,
    worker: Option<String>,
}

impl Job {
    pub fn new(queue: impl Into<String>, payload: Payload) -> Self {
        Self {
            queue: queue.into(),
            payload,
            worker: None,
        }
    }

    /// Tags the job with the worker running it.
    pub fn with_worker(mut self, worker: impl Into<String>) -> Self {
        self.worker = Some(worker.into());
        self
    }

    pub fn id(&self) -> Option<&str> {
        self.payload.id.as_deref()
    }

    pub fn class(&self) -> &str {
        &self.payload.class
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn worker(&self) -> Option<&str> {
        self.worker.as_deref()
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    /// Raw argument sequence.
    pub fn args(&self) -> &[Value] {
        &self.payload.args
    }

    /// The argument mapping, empty when the job carries none.
    pub fn arguments(&self) -> Map<String, Value> {
        match self.payload.args.first() {
            Some(Value::Object(arguments)) => arguments.clone(),
            _ => Map::new(),
        }
    }

    /// Resolves the job's class to a runnable unit.
    pub fn get_instance(&self, registry: &JobRegistry) -> Result<Box<dyn JobUnit>, JobError> {
        registry.resolve(self.class())
    }

    /// Updates the tracked status. Untracked jobs and jobs without an id are
    /// left alone.
    pub async fn update_status(&self, queue: &JobQueue, status: JobStatus) -> Result<bool, QueueError> {
        match self.id() {
            Some(id) => status::update(queue.store().as_ref(), id, status).await,
            None => Ok(false),
        }
    }

    pub async fn status(&self, queue: &JobQueue) -> Result<Option<JobStatus>, QueueError> {
        match self.id() {
            Some(id) => queue.status(id).await,
            None => Ok(None),
        }
    }

    /// Runs the hooks and the unit of work.
    ///
    /// Only the RUNNING transition happens here; completion and failure
    /// bookkeeping is left to [`Job::process`].
    pub async fn perform(
        &self,
        queue: &JobQueue,
        registry: &JobRegistry,
    ) -> Result<PerformOutcome, JobError> {
        let hooks = queue.hooks();
        if hooks.before_perform(self).is_veto() {
            warn!(job = %self, "before_perform vetoed job");
            return Ok(PerformOutcome::Skipped);
        }

        self.update_status(queue, JobStatus::Running).await?;

        let mut unit = self.get_instance(registry)?;
        if unit.set_up(self).await?.is_veto() {
            warn!(job = %self, "set_up vetoed job");
            return Ok(PerformOutcome::Skipped);
        }
        unit.perform(self).await?;
        unit.tear_down(self).await?;

        if hooks.after_perform(self).is_veto() {
            warn!(job = %self, "after_perform vetoed job");
            return Ok(PerformOutcome::Skipped);
        }
        Ok(PerformOutcome::Completed)
    }

    /// Records `error` as this job's failure.
    pub async fn fail(&self, queue: &JobQueue, error: &JobError) -> Result<(), QueueError> {
        queue.hooks().on_failure(error, self);
        self.update_status(queue, JobStatus::Failed).await?;

        let worker = self.worker().unwrap_or(UNKNOWN_WORKER);
        let record = FailureRecord::new(self.payload.clone(), error, worker, &self.queue);
        failure::record(queue.store().as_ref(), &record).await
    }

    /// Performs the job and settles its status.
    ///
    /// Job errors are recorded and reported as [`JobOutcome::Failed`]. Store
    /// errors are returned as `Err` and leave no failure record.
    pub async fn process(
        &self,
        queue: &JobQueue,
        registry: &JobRegistry,
    ) -> Result<JobOutcome, QueueError> {
        debug!(job = %self, "Processing job");
        match self.perform(queue, registry).await {
            Ok(PerformOutcome::Completed) => {
                self.update_status(queue, JobStatus::Complete).await?;
                info!(
                    queue = %self.queue,
                    job_id = self.id().unwrap_or_default(),
                    class = %self.class(),
                    "Job completed"
                );
                Ok(JobOutcome::Completed)
            }
            Ok(PerformOutcome::Skipped) => Ok(JobOutcome::Skipped),
            // Not a job failure; nothing is recorded.
            Err(JobError::Store(err)) => Err(err),
            Err(err) => {
                error!(
                    queue = %self.queue,
                    job_id = self.id().unwrap_or_default(),
                    class = %self.class(),
                    error = %err,
                    "Job failed"
                );
                self.fail(queue, &err).await?;
                Ok(JobOutcome::Failed(err))
            }
        }
    }

    /// Enqueues a copy of this job under a new id, tracked if the original
    /// was.
    pub async fn recreate(&self, queue: &JobQueue) -> Result<String, QueueError> {
        let tracked = match self.id() {
            Some(id) => status::is_tracking(queue.store().as_ref(), id).await?,
            None => false,
        };
        let arguments = match self.payload.args.first() {
            Some(Value::Object(arguments)) => Value::Object(arguments.clone()),
            _ => Value::Null,
        };
        queue
            .create(&self.queue, self.class(), arguments, tracked, None)
            .await
    }
}

impl std::fmt::Display for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "(Job{{{}}}", self.queue)?;
        if let Some(id) = self.id().filter(|id| !id.is_empty()) {
            write!(f, " | ID: {id}")?;
        }
        write!(f, " | {}", self.class())?;
        if !self.payload.args.is_empty() {
            let args = serde_json::to_string(&self.payload.args).map_err(|_| std::fmt::Error)?;
            write!(f, " | {args}")?;
        }
        f.write_str(")")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use crate::scheduler::hooks::Hooks;
    use crate::store::{MemoryStore, StoreClient};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    type Trace = Arc<Mutex<Vec<&'static str>>>;

    struct Traced {
        trace: Trace,
        veto_set_up: bool,
        fail_with: Option<&'static str>,
    }

    #[async_trait]
    impl JobUnit for Traced {
        async fn set_up(&mut self, _job: &Job) -> anyhow::Result<HookOutcome> {
            self.trace.lock().unwrap().push("set_up");
            if self.veto_set_up {
                Ok(HookOutcome::Veto)
            } else {
                Ok(HookOutcome::Proceed)
            }
        }

        async fn perform(&mut self, job: &Job) -> anyhow::Result<()> {
            self.trace.lock().unwrap().push("perform");
            assert_eq!(job.arguments().get("to"), Some(&json!("a@b.com")));
            match self.fail_with {
                Some(message) => Err(anyhow::anyhow!(message)),
                None => Ok(()),
            }
        }

        async fn tear_down(&mut self, _job: &Job) -> anyhow::Result<()> {
            self.trace.lock().unwrap().push("tear_down");
            Ok(())
        }
    }

    fn registry(trace: &Trace, veto_set_up: bool, fail_with: Option<&'static str>) -> JobRegistry {
        let mut registry = JobRegistry::new();
        let trace = Arc::clone(trace);
        registry
            .register("SendWelcome", move || Traced {
                trace: Arc::clone(&trace),
                veto_set_up,
                fail_with,
            })
            .declare("Declared");
        registry
    }

    fn traced_hooks(trace: &Trace) -> Hooks {
        let before = Arc::clone(trace);
        let after = Arc::clone(trace);
        Hooks::new()
            .with_before_perform(move |_| {
                before.lock().unwrap().push("before_perform");
                HookOutcome::Proceed
            })
            .with_after_perform(move |_| {
                after.lock().unwrap().push("after_perform");
                HookOutcome::Proceed
            })
    }

    async fn reserve_one(queue: &JobQueue, class: &str, track: bool) -> Job {
        queue
            .create("emails", class, json!({"to": "a@b.com"}), track, None)
            .await
            .unwrap();
        queue.reserve("emails").await.unwrap().expect("job queued")
    }

    #[test]
    fn test_payload_decoding_tolerates_missing_fields() {
        let payload: Payload = serde_json::from_str(r#"{"class":"A"}"#).unwrap();
        assert_eq!(payload.class, "A");
        assert!(payload.args.is_empty());
        assert!(payload.id.is_none());

        let job = Job::new("q", payload);
        assert!(job.arguments().is_empty());
        assert_eq!(job.to_string(), "(Job{q} | A)");
    }

    #[test]
    fn test_display() {
        let payload = Payload::new("SendWelcome", json!({"to": "a@b.com"}), "abc");
        let job = Job::new("emails", payload);
        assert_eq!(
            job.to_string(),
            r#"(Job{emails} | ID: abc | SendWelcome | [{"to":"a@b.com"}])"#
        );
    }

    #[tokio::test]
    async fn test_lifecycle_order_and_completion() {
        let trace: Trace = Arc::default();
        let store = Arc::new(MemoryStore::new("resque:"));
        let queue = JobQueue::new(store).with_hooks(traced_hooks(&trace));
        let registry = registry(&trace, false, None);

        let job = reserve_one(&queue, "SendWelcome", true).await;
        let outcome = job.process(&queue, &registry).await.unwrap();

        assert!(matches!(outcome, JobOutcome::Completed));
        assert_eq!(
            *trace.lock().unwrap(),
            vec!["before_perform", "set_up", "perform", "tear_down", "after_perform"]
        );
        assert_eq!(job.status(&queue).await.unwrap(), Some(JobStatus::Complete));
        assert_eq!(queue.failed_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_before_perform_veto_skips_without_failure() {
        let trace: Trace = Arc::default();
        let queue = JobQueue::new(Arc::new(MemoryStore::new("resque:")))
            .with_hooks(Hooks::new().with_before_perform(|_| HookOutcome::Veto));
        let registry = registry(&trace, false, None);

        let job = reserve_one(&queue, "SendWelcome", true).await;
        assert_eq!(job.perform(&queue, &registry).await.unwrap(), PerformOutcome::Skipped);
        assert!(matches!(job.process(&queue, &registry).await.unwrap(), JobOutcome::Skipped));

        assert!(trace.lock().unwrap().is_empty());
        assert_eq!(job.status(&queue).await.unwrap(), Some(JobStatus::Waiting));
        assert_eq!(queue.failed_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_set_up_veto_skips() {
        let trace: Trace = Arc::default();
        let queue = JobQueue::new(Arc::new(MemoryStore::new("resque:")));
        let registry = registry(&trace, true, None);

        let job = reserve_one(&queue, "SendWelcome", false).await;
        assert!(matches!(job.process(&queue, &registry).await.unwrap(), JobOutcome::Skipped));
        assert_eq!(*trace.lock().unwrap(), vec!["set_up"]);
        assert!(queue.failures(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_store_error_propagates_without_failure_record() {
        let trace: Trace = Arc::default();
        let failures = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&failures);
        let store = Arc::new(MemoryStore::new("resque:"));
        let queue = JobQueue::new(store.clone()).with_hooks(Hooks::new().with_on_failure(
            move |_, _| {
                seen.fetch_add(1, Ordering::SeqCst);
            },
        ));
        let registry = registry(&trace, false, None);

        let job = reserve_one(&queue, "SendWelcome", true).await;
        // A status key of the wrong type makes the RUNNING update fail.
        let key = status::status_key(job.id().unwrap());
        store.del(&key).await.unwrap();
        store.rpush(&key, "garbage").await.unwrap();

        let result = job.process(&queue, &registry).await;
        assert!(matches!(result, Err(QueueError::Store(StoreError::WrongType(_)))));
        assert!(trace.lock().unwrap().is_empty());
        assert_eq!(failures.load(Ordering::SeqCst), 0);
        assert_eq!(queue.failed_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_perform_error_records_failure() {
        let trace: Trace = Arc::default();
        let failures = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&failures);
        let store = Arc::new(MemoryStore::new("resque:"));
        let queue = JobQueue::new(store.clone()).with_hooks(Hooks::new().with_on_failure(
            move |error, job| {
                assert_eq!(job.class(), "SendWelcome");
                assert_eq!(error.to_string(), "smtp down");
                seen.fetch_add(1, Ordering::SeqCst);
            },
        ));
        let registry = registry(&trace, false, Some("smtp down"));

        let job = reserve_one(&queue, "SendWelcome", true)
            .await
            .with_worker("host:1:emails");
        let outcome = job.process(&queue, &registry).await.unwrap();

        assert!(matches!(outcome, JobOutcome::Failed(JobError::Perform(_))));
        // tear_down does not run after a failed perform.
        assert_eq!(*trace.lock().unwrap(), vec!["set_up", "perform"]);
        assert_eq!(failures.load(Ordering::SeqCst), 1);
        assert_eq!(job.status(&queue).await.unwrap(), Some(JobStatus::Failed));

        let records = queue.failures(10).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].worker, "host:1:emails");
        assert_eq!(records[0].queue, "emails");
        assert_eq!(records[0].error, "smtp down");
        assert_eq!(
            store.get("stat:failed:host:1:emails").await.unwrap(),
            Some("1".to_string())
        );
    }

    #[tokio::test]
    async fn test_declared_class_fails_unresolved_once() {
        let trace: Trace = Arc::default();
        let store = Arc::new(MemoryStore::new("resque:"));
        let queue = JobQueue::new(store.clone());
        let registry = registry(&trace, false, None);

        let job = reserve_one(&queue, "Declared", false).await.with_worker("w1");
        let outcome = job.process(&queue, &registry).await.unwrap();

        match outcome {
            JobOutcome::Failed(err) => assert!(matches!(err, JobError::MissingPerform(_))),
            other => panic!("expected failure, got {other:?}"),
        }
        let records = queue.failures(10).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].exception, "UnresolvedJob");
        assert_eq!(queue.failed_count().await.unwrap(), 1);
        assert_eq!(store.get("stat:failed:w1").await.unwrap(), Some("1".to_string()));
    }

    #[tokio::test]
    async fn test_unknown_class_is_not_found() {
        let trace: Trace = Arc::default();
        let queue = JobQueue::new(Arc::new(MemoryStore::new("resque:")));
        let registry = registry(&trace, false, None);

        let job = reserve_one(&queue, "Nope", false).await;
        assert!(matches!(
            job.get_instance(&registry),
            Err(JobError::ClassNotFound(_))
        ));
        assert!(matches!(
            job.perform(&queue, &registry).await,
            Err(JobError::ClassNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_recreate_preserves_tracking() {
        let queue = JobQueue::new(Arc::new(MemoryStore::new("resque:")));

        let tracked = reserve_one(&queue, "SendWelcome", true).await;
        let new_id = tracked.recreate(&queue).await.unwrap();
        assert_ne!(Some(new_id.as_str()), tracked.id());
        assert_eq!(queue.status(&new_id).await.unwrap(), Some(JobStatus::Waiting));

        let copy = queue.reserve("emails").await.unwrap().unwrap();
        assert_eq!(copy.id(), Some(new_id.as_str()));
        assert_eq!(copy.class(), "SendWelcome");
        assert_eq!(copy.args(), tracked.args());

        let untracked = reserve_one(&queue, "SendWelcome", false).await;
        let new_id = untracked.recreate(&queue).await.unwrap();
        assert_eq!(queue.status(&new_id).await.unwrap(), None);
    }
}
