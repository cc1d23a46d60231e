//! In-process workers that reserve and run jobs.
//!
//! A [`WorkerPool`] spawns a number of [`Worker`] tasks sharing one queue and
//! registry. Workers stop when the pool broadcasts shutdown; a job being run
//! at that moment finishes first.
//!
//! Process forking and signal handling are left to the host application.
//! Call [`crate::backend::Backend::reset`] before forking so the child opens
//! its own connections.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use super::job::{Job, JobOutcome};
use super::queue::JobQueue;
use super::registry::JobRegistry;
use crate::error::QueueError;

/// Errors raised by the worker pool itself.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("Pool is already running")]
    AlreadyRunning,

    #[error("Pool is not running")]
    NotRunning,

    #[error("Shutdown timed out after {0:?}")]
    ShutdownTimeout(Duration),

    #[error("Worker pool needs at least one queue")]
    NoQueues,
}

/// Configuration for workers.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Queues to take jobs from, highest priority first.
    pub queues: Vec<String>,
    /// Number of worker tasks.
    pub num_workers: usize,
    /// Poll interval, or the blocking-pop timeout in blocking mode.
    pub interval: Duration,
    /// Wait on a blocking pop instead of polling.
    pub blocking: bool,
    /// Base name recorded with failures. Defaults to `host:pid:queues`.
    pub worker_id: Option<String>,
    pub shutdown_timeout: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            queues: vec!["default".to_string()],
            num_workers: 1,
            interval: Duration::from_secs(5),
            blocking: false,
            worker_id: None,
            shutdown_timeout: Duration::from_secs(60),
        }
    }
}

impl WorkerConfig {
    pub fn new<S: Into<String>>(queues: impl IntoIterator<Item = S>) -> Self {
        Self {
            queues: queues.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    pub fn with_num_workers(mut self, num_workers: usize) -> Self {
        self.num_workers = num_workers;
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_blocking(mut self, blocking: bool) -> Self {
        self.blocking = blocking;
        self
    }

    pub fn with_worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = Some(worker_id.into());
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Identity of the worker at `index`.
    fn worker_name(&self, index: usize) -> String {
        match &self.worker_id {
            Some(base) if self.num_workers <= 1 => base.clone(),
            Some(base) => format!("{base}-{index}"),
            None => {
                let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string());
                format!(
                    "{}:{}-{}:{}",
                    host,
                    std::process::id(),
                    index,
                    self.queues.join(",")
                )
            }
        }
    }
}

/// Snapshot of worker counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub jobs_completed: u64,
    pub jobs_failed: u64,
    pub jobs_skipped: u64,
    pub average_job_duration: Duration,
}

impl WorkerStats {
    pub fn total_processed(&self) -> u64 {
        self.jobs_completed + self.jobs_failed + self.jobs_skipped
    }
}

#[derive(Default)]
struct SharedWorkerStats {
    jobs_completed: AtomicU64,
    jobs_failed: AtomicU64,
    jobs_skipped: AtomicU64,
    total_duration_ms: AtomicU64,
}

impl SharedWorkerStats {
    fn record(&self, outcome: &JobOutcome, duration: Duration) {
        let counter = match outcome {
            JobOutcome::Completed => &self.jobs_completed,
            JobOutcome::Skipped => &self.jobs_skipped,
            JobOutcome::Failed(_) => &self.jobs_failed,
        };
        counter.fetch_add(1, Ordering::SeqCst);
        self.total_duration_ms
            .fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
    }

    fn snapshot(&self) -> WorkerStats {
        let completed = self.jobs_completed.load(Ordering::SeqCst);
        let failed = self.jobs_failed.load(Ordering::SeqCst);
        let skipped = self.jobs_skipped.load(Ordering::SeqCst);
        let total = completed + failed + skipped;
        let average_job_duration = if total > 0 {
            Duration::from_millis(self.total_duration_ms.load(Ordering::SeqCst) / total)
        } else {
            Duration::ZERO
        };

        WorkerStats {
            jobs_completed: completed,
            jobs_failed: failed,
            jobs_skipped: skipped,
            average_job_duration,
        }
    }
}

/// Pool of workers over one queue.
pub struct WorkerPool {
    config: WorkerConfig,
    queue: Arc<JobQueue>,
    registry: Arc<JobRegistry>,
    shutdown_tx: broadcast::Sender<()>,
    worker_handles: Vec<JoinHandle<()>>,
    stats: Arc<SharedWorkerStats>,
    is_running: AtomicBool,
}

impl WorkerPool {
    pub fn new(config: WorkerConfig, queue: Arc<JobQueue>, registry: Arc<JobRegistry>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config,
            queue,
            registry,
            shutdown_tx,
            worker_handles: Vec::new(),
            stats: Arc::new(SharedWorkerStats::default()),
            is_running: AtomicBool::new(false),
        }
    }

    /// Spawns the workers.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::AlreadyRunning` if the pool is already running and
    /// `PoolError::NoQueues` if no queue is configured.
    pub fn start(&mut self) -> Result<(), PoolError> {
        if self.is_running.load(Ordering::SeqCst) {
            return Err(PoolError::AlreadyRunning);
        }
        if self.config.queues.is_empty() {
            return Err(PoolError::NoQueues);
        }

        for index in 0..self.config.num_workers {
            let mut worker = Worker::new(
                self.config.worker_name(index),
                Arc::clone(&self.queue),
                Arc::clone(&self.registry),
                &self.config,
            );
            worker.stats = Arc::clone(&self.stats);
            let shutdown_rx = self.shutdown_tx.subscribe();
            self.worker_handles
                .push(tokio::spawn(async move { worker.run(shutdown_rx).await }));
        }

        self.is_running.store(true, Ordering::SeqCst);
        info!(
            num_workers = self.config.num_workers,
            queues = %self.config.queues.join(","),
            blocking = self.config.blocking,
            "Worker pool started"
        );
        Ok(())
    }

    /// Signals shutdown and waits for the workers to finish their current
    /// jobs.
    pub async fn shutdown(&mut self) -> Result<(), PoolError> {
        if !self.is_running.load(Ordering::SeqCst) {
            return Err(PoolError::NotRunning);
        }

        info!("Initiating worker pool shutdown");
        // Workers may already be gone.
        let _ = self.shutdown_tx.send(());

        let handles: Vec<JoinHandle<()>> = self.worker_handles.drain(..).collect();
        let wait_all = async {
            for handle in handles {
                if let Err(e) = handle.await {
                    error!(error = %e, "Worker task panicked during shutdown");
                }
            }
        };

        let result = tokio::time::timeout(self.config.shutdown_timeout, wait_all).await;
        self.is_running.store(false, Ordering::SeqCst);
        match result {
            Ok(()) => {
                info!("Worker pool shutdown complete");
                Ok(())
            }
            Err(_) => Err(PoolError::ShutdownTimeout(self.config.shutdown_timeout)),
        }
    }

    pub fn stats(&self) -> WorkerStats {
        self.stats.snapshot()
    }

    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    pub fn queue(&self) -> &Arc<JobQueue> {
        &self.queue
    }
}

/// One consuming loop.
pub struct Worker {
    id: String,
    queue: Arc<JobQueue>,
    registry: Arc<JobRegistry>,
    queues: Vec<String>,
    interval: Duration,
    blocking: bool,
    stats: Arc<SharedWorkerStats>,
}

impl Worker {
    pub fn new(
        id: impl Into<String>,
        queue: Arc<JobQueue>,
        registry: Arc<JobRegistry>,
        config: &WorkerConfig,
    ) -> Self {
        Self {
            id: id.into(),
            queue,
            registry,
            queues: config.queues.clone(),
            interval: config.interval,
            blocking: config.blocking,
            stats: Arc::default(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Runs until `shutdown_rx` fires or its sender is dropped.
    pub async fn run(self, mut shutdown_rx: broadcast::Receiver<()>) {
        info!(worker_id = %self.id, "Worker started");

        loop {
            match shutdown_rx.try_recv() {
                Ok(()) | Err(broadcast::error::TryRecvError::Closed) => {
                    info!(worker_id = %self.id, "Worker received shutdown signal");
                    break;
                }
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(broadcast::error::TryRecvError::Empty) => {}
            }

            match self.reserve().await {
                Ok(Some(job)) => self.process(job).await,
                Ok(None) => {
                    debug!(worker_id = %self.id, "No jobs available");
                    if !self.blocking {
                        tokio::select! {
                            _ = tokio::time::sleep(self.interval) => {}
                            _ = shutdown_rx.recv() => {
                                info!(worker_id = %self.id, "Worker received shutdown signal");
                                break;
                            }
                        }
                    }
                }
                Err(e) => {
                    error!(worker_id = %self.id, error = %e, "Failed to reserve job");
                    tokio::time::sleep(self.interval).await;
                }
            }
        }

        info!(worker_id = %self.id, "Worker stopped");
    }

    async fn reserve(&self) -> Result<Option<Job>, QueueError> {
        if self.blocking {
            let timeout = self.interval.as_secs().max(1);
            return self.queue.reserve_blocking(self.queues.as_slice(), timeout).await;
        }
        for queue in &self.queues {
            if let Some(job) = self.queue.reserve(queue).await? {
                return Ok(Some(job));
            }
        }
        Ok(None)
    }

    async fn process(&self, job: Job) {
        let job = job.with_worker(self.id.clone());
        let started = Instant::now();

        match job.process(&self.queue, &self.registry).await {
            Ok(outcome) => {
                let duration = started.elapsed();
                debug!(
                    worker_id = %self.id,
                    job_id = job.id().unwrap_or_default(),
                    outcome = ?outcome,
                    duration_ms = duration.as_millis() as u64,
                    "Job processed"
                );
                self.stats.record(&outcome, duration);
            }
            Err(e) => {
                error!(
                    worker_id = %self.id,
                    job_id = job.id().unwrap_or_default(),
                    error = %e,
                    "Failed to settle job"
                );
            }
        }
    }
}
