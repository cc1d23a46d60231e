//! Job status tracking.
//!
//! Tracked jobs have a status record at `job:<id>:status`. Jobs enqueued
//! without tracking have no record, and updates for them are ignored.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::QueueError;
use crate::store::StoreClient;

/// Lifecycle state of a tracked job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobStatus {
    Waiting,
    Running,
    Failed,
    Complete,
}

impl JobStatus {
    /// Numeric code stored in the status record.
    pub fn code(self) -> u8 {
        match self {
            JobStatus::Waiting => 1,
            JobStatus::Running => 2,
            JobStatus::Failed => 3,
            JobStatus::Complete => 4,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(JobStatus::Waiting),
            2 => Some(JobStatus::Running),
            3 => Some(JobStatus::Failed),
            4 => Some(JobStatus::Complete),
            _ => None,
        }
    }

    /// Whether the job will not change state again.
    pub fn is_final(self) -> bool {
        matches!(self, JobStatus::Failed | JobStatus::Complete)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            JobStatus::Waiting => "waiting",
            JobStatus::Running => "running",
            JobStatus::Failed => "failed",
            JobStatus::Complete => "complete",
        };
        f.write_str(name)
    }
}

/// Persisted status record. Timestamps are epoch seconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusRecord {
    pub status: u8,
    pub updated: i64,
    #[serde(default)]
    pub started: i64,
}

impl StatusRecord {
    pub fn status(&self) -> Option<JobStatus> {
        JobStatus::from_code(self.status)
    }
}

pub fn status_key(id: &str) -> String {
    format!("job:{id}:status")
}

/// Starts tracking `id` in the WAITING state.
pub async fn create(store: &dyn StoreClient, id: &str) -> Result<(), QueueError> {
    let now = Utc::now().timestamp();
    let record = StatusRecord {
        status: JobStatus::Waiting.code(),
        updated: now,
        started: now,
    };
    store
        .set(&status_key(id), &serde_json::to_string(&record)?)
        .await?;
    Ok(())
}

pub async fn is_tracking(store: &dyn StoreClient, id: &str) -> Result<bool, QueueError> {
    Ok(store.exists(&status_key(id)).await?)
}

/// Moves a tracked job to `status`. Returns `false` if the job is not
/// tracked.
pub async fn update(store: &dyn StoreClient, id: &str, status: JobStatus) -> Result<bool, QueueError> {
    let Some(current) = get(store, id).await? else {
        return Ok(false);
    };

    let record = StatusRecord {
        status: status.code(),
        updated: Utc::now().timestamp(),
        started: current.started,
    };
    store
        .set(&status_key(id), &serde_json::to_string(&record)?)
        .await?;
    debug!(job_id = id, status = %status, "Updated job status");
    Ok(true)
}

/// The status record of `id`, if tracked.
pub async fn get(store: &dyn StoreClient, id: &str) -> Result<Option<StatusRecord>, QueueError> {
    match store.get(&status_key(id)).await? {
        Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
        None => Ok(None),
    }
}
