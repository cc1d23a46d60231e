//! Failure records and counters.
//!
//! Failed jobs are appended to the `failed` list for inspection. Records are
//! diagnostic only; nothing reads them back to drive retries.

use std::error::Error as StdError;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use super::job::Payload;
use crate::error::{JobError, QueueError};
use crate::store::StoreClient;

pub const FAILED_KEY: &str = "failed";
pub const FAILED_STAT: &str = "stat:failed";

/// One entry of the `failed` list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub failed_at: String,
    pub payload: Payload,
    pub exception: String,
    pub error: String,
    #[serde(default)]
    pub backtrace: Vec<String>,
    pub worker: String,
    pub queue: String,
}

impl FailureRecord {
    pub fn new(payload: Payload, error: &JobError, worker: &str, queue: &str) -> Self {
        let mut backtrace = Vec::new();
        let mut source = StdError::source(error);
        while let Some(cause) = source {
            backtrace.push(cause.to_string());
            source = cause.source();
        }

        Self {
            failed_at: Utc::now().format("%a %b %d %H:%M:%S UTC %Y").to_string(),
            payload,
            exception: error.kind().to_string(),
            error: error.to_string(),
            backtrace,
            worker: worker.to_string(),
            queue: queue.to_string(),
        }
    }
}

/// Key of the per-worker failure counter.
pub fn worker_stat(worker: &str) -> String {
    format!("{FAILED_STAT}:{worker}")
}

/// Appends `record` to the failure log and bumps the global and per-worker
/// counters.
pub async fn record(store: &dyn StoreClient, record: &FailureRecord) -> Result<(), QueueError> {
    store
        .rpush(FAILED_KEY, &serde_json::to_string(record)?)
        .await?;
    store.incr_by(FAILED_STAT, 1).await?;
    store.incr_by(&worker_stat(&record.worker), 1).await?;
    Ok(())
}

/// Total failures recorded since the counter was created.
pub async fn count(store: &dyn StoreClient) -> Result<u64, QueueError> {
    let raw = store.get(FAILED_STAT).await?;
    Ok(raw.and_then(|value| value.parse().ok()).unwrap_or(0))
}

/// The oldest `limit` failure records.
pub async fn peek(store: &dyn StoreClient, limit: usize) -> Result<Vec<FailureRecord>, QueueError> {
    if limit == 0 {
        return Ok(Vec::new());
    }
    let raw = store.lrange(FAILED_KEY, 0, limit as i64 - 1).await?;
    raw.iter()
        .map(|entry| serde_json::from_str(entry).map_err(QueueError::from))
        .collect()
}
