//! Error types for queue and cluster operations.
//!
//! Each subsystem gets its own error enum:
//! - Store client access (connections, protocol errors)
//! - Cluster topology (sentinel discovery, shard addressing)
//! - Job resolution and execution
//! - Queue engine operations

use thiserror::Error;

/// Errors raised by a single store endpoint.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Store connection failed: {0}")]
    Connection(String),

    #[error("Redis operation failed: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Command '{0}' is not supported by this store")]
    Unsupported(String),

    #[error("Operation against a key holding the wrong kind of value: {0}")]
    WrongType(String),
}

/// Errors raised while discovering or addressing cluster shards.
#[derive(Debug, Error)]
pub enum TopologyError {
    #[error("The master '{0}' is down")]
    MasterDown(String),

    #[error("Master '{0}' not found")]
    MasterNotFound(String),

    #[error("Client {0} does not exist")]
    UnknownClient(String),

    #[error("Cluster has no shards to route to")]
    EmptyCluster,

    #[error("Malformed sentinel reply: {0}")]
    MalformedReply(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Errors that fail a single job.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("Could not find job class {0}")]
    ClassNotFound(String),

    #[error("Job class {0} does not contain a perform method")]
    MissingPerform(String),

    #[error(transparent)]
    Perform(#[from] anyhow::Error),

    /// The store failed while the job was being run. The job itself did
    /// not fail.
    #[error("Store error while running job: {0}")]
    Store(#[from] QueueError),
}

impl JobError {
    /// Short name recorded as the `exception` of a failure record.
    pub fn kind(&self) -> &'static str {
        match self {
            JobError::ClassNotFound(_) | JobError::MissingPerform(_) => "UnresolvedJob",
            JobError::Perform(_) => "PerformError",
            JobError::Store(_) => "StoreError",
        }
    }

    /// Whether the job never reached its entry point.
    pub fn is_unresolved(&self) -> bool {
        matches!(self, JobError::ClassNotFound(_) | JobError::MissingPerform(_))
    }
}

/// Errors that can occur during queue engine operations.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Topology(#[from] TopologyError),

    #[error("JSON serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A popped item that could not be decoded. It is no longer queued;
    /// `raw` is the only copy.
    #[error("Malformed item popped from queue '{queue}': {source}; raw item: {raw}")]
    MalformedItem {
        queue: String,
        raw: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Blocking pop returned key '{key}' outside prefix '{prefix}'")]
    UnexpectedKey { key: String, prefix: String },

    #[error("Configuration error: {0}")]
    Config(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_error_kind() {
        assert_eq!(JobError::ClassNotFound("A".into()).kind(), "UnresolvedJob");
        assert_eq!(JobError::MissingPerform("A".into()).kind(), "UnresolvedJob");
        let err = JobError::from(anyhow::anyhow!("boom"));
        assert_eq!(err.kind(), "PerformError");
        assert!(!err.is_unresolved());
        assert_eq!(err.to_string(), "boom");
    }

    #[test]
    fn test_error_display() {
        let err = TopologyError::MasterDown("mymaster".to_string());
        assert!(err.to_string().contains("mymaster"));

        let err = JobError::MissingPerform("SendWelcome".to_string());
        assert!(err.to_string().contains("perform method"));

        let err = QueueError::UnexpectedKey {
            key: "other:queue:a".to_string(),
            prefix: "resque:".to_string(),
        };
        assert!(err.to_string().contains("other:queue:a"));

        let source = serde_json::from_str::<serde_json::Value>("{oops").unwrap_err();
        let err = QueueError::MalformedItem {
            queue: "emails".to_string(),
            raw: "{oops".to_string(),
            source,
        };
        assert!(err.to_string().contains("raw item: {oops"));

        let err = QueueError::from(StoreError::Connection("refused".to_string()));
        assert!(err.to_string().contains("refused"));
    }
}
