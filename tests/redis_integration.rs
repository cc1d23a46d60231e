//! Integration tests against a live Redis server.
//!
//! Each test works under its own key prefix and deletes its keys afterwards.
//! Run with: RESQUE_TEST_SERVER=127.0.0.1:6379 cargo test --test redis_integration -- --ignored

use std::sync::Arc;

use async_trait::async_trait;
use resque_cluster::scheduler::{
    Job, JobOutcome, JobQueue, JobRegistry, JobStatus, JobUnit, MatchSpec,
};
use resque_cluster::store::{RedisStore, StoreClient};
use resque_cluster::{Backend, BackendConfig, ShardConfig};
use serde_json::json;

fn test_server() -> ShardConfig {
    let address =
        std::env::var("RESQUE_TEST_SERVER").unwrap_or_else(|_| "127.0.0.1:6379".to_string());
    ShardConfig::parse(&address).expect("RESQUE_TEST_SERVER must be host:port")
}

fn test_prefix() -> String {
    format!("resque-test-{}:", uuid::Uuid::new_v4().simple())
}

fn create_test_queue() -> JobQueue {
    let store = RedisStore::new(&test_server(), test_prefix()).expect("valid server address");
    JobQueue::new(Arc::new(store))
}

async fn cleanup(queue: &JobQueue, keys: &[&str]) {
    for name in queue.queues().await.unwrap_or_default() {
        let _ = queue.remove_queue(&name).await;
    }
    for key in keys {
        let _ = queue.store().del(key).await;
    }
}

struct Greet;

#[async_trait]
impl JobUnit for Greet {
    async fn perform(&mut self, job: &Job) -> anyhow::Result<()> {
        anyhow::ensure!(job.arguments().contains_key("name"), "name is required");
        Ok(())
    }
}

#[tokio::test]
#[ignore] // Run with: cargo test --test redis_integration -- --ignored
async fn test_push_pop_round_trip() {
    let queue = create_test_queue();

    let item = json!({"class": "SendWelcome", "args": [{"to": "a@b.com"}]});
    assert!(queue.push("emails", &item).await.unwrap());
    assert_eq!(queue.size("emails").await.unwrap(), 1);
    assert_eq!(queue.queues().await.unwrap(), vec!["emails"]);

    let popped = queue.pop("emails").await.unwrap();
    assert_eq!(popped, Some(item));
    assert_eq!(queue.pop("emails").await.unwrap(), None);

    cleanup(&queue, &[]).await;
}

#[tokio::test]
#[ignore]
async fn test_blocking_pop_across_queues() {
    let queue = create_test_queue();

    queue.push("low", &json!({"class": "Low"})).await.unwrap();
    let job = queue
        .reserve_blocking(&["high", "low"][..], 1)
        .await
        .unwrap()
        .expect("job from the low queue");
    assert_eq!(job.queue(), "low");
    assert_eq!(job.class(), "Low");

    let empty = queue.reserve_blocking(&["high", "low"][..], 1).await.unwrap();
    assert!(empty.is_none());

    cleanup(&queue, &[]).await;
}

#[tokio::test]
#[ignore]
async fn test_selective_dequeue_keeps_order() {
    let queue = create_test_queue();

    queue.create("emails", "A", json!({"n": 1}), false, Some("a1".to_string())).await.unwrap();
    queue.create("emails", "B", json!({"n": 2}), false, Some("b1".to_string())).await.unwrap();
    queue.create("emails", "A", json!({"n": 3}), false, Some("a2".to_string())).await.unwrap();
    queue.create("emails", "C", json!({"n": 4}), false, Some("c1".to_string())).await.unwrap();

    let removed = queue
        .dequeue("emails", &[MatchSpec::id("A", "a2"), MatchSpec::class("B")])
        .await
        .unwrap();
    assert_eq!(removed, 2);

    let first = queue.reserve("emails").await.unwrap().unwrap();
    let second = queue.reserve("emails").await.unwrap().unwrap();
    assert_eq!(first.id(), Some("a1"));
    assert_eq!(second.id(), Some("c1"));

    cleanup(&queue, &[]).await;
}

#[tokio::test]
#[ignore]
async fn test_tracked_job_lifecycle() {
    let queue = create_test_queue();
    let mut registry = JobRegistry::new();
    registry.register("Greet", || Greet);

    let ok = queue.enqueue("jobs", "Greet", json!({"name": "ada"}), true).await.unwrap();
    let bad = queue.enqueue("jobs", "Greet", json!({}), true).await.unwrap();
    let ok_id = ok.id().unwrap().to_string();
    let bad_id = bad.id().unwrap().to_string();
    assert_eq!(queue.status(&ok_id).await.unwrap(), Some(JobStatus::Waiting));

    let job = queue.reserve("jobs").await.unwrap().unwrap().with_worker("itest:1:jobs");
    assert!(matches!(job.process(&queue, &registry).await.unwrap(), JobOutcome::Completed));
    assert_eq!(queue.status(&ok_id).await.unwrap(), Some(JobStatus::Complete));

    let job = queue.reserve("jobs").await.unwrap().unwrap().with_worker("itest:1:jobs");
    assert!(matches!(job.process(&queue, &registry).await.unwrap(), JobOutcome::Failed(_)));
    assert_eq!(queue.status(&bad_id).await.unwrap(), Some(JobStatus::Failed));
    assert_eq!(queue.failed_count().await.unwrap(), 1);

    let failures = queue.failures(10).await.unwrap();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].worker, "itest:1:jobs");
    assert_eq!(failures[0].payload.id.as_deref(), Some(bad_id.as_str()));

    cleanup(
        &queue,
        &[
            "failed",
            "stat:failed",
            "stat:failed:itest:1:jobs",
            &format!("job:{ok_id}:status"),
            &format!("job:{bad_id}:status"),
        ],
    )
    .await;
}

#[tokio::test]
#[ignore]
async fn test_backend_reset_reconnects() {
    let backend = Backend::new(BackendConfig::single(test_server()).with_prefix(test_prefix()));
    let store = backend.store().await.unwrap();
    store.set("connectivity", "1").await.unwrap();

    backend.reset().await;
    let store = backend.store().await.unwrap();
    assert_eq!(store.get("connectivity").await.unwrap(), Some("1".to_string()));
    store.del("connectivity").await.unwrap();
}
