//! RedisStore against a real Redis (testcontainers). Needs Docker, so the
//! suite is ignored by default: `cargo test -p job-queue -- --ignored`.

use job_queue::{
    Clock, EnqueueOptions, JobId, JobState, Lease, ManualClock, NackOutcome, Priority, QueueConfig,
    QueueCore, QueueError, QueueJob, RedisStore,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use test_utils::{TestDataBuilder, TestRedis};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
struct Work {
    label: String,
    attrs: serde_json::Value,
}

impl QueueJob for Work {
    fn kind(&self) -> &str {
        "work"
    }
}

fn work(label: &str) -> Work {
    Work {
        label: label.to_string(),
        attrs: serde_json::json!({ "ratio": 0.25, "tags": ["a", "b"] }),
    }
}

async fn redis_queue(
    redis: &TestRedis,
    test_name: &str,
    config: QueueConfig,
) -> (QueueCore<Work>, Arc<ManualClock>) {
    let builder = TestDataBuilder::from_test_name(test_name);
    let store = RedisStore::new(
        redis.connection_manager().await,
        &builder.key_prefix(),
        &config.name,
    );
    let clock = Arc::new(ManualClock::default());
    (
        QueueCore::with_clock(config, Arc::new(store), clock.clone()),
        clock,
    )
}

#[tokio::test]
#[ignore = "requires Docker for testcontainers"]
async fn round_trips_payload_and_orders_by_priority() {
    let redis = TestRedis::new().await;
    let (queue, _) = redis_queue(&redis, "redis_priority", QueueConfig::new("work")).await;

    queue.enqueue(work("n1"), EnqueueOptions::new()).await.unwrap();
    queue
        .enqueue(work("low"), EnqueueOptions::new().with_priority(Priority::Low))
        .await
        .unwrap();
    queue
        .enqueue(work("crit"), EnqueueOptions::new().with_priority(Priority::Critical))
        .await
        .unwrap();
    queue.enqueue(work("n2"), EnqueueOptions::new()).await.unwrap();

    let mut order = Vec::new();
    while let Some(job) = queue.dequeue_next().await.unwrap() {
        assert_eq!(job.data, work(&job.data.label));
        assert_eq!(job.state, JobState::Active);
        order.push(job.data.label.clone());
    }
    assert_eq!(order, ["crit", "n1", "n2", "low"]);
}

#[tokio::test]
#[ignore = "requires Docker for testcontainers"]
async fn retry_backoff_and_failure() {
    let redis = TestRedis::new().await;
    let (queue, clock) = redis_queue(&redis, "redis_retry", QueueConfig::new("work")).await;
    let id = queue.enqueue(work("x"), EnqueueOptions::new()).await.unwrap();

    let job = queue.dequeue_next().await.unwrap().unwrap();
    let outcome = queue.nack(job.lease(), "boom").await.unwrap();
    let NackOutcome::Retrying { attempts_made, retry_at } = outcome else {
        panic!("expected retry, got {outcome:?}");
    };
    assert_eq!(attempts_made, 1);
    assert_eq!(
        retry_at.timestamp_millis(),
        clock.now().timestamp_millis() + 2000
    );

    clock.advance(Duration::from_millis(1999));
    assert!(queue.dequeue_next().await.unwrap().is_none());
    clock.advance(Duration::from_millis(1));
    let job = queue.dequeue_next().await.unwrap().unwrap();
    queue.nack(job.lease(), "boom").await.unwrap();

    clock.advance(Duration::from_secs(4));
    let job = queue.dequeue_next().await.unwrap().unwrap();
    assert_eq!(
        queue.nack(job.lease(), "boom").await.unwrap(),
        NackOutcome::Failed { attempts_made: 3 }
    );

    let stored = queue.get(id).await.unwrap().unwrap();
    assert_eq!(stored.state, JobState::Failed);
    assert_eq!(stored.last_error.as_deref(), Some("boom"));

    assert_eq!(queue.retry_failed().await.unwrap(), 1);
    let stored = queue.get(id).await.unwrap().unwrap();
    assert_eq!(stored.state, JobState::Waiting);
    assert_eq!(stored.attempts_made, 0);
}

#[tokio::test]
#[ignore = "requires Docker for testcontainers"]
async fn retention_purge_and_stats() {
    let redis = TestRedis::new().await;
    let config = QueueConfig::new("work").with_retention(2, 1);
    let (queue, _) = redis_queue(&redis, "redis_retention", config).await;

    let mut completed = Vec::new();
    for i in 0..4 {
        let id = queue.enqueue(work(&i.to_string()), EnqueueOptions::new()).await.unwrap();
        let job = queue.dequeue_next().await.unwrap().unwrap();
        queue.ack(job.lease()).await.unwrap();
        completed.push(id);
    }
    for i in 0..2 {
        let id = queue
            .enqueue(work(&format!("f{i}")), EnqueueOptions::new().with_attempts(1))
            .await
            .unwrap();
        let job = queue.dequeue_next().await.unwrap().unwrap();
        assert_eq!(job.id, id);
        queue.nack(job.lease(), "x").await.unwrap();
    }
    queue.enqueue(work("pending"), EnqueueOptions::new()).await.unwrap();

    let stats = queue.stats().await.unwrap();
    assert_eq!((stats.completed, stats.failed, stats.waiting), (2, 1, 1));
    assert_eq!(stats.total, 4);
    assert!(queue.get(completed[0]).await.unwrap().is_none());
    assert!(queue.get(completed[3]).await.unwrap().is_some());

    assert_eq!(queue.purge().await.unwrap(), 3);
    let stats = queue.stats().await.unwrap();
    assert_eq!((stats.completed, stats.failed, stats.waiting), (0, 0, 1));
}

#[tokio::test]
#[ignore = "requires Docker for testcontainers"]
async fn expired_lease_is_reclaimed_across_handles() {
    let redis = TestRedis::new().await;
    let config = QueueConfig::new("work").with_lease_duration(Duration::from_secs(5));
    let (queue, clock) = redis_queue(&redis, "redis_lease", config).await;
    let id = queue.enqueue(work("x"), EnqueueOptions::new()).await.unwrap();

    queue.dequeue_next().await.unwrap().unwrap();
    let missing = Lease {
        id: JobId::new(),
        token: 1,
    };
    assert!(matches!(
        queue.nack(missing, "missing").await,
        Err(QueueError::NotFound(_))
    ));

    clock.advance(Duration::from_secs(6));
    let again = queue.dequeue_next().await.unwrap().unwrap();
    assert_eq!(again.id, id);
    assert_eq!(again.stalled_count, 1);
    assert_eq!(again.attempts_made, 0);
}

#[tokio::test]
#[ignore = "requires Docker for testcontainers"]
async fn superseded_lease_cannot_report_an_outcome() {
    let redis = TestRedis::new().await;
    let (queue, clock) = redis_queue(&redis, "redis_stale_lease", QueueConfig::new("work")).await;
    let id = queue.enqueue(work("x"), EnqueueOptions::new()).await.unwrap();

    let slow = queue.dequeue_next().await.unwrap().unwrap();
    clock.advance(Duration::from_secs(31));
    let current = queue.dequeue_next().await.unwrap().unwrap();
    assert_eq!(current.id, id);
    assert_eq!(current.lease_token, slow.lease_token + 1);

    assert!(matches!(
        queue.nack(slow.lease(), "smtp timeout").await,
        Err(QueueError::NotActive { ref state, .. }) if state == "active"
    ));
    assert!(queue.extend_lease(slow.lease()).await.is_err());

    clock.advance(Duration::from_secs(3));
    assert!(queue.dequeue_next().await.unwrap().is_none());

    queue.ack(current.lease()).await.unwrap();
    let stored = queue.get(id).await.unwrap().unwrap();
    assert_eq!(stored.state, JobState::Completed);
    assert_eq!(stored.attempts_made, 0);
    assert_eq!(stored.last_error, None);
}

#[tokio::test]
#[ignore = "requires Docker for testcontainers"]
async fn ping_reaches_redis() {
    let redis = TestRedis::new().await;
    let (queue, _) = redis_queue(&redis, "redis_ping", QueueConfig::new("work")).await;
    queue.ping().await.unwrap();
    assert_eq!(queue.backend(), "redis");
}

