//! The queue instance producers and workers share.

use crate::clock::{Clock, SystemClock};
use crate::config::QueueConfig;
use crate::error::{QueueError, QueueResult};
use crate::job::{EnqueueOptions, Job, JobId, Lease, QueueJob, after};
use crate::metrics::QueueMetrics;
use crate::store::{InMemoryStore, JobStore, NackOutcome};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Point-in-time counts. The five state counts always sum to `total`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    pub queue_name: String,
    pub waiting: u64,
    pub delayed: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
    pub total: u64,
}

struct Shared<J> {
    config: QueueConfig,
    store: Arc<dyn JobStore<J>>,
    clock: Arc<dyn Clock>,
    metrics: QueueMetrics,
}

/// Handle to one named queue. Cloning is cheap and every clone drives the
/// same store.
pub struct QueueCore<J> {
    shared: Arc<Shared<J>>,
}

impl<J> Clone for QueueCore<J> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<J: QueueJob> QueueCore<J> {
    pub fn new(config: QueueConfig, store: Arc<dyn JobStore<J>>) -> Self {
        Self::with_clock(config, store, Arc::new(SystemClock))
    }

    pub fn with_clock(
        config: QueueConfig,
        store: Arc<dyn JobStore<J>>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let metrics = QueueMetrics::new(config.name.clone());
        Self {
            shared: Arc::new(Shared {
                config,
                store,
                clock,
                metrics,
            }),
        }
    }

    /// Queue backed by a fresh [`InMemoryStore`].
    pub fn in_memory(config: QueueConfig) -> Self {
        Self::new(config, Arc::new(InMemoryStore::new()))
    }

    pub fn name(&self) -> &str {
        &self.shared.config.name
    }

    pub fn config(&self) -> &QueueConfig {
        &self.shared.config
    }

    pub fn metrics(&self) -> &QueueMetrics {
        &self.shared.metrics
    }

    pub fn backend(&self) -> &'static str {
        self.shared.store.backend()
    }

    fn now(&self) -> DateTime<Utc> {
        self.shared.clock.now()
    }

    /// Accept a job. Returns as soon as the job is stored; delivery happens
    /// asynchronously in a worker.
    #[instrument(skip_all, fields(queue = %self.name(), kind = data.kind(), priority = %options.priority))]
    pub async fn enqueue(&self, data: J, options: EnqueueOptions) -> QueueResult<JobId> {
        let config = &self.shared.config;
        if config.validate_on_enqueue {
            if let Err(invalid) = data.validate() {
                self.shared.metrics.job_rejected(data.kind());
                warn!(reason = %invalid.reason, "payload rejected");
                return Err(QueueError::InvalidPayload(invalid));
            }
        }

        let attempts = options.resolved_attempts(config.default_attempts);
        let backoff = options.backoff.unwrap_or(config.backoff);
        let job = Job::new(data, &options, attempts, backoff, self.now());
        let job = self.shared.store.insert(job).await?;

        self.shared
            .metrics
            .job_enqueued(&job.kind, job.priority.as_ref());
        info!(
            job_id = %job.id,
            state = %job.state,
            max_attempts = job.max_attempts,
            delay_ms = job.delay_ms,
            "job enqueued"
        );
        Ok(job.id)
    }

    /// Lease the next eligible job, or `None` when nothing is ready.
    /// Outcomes for it are reported with [`Job::lease`].
    ///
    /// Jobs whose previous lease ran out are put back in line first, so a
    /// worker that died mid-delivery does not strand its job.
    pub async fn dequeue_next(&self) -> QueueResult<Option<Job<J>>> {
        let now = self.now();
        let reclaimed = self.shared.store.reclaim_expired(now).await?;
        if !reclaimed.is_empty() {
            self.shared.metrics.jobs_stalled(reclaimed.len());
            for id in &reclaimed {
                warn!(queue = %self.name(), job_id = %id, "lease expired, job returned to waiting");
            }
        }

        let lease_until = after(now, duration_ms(self.shared.config.lease_duration));
        let job = self.shared.store.lease_next(now, lease_until).await?;
        if let Some(job) = &job {
            debug!(
                queue = %self.name(),
                job_id = %job.id,
                kind = %job.kind,
                attempt = job.attempts_made + 1,
                "job leased"
            );
        }
        Ok(job)
    }

    /// Push the lease deadline of an active job one lease duration ahead.
    pub async fn extend_lease(&self, lease: Lease) -> QueueResult<()> {
        let until = after(self.now(), duration_ms(self.shared.config.lease_duration));
        self.shared.store.extend_lease(lease, until).await
    }

    /// Mark a leased job completed. Fails with [`QueueError::NotActive`] once
    /// the lease has been superseded.
    pub async fn ack(&self, lease: Lease) -> QueueResult<()> {
        let keep = self.shared.config.retention.completed;
        self.shared.store.complete(lease, self.now(), keep).await?;
        debug!(queue = %self.name(), job_id = %lease.id, "job completed");
        Ok(())
    }

    /// Report a failed attempt. The job is retried with backoff while it has
    /// attempts left, otherwise it lands in `failed`.
    pub async fn nack(&self, lease: Lease, error: &str) -> QueueResult<NackOutcome> {
        let id = lease.id;
        let keep = self.shared.config.retention.failed;
        let outcome = self.shared.store.fail(lease, error, self.now(), keep).await?;
        match outcome {
            NackOutcome::Retrying {
                attempts_made,
                retry_at,
            } => {
                debug!(queue = %self.name(), job_id = %id, attempts_made, %retry_at, "job scheduled for retry");
            }
            NackOutcome::Failed { attempts_made } => {
                warn!(queue = %self.name(), job_id = %id, attempts_made, error, "job exhausted its attempts");
            }
        }
        Ok(outcome)
    }

    pub async fn stats(&self) -> QueueResult<QueueStats> {
        let counts = self.shared.store.counts().await?;
        self.shared.metrics.state_counts(&counts);
        Ok(QueueStats {
            queue_name: self.name().to_string(),
            waiting: counts.waiting,
            delayed: counts.delayed,
            active: counts.active,
            completed: counts.completed,
            failed: counts.failed,
            total: counts.total(),
        })
    }

    /// Requeue every failed job with its attempt counter reset.
    pub async fn retry_failed(&self) -> QueueResult<usize> {
        let moved = self.shared.store.retry_failed(self.now()).await?;
        info!(queue = %self.name(), moved, "failed jobs requeued");
        Ok(moved)
    }

    /// Remove completed and failed jobs. Waiting, delayed and active jobs stay.
    pub async fn purge(&self) -> QueueResult<usize> {
        let removed = self.shared.store.purge().await?;
        info!(queue = %self.name(), removed, "queue purged");
        Ok(removed)
    }

    pub async fn get(&self, id: JobId) -> QueueResult<Option<Job<J>>> {
        self.shared.store.get(id).await
    }

    pub async fn ping(&self) -> QueueResult<()> {
        self.shared.store.ping().await
    }
}

fn duration_ms(d: std::time::Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::error::InvalidPayload;
    use crate::job::{JobState, Priority};
    use std::time::Duration;

    #[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
    struct Task {
        name: String,
    }

    impl QueueJob for Task {
        fn kind(&self) -> &str {
            "task"
        }

        fn validate(&self) -> Result<(), InvalidPayload> {
            if self.name.is_empty() {
                return Err(InvalidPayload::new("task", "name is required"));
            }
            Ok(())
        }
    }

    fn task(name: &str) -> Task {
        Task { name: name.into() }
    }

    fn queue() -> (QueueCore<Task>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::default());
        let queue = QueueCore::with_clock(
            QueueConfig::new("tasks"),
            Arc::new(InMemoryStore::new()),
            clock.clone(),
        );
        (queue, clock)
    }

    #[tokio::test]
    async fn enqueue_rejects_invalid_payload() {
        let (queue, _) = queue();
        let err = queue.enqueue(task(""), EnqueueOptions::new()).await.unwrap_err();
        assert!(matches!(err, QueueError::InvalidPayload(_)));
        assert_eq!(queue.stats().await.unwrap().total, 0);
    }

    #[tokio::test]
    async fn enqueue_accepts_invalid_payload_when_validation_is_off() {
        let queue = QueueCore::in_memory(QueueConfig::new("tasks").with_validate_on_enqueue(false));
        queue.enqueue(task(""), EnqueueOptions::new()).await.unwrap();
        assert_eq!(queue.stats().await.unwrap().waiting, 1);
    }

    #[tokio::test]
    async fn enqueue_applies_defaults() {
        let (queue, _) = queue();
        let id = queue
            .enqueue(task("a"), EnqueueOptions::new().with_attempts(0))
            .await
            .unwrap();
        let job = queue.get(id).await.unwrap().unwrap();
        assert_eq!(job.max_attempts, 3);
        assert_eq!(job.priority, Priority::Normal);
        assert_eq!(job.state, JobState::Waiting);
    }

    #[tokio::test]
    async fn nack_backs_off_exponentially() {
        let (queue, clock) = queue();
        let id = queue.enqueue(task("a"), EnqueueOptions::new()).await.unwrap();

        let job = queue.dequeue_next().await.unwrap().unwrap();
        let first = queue.nack(job.lease(), "smtp down").await.unwrap();
        assert_eq!(
            first,
            NackOutcome::Retrying {
                attempts_made: 1,
                retry_at: clock.now() + chrono::Duration::milliseconds(2000)
            }
        );

        clock.advance(Duration::from_millis(1999));
        assert!(queue.dequeue_next().await.unwrap().is_none());
        clock.advance(Duration::from_millis(1));
        let job = queue.dequeue_next().await.unwrap().unwrap();

        let second = queue.nack(job.lease(), "smtp down").await.unwrap();
        assert_eq!(
            second,
            NackOutcome::Retrying {
                attempts_made: 2,
                retry_at: clock.now() + chrono::Duration::milliseconds(4000)
            }
        );

        clock.advance(Duration::from_millis(4000));
        let job = queue.dequeue_next().await.unwrap().unwrap();
        let last = queue.nack(job.lease(), "smtp down").await.unwrap();
        assert_eq!(last, NackOutcome::Failed { attempts_made: 3 });

        let job = queue.get(id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.last_error.as_deref(), Some("smtp down"));
    }

    #[tokio::test]
    async fn ack_of_waiting_job_is_rejected() {
        let (queue, _) = queue();
        let id = queue.enqueue(task("a"), EnqueueOptions::new()).await.unwrap();
        assert!(matches!(
            queue.ack(Lease { id, token: 0 }).await,
            Err(QueueError::NotActive { .. })
        ));
    }

    #[tokio::test]
    async fn late_outcome_from_a_reclaimed_lease_is_refused() {
        let (queue, clock) = queue();
        let id = queue.enqueue(task("a"), EnqueueOptions::new()).await.unwrap();

        let slow = queue.dequeue_next().await.unwrap().unwrap();
        clock.advance(Duration::from_secs(31));
        let current = queue.dequeue_next().await.unwrap().unwrap();
        assert_eq!(current.id, id);

        // the slow worker finally reports back
        let err = queue.nack(slow.lease(), "smtp timeout").await.unwrap_err();
        assert!(matches!(err, QueueError::NotActive { ref state, .. } if state == "active"));
        assert!(queue.extend_lease(slow.lease()).await.is_err());

        clock.advance(Duration::from_secs(3));
        assert!(queue.dequeue_next().await.unwrap().is_none());

        queue.ack(current.lease()).await.unwrap();
        let job = queue.get(id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Completed);
        assert_eq!(job.attempts_made, 0);
        assert_eq!(job.last_error, None);
        assert!(queue.ack(slow.lease()).await.is_err());
    }

    #[tokio::test]
    async fn worker_crash_is_recovered_after_lease() {
        let (queue, clock) = queue();
        let id = queue.enqueue(task("a"), EnqueueOptions::new()).await.unwrap();
        queue.dequeue_next().await.unwrap().unwrap();

        // worker vanishes without ack
        clock.advance(Duration::from_secs(29));
        assert!(queue.dequeue_next().await.unwrap().is_none());

        clock.advance(Duration::from_secs(2));
        let again = queue.dequeue_next().await.unwrap().unwrap();
        assert_eq!(again.id, id);
        assert_eq!(again.attempts_made, 0);
        assert_eq!(again.stalled_count, 1);
    }

    #[tokio::test]
    async fn heartbeat_keeps_job_invisible() {
        let (queue, clock) = queue();
        queue.enqueue(task("a"), EnqueueOptions::new()).await.unwrap();
        let job = queue.dequeue_next().await.unwrap().unwrap();

        for _ in 0..4 {
            clock.advance(Duration::from_secs(15));
            queue.extend_lease(job.lease()).await.unwrap();
            assert!(queue.dequeue_next().await.unwrap().is_none());
        }
        queue.ack(job.lease()).await.unwrap();
    }

    #[tokio::test]
    async fn stats_serialize_with_queue_name() {
        let (queue, _) = queue();
        queue.enqueue(task("a"), EnqueueOptions::new()).await.unwrap();
        let value = serde_json::to_value(queue.stats().await.unwrap()).unwrap();
        assert_eq!(value["queueName"], "tasks");
        assert_eq!(value["waiting"], 1);
        assert_eq!(value["total"], 1);
    }
}
