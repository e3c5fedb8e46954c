//! Worker traits and the generic [`QueueWorker`] loop.

use crate::config::WorkerConfig;
use crate::error::{InvalidPayload, QueueError, QueueResult};
use crate::job::{Job, QueueJob};
use crate::queue::QueueCore;
use crate::store::NackOutcome;
use async_trait::async_trait;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Failure reported by a processor. Every variant is nacked; the queue
/// decides between retry and `failed` from the attempt budget.
#[derive(Error, Debug)]
pub enum ProcessError {
    #[error(transparent)]
    InvalidPayload(#[from] InvalidPayload),

    #[error("Delivery failed: {0}")]
    Delivery(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ProcessError {
    pub fn delivery(message: impl Into<String>) -> Self {
        ProcessError::Delivery(message.into())
    }

    pub fn internal(message: impl Into<String>) -> Self {
        ProcessError::Internal(message.into())
    }
}

/// Domain handler run by a [`QueueWorker`] for each leased job.
///
/// ```rust,ignore
/// struct Reindexer { search: SearchClient }
///
/// #[async_trait]
/// impl JobProcessor<Reindex> for Reindexer {
///     async fn process(&self, job: &Job<Reindex>) -> Result<(), ProcessError> {
///         self.search.reindex(&job.data.index).await.map_err(ProcessError::internal)
///     }
///
///     fn name(&self) -> &'static str {
///         "reindexer"
///     }
/// }
/// ```
#[async_trait]
pub trait JobProcessor<J: QueueJob>: Send + Sync {
    async fn process(&self, job: &Job<J>) -> Result<(), ProcessError>;

    fn name(&self) -> &'static str;

    /// Override to probe downstream dependencies.
    async fn health_check(&self) -> Result<bool, ProcessError> {
        Ok(true)
    }
}

const MAX_BACKOFF_SECS: u64 = 30;

/// Pulls jobs from a queue and runs them through a processor, `concurrency`
/// jobs at a time.
pub struct QueueWorker<J, P> {
    queue: QueueCore<J>,
    processor: Arc<P>,
    config: WorkerConfig,
}

impl<J, P> Clone for QueueWorker<J, P> {
    fn clone(&self) -> Self {
        Self {
            queue: self.queue.clone(),
            processor: Arc::clone(&self.processor),
            config: self.config.clone(),
        }
    }
}

impl<J, P> QueueWorker<J, P>
where
    J: QueueJob,
    P: JobProcessor<J> + 'static,
{
    pub fn new(queue: QueueCore<J>, processor: P, config: WorkerConfig) -> Self {
        Self::with_arc_processor(queue, Arc::new(processor), config)
    }

    pub fn with_arc_processor(queue: QueueCore<J>, processor: Arc<P>, config: WorkerConfig) -> Self {
        Self {
            queue,
            processor,
            config,
        }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn processor(&self) -> &P {
        &self.processor
    }

    /// Run until `shutdown` flips to `true`. In-flight jobs finish before
    /// this returns. A slot whose processor panics is restarted; the job it
    /// held comes back once its lease expires.
    pub async fn run(&self, shutdown: watch::Receiver<bool>) -> QueueResult<()> {
        info!(
            worker_id = %self.config.worker_id,
            queue = %self.queue.name(),
            backend = self.queue.backend(),
            processor = self.processor.name(),
            concurrency = self.config.concurrency,
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            "Starting queue worker"
        );

        let mut slots = JoinSet::new();
        for slot in 0..self.config.concurrency {
            let worker = self.clone();
            let shutdown = shutdown.clone();
            slots.spawn(async move { worker.supervised_slot(slot, shutdown).await });
        }

        while let Some(joined) = slots.join_next().await {
            if let Err(e) = joined {
                error!(worker_id = %self.config.worker_id, error = %e, "worker slot panicked");
            }
        }

        info!(worker_id = %self.config.worker_id, "Queue worker stopped");
        Ok(())
    }

    async fn supervised_slot(&self, slot: usize, mut shutdown: watch::Receiver<bool>) {
        loop {
            let finished = AssertUnwindSafe(self.slot_loop(slot, shutdown.clone()))
                .catch_unwind()
                .await;
            if finished.is_ok() || *shutdown.borrow() {
                return;
            }

            error!(worker_id = %self.config.worker_id, slot, "worker slot panicked, restarting");
            tokio::select! {
                _ = shutdown.changed() => return,
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }
    }

    async fn slot_loop(&self, slot: usize, mut shutdown: watch::Receiver<bool>) {
        let mut consecutive_errors: u32 = 0;

        loop {
            if *shutdown.borrow() {
                debug!(slot, "shutdown requested, slot exiting");
                break;
            }

            let pause = match self.run_once().await {
                Ok(processed) => {
                    if consecutive_errors > 0 {
                        info!(slot, consecutive_errors, "queue store recovered");
                        consecutive_errors = 0;
                    }
                    if processed {
                        continue;
                    }
                    self.config.poll_interval
                }
                Err(e) => {
                    consecutive_errors += 1;
                    let backoff_secs = 2u64.pow(consecutive_errors.min(5)).min(MAX_BACKOFF_SECS);
                    warn!(
                        slot,
                        error = %e,
                        consecutive_errors,
                        backoff_secs,
                        "queue store error, backing off"
                    );
                    Duration::from_secs(backoff_secs)
                }
            };

            tokio::select! {
                _ = shutdown.changed() => {}
                _ = tokio::time::sleep(pause) => {}
            }
        }
    }

    /// Lease and handle at most one job. Returns whether a job was handled.
    ///
    /// Store failures propagate; processor failures are nacked and count as
    /// handled.
    pub async fn run_once(&self) -> QueueResult<bool> {
        let Some(job) = self.queue.dequeue_next().await? else {
            return Ok(false);
        };
        self.handle(job).await?;
        Ok(true)
    }

    async fn handle(&self, job: Job<J>) -> QueueResult<()> {
        let started = Instant::now();
        let result = self.process_with_heartbeat(&job).await;
        let metrics = self.queue.metrics();

        let reported = match result {
            Ok(()) => {
                let acked = self.queue.ack(job.lease()).await;
                if acked.is_ok() {
                    metrics.job_completed(&job.kind, started.elapsed());
                    info!(
                        job_id = %job.id,
                        kind = %job.kind,
                        attempt = job.attempts_made + 1,
                        duration_ms = started.elapsed().as_millis() as u64,
                        "job completed"
                    );
                }
                acked
            }
            Err(e) => match self.queue.nack(job.lease(), &e.to_string()).await {
                Ok(NackOutcome::Retrying { attempts_made, retry_at }) => {
                    metrics.job_retried(&job.kind);
                    warn!(
                        job_id = %job.id,
                        kind = %job.kind,
                        error = %e,
                        attempts_made,
                        max_attempts = job.max_attempts,
                        %retry_at,
                        "job failed, will retry"
                    );
                    Ok(())
                }
                Ok(NackOutcome::Failed { attempts_made }) => {
                    metrics.job_failed(&job.kind);
                    error!(
                        job_id = %job.id,
                        kind = %job.kind,
                        error = %e,
                        attempts_made,
                        "job failed permanently"
                    );
                    Ok(())
                }
                Err(report_err) => Err(report_err),
            },
        };

        match reported {
            Err(QueueError::NotActive { .. } | QueueError::NotFound(_)) => {
                // lease ran out and the job was handed to someone else
                warn!(job_id = %job.id, "lease lost before the outcome was recorded");
                Ok(())
            }
            other => other,
        }
    }

    async fn process_with_heartbeat(&self, job: &Job<J>) -> Result<(), ProcessError> {
        let every = self.config.heartbeat_for(self.queue.config().lease_duration);
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + every, every);

        let work = self.processor.process(job);
        tokio::pin!(work);

        loop {
            tokio::select! {
                result = &mut work => return result,
                _ = ticker.tick() => {
                    if let Err(e) = self.queue.extend_lease(job.lease()).await {
                        warn!(job_id = %job.id, error = %e, "lease renewal failed");
                    }
                }
            }
        }
    }
}
