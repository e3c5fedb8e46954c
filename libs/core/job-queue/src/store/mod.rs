//! Storage backends.
//!
//! The store is the only shared mutable resource of a queue. Every method
//! performs one atomic transition, so several workers (or processes, for the
//! Redis backend) can drive the same queue without double delivery or lost
//! retries.

mod memory;
mod redis;

pub use memory::InMemoryStore;
pub use redis::RedisStore;

use crate::error::QueueResult;
use crate::job::{Job, JobId, Lease, QueueJob};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Point-in-time job counts per state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateCounts {
    pub waiting: u64,
    pub delayed: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
}

impl StateCounts {
    pub fn total(&self) -> u64 {
        self.waiting + self.delayed + self.active + self.completed + self.failed
    }
}

/// What happened to a job reported as failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum NackOutcome {
    /// Rescheduled as delayed until `retry_at`
    Retrying {
        attempts_made: u32,
        retry_at: DateTime<Utc>,
    },
    /// Out of attempts; moved to failed
    Failed { attempts_made: u32 },
}

#[async_trait]
pub trait JobStore<J: QueueJob>: Send + Sync {
    /// Store a new job, assigning its sequence number. Returns the stored job.
    async fn insert(&self, job: Job<J>) -> QueueResult<Job<J>>;

    /// Return active jobs whose lease expired before `now` to waiting.
    /// Their attempt counter is untouched; `stalled_count` is bumped.
    async fn reclaim_expired(&self, now: DateTime<Utc>) -> QueueResult<Vec<JobId>>;

    /// Promote due delayed jobs, then lease the highest-priority, oldest
    /// waiting job until `lease_until`. The returned job carries a fresh
    /// `lease_token`.
    async fn lease_next(
        &self,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> QueueResult<Option<Job<J>>>;

    /// The transitions below refuse a `lease` that is not the job's current
    /// one with `QueueError::NotActive`.
    async fn extend_lease(&self, lease: Lease, lease_until: DateTime<Utc>) -> QueueResult<()>;

    /// Mark an active job completed, keeping at most `keep` completed jobs.
    async fn complete(&self, lease: Lease, now: DateTime<Utc>, keep: usize) -> QueueResult<()>;

    /// Record a failed attempt. Retries with the job's backoff while attempts
    /// remain, otherwise moves it to failed keeping at most `keep` failed jobs.
    async fn fail(
        &self,
        lease: Lease,
        error: &str,
        now: DateTime<Utc>,
        keep: usize,
    ) -> QueueResult<NackOutcome>;

    async fn counts(&self) -> QueueResult<StateCounts>;

    /// Move every failed job back to waiting with a fresh attempt budget.
    async fn retry_failed(&self, now: DateTime<Utc>) -> QueueResult<usize>;

    /// Drop all completed and failed jobs.
    async fn purge(&self) -> QueueResult<usize>;

    async fn get(&self, id: JobId) -> QueueResult<Option<Job<J>>>;

    /// Backend reachability, used by readiness probes.
    async fn ping(&self) -> QueueResult<()> {
        Ok(())
    }

    /// Short backend label for logs.
    fn backend(&self) -> &'static str;
}
