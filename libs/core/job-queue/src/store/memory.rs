//! Process-local store. Suitable for tests and single-process deployments;
//! jobs are lost when the process exits.

use super::{JobStore, NackOutcome, StateCounts};
use crate::error::{QueueError, QueueResult};
use crate::job::{Job, JobId, JobState, Lease, QueueJob, after};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::cmp::Reverse;
use std::collections::{BTreeSet, HashMap, VecDeque};
use tokio::sync::Mutex;
use tracing::debug;

type WaitingKey = (Reverse<u8>, u64, JobId);
type TimedKey = (i64, u64, JobId);

struct Inner<J> {
    jobs: HashMap<JobId, Job<J>>,
    waiting: BTreeSet<WaitingKey>,
    delayed: BTreeSet<TimedKey>,
    active: BTreeSet<TimedKey>,
    /// Oldest at the front
    completed: VecDeque<JobId>,
    failed: VecDeque<JobId>,
    next_sequence: u64,
}

impl<J> Default for Inner<J> {
    fn default() -> Self {
        Self {
            jobs: HashMap::new(),
            waiting: BTreeSet::new(),
            delayed: BTreeSet::new(),
            active: BTreeSet::new(),
            completed: VecDeque::new(),
            failed: VecDeque::new(),
            next_sequence: 0,
        }
    }
}

fn waiting_key<J>(job: &Job<J>) -> WaitingKey {
    (Reverse(job.priority.value()), job.sequence, job.id)
}

fn timed_key(at: DateTime<Utc>, seq: u64, id: JobId) -> TimedKey {
    (at.timestamp_millis(), seq, id)
}

impl<J: QueueJob> Inner<J> {
    fn job_mut(&mut self, id: JobId) -> QueueResult<&mut Job<J>> {
        self.jobs.get_mut(&id).ok_or(QueueError::NotFound(id))
    }

    fn require_lease(&self, lease: Lease) -> QueueResult<&Job<J>> {
        let id = lease.id;
        let job = self.jobs.get(&id).ok_or(QueueError::NotFound(id))?;
        if job.state != JobState::Active || job.lease_token != lease.token {
            return Err(QueueError::NotActive {
                id,
                state: job.state.to_string(),
            });
        }
        Ok(job)
    }

    fn push_waiting(&mut self, id: JobId) {
        if let Some(job) = self.jobs.get_mut(&id) {
            job.state = JobState::Waiting;
            let key = waiting_key(job);
            self.waiting.insert(key);
        }
    }

    fn take_active(&mut self, id: JobId) {
        if let Some(job) = self.jobs.get_mut(&id) {
            if let Some(until) = job.lease_expires_at.take() {
                self.active.remove(&timed_key(until, job.sequence, id));
            }
        }
    }

    fn promote_due(&mut self, now: DateTime<Utc>) {
        let now_ms = now.timestamp_millis();
        while let Some(&(ready, _, id)) = self.delayed.first() {
            if ready > now_ms {
                break;
            }
            self.delayed.pop_first();
            self.push_waiting(id);
        }
    }

    fn prune(list: &mut VecDeque<JobId>, jobs: &mut HashMap<JobId, Job<J>>, keep: usize) {
        while list.len() > keep {
            if let Some(old) = list.pop_front() {
                jobs.remove(&old);
            }
        }
    }
}

pub struct InMemoryStore<J> {
    inner: Mutex<Inner<J>>,
}

impl<J> InMemoryStore<J> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
        }
    }
}

impl<J> Default for InMemoryStore<J> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<J: QueueJob> JobStore<J> for InMemoryStore<J> {
    async fn insert(&self, mut job: Job<J>) -> QueueResult<Job<J>> {
        let mut inner = self.inner.lock().await;
        inner.next_sequence += 1;
        job.sequence = inner.next_sequence;

        match (job.state, job.ready_at) {
            (JobState::Delayed, Some(ready)) => {
                inner.delayed.insert(timed_key(ready, job.sequence, job.id));
            }
            _ => {
                job.state = JobState::Waiting;
                inner.waiting.insert(waiting_key(&job));
            }
        }
        inner.jobs.insert(job.id, job.clone());
        Ok(job)
    }

    async fn reclaim_expired(&self, now: DateTime<Utc>) -> QueueResult<Vec<JobId>> {
        let mut inner = self.inner.lock().await;
        let now_ms = now.timestamp_millis();
        let mut reclaimed = Vec::new();

        while let Some(&(until, _, id)) = inner.active.first() {
            if until >= now_ms {
                break;
            }
            inner.active.pop_first();
            if let Some(job) = inner.jobs.get_mut(&id) {
                job.lease_expires_at = None;
                job.stalled_count += 1;
            }
            inner.push_waiting(id);
            reclaimed.push(id);
        }
        Ok(reclaimed)
    }

    async fn lease_next(
        &self,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> QueueResult<Option<Job<J>>> {
        let mut inner = self.inner.lock().await;
        inner.promote_due(now);

        let Some((_, seq, id)) = inner.waiting.pop_first() else {
            return Ok(None);
        };
        inner.active.insert(timed_key(lease_until, seq, id));

        let job = inner.job_mut(id)?;
        job.state = JobState::Active;
        job.lease_token += 1;
        job.lease_expires_at = Some(lease_until);
        job.processed_at = Some(now);
        Ok(Some(job.clone()))
    }

    async fn extend_lease(&self, lease: Lease, lease_until: DateTime<Utc>) -> QueueResult<()> {
        let id = lease.id;
        let mut inner = self.inner.lock().await;
        inner.require_lease(lease)?;
        inner.take_active(id);

        let job = inner.job_mut(id)?;
        job.lease_expires_at = Some(lease_until);
        let key = timed_key(lease_until, job.sequence, id);
        inner.active.insert(key);
        Ok(())
    }

    async fn complete(&self, lease: Lease, now: DateTime<Utc>, keep: usize) -> QueueResult<()> {
        let id = lease.id;
        let mut guard = self.inner.lock().await;
        guard.require_lease(lease)?;
        guard.take_active(id);

        let job = guard.job_mut(id)?;
        job.state = JobState::Completed;
        job.finished_at = Some(now);

        let inner = &mut *guard;
        inner.completed.push_back(id);
        Inner::prune(&mut inner.completed, &mut inner.jobs, keep);
        Ok(())
    }

    async fn fail(
        &self,
        lease: Lease,
        error: &str,
        now: DateTime<Utc>,
        keep: usize,
    ) -> QueueResult<NackOutcome> {
        let id = lease.id;
        let mut guard = self.inner.lock().await;
        guard.require_lease(lease)?;
        guard.take_active(id);

        let job = guard.job_mut(id)?;
        job.attempts_made += 1;
        job.last_error = Some(error.to_string());
        let attempts_made = job.attempts_made;

        if attempts_made < job.max_attempts {
            let delay = job.backoff.delay_for(attempts_made);
            let retry_at = after(now, u64::try_from(delay.as_millis()).unwrap_or(u64::MAX));
            job.state = JobState::Delayed;
            job.ready_at = Some(retry_at);
            let key = timed_key(retry_at, job.sequence, id);
            guard.delayed.insert(key);
            debug!(job_id = %id, attempts_made, %retry_at, "job rescheduled");
            return Ok(NackOutcome::Retrying {
                attempts_made,
                retry_at,
            });
        }

        job.state = JobState::Failed;
        job.finished_at = Some(now);
        let inner = &mut *guard;
        inner.failed.push_back(id);
        Inner::prune(&mut inner.failed, &mut inner.jobs, keep);
        Ok(NackOutcome::Failed { attempts_made })
    }

    async fn counts(&self) -> QueueResult<StateCounts> {
        let inner = self.inner.lock().await;
        Ok(StateCounts {
            waiting: inner.waiting.len() as u64,
            delayed: inner.delayed.len() as u64,
            active: inner.active.len() as u64,
            completed: inner.completed.len() as u64,
            failed: inner.failed.len() as u64,
        })
    }

    async fn retry_failed(&self, _now: DateTime<Utc>) -> QueueResult<usize> {
        let mut inner = self.inner.lock().await;
        let ids: Vec<JobId> = inner.failed.drain(..).collect();
        for &id in &ids {
            if let Some(job) = inner.jobs.get_mut(&id) {
                job.attempts_made = 0;
                job.finished_at = None;
                job.ready_at = None;
            }
            inner.push_waiting(id);
        }
        Ok(ids.len())
    }

    async fn purge(&self) -> QueueResult<usize> {
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;
        let mut removed = 0;
        for id in inner.completed.drain(..).chain(inner.failed.drain(..)) {
            inner.jobs.remove(&id);
            removed += 1;
        }
        Ok(removed)
    }

    async fn get(&self, id: JobId) -> QueueResult<Option<Job<J>>> {
        Ok(self.inner.lock().await.jobs.get(&id).cloned())
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}
