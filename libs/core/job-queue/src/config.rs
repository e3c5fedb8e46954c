//! Queue and worker configuration.

use crate::job::Backoff;
use crate::registry::QueueDef;
use std::time::Duration;
use uuid::Uuid;

/// How many terminal jobs are kept before the oldest are pruned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Retention {
    pub completed: usize,
    pub failed: usize,
}

impl Default for Retention {
    fn default() -> Self {
        Self {
            completed: 10,
            failed: 5,
        }
    }
}

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub name: String,
    /// Used when a job is enqueued without (or with zero) attempts
    pub default_attempts: u32,
    pub backoff: Backoff,
    pub retention: Retention,
    /// How long a dequeued job stays invisible to other workers without a heartbeat
    pub lease_duration: Duration,
    /// Reject malformed payloads in `enqueue` instead of letting the worker fail them
    pub validate_on_enqueue: bool,
}

impl QueueConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            default_attempts: 3,
            backoff: Backoff::default(),
            retention: Retention::default(),
            lease_duration: Duration::from_secs(30),
            validate_on_enqueue: true,
        }
    }

    pub fn from_queue_def<Q: QueueDef>() -> Self {
        Self {
            name: Q::NAME.to_string(),
            default_attempts: Q::DEFAULT_ATTEMPTS,
            backoff: Backoff::Exponential {
                base_ms: Q::BACKOFF_BASE_MS,
            },
            retention: Retention {
                completed: Q::KEEP_COMPLETED,
                failed: Q::KEEP_FAILED,
            },
            lease_duration: Q::LEASE_DURATION,
            validate_on_enqueue: true,
        }
    }

    pub fn with_default_attempts(mut self, attempts: u32) -> Self {
        self.default_attempts = attempts.max(1);
        self
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_retention(mut self, completed: usize, failed: usize) -> Self {
        self.retention = Retention { completed, failed };
        self
    }

    pub fn with_lease_duration(mut self, lease: Duration) -> Self {
        self.lease_duration = lease;
        self
    }

    pub fn with_validate_on_enqueue(mut self, enabled: bool) -> Self {
        self.validate_on_enqueue = enabled;
        self
    }
}

/// Settings for a [`QueueWorker`](crate::QueueWorker).
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Appears in logs and metrics
    pub worker_id: String,
    /// Number of jobs processed in parallel by one worker
    pub concurrency: usize,
    /// Sleep between polls when the queue is empty
    pub poll_interval: Duration,
    /// Lease renewal period; `None` derives half the queue lease duration
    pub heartbeat_interval: Option<Duration>,
}

impl WorkerConfig {
    pub fn new() -> Self {
        Self {
            worker_id: format!("worker-{}", Uuid::new_v4()),
            concurrency: 1,
            poll_interval: Duration::from_millis(500),
            heartbeat_interval: None,
        }
    }

    pub fn with_worker_id(mut self, id: impl Into<String>) -> Self {
        self.worker_id = id.into();
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = Some(interval);
        self
    }

    pub(crate) fn heartbeat_for(&self, lease: Duration) -> Duration {
        self.heartbeat_interval
            .unwrap_or(lease / 2)
            .max(Duration::from_millis(10))
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_defaults_match_notification_queue() {
        let config = QueueConfig::new("email-notifications");
        assert_eq!(config.default_attempts, 3);
        assert_eq!(config.backoff, Backoff::Exponential { base_ms: 2000 });
        assert_eq!(config.retention, Retention { completed: 10, failed: 5 });
        assert_eq!(config.lease_duration, Duration::from_secs(30));
        assert!(config.validate_on_enqueue);
    }

    #[test]
    fn zero_default_attempts_is_clamped() {
        let config = QueueConfig::new("q").with_default_attempts(0);
        assert_eq!(config.default_attempts, 1);
    }

    #[test]
    fn heartbeat_defaults_to_half_the_lease() {
        let worker = WorkerConfig::new();
        assert_eq!(worker.heartbeat_for(Duration::from_secs(30)), Duration::from_secs(15));
        let worker = worker.with_heartbeat_interval(Duration::from_secs(2));
        assert_eq!(worker.heartbeat_for(Duration::from_secs(30)), Duration::from_secs(2));
    }

    #[test]
    fn concurrency_is_at_least_one() {
        assert_eq!(WorkerConfig::new().with_concurrency(0).concurrency, 1);
        assert!(WorkerConfig::new().worker_id.starts_with("worker-"));
    }
}
