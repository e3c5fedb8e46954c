//! Prometheus metrics for queues and workers.

use crate::store::StateCounts;
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;
use std::time::Duration;
use tracing::{info, warn};

static PROMETHEUS_HANDLE: OnceCell<PrometheusHandle> = OnceCell::new();

/// Install the global Prometheus recorder. Later calls are no-ops.
pub fn init_metrics() {
    match PROMETHEUS_HANDLE.get_or_try_init(|| PrometheusBuilder::new().install_recorder()) {
        Ok(_) => info!("Prometheus metrics initialized"),
        Err(e) => warn!(error = %e, "Prometheus recorder not installed"),
    }
}

pub fn prometheus_handle() -> Option<&'static PrometheusHandle> {
    PROMETHEUS_HANDLE.get()
}

/// Metric helpers labelled with the queue name.
#[derive(Debug, Clone)]
pub struct QueueMetrics {
    queue: String,
}

impl QueueMetrics {
    pub fn new(queue: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
        }
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn job_enqueued(&self, kind: &str, priority: &str) {
        counter!(
            "job_queue_jobs_enqueued_total",
            "queue" => self.queue.clone(),
            "kind" => kind.to_string(),
            "priority" => priority.to_string()
        )
        .increment(1);
    }

    /// Payload rejected before entering the queue
    pub fn job_rejected(&self, kind: &str) {
        counter!(
            "job_queue_jobs_rejected_total",
            "queue" => self.queue.clone(),
            "kind" => kind.to_string()
        )
        .increment(1);
    }

    pub fn job_completed(&self, kind: &str, duration: Duration) {
        counter!(
            "job_queue_jobs_completed_total",
            "queue" => self.queue.clone(),
            "kind" => kind.to_string()
        )
        .increment(1);

        histogram!(
            "job_queue_job_duration_seconds",
            "queue" => self.queue.clone(),
            "kind" => kind.to_string()
        )
        .record(duration.as_secs_f64());
    }

    pub fn job_retried(&self, kind: &str) {
        counter!(
            "job_queue_jobs_retried_total",
            "queue" => self.queue.clone(),
            "kind" => kind.to_string()
        )
        .increment(1);
    }

    pub fn job_failed(&self, kind: &str) {
        counter!(
            "job_queue_jobs_failed_total",
            "queue" => self.queue.clone(),
            "kind" => kind.to_string()
        )
        .increment(1);
    }

    pub fn jobs_stalled(&self, count: usize) {
        counter!("job_queue_jobs_stalled_total", "queue" => self.queue.clone())
            .increment(count as u64);
    }

    pub fn state_counts(&self, counts: &StateCounts) {
        for (state, value) in [
            ("waiting", counts.waiting),
            ("delayed", counts.delayed),
            ("active", counts.active),
            ("completed", counts.completed),
            ("failed", counts.failed),
        ] {
            gauge!("job_queue_jobs", "queue" => self.queue.clone(), "state" => state)
                .set(value as f64);
        }
    }
}
