//! Job Queue
//!
//! A priority-ordered, retrying, at-least-once job queue.
//!
//! ## Features
//!
//! - **Priorities**: `low`/`normal`/`high`/`critical`, FIFO within a level
//! - **Delays**: jobs stay invisible until their delay elapses
//! - **Retries**: exponential backoff up to a per-job attempt budget
//! - **Leases**: a dequeued job returns to the queue if its worker stops heartbeating
//! - **Retention**: only the newest completed and failed jobs are kept
//! - **Backends**: in-memory for tests and single processes, Redis for shared queues
//! - **Observability**: Prometheus metrics and axum health/admin routes
//!
//! ## Example
//!
//! ```ignore
//! use job_queue::{EnqueueOptions, Priority, QueueConfig, QueueCore, QueueWorker, WorkerConfig};
//!
//! let queue = QueueCore::in_memory(QueueConfig::new("reports"));
//! queue
//!     .enqueue(Report { id: 7 }, EnqueueOptions::new().with_priority(Priority::High))
//!     .await?;
//!
//! let worker = QueueWorker::new(queue.clone(), ReportProcessor::new(), WorkerConfig::new());
//! worker.run(shutdown_rx).await?;
//! ```

pub mod admin;
mod clock;
mod config;
mod error;
mod job;
pub mod metrics;
mod queue;
mod registry;
mod store;
mod worker;

pub use admin::{AdminState, admin_router, health_router};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{QueueConfig, Retention, WorkerConfig};
pub use error::{InvalidPayload, QueueError, QueueResult};
pub use job::{Backoff, EnqueueOptions, Job, JobId, JobState, Lease, Priority, QueueJob};
pub use metrics::{QueueMetrics, init_metrics};
pub use queue::{QueueCore, QueueStats};
pub use registry::QueueDef;
pub use store::{InMemoryStore, JobStore, NackOutcome, RedisStore, StateCounts};
pub use worker::{JobProcessor, ProcessError, QueueWorker};
