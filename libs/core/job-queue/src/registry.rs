//! Static queue definitions.
//!
//! A domain declares its queue once as a zero-sized type and derives both the
//! queue and worker configuration from it.
//!
//! ```rust,ignore
//! pub struct ReportQueue;
//!
//! impl QueueDef for ReportQueue {
//!     const NAME: &'static str = "reports";
//!     const DEFAULT_ATTEMPTS: u32 = 5;
//! }
//!
//! let config = QueueConfig::from_queue_def::<ReportQueue>();
//! ```

use std::time::Duration;

pub trait QueueDef: Send + Sync {
    /// Queue name, also used as the Redis key namespace and metric label.
    const NAME: &'static str;

    const DEFAULT_ATTEMPTS: u32 = 3;

    /// Base delay for exponential backoff.
    const BACKOFF_BASE_MS: u64 = 2000;

    const KEEP_COMPLETED: usize = 10;

    const KEEP_FAILED: usize = 5;

    const LEASE_DURATION: Duration = Duration::from_secs(30);

    fn name() -> &'static str {
        Self::NAME
    }
}
