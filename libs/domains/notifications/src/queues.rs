//! Queue definitions owned by the notifications domain.

use job_queue::{QueueConfig, QueueDef};

/// Outbound email queue. Retry and retention limits use the queue defaults:
/// 3 attempts, 2s exponential backoff, 10 completed and 5 failed jobs kept.
pub struct EmailQueue;

impl QueueDef for EmailQueue {
    const NAME: &'static str = "email-notifications";
}

impl EmailQueue {
    pub fn config() -> QueueConfig {
        QueueConfig::from_queue_def::<Self>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_email_queue_config() {
        let config = EmailQueue::config();
        assert_eq!(config.name, "email-notifications");
        assert_eq!(config.default_attempts, 3);
        assert_eq!(config.retention.completed, 10);
        assert_eq!(config.retention.failed, 5);
    }
}
