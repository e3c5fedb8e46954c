//! Error types for the notifications domain.

use crate::gateway::GatewayError;
use core_config::ConfigError;
use job_queue::QueueError;
use thiserror::Error;

/// Result type for notification operations.
pub type NotificationResult<T> = Result<T, NotificationError>;

/// Errors that can occur in the notifications domain.
#[derive(Debug, Error)]
pub enum NotificationError {
    /// The queue rejected the job or its store is unavailable.
    #[error(transparent)]
    Queue(#[from] QueueError),

    /// No provider template id is configured for this event.
    #[error("No template configured for {0} emails")]
    TemplateNotConfigured(&'static str),

    /// Mail gateway could not be built or probed.
    #[error("Email gateway error: {0}")]
    Gateway(#[from] GatewayError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl NotificationError {
    /// Whether the caller sent something the queue refused to accept.
    pub fn is_invalid_payload(&self) -> bool {
        matches!(self, NotificationError::Queue(QueueError::InvalidPayload(_)))
    }
}
