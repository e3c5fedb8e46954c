//! Queue error types.
//!
//! Only infrastructure failures and caller mistakes live here. Domain failures
//! of a job never surface as a `QueueError`; workers report them through
//! [`QueueCore::nack`](crate::QueueCore::nack).

use crate::job::JobId;
use thiserror::Error;

/// A payload that does not satisfy its kind's required-field rules.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid '{kind}' payload: {reason}")]
pub struct InvalidPayload {
    pub kind: String,
    pub reason: String,
}

impl InvalidPayload {
    pub fn new(kind: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            reason: reason.into(),
        }
    }
}

#[derive(Error, Debug)]
pub enum QueueError {
    /// Rejected at enqueue time, never enters the retry path
    #[error(transparent)]
    InvalidPayload(#[from] InvalidPayload),

    #[error("Job {0} not found")]
    NotFound(JobId),

    /// ack/nack/extend by a caller that does not hold the current lease.
    /// `state` is `active` when another worker has leased the job since.
    #[error("Job {id} is {state}, not held by this lease")]
    NotActive { id: JobId, state: String },

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Stored data could not be interpreted
    #[error("Corrupt job record {id}: {details}")]
    Corrupt { id: String, details: String },
}

impl QueueError {
    /// Whether the error comes from the backing store rather than the caller.
    pub fn is_storage(&self) -> bool {
        matches!(
            self,
            QueueError::Redis(_) | QueueError::Serialization(_) | QueueError::Corrupt { .. }
        )
    }
}

impl From<serde_json::Error> for QueueError {
    fn from(err: serde_json::Error) -> Self {
        QueueError::Serialization(err.to_string())
    }
}

pub type QueueResult<T> = Result<T, QueueError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_payload_message_names_kind() {
        let err: QueueError = InvalidPayload::new("send-email", "subject is required").into();
        assert_eq!(
            err.to_string(),
            "invalid 'send-email' payload: subject is required"
        );
        assert!(!err.is_storage());
    }

    #[test]
    fn invalid_payload_is_a_std_error() {
        let invalid = InvalidPayload::new("send-template-email", "templateId is required");
        let as_error: &dyn std::error::Error = &invalid;
        assert_eq!(
            as_error.to_string(),
            "invalid 'send-template-email' payload: templateId is required"
        );
        assert!(as_error.source().is_none());
    }

    #[test]
    fn serde_errors_are_storage_errors() {
        let err: QueueError = serde_json::from_str::<u32>("nope").unwrap_err().into();
        assert!(err.is_storage());
    }
}
