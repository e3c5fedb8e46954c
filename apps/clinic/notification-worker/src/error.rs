//! HTTP error responses.

use axum::{
    Json,
    extract::rejection::JsonRejection,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use domain_notifications::NotificationError;
use job_queue::QueueError;
use serde::Serialize;
use thiserror::Error;
use validator::ValidationErrors;

/// Body of every error response.
///
/// ```json
/// { "error": "BadRequest", "message": "Request validation failed", "details": { ... } }
/// ```
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// Machine-readable error identifier
    pub error: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("JSON extraction error: {0}")]
    JsonRejection(#[from] JsonRejection),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationErrors),

    #[error(transparent)]
    Notification(#[from] NotificationError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error, message, details) = match self {
            ApiError::JsonRejection(e) => {
                tracing::warn!(error = %e, "JSON extraction error");
                let status = e.status();
                (status, status_label(status), e.body_text(), None)
            }
            ApiError::Validation(e) => {
                tracing::info!(error = %e, "Validation error");
                (
                    StatusCode::BAD_REQUEST,
                    "BadRequest",
                    "Request validation failed".to_string(),
                    serde_json::to_value(&e).ok(),
                )
            }
            ApiError::Notification(e) => notification_error(e),
        };

        let body = ErrorResponse {
            error,
            message,
            details,
        };
        (status, Json(body)).into_response()
    }
}

/// Error identifier for a status produced by the JSON extractor.
fn status_label(status: StatusCode) -> &'static str {
    match status {
        StatusCode::UNPROCESSABLE_ENTITY => "UnprocessableEntity",
        StatusCode::UNSUPPORTED_MEDIA_TYPE => "UnsupportedMediaType",
        StatusCode::PAYLOAD_TOO_LARGE => "PayloadTooLarge",
        s if s.is_server_error() => "InternalServerError",
        _ => "BadRequest",
    }
}

fn notification_error(
    e: NotificationError,
) -> (StatusCode, &'static str, String, Option<serde_json::Value>) {
    match e {
        NotificationError::Queue(QueueError::InvalidPayload(invalid)) => {
            tracing::info!(kind = %invalid.kind, reason = %invalid.reason, "Rejected email payload");
            (StatusCode::UNPROCESSABLE_ENTITY, "InvalidPayload", invalid.to_string(), None)
        }
        NotificationError::TemplateNotConfigured(_) => {
            tracing::error!(error = %e, "Template missing from configuration");
            (StatusCode::SERVICE_UNAVAILABLE, "ServiceUnavailable", e.to_string(), None)
        }
        NotificationError::Queue(ref queue) if queue.is_storage() => {
            tracing::error!(error = %e, "Queue store unavailable");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                "ServiceUnavailable",
                "Queue store unavailable".to_string(),
                None,
            )
        }
        other => {
            tracing::error!(error = %other, "Notification request failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "InternalServerError",
                "An internal server error occurred".to_string(),
                None,
            )
        }
    }
}
