//! Notification HTTP endpoints.
//!
//! - `POST /notifications/email/send`: queue an ad hoc email
//! - `POST /notifications/email/template`: queue a template email
//! - `POST /notifications/email/welcome`: queue a welcome email
//! - `POST /notifications/email/bulk-welcome`: queue one welcome email per user
//! - `GET /admin/queue-info/info`, `GET /admin/queue-info/health`: queue overview
//!
//! Queue stats, retry and clear come from [`job_queue::admin_router`],
//! mounted under `/notifications`.

use crate::error::ApiError;
use axum::{
    Json, Router,
    extract::{FromRequest, Request, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use domain_notifications::{EmailJob, EmailPayload, NotificationService, TemplateData, WelcomeRecipient};
use job_queue::{AdminState, EnqueueOptions, JobId, Priority, admin_router, health_router};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;
use tower_http::trace::TraceLayer;
use validator::Validate;

/// Shared state for the notification handlers.
#[derive(Clone)]
pub struct AppState {
    pub notifications: NotificationService,
    /// Mail gateway name, for the queue-info endpoints
    pub gateway: &'static str,
    /// Worker slots running in this process
    pub workers: usize,
}

/// JSON body extractor that runs `validator` rules before the handler.
pub struct ValidatedJson<T>(pub T);

impl<T, S> FromRequest<S> for ValidatedJson<T>
where
    T: DeserializeOwned + Validate,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let Json(data) = Json::<T>::from_request(req, state).await?;
        data.validate()?;
        Ok(Self(data))
    }
}

/// Body shared by the send and template endpoints. Kind-specific fields are
/// checked by the queue when the job is enqueued.
#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct EmailRequest {
    #[validate(length(min = 1, message = "at least one recipient is required"))]
    pub to: Vec<String>,
    pub template_id: Option<String>,
    pub subject: Option<String>,
    pub html: Option<String>,
    #[validate(email)]
    pub from: Option<String>,
    pub dynamic_data: Option<TemplateData>,
    /// Priority name; unknown names fall back to normal
    pub priority: Option<String>,
    /// Milliseconds before the job becomes eligible
    #[serde(default)]
    pub delay: u64,
    pub attempts: Option<u32>,
}

impl EmailRequest {
    fn into_parts(self) -> (EmailPayload, EnqueueOptions) {
        let mut options = EnqueueOptions::new()
            .with_priority(
                self.priority
                    .as_deref()
                    .map(Priority::from_name_or_default)
                    .unwrap_or_default(),
            )
            .with_delay(Duration::from_millis(self.delay));
        if let Some(attempts) = self.attempts {
            options = options.with_attempts(attempts);
        }

        let payload = EmailPayload {
            to: self.to,
            template_id: self.template_id,
            subject: self.subject,
            html: self.html,
            from: self.from,
            dynamic_data: self.dynamic_data,
        };
        (payload, options)
    }
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct WelcomeRequest {
    #[validate(email)]
    pub email: String,
    #[serde(default)]
    pub user_data: TemplateData,
}

#[derive(Debug, Deserialize, Validate)]
pub struct BulkWelcomeRequest {
    #[validate(length(min = 1, message = "at least one user is required"))]
    pub users: Vec<WelcomeRecipient>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedResponse {
    pub message: String,
    pub status: String,
    pub job_ids: Vec<JobId>,
}

fn queued(message: &str, job_ids: Vec<JobId>) -> impl IntoResponse {
    (
        StatusCode::CREATED,
        Json(QueuedResponse {
            message: message.to_string(),
            status: "queued".to_string(),
            job_ids,
        }),
    )
}

async fn send_email(
    State(state): State<AppState>,
    ValidatedJson(request): ValidatedJson<EmailRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let (payload, options) = request.into_parts();
    let id = state.notifications.send_custom_email(payload, options).await?;
    Ok(queued("Email notification queued successfully", vec![id]))
}

async fn send_template_email(
    State(state): State<AppState>,
    ValidatedJson(request): ValidatedJson<EmailRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let (payload, options) = request.into_parts();
    let id = state
        .notifications
        .send_custom_template_email(payload, options)
        .await?;
    Ok(queued("Template email notification queued successfully", vec![id]))
}

async fn send_welcome_email(
    State(state): State<AppState>,
    ValidatedJson(request): ValidatedJson<WelcomeRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let id = state
        .notifications
        .send_welcome_email(&request.email, request.user_data)
        .await?;
    Ok(queued("Welcome email queued successfully", vec![id]))
}

async fn send_bulk_welcome_emails(
    State(state): State<AppState>,
    ValidatedJson(request): ValidatedJson<BulkWelcomeRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let ids = state
        .notifications
        .send_bulk_welcome_emails(request.users)
        .await?;
    Ok(queued("Bulk welcome emails queued successfully", ids))
}

async fn queue_info(State(state): State<AppState>) -> impl IntoResponse {
    let queue = state.notifications.queue();
    Json(json!({
        "queueName": queue.name(),
        "backend": queue.backend(),
        "processor": "EmailProcessor",
        "gateway": state.gateway,
        "workers": state.workers,
        "endpoints": {
            "stats": "GET /notifications/queue/stats",
            "job": "GET /notifications/queue/jobs/{id}",
            "retry": "PATCH /notifications/queue/retry-failed",
            "clear": "PATCH /notifications/queue/clear",
        },
    }))
}

async fn queue_health(State(state): State<AppState>) -> impl IntoResponse {
    let queue = state.notifications.queue();
    let store = queue.ping().await;
    let status = if store.is_ok() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    let body = json!({
        "status": if store.is_ok() { "healthy" } else { "unhealthy" },
        "queue": {
            "name": queue.name(),
            "backend": queue.backend(),
            "reachable": store.is_ok(),
            "error": store.err().map(|e| e.to_string()),
        },
        "workers": state.workers,
        "gateway": state.gateway,
        "timestamp": chrono::Utc::now().to_rfc3339(),
    });
    (status, Json(body))
}

pub fn notification_router(state: AppState) -> Router {
    Router::new()
        .route("/email/send", post(send_email))
        .route("/email/template", post(send_template_email))
        .route("/email/welcome", post(send_welcome_email))
        .route("/email/bulk-welcome", post(send_bulk_welcome_emails))
        .with_state(state)
}

pub fn queue_info_router(state: AppState) -> Router {
    Router::new()
        .route("/info", get(queue_info))
        .route("/health", get(queue_health))
        .with_state(state)
}

/// Full application router: probes and metrics at the root, notification
/// endpoints and queue management under `/notifications`.
pub fn app_router(state: AppState, app_name: &str, app_version: &str) -> Router {
    let admin = AdminState::<EmailJob>::new(state.notifications.queue().clone(), app_name, app_version);

    Router::new()
        .merge(health_router(admin.clone()))
        .nest(
            "/notifications",
            notification_router(state.clone()).merge(admin_router(admin)),
        )
        .nest("/admin/queue-info", queue_info_router(state))
        .layer(TraceLayer::new_for_http())
}
