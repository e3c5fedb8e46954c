//! HTTP surface against an in-memory queue.

use axum::Router;
use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use clinic_notification_worker::routes::{AppState, QueuedResponse, app_router};
use domain_notifications::{EmailQueue, NotificationService, TemplateIds};
use http_body_util::BodyExt;
use job_queue::{JobState, Priority, QueueConfig, QueueCore};
use serde_json::{Value, json};
use tower::ServiceExt;

fn setup() -> (Router, NotificationService) {
    let queue = QueueCore::in_memory(EmailQueue::config());
    let templates = TemplateIds {
        welcome: Some("d-welcome".into()),
        ..TemplateIds::default()
    };
    let notifications = NotificationService::new(queue, templates);
    let state = AppState {
        notifications: notifications.clone(),
        gateway: "SendGrid",
        workers: 0,
    };
    (app_router(state, "notification-worker", "0.0.0-test"), notifications)
}

async fn send(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let json = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, json)
}

#[tokio::test]
async fn send_email_queues_a_job() {
    let (app, notifications) = setup();

    let (status, body) = send(
        &app,
        Method::POST,
        "/notifications/email/send",
        Some(json!({
            "to": ["patient@example.com"],
            "subject": "Appointment confirmed",
            "html": "<p>See you Tuesday</p>",
            "priority": "high",
        })),
    )
    .await;

    assert_eq!(status, StatusCode::CREATED);
    let queued: QueuedResponse = serde_json::from_value(body).unwrap();
    assert_eq!(queued.status, "queued");
    assert_eq!(queued.job_ids.len(), 1);

    let job = notifications.queue().get(queued.job_ids[0]).await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Waiting);
    assert_eq!(job.data.payload.subject(), Some("Appointment confirmed"));
}

async fn queued_priority(app: &Router, notifications: &NotificationService, priority: &str) -> Priority {
    let (status, body) = send(
        app,
        Method::POST,
        "/notifications/email/send",
        Some(json!({
            "to": ["patient@example.com"],
            "subject": "Lab results",
            "html": "<p>Ready</p>",
            "priority": priority,
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "priority {priority}: {body}");

    let queued: QueuedResponse = serde_json::from_value(body).unwrap();
    let job = notifications.queue().get(queued.job_ids[0]).await.unwrap().unwrap();
    job.priority
}

#[tokio::test]
async fn priority_names_are_lenient() {
    let (app, notifications) = setup();

    assert_eq!(queued_priority(&app, &notifications, "urgent").await, Priority::Normal);
    assert_eq!(queued_priority(&app, &notifications, "HIGH").await, Priority::High);
    assert_eq!(queued_priority(&app, &notifications, "critical").await, Priority::Critical);
}

#[tokio::test]
async fn wrongly_typed_field_is_labelled_unprocessable() {
    let (app, _) = setup();

    let (status, body) = send(
        &app,
        Method::POST,
        "/notifications/email/send",
        Some(json!({ "to": "patient@example.com", "subject": "s", "html": "h" })),
    )
    .await;

    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["error"], "UnprocessableEntity");
}

#[tokio::test]
async fn empty_bulk_welcome_fails_validation() {
    let (app, notifications) = setup();

    let (status, body) = send(
        &app,
        Method::POST,
        "/notifications/email/bulk-welcome",
        Some(json!({ "users": [] })),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["details"]["users"].is_array());
    assert_eq!(notifications.queue_stats().await.unwrap().total, 0);
}

#[tokio::test]
async fn send_email_without_body_fields_is_unprocessable() {
    let (app, notifications) = setup();

    let (status, body) = send(
        &app,
        Method::POST,
        "/notifications/email/send",
        Some(json!({ "to": ["patient@example.com"], "subject": "No body" })),
    )
    .await;

    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["error"], "InvalidPayload");
    assert!(body["message"].as_str().unwrap().contains("subject and html are required"));
    assert_eq!(notifications.queue_stats().await.unwrap().total, 0);
}

#[tokio::test]
async fn empty_recipient_list_fails_validation() {
    let (app, _) = setup();

    let (status, body) = send(
        &app,
        Method::POST,
        "/notifications/email/template",
        Some(json!({ "to": [], "templateId": "d-any" })),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "BadRequest");
    assert!(body["details"]["to"].is_array());
}

#[tokio::test]
async fn malformed_json_is_rejected() {
    let (app, _) = setup();

    let request = Request::builder()
        .method(Method::POST)
        .uri("/notifications/email/welcome")
        .header("content-type", "application/json")
        .body(Body::from("{not json"))
        .unwrap();
    let response = app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body["error"], "BadRequest");
}

#[tokio::test]
async fn bulk_welcome_returns_one_id_per_user() {
    let (app, notifications) = setup();

    let (status, body) = send(
        &app,
        Method::POST,
        "/notifications/email/bulk-welcome",
        Some(json!({
            "users": [
                { "email": "a@example.com", "userData": { "firstName": "Ann" } },
                { "email": "b@example.com" },
            ]
        })),
    )
    .await;

    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["jobIds"].as_array().unwrap().len(), 2);
    assert_eq!(notifications.queue_stats().await.unwrap().waiting, 2);
}

#[tokio::test]
async fn queue_management_is_mounted_under_notifications() {
    let (app, _) = setup();
    send(
        &app,
        Method::POST,
        "/notifications/email/welcome",
        Some(json!({ "email": "new@example.com" })),
    )
    .await;

    let (status, body) = send(&app, Method::GET, "/notifications/queue/stats", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["queueName"], "email-notifications");
    assert_eq!(body["waiting"], 1);
    assert_eq!(body["total"], 1);

    let (status, body) = send(&app, Method::PATCH, "/notifications/queue/clear", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["removed"], 0);

    let (status, body) = send(&app, Method::PATCH, "/notifications/queue/retry-failed", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["retried"], 0);
}

#[tokio::test]
async fn queue_info_and_health() {
    let (app, _) = setup();

    let (status, body) = send(&app, Method::GET, "/admin/queue-info/info", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["queueName"], "email-notifications");
    assert_eq!(body["backend"], "memory");
    assert_eq!(body["workers"], 0);

    let (status, body) = send(&app, Method::GET, "/admin/queue-info/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["queue"]["reachable"], true);

    let (status, _) = send(&app, Method::GET, "/readyz", None).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn missing_template_is_service_unavailable() {
    let queue = QueueCore::in_memory(QueueConfig::new("no-templates"));
    let state = AppState {
        notifications: NotificationService::new(queue, TemplateIds::default()),
        gateway: "SendGrid",
        workers: 1,
    };
    let app = app_router(state, "notification-worker", "0.0.0-test");

    let (status, body) = send(
        &app,
        Method::POST,
        "/notifications/email/welcome",
        Some(json!({ "email": "new@example.com" })),
    )
    .await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["error"], "ServiceUnavailable");
}
