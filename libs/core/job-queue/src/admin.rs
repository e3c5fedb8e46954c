//! Health, metrics and queue-management endpoints.
//!
//! - `GET /health`, `GET /healthz`: liveness
//! - `GET /ready`, `GET /readyz`: store reachability
//! - `GET /metrics`: Prometheus text format
//! - `GET /queue/stats`: counts per state, as a bare [`QueueStats`] object
//! - `GET /queue/jobs/{id}`: one job record
//! - `PATCH /queue/retry-failed`: requeue failed jobs
//! - `PATCH /queue/clear`: drop completed and failed jobs

use crate::job::{JobId, QueueJob};
use crate::metrics;
use crate::queue::{QueueCore, QueueStats};
use axum::{
    Json, Router,
    extract::{Path, State},
    http::{StatusCode, header},
    response::IntoResponse,
    routing::{get, patch},
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

pub struct AdminState<J> {
    pub queue: QueueCore<J>,
    pub app_name: String,
    pub app_version: String,
}

impl<J> Clone for AdminState<J> {
    fn clone(&self) -> Self {
        Self {
            queue: self.queue.clone(),
            app_name: self.app_name.clone(),
            app_version: self.app_version.clone(),
        }
    }
}

impl<J: QueueJob> AdminState<J> {
    pub fn new(
        queue: QueueCore<J>,
        app_name: impl Into<String>,
        app_version: impl Into<String>,
    ) -> Self {
        Self {
            queue,
            app_name: app_name.into(),
            app_version: app_version.into(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub name: String,
    pub version: String,
    pub queue: String,
}

type ApiError = (StatusCode, Json<Value>);

fn internal(e: impl std::fmt::Display) -> ApiError {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": e.to_string() })),
    )
}

pub async fn health_handler<J: QueueJob>(State(state): State<AdminState<J>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        name: state.app_name,
        version: state.app_version,
        queue: state.queue.name().to_string(),
    })
}

pub async fn ready_handler<J: QueueJob>(
    State(state): State<AdminState<J>>,
) -> Result<Json<Value>, ApiError> {
    match state.queue.ping().await {
        Ok(()) => Ok(Json(json!({
            "status": "ready",
            "checks": { "store": "ok", "backend": state.queue.backend() }
        }))),
        Err(e) => Err((
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "status": "not_ready",
                "checks": { "store": format!("error: {e}"), "backend": state.queue.backend() }
            })),
        )),
    }
}

pub async fn metrics_handler() -> impl IntoResponse {
    let content_type = [(header::CONTENT_TYPE, "text/plain; charset=utf-8")];
    match metrics::prometheus_handle() {
        Some(handle) => (StatusCode::OK, content_type, handle.render()).into_response(),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            content_type,
            "Metrics not initialized".to_string(),
        )
            .into_response(),
    }
}

pub async fn stats_handler<J: QueueJob>(
    State(state): State<AdminState<J>>,
) -> Result<Json<QueueStats>, ApiError> {
    let stats = state.queue.stats().await.map_err(internal)?;
    Ok(Json(stats))
}

pub async fn job_handler<J: QueueJob>(
    State(state): State<AdminState<J>>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let id: JobId = id.parse().map_err(|_| {
        (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "invalid job id", "id": id })),
        )
    })?;

    match state.queue.get(id).await.map_err(internal)? {
        Some(job) => Ok(Json(json!({ "success": true, "data": job }))),
        None => Err((
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "job not found", "id": id.to_string() })),
        )),
    }
}

pub async fn retry_failed_handler<J: QueueJob>(
    State(state): State<AdminState<J>>,
) -> Result<Json<Value>, ApiError> {
    let retried = state.queue.retry_failed().await.map_err(internal)?;
    Ok(Json(json!({
        "success": true,
        "message": "Failed jobs retried",
        "retried": retried
    })))
}

pub async fn clear_handler<J: QueueJob>(
    State(state): State<AdminState<J>>,
) -> Result<Json<Value>, ApiError> {
    let removed = state.queue.purge().await.map_err(internal)?;
    Ok(Json(json!({
        "success": true,
        "message": "Queue cleared",
        "removed": removed
    })))
}

/// Liveness, readiness and metrics only.
pub fn health_router<J: QueueJob>(state: AdminState<J>) -> Router {
    Router::new()
        .route("/health", get(health_handler::<J>))
        .route("/healthz", get(health_handler::<J>))
        .route("/ready", get(ready_handler::<J>))
        .route("/readyz", get(ready_handler::<J>))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

/// Health endpoints plus queue management.
pub fn admin_router<J: QueueJob>(state: AdminState<J>) -> Router {
    Router::new()
        .route("/queue/stats", get(stats_handler::<J>))
        .route("/queue/jobs/{id}", get(job_handler::<J>))
        .route("/queue/retry-failed", patch(retry_failed_handler::<J>))
        .route("/queue/clear", patch(clear_handler::<J>))
        .with_state(state.clone())
        .merge(health_router(state))
}
