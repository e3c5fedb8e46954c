//! Clinic notification worker
//!
//! Accepts email requests over HTTP, queues them and delivers them through
//! SendGrid from in-process workers.
//!
//! ## Architecture
//!
//! ```text
//! POST /notifications/email/*
//!   ↓ (NotificationService)
//! QueueCore<EmailJob> (memory or Redis)
//!   ↓ (QueueWorker, WORKER_CONCURRENCY slots)
//! EmailProcessor
//!   ↓ (DeliveryPolicy per job kind)
//! SendGridGateway
//! ```
//!
//! Failed jobs retry with exponential backoff and are kept for inspection
//! through `/notifications/queue/*`.

pub mod config;
pub mod error;
pub mod routes;

use crate::config::{Config, QueueBackend};
use crate::routes::{AppState, app_router};
use domain_notifications::{
    EmailJob, EmailProcessor, MailGateway, NotificationService, SendGridGateway,
};
use eyre::{Result, WrapErr};
use job_queue::{QueueConfig, QueueCore, QueueWorker, RedisStore};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};

pub const APP_NAME: &str = env!("CARGO_PKG_NAME");
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Open the configured job store.
pub async fn build_queue(backend: &QueueBackend, queue: QueueConfig) -> Result<QueueCore<EmailJob>> {
    match backend {
        QueueBackend::Memory => {
            warn!(queue = %queue.name, "Using in-memory queue; jobs are lost on restart");
            Ok(QueueCore::in_memory(queue))
        }
        QueueBackend::Redis(redis) => {
            info!(queue = %queue.name, prefix = %redis.key_prefix, "Connecting to Redis...");
            let store = RedisStore::<EmailJob>::connect(&redis.uri, &redis.key_prefix, &queue.name)
                .await
                .wrap_err("Failed to connect to Redis")?;
            info!("Connected to Redis successfully");
            Ok(QueueCore::new(queue, Arc::new(store)))
        }
    }
}

/// Run the notification service
///
/// 1. Loads configuration and sets up logging and metrics
/// 2. Opens the queue store and the SendGrid gateway
/// 3. Spawns the queue worker unless concurrency is zero
/// 4. Serves HTTP until SIGINT or SIGTERM, then drains the worker
///
/// # Errors
///
/// Returns an error if configuration is invalid, the store is unreachable,
/// the listener cannot bind, or the worker hits a storage failure.
pub async fn run() -> Result<()> {
    let config = Config::from_env().wrap_err("Failed to load configuration")?;
    core_config::tracing::init_tracing(&config.environment);
    job_queue::init_metrics();

    info!(name = APP_NAME, version = APP_VERSION, "Starting notification worker");
    info!("Environment: {:?}", config.environment);

    let queue = build_queue(&config.backend, config.queue.clone()).await?;

    let gateway = Arc::new(
        SendGridGateway::new(config.sendgrid.clone()).wrap_err("Failed to create SendGrid gateway")?,
    );
    match gateway.health_check().await {
        Ok(_) => info!(dry_run = config.sendgrid.dry_run, "SendGrid gateway ready"),
        Err(e) => warn!(error = %e, "SendGrid gateway is not usable; jobs will fail until it is configured"),
    }

    let processor = EmailProcessor::with_arc_gateway(gateway.clone())
        .with_default_from(config.sendgrid.from_email.clone())
        .with_policies(config.policies);

    let notifications = NotificationService::new(queue.clone(), config.templates.clone());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let worker = if config.worker_concurrency > 0 {
        let worker = QueueWorker::new(queue.clone(), processor, config.worker.clone());
        info!(
            queue = %queue.name(),
            concurrency = config.worker.concurrency,
            poll_interval_ms = config.worker.poll_interval.as_millis() as u64,
            "Starting queue worker"
        );
        Some(tokio::spawn(async move { worker.run(shutdown_rx).await }))
    } else {
        info!("WORKER_CONCURRENCY is 0; serving the API without a worker");
        None
    };

    let state = AppState {
        notifications,
        gateway: gateway.name(),
        workers: config.worker_concurrency,
    };
    let app = app_router(state, APP_NAME, APP_VERSION);

    let addr = config.server.address();
    let listener = TcpListener::bind(&addr)
        .await
        .wrap_err_with(|| format!("Failed to bind to {addr}"))?;
    info!(%addr, "HTTP server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            let _ = shutdown_tx.send(true);
        })
        .await
        .wrap_err("HTTP server failed")?;

    if let Some(handle) = worker {
        handle
            .await
            .wrap_err("Worker task panicked")?
            .wrap_err("Queue worker failed")?;
    }

    info!("Notification worker stopped");
    Ok(())
}

/// Wait for SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, initiating shutdown..."),
        _ = terminate => info!("Received SIGTERM, initiating shutdown..."),
    }
}
