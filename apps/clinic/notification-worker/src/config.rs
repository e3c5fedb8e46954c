//! Worker configuration.
//! Composes the shared config components from `core_config` with the queue,
//! worker and mail settings of this service.

use core_config::redis::RedisConfig;
use core_config::server::ServerConfig;
use core_config::{ConfigError, FromEnv, env_flag, env_or_default, env_parse};
use domain_notifications::{
    DeliveryPolicies, DeliveryPolicy, EmailQueue, SendGridConfig, TemplateIds,
};
use job_queue::{Backoff, QueueConfig, QueueDef, WorkerConfig};
use std::time::Duration;

pub use core_config::Environment;

/// Where jobs are stored.
#[derive(Clone, Debug)]
pub enum QueueBackend {
    /// Process-local; jobs are lost on restart
    Memory,
    Redis(RedisConfig),
}

impl QueueBackend {
    pub fn name(&self) -> &'static str {
        match self {
            QueueBackend::Memory => "memory",
            QueueBackend::Redis(_) => "redis",
        }
    }
}

impl FromEnv for QueueBackend {
    /// `QUEUE_BACKEND` is `memory` (default) or `redis`.
    fn from_env() -> Result<Self, ConfigError> {
        match env_or_default("QUEUE_BACKEND", "memory").trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(QueueBackend::Memory),
            "redis" => Ok(QueueBackend::Redis(RedisConfig::from_env()?)),
            other => Err(ConfigError::Invalid {
                key: "QUEUE_BACKEND".to_string(),
                details: format!("expected 'memory' or 'redis', got '{other}'"),
            }),
        }
    }
}

/// Application configuration
#[derive(Clone, Debug)]
pub struct Config {
    pub environment: Environment,
    pub server: ServerConfig,
    pub backend: QueueBackend,
    pub queue: QueueConfig,
    pub worker: WorkerConfig,
    /// Worker slots in this process; zero runs the HTTP API only
    pub worker_concurrency: usize,
    pub sendgrid: SendGridConfig,
    pub templates: TemplateIds,
    pub policies: DeliveryPolicies,
}

fn queue_from_env() -> Result<QueueConfig, ConfigError> {
    let defaults = QueueConfig::from_queue_def::<EmailQueue>();
    let lease_secs = env_parse("QUEUE_LEASE_SECS", EmailQueue::LEASE_DURATION.as_secs())?;
    if lease_secs == 0 {
        return Err(ConfigError::Invalid {
            key: "QUEUE_LEASE_SECS".to_string(),
            details: "lease must be at least one second".to_string(),
        });
    }

    Ok(QueueConfig::new(env_or_default("QUEUE_NAME", EmailQueue::NAME))
        .with_default_attempts(env_parse("QUEUE_ATTEMPTS", defaults.default_attempts)?)
        .with_backoff(Backoff::Exponential {
            base_ms: env_parse("QUEUE_BACKOFF_MS", EmailQueue::BACKOFF_BASE_MS)?,
        })
        .with_retention(
            env_parse("QUEUE_KEEP_COMPLETED", defaults.retention.completed)?,
            env_parse("QUEUE_KEEP_FAILED", defaults.retention.failed)?,
        )
        .with_lease_duration(Duration::from_secs(lease_secs))
        .with_validate_on_enqueue(env_flag("QUEUE_VALIDATE_ON_ENQUEUE", true)?))
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let worker_concurrency = env_parse("WORKER_CONCURRENCY", 1usize)?;
        let worker = WorkerConfig::new()
            .with_concurrency(worker_concurrency)
            .with_poll_interval(Duration::from_millis(env_parse(
                "WORKER_POLL_INTERVAL_MS",
                500u64,
            )?));

        let policies = DeliveryPolicies {
            simple: env_parse("DELIVERY_POLICY_SIMPLE", DeliveryPolicy::RequireAll)?,
            template: env_parse("DELIVERY_POLICY_TEMPLATE", DeliveryPolicy::BestEffort)?,
        };

        Ok(Self {
            environment: Environment::from_env(),
            server: ServerConfig::from_env()?,
            backend: QueueBackend::from_env()?,
            queue: queue_from_env()?,
            worker,
            worker_concurrency,
            sendgrid: SendGridConfig::from_env()?,
            templates: TemplateIds::from_env()?,
            policies,
        })
    }
}
