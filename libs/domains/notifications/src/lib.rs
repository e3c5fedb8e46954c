//! Notifications Domain
//!
//! Asynchronous email delivery for the clinic backend.
//!
//! # Features
//!
//! - Welcome, password reset, invite and reminder emails from provider templates
//! - Ad hoc and templated emails for arbitrary recipient lists
//! - Bulk sends
//! - Per-recipient delivery reports with a configurable success policy
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │   API Handler   │  ← Accepts notification requests
//! └────────┬────────┘
//!          │
//! ┌────────▼────────┐
//! │ NotificationSvc │  ← Builds payloads, picks priorities
//! └────────┬────────┘
//!          │
//! ┌────────▼────────┐
//! │   QueueCore     │  ← email-notifications queue (memory or Redis)
//! └────────┬────────┘
//!          │
//! ┌────────▼────────┐
//! │ EmailProcessor  │  ← Validates, delivers, applies DeliveryPolicy
//! └────────┬────────┘
//!          │
//! ┌────────▼────────┐
//! │  MailGateway    │  ← SendGrid
//! └─────────────────┘
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! use domain_notifications::{EmailQueue, NotificationService, TemplateIds};
//! use job_queue::QueueCore;
//!
//! let queue = QueueCore::in_memory(EmailQueue::config());
//! let service = NotificationService::new(queue, TemplateIds::from_env()?);
//!
//! service.send_welcome_email("ann@clinic.test", user_data).await?;
//! ```

pub mod error;
pub mod gateway;
pub mod models;
pub mod processor;
pub mod queues;
pub mod service;

// Re-export commonly used types
pub use error::{NotificationError, NotificationResult};
pub use gateway::{
    DeliveryReport, GatewayError, MailGateway, RecipientResult, RecordingGateway, SendGridConfig,
    SendGridGateway,
};
pub use models::{EmailJob, EmailJobKind, EmailPayload, TemplateData};
pub use processor::{DeliveryPolicies, DeliveryPolicy, EmailProcessor};
pub use queues::EmailQueue;
pub use service::{NotificationService, TemplateIds, WelcomeRecipient};
