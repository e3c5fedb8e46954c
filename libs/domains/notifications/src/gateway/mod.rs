//! Mail gateway implementations.
//!
//! A gateway delivers one mail to each listed recipient independently and
//! reports the outcome per recipient. Whether a partial delivery is good
//! enough is decided by the caller, never inside the gateway.

mod recording;
mod sendgrid;

pub use recording::{RecordingGateway, SentMail};
pub use sendgrid::{SendGridConfig, SendGridGateway};

use crate::models::TemplateData;
use async_trait::async_trait;
use thiserror::Error;

pub type GatewayResult<T> = Result<T, GatewayError>;

/// Gateway-level failures. Per-recipient failures are reported in a
/// [`DeliveryReport`] instead.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// No API key and dry-run mode is off.
    #[error("{0} gateway is disabled: no API key configured")]
    Disabled(&'static str),

    #[error("Invalid gateway configuration: {0}")]
    Config(String),

    #[error("Gateway request failed: {0}")]
    Request(String),
}

/// Ad hoc mail with explicit subject and body.
#[derive(Debug, Clone, PartialEq)]
pub struct SimpleMail {
    pub to: Vec<String>,
    pub from: String,
    pub subject: String,
    pub html: String,
}

/// Mail rendered by the provider from a stored template.
#[derive(Debug, Clone, PartialEq)]
pub struct TemplateMail {
    pub to: Vec<String>,
    /// `None` uses the gateway's configured sender
    pub from: Option<String>,
    pub template_id: String,
    pub dynamic_data: TemplateData,
}

/// Outcome of delivering to a single address.
#[derive(Debug, Clone, PartialEq)]
pub struct RecipientResult {
    pub address: String,
    pub ok: bool,
    pub error: Option<String>,
    /// Provider tracking id, when one was returned
    pub message_id: Option<String>,
}

impl RecipientResult {
    pub fn delivered(address: impl Into<String>, message_id: Option<String>) -> Self {
        Self {
            address: address.into(),
            ok: true,
            error: None,
            message_id,
        }
    }

    pub fn rejected(address: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            ok: false,
            error: Some(error.into()),
            message_id: None,
        }
    }
}

/// Per-recipient results, in recipient order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeliveryReport {
    pub results: Vec<RecipientResult>,
}

impl DeliveryReport {
    pub fn new(results: Vec<RecipientResult>) -> Self {
        Self { results }
    }

    pub fn delivered(&self) -> usize {
        self.results.iter().filter(|r| r.ok).count()
    }

    pub fn failures(&self) -> impl Iterator<Item = &RecipientResult> {
        self.results.iter().filter(|r| !r.ok)
    }

    pub fn all_delivered(&self) -> bool {
        self.results.iter().all(|r| r.ok)
    }

    pub fn any_delivered(&self) -> bool {
        self.results.iter().any(|r| r.ok)
    }
}

/// Transactional email provider.
///
/// Implementations include SendGrid and an in-process recorder for tests.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MailGateway: Send + Sync {
    /// Send `mail` to every recipient, one delivery per address.
    async fn send_simple(&self, mail: &SimpleMail) -> GatewayResult<DeliveryReport>;

    /// Send a provider template to every recipient, one delivery per address.
    async fn send_template(&self, mail: &TemplateMail) -> GatewayResult<DeliveryReport>;

    /// Get the gateway name for logging.
    fn name(&self) -> &'static str;

    /// Check if the gateway is configured and able to send.
    async fn health_check(&self) -> GatewayResult<bool>;
}
