//! SendGrid v3 mail gateway.

use super::{
    DeliveryReport, GatewayError, GatewayResult, MailGateway, RecipientResult, SimpleMail,
    TemplateMail,
};
use crate::models::{DEFAULT_FROM_EMAIL, DEFAULT_FROM_NAME, TemplateData};
use async_trait::async_trait;
use core_config::{ConfigError, FromEnv, env_flag, env_optional, env_or_default, env_parse};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, error, info, warn};

const DEFAULT_API_URL: &str = "https://api.sendgrid.com/v3";
const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// SendGrid API configuration.
#[derive(Debug, Clone)]
pub struct SendGridConfig {
    /// `None` disables the gateway unless `dry_run` is set.
    pub api_key: Option<String>,
    /// Sender for template mails without an explicit `from`.
    pub from_email: String,
    pub from_name: String,
    /// SendGrid API base URL (defaults to production).
    pub api_url: String,
    /// Upper bound for each request to the provider.
    pub timeout: Duration,
    /// Log and report success without calling the provider.
    pub dry_run: bool,
}

impl Default for SendGridConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            from_email: DEFAULT_FROM_EMAIL.to_string(),
            from_name: DEFAULT_FROM_NAME.to_string(),
            api_url: DEFAULT_API_URL.to_string(),
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            dry_run: false,
        }
    }
}

impl SendGridConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: Some(api_key.into()),
            ..Self::default()
        }
    }

    /// Configuration that never reaches the provider.
    pub fn dry_run() -> Self {
        Self {
            dry_run: true,
            ..Self::default()
        }
    }

    pub fn with_sender(mut self, email: impl Into<String>, name: impl Into<String>) -> Self {
        self.from_email = email.into();
        self.from_name = name.into();
        self
    }

    pub fn with_api_url(mut self, url: impl Into<String>) -> Self {
        self.api_url = url.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

impl FromEnv for SendGridConfig {
    /// Reads `SENDGRID_API_KEY`, `SENDGRID_FROM_EMAIL`, `SENDGRID_FROM_NAME`,
    /// `SENDGRID_API_URL`, `SENDGRID_TIMEOUT_SECS` and `MAIL_DRY_RUN`.
    fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            api_key: env_optional("SENDGRID_API_KEY"),
            from_email: env_or_default("SENDGRID_FROM_EMAIL", DEFAULT_FROM_EMAIL),
            from_name: env_or_default("SENDGRID_FROM_NAME", DEFAULT_FROM_NAME),
            api_url: env_or_default("SENDGRID_API_URL", DEFAULT_API_URL),
            timeout: Duration::from_secs(env_parse("SENDGRID_TIMEOUT_SECS", DEFAULT_TIMEOUT_SECS)?),
            dry_run: env_flag("MAIL_DRY_RUN", false)?,
        })
    }
}

// SendGrid API request/response structures

#[derive(Debug, Serialize)]
struct SendGridRequest<'a> {
    personalizations: Vec<Personalization<'a>>,
    from: EmailAddress<'a>,
    #[serde(skip_serializing_if = "Option::is_none")]
    subject: Option<&'a str>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    content: Vec<Content<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    template_id: Option<&'a str>,
}

#[derive(Debug, Serialize)]
struct Personalization<'a> {
    to: Vec<EmailAddress<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    dynamic_template_data: Option<&'a TemplateData>,
}

#[derive(Debug, Serialize)]
struct EmailAddress<'a> {
    email: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<&'a str>,
}

#[derive(Debug, Serialize)]
struct Content<'a> {
    #[serde(rename = "type")]
    content_type: &'static str,
    value: &'a str,
}

#[derive(Debug, Deserialize)]
struct SendGridError {
    errors: Vec<SendGridErrorDetail>,
}

#[derive(Debug, Deserialize)]
struct SendGridErrorDetail {
    message: String,
    field: Option<String>,
}

impl SendGridErrorDetail {
    fn describe(self) -> String {
        match self.field {
            Some(field) => format!("{} ({field})", self.message),
            None => self.message,
        }
    }
}

fn simple_request<'a>(mail: &'a SimpleMail, recipient: &'a str, from_name: &'a str) -> SendGridRequest<'a> {
    SendGridRequest {
        personalizations: vec![Personalization {
            to: vec![EmailAddress {
                email: recipient,
                name: None,
            }],
            dynamic_template_data: None,
        }],
        from: EmailAddress {
            email: &mail.from,
            name: Some(from_name),
        },
        subject: Some(&mail.subject),
        content: vec![Content {
            content_type: "text/html",
            value: &mail.html,
        }],
        template_id: None,
    }
}

fn template_request<'a>(
    mail: &'a TemplateMail,
    recipient: &'a str,
    config: &'a SendGridConfig,
) -> SendGridRequest<'a> {
    SendGridRequest {
        personalizations: vec![Personalization {
            to: vec![EmailAddress {
                email: recipient,
                name: None,
            }],
            dynamic_template_data: Some(&mail.dynamic_data),
        }],
        from: EmailAddress {
            email: mail.from.as_deref().unwrap_or(&config.from_email),
            name: Some(&config.from_name),
        },
        subject: None,
        content: Vec::new(),
        template_id: Some(&mail.template_id),
    }
}

/// SendGrid gateway. Sends one `mail/send` request per recipient so a
/// rejected address never hides the others.
pub struct SendGridGateway {
    config: SendGridConfig,
    client: Client,
}

impl SendGridGateway {
    pub fn new(config: SendGridConfig) -> GatewayResult<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| GatewayError::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { config, client })
    }

    pub fn config(&self) -> &SendGridConfig {
        &self.config
    }

    /// Key to send with, or `None` in dry-run mode.
    fn api_key(&self) -> GatewayResult<Option<&str>> {
        if self.config.dry_run {
            return Ok(None);
        }
        match self.config.api_key.as_deref() {
            Some(key) => Ok(Some(key)),
            None => Err(GatewayError::Disabled("SendGrid")),
        }
    }

    async fn deliver<'a, F>(&'a self, recipients: &'a [String], build: F) -> GatewayResult<DeliveryReport>
    where
        F: Fn(&'a str) -> SendGridRequest<'a>,
    {
        let Some(api_key) = self.api_key()? else {
            warn!(
                recipients = recipients.len(),
                "Mail dry run enabled, skipping delivery via SendGrid"
            );
            return Ok(DeliveryReport::new(
                recipients
                    .iter()
                    .map(|address| RecipientResult::delivered(address.as_str(), None))
                    .collect(),
            ));
        };

        let mut results = Vec::with_capacity(recipients.len());
        for recipient in recipients {
            let request = build(recipient.as_str());
            let result = match self.post(api_key, &request).await {
                Ok(message_id) => RecipientResult::delivered(recipient.as_str(), message_id),
                Err(reason) => RecipientResult::rejected(recipient.as_str(), reason),
            };
            results.push(result);
        }
        Ok(DeliveryReport::new(results))
    }

    /// Returns the provider message id, or a description of the failure.
    async fn post(&self, api_key: &str, request: &SendGridRequest<'_>) -> Result<Option<String>, String> {
        let to = request
            .personalizations
            .first()
            .and_then(|p| p.to.first())
            .map(|a| a.email)
            .unwrap_or_default();

        debug!(to, template_id = ?request.template_id, "Sending email via SendGrid");

        let response = self
            .client
            .post(format!("{}/mail/send", self.config.api_url))
            .bearer_auth(api_key)
            .json(request)
            .send()
            .await
            .map_err(|e| {
                error!(to, error = %e, "SendGrid request failed");
                e.to_string()
            })?;

        let status = response.status();
        let message_id = response
            .headers()
            .get("x-message-id")
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());

        if status.is_success() {
            info!(to, message_id = ?message_id, "Email sent successfully via SendGrid");
            return Ok(message_id);
        }

        let body = response.text().await.unwrap_or_default();
        let detail = match serde_json::from_str::<SendGridError>(&body) {
            Ok(parsed) => parsed
                .errors
                .into_iter()
                .map(SendGridErrorDetail::describe)
                .collect::<Vec<_>>()
                .join(", "),
            Err(_) => body,
        };
        error!(to, status = %status, error = %detail, "SendGrid rejected email");
        Err(format!("SendGrid error ({status}): {detail}"))
    }
}

#[async_trait]
impl MailGateway for SendGridGateway {
    async fn send_simple(&self, mail: &SimpleMail) -> GatewayResult<DeliveryReport> {
        self.deliver(&mail.to, |recipient| {
            simple_request(mail, recipient, &self.config.from_name)
        })
        .await
    }

    async fn send_template(&self, mail: &TemplateMail) -> GatewayResult<DeliveryReport> {
        self.deliver(&mail.to, |recipient| template_request(mail, recipient, &self.config))
            .await
    }

    fn name(&self) -> &'static str {
        "SendGrid"
    }

    async fn health_check(&self) -> GatewayResult<bool> {
        // No dedicated health endpoint; check the key format instead.
        match self.api_key()? {
            None => Ok(true),
            Some(key) if key.starts_with("SG.") => Ok(true),
            Some(_) => Err(GatewayError::Config(
                "SendGrid API key should start with 'SG.'".to_string(),
            )),
        }
    }
}
