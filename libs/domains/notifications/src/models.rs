//! Email job payloads carried through the notification queue.

use job_queue::{InvalidPayload, QueueJob};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use strum::{AsRefStr, Display, EnumString};
use validator::ValidateEmail;

/// Sender used when neither the job nor the gateway config names one.
pub const DEFAULT_FROM_EMAIL: &str = "support@saharamind.com";

pub const DEFAULT_FROM_NAME: &str = "Sahara Mind";

/// Template variables, handed to the mail provider untouched.
pub type TemplateData = Map<String, Value>;

/// What a job asks the worker to do.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum EmailJobKind {
    /// Ad hoc email with an explicit subject and HTML body
    SendEmail,
    /// Provider-side template rendered with `dynamicData`
    SendTemplateEmail,
}

/// Recipients and content of one email job.
///
/// Serialized in camelCase so stored jobs and HTTP bodies share one shape.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmailPayload {
    pub to: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub html: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dynamic_data: Option<TemplateData>,
}

fn non_blank(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.trim().is_empty())
}

impl EmailPayload {
    pub fn new<I, S>(to: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            to: to.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    pub fn with_html(mut self, html: impl Into<String>) -> Self {
        self.html = Some(html.into());
        self
    }

    pub fn with_template(mut self, template_id: impl Into<String>) -> Self {
        self.template_id = Some(template_id.into());
        self
    }

    pub fn with_from(mut self, from: impl Into<String>) -> Self {
        self.from = Some(from.into());
        self
    }

    pub fn with_dynamic_data(mut self, data: TemplateData) -> Self {
        self.dynamic_data = Some(data);
        self
    }

    // Blank strings count as missing.

    pub fn subject(&self) -> Option<&str> {
        non_blank(&self.subject)
    }

    pub fn html(&self) -> Option<&str> {
        non_blank(&self.html)
    }

    pub fn template_id(&self) -> Option<&str> {
        non_blank(&self.template_id)
    }

    pub fn from(&self) -> Option<&str> {
        non_blank(&self.from)
    }
}

/// Unit of work on the email queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmailJob {
    pub kind: EmailJobKind,
    pub payload: EmailPayload,
}

impl EmailJob {
    pub fn new(kind: EmailJobKind, payload: EmailPayload) -> Self {
        Self { kind, payload }
    }

    pub fn simple(payload: EmailPayload) -> Self {
        Self::new(EmailJobKind::SendEmail, payload)
    }

    pub fn template(payload: EmailPayload) -> Self {
        Self::new(EmailJobKind::SendTemplateEmail, payload)
    }

    fn invalid(&self, reason: impl Into<String>) -> InvalidPayload {
        InvalidPayload::new(self.kind.as_ref(), reason)
    }
}

impl QueueJob for EmailJob {
    fn kind(&self) -> &str {
        self.kind.as_ref()
    }

    fn validate(&self) -> Result<(), InvalidPayload> {
        let payload = &self.payload;

        if payload.to.is_empty() {
            return Err(self.invalid("at least one recipient is required"));
        }
        if let Some(bad) = payload.to.iter().find(|address| !address.validate_email()) {
            return Err(self.invalid(format!("'{bad}' is not a valid email address")));
        }
        if let Some(from) = payload.from() {
            if !from.validate_email() {
                return Err(self.invalid(format!("sender '{from}' is not a valid email address")));
            }
        }

        match self.kind {
            EmailJobKind::SendEmail if payload.subject().is_none() || payload.html().is_none() => {
                Err(self.invalid("subject and html are required"))
            }
            EmailJobKind::SendTemplateEmail if payload.template_id().is_none() => {
                Err(self.invalid("templateId is required"))
            }
            _ => Ok(()),
        }
    }
}
