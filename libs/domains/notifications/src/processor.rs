//! Email processor for queue workers.
//!
//! This module provides the `EmailProcessor` that implements
//! `JobProcessor<EmailJob>`, turning leased jobs into gateway calls and
//! deciding from the per-recipient report whether the job succeeded.

use crate::gateway::{DeliveryReport, MailGateway, SimpleMail, TemplateMail};
use crate::models::{DEFAULT_FROM_EMAIL, EmailJob, EmailJobKind};
use async_trait::async_trait;
use job_queue::{InvalidPayload, Job, JobProcessor, ProcessError, QueueJob};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use strum::{Display, EnumString};
use tracing::{info, warn};

/// When a partially delivered job counts as done.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case", ascii_case_insensitive)]
pub enum DeliveryPolicy {
    /// Every recipient must be delivered
    RequireAll,
    /// At least one recipient must be delivered
    RequireAny,
    /// Done once the gateway call itself succeeds
    BestEffort,
}

impl DeliveryPolicy {
    pub fn accepts(self, report: &DeliveryReport) -> bool {
        match self {
            DeliveryPolicy::RequireAll => report.all_delivered(),
            DeliveryPolicy::RequireAny => report.any_delivered(),
            DeliveryPolicy::BestEffort => true,
        }
    }
}

/// Policy per job kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryPolicies {
    pub simple: DeliveryPolicy,
    pub template: DeliveryPolicy,
}

impl Default for DeliveryPolicies {
    fn default() -> Self {
        Self {
            simple: DeliveryPolicy::RequireAll,
            template: DeliveryPolicy::BestEffort,
        }
    }
}

impl DeliveryPolicies {
    pub fn for_kind(&self, kind: EmailJobKind) -> DeliveryPolicy {
        match kind {
            EmailJobKind::SendEmail => self.simple,
            EmailJobKind::SendTemplateEmail => self.template,
        }
    }
}

/// Delivers email jobs through a [`MailGateway`].
pub struct EmailProcessor<G: MailGateway> {
    gateway: Arc<G>,
    default_from: String,
    policies: DeliveryPolicies,
}

impl<G: MailGateway + 'static> EmailProcessor<G> {
    pub fn new(gateway: G) -> Self {
        Self::with_arc_gateway(Arc::new(gateway))
    }

    pub fn with_arc_gateway(gateway: Arc<G>) -> Self {
        Self {
            gateway,
            default_from: DEFAULT_FROM_EMAIL.to_string(),
            policies: DeliveryPolicies::default(),
        }
    }

    /// Sender for `send-email` jobs that carry no `from`.
    pub fn with_default_from(mut self, from: impl Into<String>) -> Self {
        self.default_from = from.into();
        self
    }

    pub fn with_policies(mut self, policies: DeliveryPolicies) -> Self {
        self.policies = policies;
        self
    }

    pub fn gateway(&self) -> &G {
        &self.gateway
    }

    pub fn policies(&self) -> DeliveryPolicies {
        self.policies
    }

    fn simple_mail(&self, job: &EmailJob) -> Result<SimpleMail, InvalidPayload> {
        let payload = &job.payload;
        let (Some(subject), Some(html)) = (payload.subject(), payload.html()) else {
            return Err(InvalidPayload::new(job.kind(), "subject and html are required"));
        };
        Ok(SimpleMail {
            to: payload.to.clone(),
            from: payload.from().unwrap_or(&self.default_from).to_string(),
            subject: subject.to_string(),
            html: html.to_string(),
        })
    }

    fn template_mail(job: &EmailJob) -> Result<TemplateMail, InvalidPayload> {
        let payload = &job.payload;
        let Some(template_id) = payload.template_id() else {
            return Err(InvalidPayload::new(job.kind(), "templateId is required"));
        };
        Ok(TemplateMail {
            to: payload.to.clone(),
            from: payload.from().map(str::to_string),
            template_id: template_id.to_string(),
            dynamic_data: payload.dynamic_data.clone().unwrap_or_default(),
        })
    }
}

#[async_trait]
impl<G: MailGateway + 'static> JobProcessor<EmailJob> for EmailProcessor<G> {
    async fn process(&self, job: &Job<EmailJob>) -> Result<(), ProcessError> {
        let email = &job.data;
        info!(
            job_id = %job.id,
            kind = %email.kind,
            recipients = email.payload.to.len(),
            attempt = job.attempts_made + 1,
            max_attempts = job.max_attempts,
            "Processing email job"
        );

        email.validate()?;

        let sent = match email.kind {
            EmailJobKind::SendEmail => {
                let mail = self.simple_mail(email)?;
                self.gateway.send_simple(&mail).await
            }
            EmailJobKind::SendTemplateEmail => {
                let mail = Self::template_mail(email)?;
                self.gateway.send_template(&mail).await
            }
        };
        let report = sent.map_err(|e| ProcessError::delivery(e.to_string()))?;

        for failure in report.failures() {
            warn!(
                job_id = %job.id,
                kind = %email.kind,
                to = %failure.address,
                error = failure.error.as_deref().unwrap_or("unknown"),
                "Recipient delivery failed"
            );
        }

        let policy = self.policies.for_kind(email.kind);
        let total = report.results.len();
        let delivered = report.delivered();

        if !policy.accepts(&report) {
            return Err(ProcessError::delivery(format!(
                "{} of {total} recipients failed under {policy} policy",
                total - delivered
            )));
        }

        info!(
            job_id = %job.id,
            kind = %email.kind,
            gateway = self.gateway.name(),
            delivered,
            total,
            "Email job delivered"
        );
        Ok(())
    }

    fn name(&self) -> &'static str {
        "EmailProcessor"
    }

    async fn health_check(&self) -> Result<bool, ProcessError> {
        self.gateway
            .health_check()
            .await
            .map_err(|e| ProcessError::internal(e.to_string()))
    }
}

impl<G: MailGateway> Clone for EmailProcessor<G> {
    fn clone(&self) -> Self {
        Self {
            gateway: Arc::clone(&self.gateway),
            default_from: self.default_from.clone(),
            policies: self.policies,
        }
    }
}
