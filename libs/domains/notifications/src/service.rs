//! Notification service: turns business events into queued email jobs.
//!
//! Every method returns once the job is stored. Delivery happens later in an
//! [`EmailProcessor`](crate::EmailProcessor) worker.

use crate::error::{NotificationError, NotificationResult};
use crate::models::{DEFAULT_FROM_NAME, EmailJob, EmailPayload, TemplateData};
use core_config::{ConfigError, FromEnv, env_optional};
use futures::future::try_join_all;
use job_queue::{EnqueueOptions, JobId, Priority, QueueCore, QueueStats};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::{debug, info, instrument};

/// Provider template ids for the built-in business emails.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TemplateIds {
    pub welcome: Option<String>,
    pub reset_password: Option<String>,
    pub invite: Option<String>,
    pub reminder: Option<String>,
}

impl FromEnv for TemplateIds {
    /// Reads `TEMPLATE_WELCOME`, `TEMPLATE_RESET_PASSWORD`, `TEMPLATE_INVITE`
    /// and `TEMPLATE_REMINDER`. Unset templates make the matching send fail.
    fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            welcome: env_optional("TEMPLATE_WELCOME"),
            reset_password: env_optional("TEMPLATE_RESET_PASSWORD"),
            invite: env_optional("TEMPLATE_INVITE"),
            reminder: env_optional("TEMPLATE_REMINDER"),
        })
    }
}

/// One entry of a bulk welcome send.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WelcomeRecipient {
    pub email: String,
    #[serde(default)]
    pub user_data: TemplateData,
}

/// Fill `defaults` into `data` where the caller did not set them.
fn with_defaults<const N: usize>(mut data: TemplateData, defaults: [(&str, Value); N]) -> TemplateData {
    for (key, value) in defaults {
        data.entry(key.to_string()).or_insert(value);
    }
    data
}

/// Service for queueing email notifications.
#[derive(Clone)]
pub struct NotificationService {
    queue: QueueCore<EmailJob>,
    templates: Arc<TemplateIds>,
}

impl NotificationService {
    pub fn new(queue: QueueCore<EmailJob>, templates: TemplateIds) -> Self {
        Self {
            queue,
            templates: Arc::new(templates),
        }
    }

    pub fn queue(&self) -> &QueueCore<EmailJob> {
        &self.queue
    }

    pub fn templates(&self) -> &TemplateIds {
        &self.templates
    }

    async fn enqueue(&self, job: EmailJob, options: EnqueueOptions) -> NotificationResult<JobId> {
        let id = self.queue.enqueue(job, options).await?;
        Ok(id)
    }

    #[instrument(skip(self, template, email, data), fields(to = %email))]
    async fn enqueue_event(
        &self,
        event: &'static str,
        template: Option<&str>,
        email: &str,
        data: TemplateData,
        priority: Priority,
    ) -> NotificationResult<JobId> {
        let template = template.ok_or(NotificationError::TemplateNotConfigured(event))?;
        let payload = EmailPayload::new([email])
            .with_template(template)
            .with_dynamic_data(data);

        let id = self
            .enqueue(EmailJob::template(payload), EnqueueOptions::new().with_priority(priority))
            .await?;
        debug!(job_id = %id, event, to = email, "Queued notification email");
        Ok(id)
    }

    /// High priority. `firstName` defaults to "User", `lastName` to "" and
    /// `companyName` to "Sahara Mind".
    pub async fn send_welcome_email(&self, email: &str, user_data: TemplateData) -> NotificationResult<JobId> {
        let data = with_defaults(
            user_data,
            [
                ("firstName", json!("User")),
                ("lastName", json!("")),
                ("companyName", json!(DEFAULT_FROM_NAME)),
            ],
        );
        self.enqueue_event("welcome", self.templates.welcome.as_deref(), email, data, Priority::High)
            .await
    }

    /// Critical priority. `expiryTime` defaults to "24 hours".
    pub async fn send_password_reset_email(
        &self,
        email: &str,
        reset_data: TemplateData,
    ) -> NotificationResult<JobId> {
        let data = with_defaults(reset_data, [("expiryTime", json!("24 hours"))]);
        self.enqueue_event(
            "password reset",
            self.templates.reset_password.as_deref(),
            email,
            data,
            Priority::Critical,
        )
        .await
    }

    /// High priority. Expects `inviterName`, `organizationName` and `inviteLink`.
    pub async fn send_invite_email(&self, email: &str, invite_data: TemplateData) -> NotificationResult<JobId> {
        self.enqueue_event(
            "invite",
            self.templates.invite.as_deref(),
            email,
            invite_data,
            Priority::High,
        )
        .await
    }

    pub async fn send_reminder_email(
        &self,
        email: &str,
        reminder_data: TemplateData,
    ) -> NotificationResult<JobId> {
        self.enqueue_event(
            "reminder",
            self.templates.reminder.as_deref(),
            email,
            reminder_data,
            Priority::Normal,
        )
        .await
    }

    /// Queue an ad hoc `send-email` job.
    pub async fn send_custom_email(
        &self,
        payload: EmailPayload,
        options: EnqueueOptions,
    ) -> NotificationResult<JobId> {
        self.enqueue(EmailJob::simple(payload), options).await
    }

    /// Queue a `send-template-email` job for any template.
    pub async fn send_custom_template_email(
        &self,
        payload: EmailPayload,
        options: EnqueueOptions,
    ) -> NotificationResult<JobId> {
        self.enqueue(EmailJob::template(payload), options).await
    }

    /// One welcome job per user. Waits for every job to be queued, not delivered.
    #[instrument(skip(self, users), fields(count = users.len()))]
    pub async fn send_bulk_welcome_emails(
        &self,
        users: Vec<WelcomeRecipient>,
    ) -> NotificationResult<Vec<JobId>> {
        let count = users.len();
        let ids = try_join_all(
            users
                .into_iter()
                .map(|user| async move { self.send_welcome_email(&user.email, user.user_data).await }),
        )
        .await?;
        info!(count, "Queued bulk welcome emails");
        Ok(ids)
    }

    /// A single normal-priority template job addressed to every recipient.
    #[instrument(skip(self, emails, dynamic_data), fields(recipients = emails.len()))]
    pub async fn send_bulk_notification(
        &self,
        emails: Vec<String>,
        template_id: &str,
        dynamic_data: TemplateData,
    ) -> NotificationResult<JobId> {
        let payload = EmailPayload::new(emails)
            .with_template(template_id)
            .with_dynamic_data(dynamic_data);
        self.enqueue(EmailJob::template(payload), EnqueueOptions::new())
            .await
    }

    pub async fn queue_stats(&self) -> NotificationResult<QueueStats> {
        Ok(self.queue.stats().await?)
    }

    /// Requeue every failed job with a fresh attempt budget.
    pub async fn retry_failed_jobs(&self) -> NotificationResult<usize> {
        Ok(self.queue.retry_failed().await?)
    }

    /// Drop completed and failed jobs.
    pub async fn clear_queue(&self) -> NotificationResult<usize> {
        Ok(self.queue.purge().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::EmailJobKind;
    use crate::queues::EmailQueue;

    fn templates() -> TemplateIds {
        TemplateIds {
            welcome: Some("d-welcome".into()),
            reset_password: Some("d-reset".into()),
            invite: Some("d-invite".into()),
            reminder: Some("d-reminder".into()),
        }
    }

    fn service() -> NotificationService {
        NotificationService::new(QueueCore::in_memory(EmailQueue::config()), templates())
    }

    fn data(value: Value) -> TemplateData {
        match value {
            Value::Object(map) => map,
            other => panic!("expected an object, got {other}"),
        }
    }

    #[test]
    fn test_welcome_recipient_uses_camel_case_both_ways() {
        let recipient: WelcomeRecipient =
            serde_json::from_value(json!({ "email": "ann@clinic.test", "userData": { "firstName": "Ann" } }))
                .unwrap();
        assert_eq!(recipient.user_data["firstName"], "Ann");

        let value = serde_json::to_value(&recipient).unwrap();
        assert_eq!(value["email"], "ann@clinic.test");
        assert_eq!(value["userData"]["firstName"], "Ann");
    }

    #[tokio::test]
    async fn test_welcome_email_fills_defaults_and_is_high_priority() {
        let service = service();

        service
            .send_welcome_email("ann@clinic.test", data(json!({ "lastName": "Lee" })))
            .await
            .unwrap();

        let job = service.queue().dequeue_next().await.unwrap().unwrap();
        assert_eq!(job.priority, Priority::High);
        assert_eq!(job.data.kind, EmailJobKind::SendTemplateEmail);
        assert_eq!(job.data.payload.template_id(), Some("d-welcome"));
        let dynamic = job.data.payload.dynamic_data.unwrap();
        assert_eq!(dynamic["firstName"], "User");
        assert_eq!(dynamic["lastName"], "Lee");
        assert_eq!(dynamic["companyName"], "Sahara Mind");
    }

    #[tokio::test]
    async fn test_caller_values_override_defaults_even_when_empty() {
        let service = service();

        service
            .send_welcome_email("ann@clinic.test", data(json!({ "firstName": "" })))
            .await
            .unwrap();

        let job = service.queue().dequeue_next().await.unwrap().unwrap();
        assert_eq!(job.data.payload.dynamic_data.unwrap()["firstName"], "");
    }

    #[tokio::test]
    async fn test_password_reset_is_critical_with_expiry_default() {
        let service = service();

        service
            .send_password_reset_email(
                "ann@clinic.test",
                data(json!({ "resetLink": "https://app.test/reset/abc" })),
            )
            .await
            .unwrap();

        let job = service.queue().dequeue_next().await.unwrap().unwrap();
        assert_eq!(job.priority, Priority::Critical);
        let dynamic = job.data.payload.dynamic_data.unwrap();
        assert_eq!(dynamic["expiryTime"], "24 hours");
        assert_eq!(dynamic["resetLink"], "https://app.test/reset/abc");
    }

    #[tokio::test]
    async fn test_reminder_is_normal_and_invite_is_high() {
        let service = service();

        service
            .send_reminder_email("a@clinic.test", TemplateData::new())
            .await
            .unwrap();
        service
            .send_invite_email("b@clinic.test", data(json!({ "inviterName": "Dr. Ray" })))
            .await
            .unwrap();

        let first = service.queue().dequeue_next().await.unwrap().unwrap();
        let second = service.queue().dequeue_next().await.unwrap().unwrap();
        assert_eq!(first.priority, Priority::High);
        assert_eq!(first.data.payload.to, ["b@clinic.test"]);
        assert_eq!(second.priority, Priority::Normal);
    }

    #[tokio::test]
    async fn test_unconfigured_template_is_reported() {
        let service = NotificationService::new(
            QueueCore::in_memory(EmailQueue::config()),
            TemplateIds::default(),
        );

        let err = service
            .send_invite_email("a@clinic.test", TemplateData::new())
            .await
            .unwrap_err();
        assert!(matches!(err, NotificationError::TemplateNotConfigured("invite")));
        assert_eq!(service.queue_stats().await.unwrap().total, 0);
    }

    #[tokio::test]
    async fn test_bulk_welcome_queues_one_job_per_user() {
        let service = service();
        let users = vec![
            WelcomeRecipient {
                email: "a@clinic.test".into(),
                user_data: data(json!({ "firstName": "Ann" })),
            },
            WelcomeRecipient {
                email: "b@clinic.test".into(),
                user_data: TemplateData::new(),
            },
        ];

        let ids = service.send_bulk_welcome_emails(users).await.unwrap();

        assert_eq!(ids.len(), 2);
        assert_eq!(service.queue_stats().await.unwrap().waiting, 2);
    }

    #[tokio::test]
    async fn test_bulk_welcome_fails_on_invalid_address() {
        let service = service();
        let users = vec![WelcomeRecipient {
            email: "not-an-email".into(),
            user_data: TemplateData::new(),
        }];

        let err = service.send_bulk_welcome_emails(users).await.unwrap_err();
        assert!(err.is_invalid_payload());
    }

    #[tokio::test]
    async fn test_bulk_notification_is_a_single_job() {
        let service = service();

        service
            .send_bulk_notification(
                vec!["a@clinic.test".into(), "b@clinic.test".into()],
                "d-news",
                TemplateData::new(),
            )
            .await
            .unwrap();

        let job = service.queue().dequeue_next().await.unwrap().unwrap();
        assert_eq!(job.priority, Priority::Normal);
        assert_eq!(job.data.payload.to.len(), 2);
        assert!(service.queue().dequeue_next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_custom_email_is_validated_at_enqueue() {
        let service = service();

        let err = service
            .send_custom_email(EmailPayload::new(["a@clinic.test"]), EnqueueOptions::new())
            .await
            .unwrap_err();
        assert!(err.is_invalid_payload());

        let id = service
            .send_custom_email(
                EmailPayload::new(["a@clinic.test"]).with_subject("Hi").with_html("<p>Hi</p>"),
                EnqueueOptions::new().with_priority(Priority::Low),
            )
            .await
            .unwrap();
        let job = service.queue().get(id).await.unwrap().unwrap();
        assert_eq!(job.priority, Priority::Low);
    }

    #[tokio::test]
    async fn test_clear_and_stats_delegate_to_queue() {
        let service = service();
        service
            .send_custom_template_email(
                EmailPayload::new(["a@clinic.test"]).with_template("t1"),
                EnqueueOptions::new(),
            )
            .await
            .unwrap();

        let job = service.queue().dequeue_next().await.unwrap().unwrap();
        service.queue().ack(job.lease()).await.unwrap();

        assert_eq!(service.queue_stats().await.unwrap().completed, 1);
        assert_eq!(service.clear_queue().await.unwrap(), 1);
        assert_eq!(service.retry_failed_jobs().await.unwrap(), 0);
        assert_eq!(service.queue_stats().await.unwrap().total, 0);
    }

    #[test]
    fn test_template_ids_from_env() {
        temp_env::with_vars(
            [
                ("TEMPLATE_WELCOME", Some("d-w")),
                ("TEMPLATE_RESET_PASSWORD", Some("")),
                ("TEMPLATE_INVITE", None),
                ("TEMPLATE_REMINDER", Some("d-r")),
            ],
            || {
                let ids = TemplateIds::from_env().unwrap();
                assert_eq!(ids.welcome.as_deref(), Some("d-w"));
                assert_eq!(ids.reset_password, None);
                assert_eq!(ids.invite, None);
                assert_eq!(ids.reminder.as_deref(), Some("d-r"));
            },
        );
    }
}
