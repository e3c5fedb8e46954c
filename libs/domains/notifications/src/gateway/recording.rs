//! In-process gateway that records deliveries instead of sending them.
//!
//! Used by tests to observe what a worker delivered.

use super::{
    DeliveryReport, GatewayError, GatewayResult, MailGateway, RecipientResult, SimpleMail,
    TemplateMail,
};
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tracing::debug;

/// One recorded delivery to a single recipient.
#[derive(Debug, Clone, PartialEq)]
pub enum SentMail {
    Simple {
        to: String,
        from: String,
        subject: String,
    },
    Template {
        to: String,
        from: Option<String>,
        template_id: String,
    },
}

impl SentMail {
    pub fn to(&self) -> &str {
        match self {
            SentMail::Simple { to, .. } | SentMail::Template { to, .. } => to,
        }
    }
}

#[derive(Debug, Default)]
struct Recorder {
    sent: Vec<SentMail>,
    rejected: HashSet<String>,
    fail_next_calls: usize,
    calls: usize,
}

/// Records every delivery. Clones share the same log.
#[derive(Debug, Clone, Default)]
pub struct RecordingGateway {
    inner: Arc<Mutex<Recorder>>,
}

impl RecordingGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject deliveries to `address` until further notice.
    pub fn reject(&self, address: impl Into<String>) -> &Self {
        self.with(|r| {
            r.rejected.insert(address.into());
        });
        self
    }

    /// Fail the next `calls` gateway calls outright.
    pub fn fail_next(&self, calls: usize) -> &Self {
        self.with(|r| r.fail_next_calls = calls);
        self
    }

    pub fn sent(&self) -> Vec<SentMail> {
        self.with(|r| r.sent.clone())
    }

    pub fn was_sent_to(&self, address: &str) -> bool {
        self.with(|r| r.sent.iter().any(|m| m.to() == address))
    }

    /// Gateway calls seen so far, failed ones included.
    pub fn calls(&self) -> usize {
        self.with(|r| r.calls)
    }

    fn with<T>(&self, f: impl FnOnce(&mut Recorder) -> T) -> T {
        // A poisoned log is still a usable log.
        let mut guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut guard)
    }

    fn record<F>(&self, recipients: &[String], make: F) -> GatewayResult<DeliveryReport>
    where
        F: Fn(&str) -> SentMail,
    {
        self.with(|r| {
            r.calls += 1;
            if r.fail_next_calls > 0 {
                r.fail_next_calls -= 1;
                return Err(GatewayError::Request("simulated gateway outage".to_string()));
            }

            let results = recipients
                .iter()
                .map(|address| {
                    if r.rejected.contains(address) {
                        return RecipientResult::rejected(address.as_str(), "recipient rejected");
                    }
                    r.sent.push(make(address.as_str()));
                    let message_id = format!("rec-{}", r.sent.len());
                    RecipientResult::delivered(address.as_str(), Some(message_id))
                })
                .collect();
            Ok(DeliveryReport::new(results))
        })
    }
}

#[async_trait]
impl MailGateway for RecordingGateway {
    async fn send_simple(&self, mail: &SimpleMail) -> GatewayResult<DeliveryReport> {
        debug!(recipients = mail.to.len(), subject = %mail.subject, "Recording simple email");
        self.record(&mail.to, |to| SentMail::Simple {
            to: to.to_string(),
            from: mail.from.clone(),
            subject: mail.subject.clone(),
        })
    }

    async fn send_template(&self, mail: &TemplateMail) -> GatewayResult<DeliveryReport> {
        debug!(recipients = mail.to.len(), template_id = %mail.template_id, "Recording template email");
        self.record(&mail.to, |to| SentMail::Template {
            to: to.to_string(),
            from: mail.from.clone(),
            template_id: mail.template_id.clone(),
        })
    }

    fn name(&self) -> &'static str {
        "Recording"
    }

    async fn health_check(&self) -> GatewayResult<bool> {
        Ok(true)
    }
}
