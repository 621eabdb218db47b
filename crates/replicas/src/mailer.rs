//! Mail capability used by the notification consumer.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MailError {
    #[error("unknown template: {0}")]
    UnknownTemplate(String),

    #[error("mail transport failed: {0}")]
    Transport(String),
}

/// Values substituted into a template's `{{key}}` placeholders.
pub type TemplateModel = BTreeMap<&'static str, String>;

/// Built-in templates, keyed by name.
mod templates {
    pub const USER_REGISTERED: &str = "\
Hello {{username}}!

Welcome to {{clubName}}. Your current rank: {{karateRank}}.
Open your dashboard: {{dashboardUrl}}

Manage notifications: {{preferencesUrl}}";

    pub const ENROLLMENT: &str = "\
Hello {{username}},

you are enrolled in \"{{description}}\".
Starts: {{startTime}}
Ends: {{endTime}}

Manage notifications: {{preferencesUrl}}";

    pub const PAYMENT_RECEIVED: &str = "\
Thank you!

We received {{amount}} {{currency}} for: {{months}}.
Open your dashboard: {{dashboardUrl}}";

    pub const PAYMENT_DEBT_REMINDER: &str = "\
Hello,

the membership fee ({{monthlyFee}} per month) is still open for: {{months}}.
Outstanding total: {{total}}.
Open your dashboard: {{dashboardUrl}}";

    pub fn lookup(key: &str) -> Option<&'static str> {
        match key {
            "user-registered" => Some(USER_REGISTERED),
            "enrollment" => Some(ENROLLMENT),
            "payment-received" => Some(PAYMENT_RECEIVED),
            "payment-debt-reminder" => Some(PAYMENT_DEBT_REMINDER),
            _ => None,
        }
    }
}

/// Renders a built-in template. Placeholders without a model value render
/// empty.
pub fn render_builtin(template_key: &str, model: &TemplateModel) -> Result<String, MailError> {
    let template = templates::lookup(template_key)
        .ok_or_else(|| MailError::UnknownTemplate(template_key.to_string()))?;

    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find("}}") {
            Some(end) => {
                let key = &after[..end];
                if let Some(value) = model.get(key) {
                    out.push_str(value);
                }
                rest = &after[end + 2..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    Ok(out)
}

/// Rendering and sending of notification mail.
#[async_trait]
pub trait Mailer: Send + Sync {
    fn render(&self, template_key: &str, model: &TemplateModel) -> Result<String, MailError> {
        render_builtin(template_key, model)
    }

    async fn send(&self, to: &str, subject: &str, body: &str) -> Result<(), MailError>;
}

/// Writes mail to the log instead of a mail server.
#[derive(Debug, Clone, Default)]
pub struct LoggingMailer;

#[async_trait]
impl Mailer for LoggingMailer {
    async fn send(&self, to: &str, subject: &str, body: &str) -> Result<(), MailError> {
        tracing::info!(to, subject, body_len = body.len(), "mail sent");
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMail {
    pub to: String,
    pub subject: String,
    pub body: String,
}

/// Keeps every sent mail for assertions; can be told to fail.
#[derive(Debug, Clone, Default)]
pub struct RecordingMailer {
    sent: Arc<RwLock<Vec<SentMail>>>,
    failures: Arc<AtomicU32>,
}

impl RecordingMailer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `count` sends fail with a transport error.
    pub fn fail_next_sends(&self, count: u32) {
        self.failures.store(count, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<SentMail> {
        self.sent
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl Mailer for RecordingMailer {
    async fn send(&self, to: &str, subject: &str, body: &str) -> Result<(), MailError> {
        if self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(MailError::Transport("smtp connection reset".into()));
        }
        self.sent
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(SentMail {
                to: to.to_string(),
                subject: subject.to_string(),
                body: body.to_string(),
            });
        Ok(())
    }
}
