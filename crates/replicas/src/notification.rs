//! Notification service consumer: turns events into mail.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use common::{BillingPeriod, UserId};
use event_bus::topics::event_type;
use event_bus::{
    EnrollmentCreated, EventEnvelope, EventHandler, EventId, HandlerError, PaymentDebtReminder,
    PaymentReceived, UserDeleted, UserRegistered,
};
use tokio::sync::Mutex;

use crate::applied::{AppliedEvents, skip_duplicate};
use crate::mailer::{Mailer, TemplateModel};

/// Links rendered into every mail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationConfig {
    pub dashboard_url: String,
    pub preferences_url: String,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            dashboard_url: "http://localhost:5173/app/dashboard".to_string(),
            preferences_url: "http://localhost:5173/settings/notifications".to_string(),
        }
    }
}

impl NotificationConfig {
    /// Reads `NOTIFY_DASHBOARD_URL` and `NOTIFY_PREFERENCES_URL`.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            dashboard_url: std::env::var("NOTIFY_DASHBOARD_URL").unwrap_or(defaults.dashboard_url),
            preferences_url: std::env::var("NOTIFY_PREFERENCES_URL")
                .unwrap_or(defaults.preferences_url),
        }
    }
}

/// One row of the sent-notification log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentNotification {
    /// Envelope the mail answers.
    pub event_id: EventId,
    pub user_id: UserId,
    pub to: String,
    pub template: &'static str,
    pub sent_at: DateTime<Utc>,
}

/// A rendered mail, keyed by the envelope it answers.
struct Outgoing {
    key: EventId,
    user_id: UserId,
    to: String,
    subject: String,
    template: &'static str,
    body: String,
}

#[derive(Default)]
struct NotificationState {
    /// Mail addresses learned from registrations, for events that carry
    /// only a user id.
    contacts: HashMap<UserId, String>,
    /// Payment confirmations that arrived before the member's address.
    held: HashMap<UserId, Vec<(EventId, PaymentReceived)>>,
    log: Vec<SentNotification>,
    applied: AppliedEvents,
    /// Keys of mails being sent right now.
    in_flight: HashSet<EventId>,
}

impl NotificationState {
    fn forget(&mut self, user_id: UserId) -> usize {
        self.contacts.remove(&user_id);
        self.held.remove(&user_id);
        let before = self.log.len();
        self.log.retain(|row| row.user_id != user_id);
        before - self.log.len()
    }

    fn release_held(&mut self, user_id: UserId, key: EventId) {
        if let Some(waiting) = self.held.get_mut(&user_id) {
            waiting.retain(|(id, _)| *id != key);
            if waiting.is_empty() {
                self.held.remove(&user_id);
            }
        }
    }
}

/// Sends welcome, enrollment, payment and reminder mail, and forgets a
/// member's address and mail log when the member is deleted.
///
/// The state lock is only held while planning and bookkeeping, never across
/// a send. A mail key is marked in flight while it is being sent and
/// recorded as applied only after the mailer accepted it, so a redelivery
/// never produces a second mail.
#[derive(Clone)]
pub struct NotificationConsumer {
    mailer: Arc<dyn Mailer>,
    config: NotificationConfig,
    state: Arc<Mutex<NotificationState>>,
}

impl NotificationConsumer {
    pub fn new(mailer: Arc<dyn Mailer>, config: NotificationConfig) -> Self {
        Self {
            mailer,
            config,
            state: Arc::new(Mutex::new(NotificationState::default())),
        }
    }

    pub async fn sent_log(&self) -> Vec<SentNotification> {
        self.state.lock().await.log.clone()
    }

    #[cfg(test)]
    async fn held_count(&self) -> usize {
        self.state.lock().await.held.values().map(Vec::len).sum()
    }

    fn base_model(&self) -> TemplateModel {
        TemplateModel::from([
            ("dashboardUrl", self.config.dashboard_url.clone()),
            ("preferencesUrl", self.config.preferences_url.clone()),
        ])
    }

    fn render(
        &self,
        key: EventId,
        user_id: UserId,
        to: String,
        subject: String,
        template: &'static str,
        model: &TemplateModel,
    ) -> Result<Outgoing, HandlerError> {
        let body = self
            .mailer
            .render(template, model)
            .map_err(|e| HandlerError::Poison(e.to_string()))?;
        Ok(Outgoing {
            key,
            user_id,
            to,
            subject,
            template,
            body,
        })
    }

    fn payment_mail(
        &self,
        key: EventId,
        to: String,
        payment: &PaymentReceived,
    ) -> Result<Outgoing, HandlerError> {
        let mut model = self.base_model();
        model.insert("amount", payment.amount.to_string());
        model.insert("currency", payment.currency.clone());
        model.insert("months", join_months(&payment.months));
        self.render(
            key,
            payment.user_id,
            to,
            "Payment received".to_string(),
            "payment-received",
            &model,
        )
    }

    /// Decides what to send for `envelope` and applies the row changes that
    /// need no mail. Runs under the state lock.
    fn plan(
        &self,
        envelope: &EventEnvelope,
        state: &mut NotificationState,
    ) -> Result<Vec<Outgoing>, HandlerError> {
        let id = envelope.event_id;
        let already_applied = state.applied.contains(&id);
        let mut model = self.base_model();

        let batch = match envelope.event_type.as_str() {
            event_type::USER_REGISTERED => {
                let p: UserRegistered = envelope.decode()?;
                let mut batch = Vec::new();
                if !already_applied {
                    state.contacts.insert(p.user_id, p.email.clone());
                    model.insert("username", p.username);
                    model.insert("clubName", p.club_name.unwrap_or_default());
                    model.insert("karateRank", p.karate_rank.unwrap_or_default());
                    batch.push(self.render(
                        id,
                        p.user_id,
                        p.email,
                        "Welcome to the club".to_string(),
                        "user-registered",
                        &model,
                    )?);
                }
                if let Some(to) = state.contacts.get(&p.user_id).cloned()
                    && let Some(waiting) = state.held.get(&p.user_id)
                {
                    for (key, payment) in waiting {
                        if !state.in_flight.contains(key) {
                            batch.push(self.payment_mail(*key, to.clone(), payment)?);
                        }
                    }
                }
                if already_applied && batch.is_empty() {
                    skip_duplicate(self.name(), &id);
                }
                batch
            }
            _ if already_applied => {
                skip_duplicate(self.name(), &id);
                Vec::new()
            }
            event_type::USER_DELETED => {
                let p: UserDeleted = envelope.decode()?;
                let removed = state.forget(p.user_id);
                state.applied.record(id);
                tracing::info!(user_id = %p.user_id, removed, "notification rows removed for deleted user");
                Vec::new()
            }
            event_type::ENROLLMENT_CREATED => {
                let p: EnrollmentCreated = envelope.decode()?;
                model.insert("username", p.username);
                model.insert("startTime", format_local(p.training_start));
                model.insert("endTime", format_local(p.training_end));
                model.insert("description", p.training_description.clone());
                vec![self.render(
                    id,
                    p.user_id,
                    p.user_email,
                    format!("Enrollment confirmed: {}", p.training_description),
                    "enrollment",
                    &model,
                )?]
            }
            event_type::PAYMENT_RECEIVED => {
                let p: PaymentReceived = envelope.decode()?;
                match state.contacts.get(&p.user_id).cloned() {
                    Some(to) => vec![self.payment_mail(id, to, &p)?],
                    None => {
                        let waiting = state.held.entry(p.user_id).or_default();
                        if !waiting.iter().any(|(key, _)| *key == id) {
                            tracing::info!(user_id = %p.user_id, "no address yet, payment mail held");
                            waiting.push((id, p));
                        }
                        Vec::new()
                    }
                }
            }
            event_type::PAYMENT_DEBT_REMINDER => {
                let p: PaymentDebtReminder = envelope.decode()?;
                model.insert("monthlyFee", p.monthly_fee.to_string());
                model.insert("total", p.total.to_string());
                model.insert("months", join_months(&p.months));
                vec![self.render(
                    id,
                    p.user_id,
                    p.email,
                    "Membership fee reminder".to_string(),
                    "payment-debt-reminder",
                    &model,
                )?]
            }
            other => {
                tracing::debug!(event_type = other, "ignoring unknown event type");
                Vec::new()
            }
        };

        let (batch, unaddressed): (Vec<_>, Vec<_>) =
            batch.into_iter().partition(|mail| !mail.to.trim().is_empty());
        for mail in unaddressed {
            tracing::warn!(template = mail.template, "no recipient, notification skipped");
            state.applied.record(mail.key);
        }
        Ok(batch)
    }
}

fn format_local(at: NaiveDateTime) -> String {
    at.format("%Y-%m-%d %H:%M").to_string()
}

fn join_months(months: &[BillingPeriod]) -> String {
    months
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

#[async_trait]
impl EventHandler for NotificationConsumer {
    fn name(&self) -> &'static str {
        "NotificationConsumer"
    }

    #[tracing::instrument(skip(self, envelope), fields(event_id = %envelope.event_id, event_type = %envelope.event_type))]
    async fn handle(&self, envelope: &EventEnvelope) -> Result<(), HandlerError> {
        let batch = {
            let mut state = self.state.lock().await;
            if state.in_flight.contains(&envelope.event_id) {
                return Err(HandlerError::Transient(format!(
                    "mail for event {} is still being sent",
                    envelope.event_id
                )));
            }
            let batch = self.plan(envelope, &mut state)?;
            state.in_flight.extend(batch.iter().map(|mail| mail.key));
            batch
        };
        if batch.is_empty() {
            return Ok(());
        }

        let mut results = Vec::with_capacity(batch.len());
        for mail in &batch {
            results.push(self.mailer.send(&mail.to, &mail.subject, &mail.body).await);
        }

        let mut state = self.state.lock().await;
        let mut failure = None;
        for (mail, result) in batch.into_iter().zip(results) {
            state.in_flight.remove(&mail.key);
            if let Err(err) = result {
                tracing::warn!(template = mail.template, to = %mail.to, error = %err, "mail not sent");
                if failure.is_none() {
                    failure = Some(err);
                }
                continue;
            }
            metrics::counter!("notifications_sent_total", "template" => mail.template).increment(1);
            tracing::info!(template = mail.template, to = %mail.to, "notification sent");
            state.release_held(mail.user_id, mail.key);
            state.applied.record(mail.key);
            state.log.push(SentNotification {
                event_id: mail.key,
                user_id: mail.user_id,
                to: mail.to,
                template: mail.template,
                sent_at: Utc::now(),
            });
        }
        match failure {
            Some(err) => Err(HandlerError::Transient(err.to_string())),
            None => Ok(()),
        }
    }
}
