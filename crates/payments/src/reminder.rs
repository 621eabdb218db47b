use std::sync::Arc;

use chrono::{NaiveDate, Utc};
use event_bus::{EventPublisher, PaymentDebtReminder};
use tokio::time::MissedTickBehavior;

use crate::config::PaymentsConfig;
use crate::error::Result;
use crate::ledger::PaymentLedger;
use crate::unpaid::unpaid_months;

/// Periodically publishes one `payment-debt-reminder` per indebted member.
pub struct DebtReminderJob {
    ledger: Arc<dyn PaymentLedger>,
    publisher: Arc<EventPublisher>,
    config: PaymentsConfig,
}

impl DebtReminderJob {
    pub fn new(
        ledger: Arc<dyn PaymentLedger>,
        publisher: Arc<EventPublisher>,
        config: PaymentsConfig,
    ) -> Self {
        Self {
            ledger,
            publisher,
            config,
        }
    }

    /// One pass over all account replicas. Returns the number of reminders
    /// published.
    #[tracing::instrument(skip(self))]
    pub async fn run_once(&self, today: NaiveDate) -> Result<usize> {
        let accounts = self.ledger.accounts().await?;
        tracing::info!(members = accounts.len(), "debt reminder run started");

        let mut reminded = 0;
        for account in accounts {
            let paid = self.ledger.paid_periods(account.user_id).await?;
            let months = unpaid_months(account.registration_date, today, &paid);
            if months.is_empty() {
                continue;
            }
            if account.email.trim().is_empty() {
                tracing::warn!(user_id = %account.user_id, "indebted member has no email");
                continue;
            }

            let reminder = PaymentDebtReminder {
                user_id: account.user_id,
                email: account.email,
                monthly_fee: self.config.monthly_fee,
                total: self.config.monthly_fee.multiply(months.len()),
                months,
            };
            match self.publisher.publish(&reminder).await {
                Ok(_) => reminded += 1,
                Err(err) => {
                    tracing::error!(user_id = %reminder.user_id, error = %err, "reminder not published");
                }
            }
        }

        metrics::counter!("payments_debt_reminders_total").increment(reminded as u64);
        tracing::info!(reminded, "debt reminder run finished");
        Ok(reminded)
    }

    /// Runs [`run_once`](Self::run_once) every `reminder_interval`, starting
    /// one interval from now. Never returns.
    pub async fn run(&self) {
        let mut ticker = tokio::time::interval(self.config.reminder_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if let Err(err) = self.run_once(Utc::now().date_naive()).await {
                tracing::error!(error = %err, "debt reminder run failed");
            }
        }
    }
}
