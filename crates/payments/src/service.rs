//! Order creation, capture, manual payments and debt queries.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;

use chrono::{NaiveDate, Utc};
use common::{BillingPeriod, UserId};
use event_bus::{EventPublisher, PaymentReceived};
use tracing::instrument;

use crate::config::PaymentsConfig;
use crate::error::{PaymentError, Result};
use crate::ledger::PaymentLedger;
use crate::model::{
    CaptureOutcome, CaptureResult, NewPayment, OrderCreated, Payment, PaymentStatus, ProviderKind,
    UnpaidSummary, UserAccount,
};
use crate::provider::{OrderRequest, PaymentProvider, ProviderError};
use crate::unpaid::unpaid_months;

/// Input of [`PaymentService::create_order`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateOrder {
    pub user_id: UserId,
    /// Empty means the current month.
    pub months: Vec<BillingPeriod>,
    pub currency: Option<String>,
    pub return_url: Option<String>,
    pub cancel_url: Option<String>,
}

impl CreateOrder {
    /// An order for the given months with default currency and redirects.
    pub fn months(user_id: UserId, months: Vec<BillingPeriod>) -> Self {
        Self {
            user_id,
            months,
            currency: None,
            return_url: None,
            cancel_url: None,
        }
    }
}

/// Membership fee payments.
///
/// Capture is the only PENDING to PAID transition. It runs under the
/// ledger's capture lock, calls the provider while holding it and publishes
/// `PAYMENT_RECEIVED` only after the PAID state is durable, so each payment
/// is announced exactly once by this service.
pub struct PaymentService {
    ledger: Arc<dyn PaymentLedger>,
    provider: Arc<dyn PaymentProvider>,
    publisher: Arc<EventPublisher>,
    config: PaymentsConfig,
}

impl PaymentService {
    pub fn new(
        ledger: Arc<dyn PaymentLedger>,
        provider: Arc<dyn PaymentProvider>,
        publisher: Arc<EventPublisher>,
        config: PaymentsConfig,
    ) -> Self {
        Self {
            ledger,
            provider,
            publisher,
            config,
        }
    }

    pub fn config(&self) -> &PaymentsConfig {
        &self.config
    }

    async fn require_account(&self, user_id: UserId) -> Result<UserAccount> {
        self.ledger
            .account(user_id)
            .await?
            .ok_or(PaymentError::UnknownUser(user_id))
    }

    /// Defaults to the current month, rejects repeats and months already
    /// PAID. Returns the months in chronological order.
    async fn billable_months(
        &self,
        user_id: UserId,
        requested: Vec<BillingPeriod>,
    ) -> Result<Vec<BillingPeriod>> {
        let requested = if requested.is_empty() {
            vec![BillingPeriod::current()]
        } else {
            requested
        };

        let mut months = BTreeSet::new();
        for month in requested {
            if !months.insert(month) {
                return Err(PaymentError::DuplicateMonth(month));
            }
        }

        let paid = self.ledger.paid_periods(user_id).await?;
        if let Some(month) = months.iter().find(|m| paid.contains(m)) {
            return Err(PaymentError::PeriodAlreadyPaid(*month));
        }
        Ok(months.into_iter().collect())
    }

    /// Creates a provider checkout order and records a PENDING payment.
    ///
    /// If the provider accepted the order but the ledger write fails, the
    /// provider order is orphaned: nothing local refers to it and a later
    /// capture of it answers "not found".
    #[instrument(skip(self, request), fields(user_id = %request.user_id))]
    pub async fn create_order(&self, request: CreateOrder) -> Result<OrderCreated> {
        self.require_account(request.user_id).await?;
        let months = self.billable_months(request.user_id, request.months).await?;

        let monthly_fee = self.config.monthly_fee;
        let order = OrderRequest {
            user_id: request.user_id,
            amount: monthly_fee.multiply(months.len()),
            currency: request.currency.unwrap_or_else(|| self.config.currency.clone()),
            return_url: request
                .return_url
                .unwrap_or_else(|| self.config.return_url.clone()),
            cancel_url: request
                .cancel_url
                .unwrap_or_else(|| self.config.cancel_url.clone()),
        };

        let provider_order_id =
            tokio::time::timeout(self.config.provider_timeout, self.provider.create_order(&order))
                .await
                .map_err(|_| ProviderError::Timeout(self.config.provider_timeout))??;

        let stored = self
            .ledger
            .insert_payment(NewPayment {
                user_id: request.user_id,
                provider: ProviderKind::PayPal,
                provider_order_id: Some(provider_order_id.clone()),
                currency: order.currency.clone(),
                monthly_fee,
                status: PaymentStatus::Pending,
                periods: months.clone(),
            })
            .await
            .inspect_err(|err| {
                tracing::error!(
                    %provider_order_id,
                    error = %err,
                    "provider order created but payment not recorded"
                );
            })?;

        metrics::counter!("payments_orders_created_total").increment(1);
        tracing::info!(
            payment_id = %stored.id,
            %provider_order_id,
            amount = %order.amount,
            months = months.len(),
            "payment order created"
        );

        Ok(OrderCreated {
            approval_url: self.provider.approval_url(&provider_order_id),
            provider_order_id,
            amount: order.amount,
            currency: order.currency,
            months,
            status: PaymentStatus::Pending,
        })
    }

    /// Captures the payment behind a provider order.
    ///
    /// - unknown order: [`PaymentError::PaymentNotFound`]
    /// - already PAID: `Ok` with [`CaptureOutcome::AlreadyPaid`], no provider call
    /// - a month already PAID by another payment: rejected before the provider
    ///   call, the payment stays PENDING
    /// - provider failure or decline: retryable error, the payment stays PENDING
    #[instrument(skip(self))]
    pub async fn capture(&self, provider_order_id: &str) -> Result<CaptureResult> {
        let started = Instant::now();
        let Some(mut lock) = self.ledger.lock_by_order(provider_order_id).await? else {
            metrics::counter!("payments_captures_total", "outcome" => "not_found").increment(1);
            return Err(PaymentError::PaymentNotFound(provider_order_id.to_string()));
        };

        if !lock.payment().status.can_capture() {
            lock.release().await?;
            metrics::counter!("payments_captures_total", "outcome" => "already_paid").increment(1);
            tracing::info!("capture repeated for a paid order");
            return Ok(CaptureResult {
                provider_order_id: provider_order_id.to_string(),
                outcome: CaptureOutcome::AlreadyPaid,
            });
        }

        let conflicts = lock.conflicting_periods().await?;
        if let Some(period) = conflicts.first().copied() {
            lock.release().await?;
            metrics::counter!("payments_captures_total", "outcome" => "period_conflict")
                .increment(1);
            tracing::warn!(%period, "capture rejected, month paid by another payment");
            return Err(PaymentError::PeriodAlreadyPaid(period));
        }

        let answer = tokio::time::timeout(
            self.config.provider_timeout,
            self.provider.capture_order(provider_order_id),
        )
        .await
        .unwrap_or(Err(ProviderError::Timeout(self.config.provider_timeout)));
        match answer {
            Ok(true) => {}
            Ok(false) => {
                lock.release().await?;
                metrics::counter!("payments_captures_total", "outcome" => "declined").increment(1);
                tracing::warn!("provider declined capture");
                return Err(PaymentError::CaptureDeclined(provider_order_id.to_string()));
            }
            Err(err) => {
                lock.release().await?;
                metrics::counter!("payments_captures_total", "outcome" => "provider_error")
                    .increment(1);
                tracing::warn!(error = %err, "provider capture failed");
                return Err(err.into());
            }
        }

        let paid = lock.mark_paid(Utc::now()).await?;
        self.announce(&paid).await;

        metrics::counter!("payments_captures_total", "outcome" => "paid").increment(1);
        metrics::histogram!("payments_capture_duration_seconds")
            .record(started.elapsed().as_secs_f64());
        tracing::info!(payment_id = %paid.id, amount = %paid.amount, "payment captured");

        Ok(CaptureResult {
            provider_order_id: provider_order_id.to_string(),
            outcome: CaptureOutcome::Paid,
        })
    }

    /// Records a payment taken outside the provider. Born PAID.
    #[instrument(skip(self, months))]
    pub async fn record_manual_payment(
        &self,
        user_id: UserId,
        months: Vec<BillingPeriod>,
    ) -> Result<Payment> {
        self.require_account(user_id).await?;
        let months = self.billable_months(user_id, months).await?;

        let paid = self
            .ledger
            .insert_payment(NewPayment {
                user_id,
                provider: ProviderKind::Manual,
                provider_order_id: None,
                currency: self.config.currency.clone(),
                monthly_fee: self.config.monthly_fee,
                status: PaymentStatus::Paid,
                periods: months,
            })
            .await?;
        self.announce(&paid).await;

        metrics::counter!("payments_manual_total").increment(1);
        tracing::info!(payment_id = %paid.id, amount = %paid.amount, "manual payment recorded");
        Ok(paid)
    }

    /// All payments of a member, newest first.
    pub async fn history(&self, user_id: UserId) -> Result<Vec<Payment>> {
        Ok(self.ledger.history(user_id).await?)
    }

    /// Months owed as of `today`, with the fee and the total.
    pub async fn unpaid_summary(&self, user_id: UserId, today: NaiveDate) -> Result<UnpaidSummary> {
        let account = self.require_account(user_id).await?;
        let paid = self.ledger.paid_periods(user_id).await?;
        let months = unpaid_months(account.registration_date, today, &paid);
        Ok(UnpaidSummary {
            total: self.config.monthly_fee.multiply(months.len()),
            monthly_fee: self.config.monthly_fee,
            months,
        })
    }

    /// Publishes `PAYMENT_RECEIVED` for a payment that is already durable.
    /// A broker outage is absorbed by the publisher, so this never fails the
    /// caller.
    async fn announce(&self, payment: &Payment) {
        let event = PaymentReceived {
            user_id: payment.user_id,
            currency: payment.currency.clone(),
            amount: payment.amount,
            months: payment.periods(),
        };
        if let Err(err) = self.publisher.publish(&event).await {
            tracing::error!(payment_id = %payment.id, error = %err, "payment event not published");
        }
    }
}
