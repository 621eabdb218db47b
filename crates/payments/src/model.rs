//! Payment ledger records.

use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use common::{BillingPeriod, ClubId, Money, PaymentId, UserId};
use serde::{Deserialize, Serialize};

/// Lifecycle of a payment and of each of its items.
///
/// ```text
/// PENDING ──capture──▶ PAID
/// ```
/// `PAID` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentStatus {
    Pending,
    Paid,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "PENDING",
            PaymentStatus::Paid => "PAID",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, PaymentStatus::Paid)
    }

    pub fn can_capture(&self) -> bool {
        matches!(self, PaymentStatus::Pending)
    }
}

impl std::fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for PaymentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(PaymentStatus::Pending),
            "PAID" => Ok(PaymentStatus::Paid),
            other => Err(format!("unknown payment status {other}")),
        }
    }
}

/// Who moved the money.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProviderKind {
    /// Online checkout; the payment is born PENDING and captured later.
    PayPal,
    /// Recorded by staff; born PAID, no provider order.
    Manual,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::PayPal => "PAYPAL",
            ProviderKind::Manual => "MANUAL",
        }
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ProviderKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PAYPAL" => Ok(ProviderKind::PayPal),
            "MANUAL" => Ok(ProviderKind::Manual),
            other => Err(format!("unknown payment provider {other}")),
        }
    }
}

/// One month covered by a payment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentItem {
    pub period: BillingPeriod,
    pub amount: Money,
    pub status: PaymentStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payment {
    pub id: PaymentId,
    pub user_id: UserId,
    pub provider: ProviderKind,
    pub provider_order_id: Option<String>,
    pub currency: String,
    pub amount: Money,
    pub status: PaymentStatus,
    pub created_at: DateTime<Utc>,
    pub paid_at: Option<DateTime<Utc>>,
    pub items: Vec<PaymentItem>,
}

impl Payment {
    pub fn periods(&self) -> Vec<BillingPeriod> {
        self.items.iter().map(|i| i.period).collect()
    }

    /// Flips the payment and all its items to PAID.
    pub(crate) fn mark_paid(&mut self, paid_at: DateTime<Utc>) {
        self.status = PaymentStatus::Paid;
        self.paid_at = Some(paid_at);
        for item in &mut self.items {
            item.status = PaymentStatus::Paid;
        }
    }
}

/// A payment about to be written; the ledger assigns id and timestamps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewPayment {
    pub user_id: UserId,
    pub provider: ProviderKind,
    pub provider_order_id: Option<String>,
    pub currency: String,
    pub monthly_fee: Money,
    pub status: PaymentStatus,
    pub periods: Vec<BillingPeriod>,
}

impl NewPayment {
    pub fn amount(&self) -> Money {
        self.monthly_fee.multiply(self.periods.len())
    }

    pub(crate) fn into_payment(self, id: PaymentId, now: DateTime<Utc>) -> Payment {
        let amount = self.amount();
        let items = self
            .periods
            .iter()
            .map(|period| PaymentItem {
                period: *period,
                amount: self.monthly_fee,
                status: self.status,
            })
            .collect();
        Payment {
            id,
            user_id: self.user_id,
            provider: self.provider,
            provider_order_id: self.provider_order_id,
            currency: self.currency,
            amount,
            status: self.status,
            created_at: now,
            paid_at: self.status.is_terminal().then_some(now),
            items,
        }
    }
}

/// Payment service's copy of a member account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserAccount {
    pub user_id: UserId,
    pub email: String,
    pub username: String,
    pub registration_date: NaiveDate,
    pub club_id: Option<ClubId>,
    pub club_name: Option<String>,
    pub karate_rank: Option<String>,
}

/// Fields a registration event carries. Absent optionals leave the stored
/// value alone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountUpsert {
    pub user_id: UserId,
    pub email: String,
    pub username: String,
    pub registration_date: Option<NaiveDate>,
    /// Used as registration date when the account is new and the event
    /// carried none.
    pub observed_on: NaiveDate,
    pub club_id: Option<ClubId>,
    pub club_name: Option<String>,
    pub karate_rank: Option<String>,
}

impl AccountUpsert {
    pub(crate) fn into_account(self) -> UserAccount {
        UserAccount {
            user_id: self.user_id,
            email: self.email,
            username: self.username,
            registration_date: self.registration_date.unwrap_or(self.observed_on),
            club_id: self.club_id,
            club_name: self.club_name,
            karate_rank: self.karate_rank,
        }
    }

    pub(crate) fn apply_to(self, account: &mut UserAccount) {
        account.email = self.email;
        account.username = self.username;
        if let Some(date) = self.registration_date {
            account.registration_date = date;
        }
        if self.club_id.is_some() {
            account.club_id = self.club_id;
        }
        if self.club_name.is_some() {
            account.club_name = self.club_name;
        }
        if self.karate_rank.is_some() {
            account.karate_rank = self.karate_rank;
        }
    }
}

/// Replica change driven by an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccountChange {
    Upsert(AccountUpsert),
    /// Removes the account with all its payments and items.
    Delete(UserId),
}

/// Answer to a successful order creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderCreated {
    pub provider_order_id: String,
    pub approval_url: String,
    pub amount: Money,
    pub currency: String,
    pub months: Vec<BillingPeriod>,
    pub status: PaymentStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CaptureOutcome {
    /// This call performed the PENDING to PAID transition.
    Paid,
    /// The payment had already been captured; nothing changed.
    AlreadyPaid,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureResult {
    pub provider_order_id: String,
    pub outcome: CaptureOutcome,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UnpaidSummary {
    pub months: Vec<BillingPeriod>,
    pub monthly_fee: Money,
    pub total: Money,
}
