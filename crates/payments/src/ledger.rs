//! Storage seam for accounts, payments and their items.

use std::collections::BTreeSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{BillingPeriod, UserId};
use event_bus::EventId;

use crate::error::LedgerError;
use crate::model::{AccountChange, NewPayment, Payment, UserAccount};

pub type LedgerResult<T> = std::result::Result<T, LedgerError>;

/// Durable payment state.
///
/// Implementations guarantee that a member never has two PAID items for the
/// same month, whatever the interleaving of writers.
#[async_trait]
pub trait PaymentLedger: Send + Sync {
    async fn account(&self, user_id: UserId) -> LedgerResult<Option<UserAccount>>;

    async fn accounts(&self) -> LedgerResult<Vec<UserAccount>>;

    /// Applies a replica change unless `consumer` already applied `event_id`.
    ///
    /// The change and the applied marker are written atomically. Returns
    /// `false` for a duplicate.
    async fn apply_account_event(
        &self,
        consumer: &str,
        event_id: EventId,
        change: AccountChange,
    ) -> LedgerResult<bool>;

    /// Months with a PAID item for this member.
    async fn paid_periods(&self, user_id: UserId) -> LedgerResult<BTreeSet<BillingPeriod>>;

    /// Writes a payment with its items in one step.
    async fn insert_payment(&self, payment: NewPayment) -> LedgerResult<Payment>;

    /// Takes the exclusive capture lock for the payment behind a provider
    /// order. Captures for the same member are serialized as well.
    ///
    /// Returns `None` when no payment carries that order id.
    async fn lock_by_order(
        &self,
        provider_order_id: &str,
    ) -> LedgerResult<Option<Box<dyn PaymentLock>>>;

    /// All payments of a member, newest first.
    async fn history(&self, user_id: UserId) -> LedgerResult<Vec<Payment>>;
}

/// An exclusively held payment. Dropping it releases the lock without
/// changing anything.
#[async_trait]
pub trait PaymentLock: Send {
    /// The payment as read under the lock.
    fn payment(&self) -> &Payment;

    /// Months of this payment that another payment of the member already
    /// covers as PAID.
    async fn conflicting_periods(&mut self) -> LedgerResult<Vec<BillingPeriod>>;

    /// Flips the payment and its items to PAID, makes it durable and
    /// releases the lock.
    async fn mark_paid(self: Box<Self>, paid_at: DateTime<Utc>) -> LedgerResult<Payment>;

    /// Releases the lock without changes.
    async fn release(self: Box<Self>) -> LedgerResult<()>;
}
