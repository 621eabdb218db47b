use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{BillingPeriod, PaymentId, UserId};
use event_bus::EventId;
use tokio::sync::OwnedMutexGuard;

use crate::error::LedgerError;
use crate::ledger::{LedgerResult, PaymentLedger, PaymentLock};
use crate::model::{AccountChange, NewPayment, Payment, PaymentStatus, UserAccount};

#[derive(Debug, Default)]
struct LedgerState {
    accounts: HashMap<UserId, UserAccount>,
    payments: BTreeMap<PaymentId, Payment>,
    by_order: HashMap<String, PaymentId>,
    applied: HashSet<(String, EventId)>,
    next_id: i64,
    failing_inserts: u32,
}

impl LedgerState {
    fn paid_periods(&self, user_id: UserId, except: Option<PaymentId>) -> BTreeSet<BillingPeriod> {
        self.payments
            .values()
            .filter(|p| p.user_id == user_id && Some(p.id) != except)
            .flat_map(|p| p.items.iter())
            .filter(|i| i.status == PaymentStatus::Paid)
            .map(|i| i.period)
            .collect()
    }

    fn conflicts_of(&self, payment: &Payment) -> Vec<BillingPeriod> {
        let paid = self.paid_periods(payment.user_id, Some(payment.id));
        let mut conflicts: Vec<_> = payment
            .periods()
            .into_iter()
            .filter(|p| paid.contains(p))
            .collect();
        conflicts.sort();
        conflicts
    }

    fn remove_member(&mut self, user_id: UserId) -> usize {
        self.accounts.remove(&user_id);
        let before = self.payments.len();
        self.payments.retain(|_, p| p.user_id != user_id);
        let payments = &self.payments;
        self.by_order.retain(|_, id| payments.contains_key(id));
        before - self.payments.len()
    }
}

/// In-memory payment ledger for tests and single-node runs.
///
/// Capture locks are per member, so two captures for the same member run one
/// after the other even when they target different orders.
#[derive(Debug, Clone, Default)]
pub struct InMemoryLedger {
    state: Arc<RwLock<LedgerState>>,
    member_locks: Arc<Mutex<HashMap<UserId, Arc<tokio::sync::Mutex<()>>>>>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `count` payment inserts fail as if storage were down.
    pub fn fail_next_inserts(&self, count: u32) {
        self.write().failing_inserts = count;
    }

    pub fn payment_count(&self) -> usize {
        self.read().payments.len()
    }

    pub fn payment_by_order(&self, provider_order_id: &str) -> Option<Payment> {
        let state = self.read();
        state
            .by_order
            .get(provider_order_id)
            .and_then(|id| state.payments.get(id))
            .cloned()
    }

    fn member_lock(&self, user_id: UserId) -> Arc<tokio::sync::Mutex<()>> {
        self.member_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(user_id)
            .or_default()
            .clone()
    }

    fn read(&self) -> RwLockReadGuard<'_, LedgerState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, LedgerState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl PaymentLedger for InMemoryLedger {
    async fn account(&self, user_id: UserId) -> LedgerResult<Option<UserAccount>> {
        Ok(self.read().accounts.get(&user_id).cloned())
    }

    async fn accounts(&self) -> LedgerResult<Vec<UserAccount>> {
        let mut accounts: Vec<_> = self.read().accounts.values().cloned().collect();
        accounts.sort_by_key(|a| a.user_id);
        Ok(accounts)
    }

    async fn apply_account_event(
        &self,
        consumer: &str,
        event_id: EventId,
        change: AccountChange,
    ) -> LedgerResult<bool> {
        let mut guard = self.write();
        let state = &mut *guard;
        let key = (consumer.to_string(), event_id);
        if state.applied.contains(&key) {
            return Ok(false);
        }

        match change {
            AccountChange::Upsert(upsert) => {
                if let Some(account) = state.accounts.get_mut(&upsert.user_id) {
                    upsert.apply_to(account);
                } else {
                    let account = upsert.into_account();
                    state.accounts.insert(account.user_id, account);
                }
            }
            AccountChange::Delete(user_id) => {
                let removed = state.remove_member(user_id);
                // A capture still holding the old lock finds its payment gone.
                self.member_locks
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(&user_id);
                tracing::debug!(%user_id, removed, "member removed from ledger");
            }
        }
        state.applied.insert(key);
        Ok(true)
    }

    async fn paid_periods(&self, user_id: UserId) -> LedgerResult<BTreeSet<BillingPeriod>> {
        Ok(self.read().paid_periods(user_id, None))
    }

    async fn insert_payment(&self, payment: NewPayment) -> LedgerResult<Payment> {
        let mut state = self.write();
        if state.failing_inserts > 0 {
            state.failing_inserts -= 1;
            return Err(LedgerError::Unavailable("write rejected".into()));
        }
        if payment.status == PaymentStatus::Paid {
            let paid = state.paid_periods(payment.user_id, None);
            if let Some(period) = payment.periods.iter().find(|p| paid.contains(p)) {
                return Err(LedgerError::PeriodAlreadyPaid {
                    user_id: payment.user_id,
                    period: *period,
                });
            }
        }
        if let Some(order) = &payment.provider_order_id
            && state.by_order.contains_key(order)
        {
            return Err(LedgerError::DuplicateOrder(order.clone()));
        }

        state.next_id += 1;
        let stored = payment.into_payment(PaymentId::new(state.next_id), Utc::now());
        if let Some(order) = &stored.provider_order_id {
            state.by_order.insert(order.clone(), stored.id);
        }
        state.payments.insert(stored.id, stored.clone());
        Ok(stored)
    }

    async fn lock_by_order(
        &self,
        provider_order_id: &str,
    ) -> LedgerResult<Option<Box<dyn PaymentLock>>> {
        let user_id = {
            let state = self.read();
            let owner = state
                .by_order
                .get(provider_order_id)
                .and_then(|id| state.payments.get(id))
                .map(|p| p.user_id);
            match owner {
                Some(user_id) => user_id,
                None => return Ok(None),
            }
        };

        let guard = self.member_lock(user_id).lock_owned().await;

        // Re-read: the payment may have been captured or deleted while waiting.
        let Some(payment) = self.payment_by_order(provider_order_id) else {
            return Ok(None);
        };
        Ok(Some(Box::new(InMemoryPaymentLock {
            state: Arc::clone(&self.state),
            payment,
            _guard: guard,
        })))
    }

    async fn history(&self, user_id: UserId) -> LedgerResult<Vec<Payment>> {
        let mut payments: Vec<_> = self
            .read()
            .payments
            .values()
            .filter(|p| p.user_id == user_id)
            .cloned()
            .collect();
        payments.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(payments)
    }
}

struct InMemoryPaymentLock {
    state: Arc<RwLock<LedgerState>>,
    payment: Payment,
    _guard: OwnedMutexGuard<()>,
}

#[async_trait]
impl PaymentLock for InMemoryPaymentLock {
    fn payment(&self) -> &Payment {
        &self.payment
    }

    async fn conflicting_periods(&mut self) -> LedgerResult<Vec<BillingPeriod>> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        Ok(state.conflicts_of(&self.payment))
    }

    async fn mark_paid(self: Box<Self>, paid_at: DateTime<Utc>) -> LedgerResult<Payment> {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(period) = state.conflicts_of(&self.payment).first() {
            return Err(LedgerError::PeriodAlreadyPaid {
                user_id: self.payment.user_id,
                period: *period,
            });
        }
        let stored = state
            .payments
            .get_mut(&self.payment.id)
            .ok_or_else(|| LedgerError::Corrupt(format!("payment {} vanished", self.payment.id)))?;
        stored.mark_paid(paid_at);
        Ok(stored.clone())
    }

    async fn release(self: Box<Self>) -> LedgerResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;
    use common::Money;

    use super::*;
    use crate::model::{AccountUpsert, ProviderKind};

    fn upsert(id: i64, email: &str) -> AccountChange {
        AccountChange::Upsert(AccountUpsert {
            user_id: UserId::new(id),
            email: email.into(),
            username: format!("member{id}"),
            registration_date: NaiveDate::from_ymd_opt(2025, 1, 10),
            observed_on: NaiveDate::from_ymd_opt(2025, 1, 10).unwrap(),
            club_id: None,
            club_name: None,
            karate_rank: None,
        })
    }

    fn order(user: i64, id: &str, months: &[&str]) -> NewPayment {
        NewPayment {
            user_id: UserId::new(user),
            provider: ProviderKind::PayPal,
            provider_order_id: Some(id.into()),
            currency: "PLN".into(),
            monthly_fee: Money::from_cents(15000),
            status: PaymentStatus::Pending,
            periods: months.iter().map(|m| m.parse().unwrap()).collect(),
        }
    }

    #[tokio::test]
    async fn duplicate_event_is_not_applied_twice() {
        let ledger = InMemoryLedger::new();
        let event_id = EventId::new();

        assert!(ledger.apply_account_event("replica", event_id, upsert(1, "a@dojo.test")).await.unwrap());
        assert!(!ledger.apply_account_event("replica", event_id, upsert(1, "b@dojo.test")).await.unwrap());
        // A different consumer keeps its own marker.
        assert!(ledger.apply_account_event("other", event_id, upsert(1, "c@dojo.test")).await.unwrap());

        let account = ledger.account(UserId::new(1)).await.unwrap().unwrap();
        assert_eq!(account.email, "c@dojo.test");
    }

    #[tokio::test]
    async fn delete_removes_account_payments_and_orders() {
        let ledger = InMemoryLedger::new();
        ledger.apply_account_event("replica", EventId::new(), upsert(1, "a@dojo.test")).await.unwrap();
        ledger.insert_payment(order(1, "PP-1", &["2025-01"])).await.unwrap();
        ledger.insert_payment(order(2, "PP-2", &["2025-01"])).await.unwrap();

        ledger
            .apply_account_event("replica", EventId::new(), AccountChange::Delete(UserId::new(1)))
            .await
            .unwrap();

        assert!(ledger.account(UserId::new(1)).await.unwrap().is_none());
        assert!(ledger.payment_by_order("PP-1").is_none());
        assert!(ledger.lock_by_order("PP-1").await.unwrap().is_none());
        assert_eq!(ledger.payment_count(), 1);
    }

    #[tokio::test]
    async fn delete_drops_the_members_capture_lock() {
        let ledger = InMemoryLedger::new();
        ledger.insert_payment(order(1, "PP-1", &["2025-01"])).await.unwrap();
        ledger.insert_payment(order(2, "PP-2", &["2025-01"])).await.unwrap();
        for id in ["PP-1", "PP-2"] {
            ledger.lock_by_order(id).await.unwrap().unwrap().release().await.unwrap();
        }
        assert_eq!(ledger.member_locks.lock().unwrap().len(), 2);

        ledger
            .apply_account_event("replica", EventId::new(), AccountChange::Delete(UserId::new(1)))
            .await
            .unwrap();

        let locks = ledger.member_locks.lock().unwrap();
        assert_eq!(locks.len(), 1);
        assert!(locks.contains_key(&UserId::new(2)));
    }

    #[tokio::test]
    async fn mark_paid_refuses_second_paid_item_for_month() {
        let ledger = InMemoryLedger::new();
        ledger.insert_payment(order(1, "PP-1", &["2025-01"])).await.unwrap();
        ledger.insert_payment(order(1, "PP-2", &["2025-01", "2025-02"])).await.unwrap();

        let first = ledger.lock_by_order("PP-1").await.unwrap().unwrap();
        first.mark_paid(Utc::now()).await.unwrap();

        let mut second = ledger.lock_by_order("PP-2").await.unwrap().unwrap();
        assert_eq!(
            second.conflicting_periods().await.unwrap(),
            vec!["2025-01".parse().unwrap()]
        );
        let err = second.mark_paid(Utc::now()).await.unwrap_err();
        assert!(matches!(err, LedgerError::PeriodAlreadyPaid { .. }));
        assert_eq!(
            ledger.payment_by_order("PP-2").unwrap().status,
            PaymentStatus::Pending
        );
    }

    #[tokio::test]
    async fn duplicate_provider_order_is_rejected() {
        let ledger = InMemoryLedger::new();
        ledger.insert_payment(order(1, "PP-1", &["2025-01"])).await.unwrap();
        let err = ledger.insert_payment(order(1, "PP-1", &["2025-02"])).await.unwrap_err();
        assert!(matches!(err, LedgerError::DuplicateOrder(_)));
    }

    #[tokio::test]
    async fn history_is_newest_first() {
        let ledger = InMemoryLedger::new();
        let first = ledger.insert_payment(order(1, "PP-1", &["2025-01"])).await.unwrap();
        let second = ledger.insert_payment(order(1, "PP-2", &["2025-02"])).await.unwrap();

        let history = ledger.history(UserId::new(1)).await.unwrap();
        assert_eq!(
            history.iter().map(|p| p.id).collect::<Vec<_>>(),
            vec![second.id, first.id]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn capture_locks_serialize_per_member() {
        let ledger = InMemoryLedger::new();
        ledger.insert_payment(order(1, "PP-1", &["2025-01"])).await.unwrap();
        ledger.insert_payment(order(1, "PP-2", &["2025-02"])).await.unwrap();
        ledger.insert_payment(order(2, "PP-3", &["2025-02"])).await.unwrap();

        let held = ledger.lock_by_order("PP-1").await.unwrap().unwrap();

        let same_member = tokio::time::timeout(
            std::time::Duration::from_millis(50),
            ledger.lock_by_order("PP-2"),
        )
        .await;
        assert!(same_member.is_err());

        let other_member = ledger.lock_by_order("PP-3").await.unwrap();
        assert!(other_member.is_some());

        held.release().await.unwrap();
        assert!(ledger.lock_by_order("PP-2").await.unwrap().is_some());
    }
}
