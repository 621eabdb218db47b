//! PostgreSQL ledger tests.
//!
//! These tests share one PostgreSQL container. Run with:
//!
//! ```bash
//! cargo test -p payments --test postgres_ledger -- --test-threads=1
//! ```

use std::sync::Arc;

use chrono::{NaiveDate, Utc};
use common::{BillingPeriod, ClubId, Money, UserId};
use event_bus::EventId;
use futures_util::future::join_all;
use payments::{
    AccountChange, AccountUpsert, CaptureOutcome, CreateOrder, LedgerError, NewPayment,
    PaymentError, PaymentLedger, PaymentService, PaymentStatus, PaymentsConfig, PostgresLedger,
    ProviderKind, SandboxPaymentProvider,
};
use sqlx::PgPool;
use testcontainers::{ContainerAsync, runners::AsyncRunner};
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;

struct ContainerInfo {
    #[allow(dead_code)] // Container must stay alive for tests
    container: ContainerAsync<Postgres>,
    connection_string: String,
}

static CONTAINER: OnceCell<Arc<ContainerInfo>> = OnceCell::const_new();

async fn get_container_info() -> Arc<ContainerInfo> {
    CONTAINER
        .get_or_init(|| async {
            let container = Postgres::default().start().await.unwrap();
            let host = container.get_host().await.unwrap();
            let port = container.get_host_port_ipv4(5432).await.unwrap();
            let connection_string =
                format!("postgres://postgres:postgres@{}:{}/postgres", host, port);

            let temp_pool = PgPool::connect(&connection_string).await.unwrap();
            sqlx::raw_sql(include_str!(
                "../../../migrations/001_create_payment_tables.sql"
            ))
            .execute(&temp_pool)
            .await
            .unwrap();
            temp_pool.close().await;

            Arc::new(ContainerInfo {
                container,
                connection_string,
            })
        })
        .await
        .clone()
}

/// A fresh ledger with its own pool and emptied tables.
async fn get_test_ledger() -> PostgresLedger {
    let info = get_container_info().await;
    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(10)
        .connect(&info.connection_string)
        .await
        .unwrap();

    sqlx::query("TRUNCATE TABLE payment_items, payments, user_account, applied_events")
        .execute(&pool)
        .await
        .unwrap();

    PostgresLedger::new(pool)
}

fn month(s: &str) -> BillingPeriod {
    s.parse().unwrap()
}

fn upsert(id: i64, registered: Option<NaiveDate>) -> AccountChange {
    AccountChange::Upsert(AccountUpsert {
        user_id: UserId::new(id),
        email: format!("member{id}@dojo.test"),
        username: format!("member{id}"),
        registration_date: registered,
        observed_on: NaiveDate::from_ymd_opt(2025, 5, 1).unwrap(),
        club_id: Some(ClubId::new(3)),
        club_name: Some("Tigers".into()),
        karate_rank: None,
    })
}

fn pending(user: i64, order: &str, months: &[&str]) -> NewPayment {
    NewPayment {
        user_id: UserId::new(user),
        provider: ProviderKind::PayPal,
        provider_order_id: Some(order.into()),
        currency: "PLN".into(),
        monthly_fee: Money::from_cents(15000),
        status: PaymentStatus::Pending,
        periods: months.iter().map(|m| month(m)).collect(),
    }
}

#[tokio::test]
async fn test_account_upsert_and_duplicate_event() {
    let ledger = get_test_ledger().await;
    let event_id = EventId::new();

    let applied = ledger
        .apply_account_event("replica", event_id, upsert(1, NaiveDate::from_ymd_opt(2025, 1, 15)))
        .await
        .unwrap();
    assert!(applied);
    let again = ledger
        .apply_account_event("replica", event_id, upsert(1, None))
        .await
        .unwrap();
    assert!(!again);

    // A later event without optional fields keeps the stored ones.
    ledger
        .apply_account_event(
            "replica",
            EventId::new(),
            AccountChange::Upsert(AccountUpsert {
                user_id: UserId::new(1),
                email: "new@dojo.test".into(),
                username: "member1".into(),
                registration_date: None,
                observed_on: NaiveDate::from_ymd_opt(2025, 6, 1).unwrap(),
                club_id: None,
                club_name: None,
                karate_rank: Some("3 kyu".into()),
            }),
        )
        .await
        .unwrap();

    let account = ledger.account(UserId::new(1)).await.unwrap().unwrap();
    assert_eq!(account.email, "new@dojo.test");
    assert_eq!(
        account.registration_date,
        NaiveDate::from_ymd_opt(2025, 1, 15).unwrap()
    );
    assert_eq!(account.club_id, Some(ClubId::new(3)));
    assert_eq!(account.karate_rank.as_deref(), Some("3 kyu"));
}

#[tokio::test]
async fn test_insert_and_history() {
    let ledger = get_test_ledger().await;
    let first = ledger
        .insert_payment(pending(1, "PP-1", &["2025-02", "2025-01"]))
        .await
        .unwrap();
    let second = ledger.insert_payment(pending(1, "PP-2", &["2025-03"])).await.unwrap();
    ledger.insert_payment(pending(2, "PP-3", &["2025-03"])).await.unwrap();

    let history = ledger.history(UserId::new(1)).await.unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0], second);
    assert_eq!(history[1].id, first.id);
    assert_eq!(history[1].periods(), vec![month("2025-01"), month("2025-02")]);
    assert_eq!(history[1].amount, Money::from_cents(30000));

    let err = ledger.insert_payment(pending(1, "PP-1", &["2025-04"])).await.unwrap_err();
    assert!(matches!(err, LedgerError::DuplicateOrder(_)));
}

#[tokio::test]
async fn test_mark_paid_and_conflicts() {
    let ledger = get_test_ledger().await;
    ledger.insert_payment(pending(1, "PP-1", &["2025-01"])).await.unwrap();
    ledger
        .insert_payment(pending(1, "PP-2", &["2025-01", "2025-02"]))
        .await
        .unwrap();

    let lock = ledger.lock_by_order("PP-1").await.unwrap().unwrap();
    let paid = lock.mark_paid(Utc::now()).await.unwrap();
    assert_eq!(paid.status, PaymentStatus::Paid);

    let mut second = ledger.lock_by_order("PP-2").await.unwrap().unwrap();
    assert_eq!(
        second.conflicting_periods().await.unwrap(),
        vec![month("2025-01")]
    );
    // The unique index refuses the second PAID item even without the check.
    let err = second.mark_paid(Utc::now()).await.unwrap_err();
    assert!(matches!(err, LedgerError::PeriodAlreadyPaid { .. }));

    let paid_periods = ledger.paid_periods(UserId::new(1)).await.unwrap();
    assert_eq!(paid_periods.into_iter().collect::<Vec<_>>(), vec![month("2025-01")]);
    let history = ledger.history(UserId::new(1)).await.unwrap();
    let second = history.iter().find(|p| p.provider_order_id.as_deref() == Some("PP-2")).unwrap();
    assert_eq!(second.status, PaymentStatus::Pending);
}

#[tokio::test]
async fn test_released_lock_changes_nothing() {
    let ledger = get_test_ledger().await;
    let stored = ledger.insert_payment(pending(1, "PP-1", &["2025-01"])).await.unwrap();

    let lock = ledger.lock_by_order("PP-1").await.unwrap().unwrap();
    assert_eq!(lock.payment(), &stored);
    lock.release().await.unwrap();

    assert!(ledger.lock_by_order("PP-404").await.unwrap().is_none());
    assert!(ledger.paid_periods(UserId::new(1)).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_manual_payment_conflict() {
    let ledger = get_test_ledger().await;
    let mut manual = pending(1, "unused", &["2025-01"]);
    manual.provider = ProviderKind::Manual;
    manual.provider_order_id = None;
    manual.status = PaymentStatus::Paid;

    let stored = ledger.insert_payment(manual.clone()).await.unwrap();
    assert!(stored.paid_at.is_some());

    let err = ledger.insert_payment(manual).await.unwrap_err();
    assert!(matches!(err, LedgerError::PeriodAlreadyPaid { .. }));
}

#[tokio::test]
async fn test_delete_member_cascades() {
    let ledger = get_test_ledger().await;
    ledger
        .apply_account_event("replica", EventId::new(), upsert(1, None))
        .await
        .unwrap();
    ledger.insert_payment(pending(1, "PP-1", &["2025-01"])).await.unwrap();
    ledger.insert_payment(pending(2, "PP-2", &["2025-01"])).await.unwrap();

    ledger
        .apply_account_event("deletion", EventId::new(), AccountChange::Delete(UserId::new(1)))
        .await
        .unwrap();

    assert!(ledger.account(UserId::new(1)).await.unwrap().is_none());
    assert!(ledger.history(UserId::new(1)).await.unwrap().is_empty());
    assert_eq!(ledger.history(UserId::new(2)).await.unwrap().len(), 1);
    let items: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM payment_items WHERE user_id = 1")
        .fetch_one(ledger.pool())
        .await
        .unwrap();
    assert_eq!(items, 0);
}

#[tokio::test]
async fn test_delete_member_waits_for_running_capture() {
    let ledger = get_test_ledger().await;
    ledger
        .apply_account_event("replica", EventId::new(), upsert(1, None))
        .await
        .unwrap();
    ledger
        .insert_payment(pending(1, "PP-1", &["2025-01", "2025-02"]))
        .await
        .unwrap();

    let lock = ledger.lock_by_order("PP-1").await.unwrap().unwrap();
    let deletion = {
        let ledger = ledger.clone();
        tokio::spawn(async move {
            ledger
                .apply_account_event("deletion", EventId::new(), AccountChange::Delete(UserId::new(1)))
                .await
        })
    };
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    assert!(!deletion.is_finished());

    let paid = lock.mark_paid(Utc::now()).await.unwrap();
    assert_eq!(paid.status, PaymentStatus::Paid);
    assert!(deletion.await.unwrap().unwrap());

    assert!(ledger.account(UserId::new(1)).await.unwrap().is_none());
    assert!(ledger.history(UserId::new(1)).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_concurrent_captures_through_service() {
    let ledger = get_test_ledger().await;
    ledger
        .apply_account_event(
            "replica",
            EventId::new(),
            upsert(1, NaiveDate::from_ymd_opt(2025, 1, 1)),
        )
        .await
        .unwrap();

    let broker = event_bus::InMemoryBroker::new(
        2,
        Arc::new(event_bus::InMemoryDeadLetters::new()),
    );
    let publisher = Arc::new(event_bus::EventPublisher::new(Arc::new(broker.clone())));
    let provider = SandboxPaymentProvider::new();
    let service = Arc::new(PaymentService::new(
        Arc::new(ledger.clone()),
        Arc::new(provider.clone()),
        publisher,
        PaymentsConfig::default(),
    ));

    let first = service
        .create_order(CreateOrder::months(UserId::new(1), vec![month("2025-01")]))
        .await
        .unwrap();
    let second = service
        .create_order(CreateOrder::months(UserId::new(1), vec![month("2025-01")]))
        .await
        .unwrap();

    let captures = [&first, &first, &first, &second, &second].map(|order| {
        let service = service.clone();
        let order_id = order.provider_order_id.clone();
        tokio::spawn(async move { service.capture(&order_id).await })
    });
    let results: Vec<_> = join_all(captures)
        .await
        .into_iter()
        .map(|joined| joined.unwrap())
        .collect();

    let paid = results
        .iter()
        .filter(|r| matches!(r, Ok(c) if c.outcome == CaptureOutcome::Paid))
        .count();
    assert_eq!(paid, 1);
    assert!(
        results
            .iter()
            .all(|r| r.is_ok() || matches!(r, Err(PaymentError::PeriodAlreadyPaid(_))))
    );
    assert_eq!(provider.capture_calls(), 1);
    assert_eq!(
        broker
            .published(event_bus::topics::PAYMENT_RECEIVED)
            .len(),
        1
    );
    assert_eq!(ledger.paid_periods(UserId::new(1)).await.unwrap().len(), 1);
}
