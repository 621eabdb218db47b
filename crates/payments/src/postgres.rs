use std::collections::{BTreeSet, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, SubsecRound, Utc};
use common::{BillingPeriod, ClubId, Money, PaymentId, UserId};
use event_bus::EventId;
use sqlx::postgres::PgRow;
use sqlx::{PgConnection, PgPool, Postgres, Row, Transaction};

use crate::error::LedgerError;
use crate::ledger::{LedgerResult, PaymentLedger, PaymentLock};
use crate::model::{
    AccountChange, AccountUpsert, NewPayment, Payment, PaymentItem, PaymentStatus, UserAccount,
};

const PAYMENT_COLUMNS: &str = "payment_id, user_id, provider, provider_order_id, currency, \
                               amount_cents, status, created_at, paid_at";

/// PostgreSQL-backed payment ledger.
///
/// The partial unique index `unique_paid_period` enforces one PAID item per
/// member and month. Capture holds a row lock on the payment plus a
/// transaction-scoped advisory lock keyed by the member id.
#[derive(Clone)]
pub struct PostgresLedger {
    pool: PgPool,
}

impl PostgresLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Runs the database migrations.
    pub async fn run_migrations(&self) -> LedgerResult<()> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }
}

fn corrupt(what: impl std::fmt::Display) -> LedgerError {
    LedgerError::Corrupt(what.to_string())
}

fn row_to_account(row: &PgRow) -> LedgerResult<UserAccount> {
    Ok(UserAccount {
        user_id: UserId::new(row.try_get("user_id")?),
        email: row.try_get("email")?,
        username: row.try_get("username")?,
        registration_date: row.try_get("registration_date")?,
        club_id: row.try_get::<Option<i64>, _>("club_id")?.map(ClubId::new),
        club_name: row.try_get("club_name")?,
        karate_rank: row.try_get("karate_rank")?,
    })
}

fn row_to_payment(row: &PgRow, items: Vec<PaymentItem>) -> LedgerResult<Payment> {
    Ok(Payment {
        id: PaymentId::new(row.try_get("payment_id")?),
        user_id: UserId::new(row.try_get("user_id")?),
        provider: row.try_get::<String, _>("provider")?.parse().map_err(corrupt)?,
        provider_order_id: row.try_get("provider_order_id")?,
        currency: row.try_get("currency")?,
        amount: Money::from_cents(row.try_get("amount_cents")?),
        status: row.try_get::<String, _>("status")?.parse().map_err(corrupt)?,
        created_at: row.try_get("created_at")?,
        paid_at: row.try_get("paid_at")?,
        items,
    })
}

fn row_to_item(row: &PgRow) -> LedgerResult<PaymentItem> {
    Ok(PaymentItem {
        period: row.try_get::<String, _>("period")?.parse().map_err(corrupt)?,
        amount: Money::from_cents(row.try_get("amount_cents")?),
        status: row.try_get::<String, _>("status")?.parse().map_err(corrupt)?,
    })
}

/// Items of the given payments, keyed by payment id, each list chronological.
async fn items_of(
    conn: &mut PgConnection,
    payment_ids: &[i64],
) -> LedgerResult<HashMap<i64, Vec<PaymentItem>>> {
    let rows = sqlx::query(
        "SELECT payment_id, period, amount_cents, status FROM payment_items \
         WHERE payment_id = ANY($1) ORDER BY payment_id, period",
    )
    .bind(payment_ids)
    .fetch_all(conn)
    .await?;

    let mut items: HashMap<i64, Vec<PaymentItem>> = HashMap::new();
    for row in &rows {
        let payment_id: i64 = row.try_get("payment_id")?;
        items.entry(payment_id).or_default().push(row_to_item(row)?);
    }
    Ok(items)
}

/// Serializes writers touching one member's PAID items.
async fn lock_member(conn: &mut PgConnection, user_id: UserId) -> LedgerResult<()> {
    sqlx::query("SELECT pg_advisory_xact_lock($1)")
        .bind(user_id.as_i64())
        .execute(conn)
        .await?;
    Ok(())
}

/// Maps a hit on the one-PAID-item-per-month index to a ledger conflict.
fn paid_conflict(err: sqlx::Error, user_id: UserId, periods: &[BillingPeriod]) -> LedgerError {
    if let sqlx::Error::Database(db) = &err
        && db.constraint() == Some("unique_paid_period")
        && let Some(period) = periods.first()
    {
        return LedgerError::PeriodAlreadyPaid {
            user_id,
            period: *period,
        };
    }
    LedgerError::Database(err)
}

async fn upsert_account(conn: &mut PgConnection, upsert: AccountUpsert) -> LedgerResult<()> {
    let explicit_date = upsert.registration_date;
    let account = upsert.into_account();
    sqlx::query(
        r#"
        INSERT INTO user_account
            (user_id, email, username, registration_date, club_id, club_name, karate_rank)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        ON CONFLICT (user_id) DO UPDATE SET
            email = EXCLUDED.email,
            username = EXCLUDED.username,
            registration_date = COALESCE($8, user_account.registration_date),
            club_id = COALESCE(EXCLUDED.club_id, user_account.club_id),
            club_name = COALESCE(EXCLUDED.club_name, user_account.club_name),
            karate_rank = COALESCE(EXCLUDED.karate_rank, user_account.karate_rank)
        "#,
    )
    .bind(account.user_id.as_i64())
    .bind(&account.email)
    .bind(&account.username)
    .bind(account.registration_date)
    .bind(account.club_id.map(|c| c.as_i64()))
    .bind(&account.club_name)
    .bind(&account.karate_rank)
    .bind(explicit_date)
    .execute(conn)
    .await?;
    Ok(())
}

/// Takes locks in capture order (payment rows, then the member lock) before
/// removing anything, so a concurrent capture waits instead of deadlocking.
async fn delete_member(conn: &mut PgConnection, user_id: UserId) -> LedgerResult<u64> {
    sqlx::query("SELECT payment_id FROM payments WHERE user_id = $1 ORDER BY payment_id FOR UPDATE")
        .bind(user_id.as_i64())
        .fetch_all(&mut *conn)
        .await?;
    lock_member(&mut *conn, user_id).await?;

    sqlx::query("DELETE FROM payment_items WHERE user_id = $1")
        .bind(user_id.as_i64())
        .execute(&mut *conn)
        .await?;
    let removed = sqlx::query("DELETE FROM payments WHERE user_id = $1")
        .bind(user_id.as_i64())
        .execute(&mut *conn)
        .await?
        .rows_affected();
    sqlx::query("DELETE FROM user_account WHERE user_id = $1")
        .bind(user_id.as_i64())
        .execute(&mut *conn)
        .await?;
    Ok(removed)
}

#[async_trait]
impl PaymentLedger for PostgresLedger {
    async fn account(&self, user_id: UserId) -> LedgerResult<Option<UserAccount>> {
        let row = sqlx::query("SELECT * FROM user_account WHERE user_id = $1")
            .bind(user_id.as_i64())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_account).transpose()
    }

    async fn accounts(&self) -> LedgerResult<Vec<UserAccount>> {
        let rows = sqlx::query("SELECT * FROM user_account ORDER BY user_id")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_account).collect()
    }

    async fn apply_account_event(
        &self,
        consumer: &str,
        event_id: EventId,
        change: AccountChange,
    ) -> LedgerResult<bool> {
        let mut tx = self.pool.begin().await?;

        let fresh = sqlx::query(
            "INSERT INTO applied_events (consumer, event_id) VALUES ($1, $2) \
             ON CONFLICT DO NOTHING",
        )
        .bind(consumer)
        .bind(event_id.as_uuid())
        .execute(&mut *tx)
        .await?
        .rows_affected()
            == 1;
        if !fresh {
            tx.rollback().await?;
            return Ok(false);
        }

        match change {
            AccountChange::Upsert(upsert) => upsert_account(&mut tx, upsert).await?,
            AccountChange::Delete(user_id) => {
                let removed = delete_member(&mut tx, user_id).await?;
                tracing::debug!(%user_id, removed, "member removed from ledger");
            }
        }

        tx.commit().await?;
        Ok(true)
    }

    async fn paid_periods(&self, user_id: UserId) -> LedgerResult<BTreeSet<BillingPeriod>> {
        let periods: Vec<String> = sqlx::query_scalar(
            "SELECT period FROM payment_items WHERE user_id = $1 AND status = 'PAID'",
        )
        .bind(user_id.as_i64())
        .fetch_all(&self.pool)
        .await?;
        periods
            .iter()
            .map(|p| p.parse().map_err(corrupt))
            .collect()
    }

    async fn insert_payment(&self, payment: NewPayment) -> LedgerResult<Payment> {
        let mut tx = self.pool.begin().await?;
        let now = Utc::now().trunc_subsecs(6);

        if payment.status == PaymentStatus::Paid {
            lock_member(&mut tx, payment.user_id).await?;
        }

        let inserted = sqlx::query(
            "INSERT INTO payments \
             (user_id, provider, provider_order_id, currency, amount_cents, status, created_at, paid_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8) RETURNING payment_id",
        )
        .bind(payment.user_id.as_i64())
        .bind(payment.provider.as_str())
        .bind(&payment.provider_order_id)
        .bind(&payment.currency)
        .bind(payment.amount().cents())
        .bind(payment.status.as_str())
        .bind(now)
        .bind(payment.status.is_terminal().then_some(now))
        .fetch_one(&mut *tx)
        .await;
        let payment_id: i64 = match inserted {
            Ok(row) => row.try_get("payment_id")?,
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                let order = payment.provider_order_id.clone().unwrap_or_default();
                return Err(LedgerError::DuplicateOrder(order));
            }
            Err(err) => return Err(err.into()),
        };

        for period in &payment.periods {
            sqlx::query(
                "INSERT INTO payment_items (payment_id, user_id, period, amount_cents, status) \
                 VALUES ($1, $2, $3, $4, $5)",
            )
            .bind(payment_id)
            .bind(payment.user_id.as_i64())
            .bind(period.to_string())
            .bind(payment.monthly_fee.cents())
            .bind(payment.status.as_str())
            .execute(&mut *tx)
            .await
            .map_err(|e| paid_conflict(e, payment.user_id, std::slice::from_ref(period)))?;
        }

        tx.commit().await?;
        Ok(payment.into_payment(PaymentId::new(payment_id), now))
    }

    async fn lock_by_order(
        &self,
        provider_order_id: &str,
    ) -> LedgerResult<Option<Box<dyn PaymentLock>>> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(&format!(
            "SELECT {PAYMENT_COLUMNS} FROM payments WHERE provider_order_id = $1 FOR UPDATE"
        ))
        .bind(provider_order_id)
        .fetch_optional(&mut *tx)
        .await?;
        let Some(row) = row else {
            tx.rollback().await?;
            return Ok(None);
        };

        let payment_id: i64 = row.try_get("payment_id")?;
        let user_id = UserId::new(row.try_get("user_id")?);
        lock_member(&mut tx, user_id).await?;

        let items = items_of(&mut tx, &[payment_id])
            .await?
            .remove(&payment_id)
            .unwrap_or_default();
        let payment = row_to_payment(&row, items)?;

        Ok(Some(Box::new(PostgresPaymentLock { tx, payment })))
    }

    async fn history(&self, user_id: UserId) -> LedgerResult<Vec<Payment>> {
        let mut conn = self.pool.acquire().await?;
        let rows = sqlx::query(&format!(
            "SELECT {PAYMENT_COLUMNS} FROM payments WHERE user_id = $1 \
             ORDER BY created_at DESC, payment_id DESC"
        ))
        .bind(user_id.as_i64())
        .fetch_all(&mut *conn)
        .await?;

        let ids = rows
            .iter()
            .map(|r| r.try_get::<i64, _>("payment_id"))
            .collect::<Result<Vec<_>, _>>()?;
        let mut items = items_of(&mut conn, &ids).await?;

        rows.iter()
            .zip(ids)
            .map(|(row, id)| row_to_payment(row, items.remove(&id).unwrap_or_default()))
            .collect()
    }
}

/// Open transaction holding the payment row and the member's advisory lock.
/// Dropping it rolls back.
struct PostgresPaymentLock {
    tx: Transaction<'static, Postgres>,
    payment: Payment,
}

#[async_trait]
impl PaymentLock for PostgresPaymentLock {
    fn payment(&self) -> &Payment {
        &self.payment
    }

    async fn conflicting_periods(&mut self) -> LedgerResult<Vec<BillingPeriod>> {
        let periods: Vec<String> = self.payment.periods().iter().map(ToString::to_string).collect();
        let conflicts: Vec<String> = sqlx::query_scalar(
            "SELECT period FROM payment_items \
             WHERE user_id = $1 AND status = 'PAID' AND payment_id <> $2 AND period = ANY($3) \
             ORDER BY period",
        )
        .bind(self.payment.user_id.as_i64())
        .bind(self.payment.id.as_i64())
        .bind(&periods)
        .fetch_all(&mut *self.tx)
        .await?;
        conflicts
            .iter()
            .map(|p| p.parse().map_err(corrupt))
            .collect()
    }

    async fn mark_paid(self: Box<Self>, paid_at: DateTime<Utc>) -> LedgerResult<Payment> {
        let PostgresPaymentLock {
            mut tx,
            mut payment,
        } = *self;
        let paid_at = paid_at.trunc_subsecs(6);

        sqlx::query("UPDATE payments SET status = 'PAID', paid_at = $2 WHERE payment_id = $1")
            .bind(payment.id.as_i64())
            .bind(paid_at)
            .execute(&mut *tx)
            .await?;
        sqlx::query("UPDATE payment_items SET status = 'PAID' WHERE payment_id = $1")
            .bind(payment.id.as_i64())
            .execute(&mut *tx)
            .await
            .map_err(|e| paid_conflict(e, payment.user_id, &payment.periods()))?;
        tx.commit().await?;

        payment.mark_paid(paid_at);
        Ok(payment)
    }

    async fn release(self: Box<Self>) -> LedgerResult<()> {
        self.tx.rollback().await?;
        Ok(())
    }
}
