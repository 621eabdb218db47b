//! Payment service's event consumers.

use std::sync::Arc;

use async_trait::async_trait;
use event_bus::topics::event_type;
use event_bus::{EventEnvelope, EventHandler, HandlerError, UserDeleted, UserRegistered};

use crate::ledger::PaymentLedger;
use crate::model::{AccountChange, AccountUpsert};

/// Hands one change to the ledger, which applies it atomically with the
/// envelope's applied marker.
async fn apply(
    ledger: &dyn PaymentLedger,
    consumer: &'static str,
    envelope: &EventEnvelope,
    change: AccountChange,
) -> Result<(), HandlerError> {
    let applied = ledger
        .apply_account_event(consumer, envelope.event_id, change)
        .await
        .map_err(|e| HandlerError::Transient(e.to_string()))?;
    if !applied {
        metrics::counter!("events_duplicates_skipped_total", "consumer" => consumer).increment(1);
        tracing::debug!(consumer, event_id = %envelope.event_id, "duplicate event skipped");
    }
    Ok(())
}

/// Keeps the `user_account` replica current from `user-registered`.
///
/// Fields the event leaves out keep their stored value. A new account with
/// no registration date is dated by the envelope timestamp.
#[derive(Clone)]
pub struct AccountReplicaConsumer {
    ledger: Arc<dyn PaymentLedger>,
}

impl AccountReplicaConsumer {
    pub fn new(ledger: Arc<dyn PaymentLedger>) -> Self {
        Self { ledger }
    }
}

#[async_trait]
impl EventHandler for AccountReplicaConsumer {
    fn name(&self) -> &'static str {
        "AccountReplicaConsumer"
    }

    #[tracing::instrument(skip(self, envelope), fields(event_id = %envelope.event_id))]
    async fn handle(&self, envelope: &EventEnvelope) -> Result<(), HandlerError> {
        if envelope.event_type != event_type::USER_REGISTERED {
            tracing::debug!(event_type = %envelope.event_type, "ignoring unknown event type");
            return Ok(());
        }
        let p: UserRegistered = envelope.decode()?;
        let user_id = p.user_id;
        let change = AccountChange::Upsert(AccountUpsert {
            user_id: p.user_id,
            email: p.email,
            username: p.username,
            registration_date: p.registration_date,
            observed_on: envelope.timestamp.date_naive(),
            club_id: p.club_id,
            club_name: p.club_name,
            karate_rank: p.karate_rank,
        });
        apply(self.ledger.as_ref(), self.name(), envelope, change).await?;
        tracing::info!(%user_id, "account replica updated");
        Ok(())
    }
}

/// Removes a member's items, payments and account on `user-deleted`, in
/// one transaction.
#[derive(Clone)]
pub struct AccountDeletionConsumer {
    ledger: Arc<dyn PaymentLedger>,
}

impl AccountDeletionConsumer {
    pub fn new(ledger: Arc<dyn PaymentLedger>) -> Self {
        Self { ledger }
    }
}

#[async_trait]
impl EventHandler for AccountDeletionConsumer {
    fn name(&self) -> &'static str {
        "AccountDeletionConsumer"
    }

    #[tracing::instrument(skip(self, envelope), fields(event_id = %envelope.event_id))]
    async fn handle(&self, envelope: &EventEnvelope) -> Result<(), HandlerError> {
        if envelope.event_type != event_type::USER_DELETED {
            tracing::debug!(event_type = %envelope.event_type, "ignoring unknown event type");
            return Ok(());
        }
        let p: UserDeleted = envelope.decode()?;
        apply(
            self.ledger.as_ref(),
            self.name(),
            envelope,
            AccountChange::Delete(p.user_id),
        )
        .await?;
        tracing::info!(user_id = %p.user_id, "member payments removed");
        Ok(())
    }
}
