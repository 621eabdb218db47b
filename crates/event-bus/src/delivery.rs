//! Handing one envelope to one handler, with bounded retries.

use std::time::Duration;

use chrono::Utc;

use crate::broker::EventHandler;
use crate::dead_letter::{DeadLetter, DeadLetterSink};
use crate::error::HandlerError;
use crate::event::EventEnvelope;

/// How hard a worker tries before parking an envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryPolicy {
    /// Attempts for transient handler failures, including the first.
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl Default for DeliveryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Duration::from_millis(50),
        }
    }
}

/// Where an envelope came from.
pub struct Origin<'a> {
    pub topic: &'a str,
    pub group: &'a str,
    pub key: &'a str,
}

/// Runs the handler until it succeeds, reports poison, or runs out of
/// attempts. Never returns an error: failures end in the dead-letter sink so
/// the partition keeps moving.
pub async fn deliver(
    handler: &dyn EventHandler,
    envelope: &EventEnvelope,
    origin: Origin<'_>,
    policy: DeliveryPolicy,
    dead_letters: &dyn DeadLetterSink,
) {
    let mut attempt = 1;
    let reason = loop {
        match handler.handle(envelope).await {
            Ok(()) => {
                metrics::counter!(
                    "events_consumed_total",
                    "topic" => origin.topic.to_string(),
                    "handler" => handler.name()
                )
                .increment(1);
                return;
            }
            Err(HandlerError::Poison(reason)) => break reason,
            Err(HandlerError::Transient(reason)) => {
                if attempt >= policy.max_attempts {
                    break reason;
                }
                tracing::warn!(
                    handler = handler.name(),
                    event_id = %envelope.event_id,
                    attempt,
                    %reason,
                    "handler failed, retrying"
                );
                attempt += 1;
                tokio::time::sleep(policy.backoff * attempt).await;
            }
        }
    };

    dead_letters
        .park(DeadLetter {
            topic: origin.topic.to_string(),
            group: origin.group.to_string(),
            handler: handler.name().to_string(),
            key: origin.key.to_string(),
            envelope: envelope.clone(),
            reason,
            attempts: attempt,
            failed_at: Utc::now(),
        })
        .await;
}
