use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::mpsc;

use crate::broker::Broker;
use crate::error::Result;
use crate::event::{EventEnvelope, EventId};
use crate::payloads::EventPayload;

struct Parked {
    topic: &'static str,
    key: String,
    envelope: EventEnvelope,
}

/// Publishes typed payloads, parking broker failures for later retry.
///
/// Call [`publish`](Self::publish) only after the change the event describes
/// has been committed locally. A broker outage never fails the caller: the
/// envelope is queued and [`run_retry_loop`](Self::run_retry_loop) keeps
/// trying, so delivery is at-least-once.
pub struct EventPublisher {
    broker: Arc<dyn Broker>,
    parked_tx: mpsc::UnboundedSender<Parked>,
    parked_rx: Mutex<Option<mpsc::UnboundedReceiver<Parked>>>,
    parked: AtomicUsize,
    base_backoff: Duration,
    max_backoff: Duration,
}

impl EventPublisher {
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        let (parked_tx, parked_rx) = mpsc::unbounded_channel();
        Self {
            broker,
            parked_tx,
            parked_rx: Mutex::new(Some(parked_rx)),
            parked: AtomicUsize::new(0),
            base_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(30),
        }
    }

    pub fn with_backoff(mut self, base: Duration, max: Duration) -> Self {
        self.base_backoff = base;
        self.max_backoff = max;
        self
    }

    /// Wraps `payload` in a fresh envelope and hands it to the broker.
    ///
    /// Returns the new event id. Fails only if the payload cannot be
    /// serialized.
    #[tracing::instrument(skip(self, payload), fields(event_type = P::EVENT_TYPE, topic = P::TOPIC))]
    pub async fn publish<P: EventPayload>(&self, payload: &P) -> Result<EventId> {
        let envelope = EventEnvelope::wrap(payload)?;
        let key = payload.partition_key();
        let event_id = envelope.event_id;

        match self.broker.publish(P::TOPIC, &key, &envelope).await {
            Ok(()) => {
                metrics::counter!("events_published_total", "topic" => P::TOPIC).increment(1);
                tracing::debug!(%event_id, %key, "event published");
            }
            Err(err) => {
                metrics::counter!("events_publish_failures_total", "topic" => P::TOPIC)
                    .increment(1);
                tracing::error!(%event_id, %key, error = %err, "publish failed, parked for retry");
                self.park(Parked {
                    topic: P::TOPIC,
                    key,
                    envelope,
                });
            }
        }
        Ok(event_id)
    }

    /// Number of envelopes waiting for the retry loop.
    pub fn pending_retries(&self) -> usize {
        self.parked.load(Ordering::SeqCst)
    }

    /// Drains parked envelopes forever, retrying each with capped
    /// exponential backoff until the broker accepts it.
    ///
    /// Only one loop may run per publisher; later calls return immediately.
    pub async fn run_retry_loop(&self) {
        let taken = self
            .parked_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(mut rx) = taken else {
            tracing::warn!("publisher retry loop already running");
            return;
        };

        tracing::info!("publisher retry loop started");
        while let Some(parked) = rx.recv().await {
            let mut attempt: u32 = 0;
            loop {
                match self
                    .broker
                    .publish(parked.topic, &parked.key, &parked.envelope)
                    .await
                {
                    Ok(()) => {
                        metrics::counter!("events_published_total", "topic" => parked.topic)
                            .increment(1);
                        tracing::info!(
                            event_id = %parked.envelope.event_id,
                            topic = parked.topic,
                            retries = attempt + 1,
                            "parked event published"
                        );
                        break;
                    }
                    Err(err) => {
                        let delay = self.backoff(attempt);
                        attempt = attempt.saturating_add(1);
                        tracing::warn!(
                            event_id = %parked.envelope.event_id,
                            topic = parked.topic,
                            error = %err,
                            ?delay,
                            "retry publish failed"
                        );
                        tokio::time::sleep(delay).await;
                    }
                }
            }
            self.parked.fetch_sub(1, Ordering::SeqCst);
        }
    }

    fn park(&self, parked: Parked) {
        self.parked.fetch_add(1, Ordering::SeqCst);
        if self.parked_tx.send(parked).is_err() {
            self.parked.fetch_sub(1, Ordering::SeqCst);
            tracing::error!("retry queue closed, event lost");
        }
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base_backoff
            .checked_mul(factor)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }
}
