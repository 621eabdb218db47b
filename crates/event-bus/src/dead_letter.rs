use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::event::EventEnvelope;

/// An envelope a handler gave up on, parked with the reason.
#[derive(Debug, Clone, PartialEq)]
pub struct DeadLetter {
    pub topic: String,
    pub group: String,
    pub handler: String,
    pub key: String,
    pub envelope: EventEnvelope,
    pub reason: String,
    pub attempts: u32,
    pub failed_at: DateTime<Utc>,
}

/// Destination for envelopes that cannot be applied.
#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    async fn park(&self, letter: DeadLetter);
}

/// Dead letters kept in memory for inspection.
#[derive(Debug, Clone, Default)]
pub struct InMemoryDeadLetters {
    letters: Arc<RwLock<Vec<DeadLetter>>>,
}

impl InMemoryDeadLetters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn letters(&self) -> Vec<DeadLetter> {
        self.letters
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn len(&self) -> usize {
        self.letters
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl DeadLetterSink for InMemoryDeadLetters {
    async fn park(&self, letter: DeadLetter) {
        tracing::error!(
            topic = %letter.topic,
            group = %letter.group,
            handler = %letter.handler,
            event_id = %letter.envelope.event_id,
            event_type = %letter.envelope.event_type,
            reason = %letter.reason,
            "event dead-lettered"
        );
        metrics::counter!("events_dead_lettered_total", "topic" => letter.topic.clone())
            .increment(1);
        self.letters
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(letter);
    }
}
