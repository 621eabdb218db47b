//! Feedback service rows and their cleanup when a member is deleted.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{TrainingId, UserId};
use event_bus::topics::event_type;
use event_bus::{EventEnvelope, EventHandler, HandlerError, UserDeleted};
use tokio::sync::RwLock;

use crate::applied::{AppliedEvents, skip_duplicate};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Feedback {
    pub id: u64,
    pub user_id: UserId,
    pub training_id: TrainingId,
    pub comment: String,
    pub stars: u8,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct FeedbackState {
    rows: Vec<Feedback>,
    next_id: u64,
    applied: AppliedEvents,
}

/// Feedback left by members after trainings.
#[derive(Debug, Clone, Default)]
pub struct FeedbackStore {
    state: Arc<RwLock<FeedbackState>>,
}

impl FeedbackStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add(
        &self,
        user_id: UserId,
        training_id: TrainingId,
        comment: impl Into<String>,
        stars: u8,
    ) -> Feedback {
        let mut state = self.state.write().await;
        state.next_id += 1;
        let feedback = Feedback {
            id: state.next_id,
            user_id,
            training_id,
            comment: comment.into(),
            stars: stars.clamp(1, 5),
            created_at: Utc::now(),
        };
        state.rows.push(feedback.clone());
        feedback
    }

    pub async fn for_user(&self, user_id: UserId) -> Vec<Feedback> {
        self.state
            .read()
            .await
            .rows
            .iter()
            .filter(|f| f.user_id == user_id)
            .cloned()
            .collect()
    }

    pub async fn count(&self) -> usize {
        self.state.read().await.rows.len()
    }
}

/// Deletes a member's feedback when the member is deleted.
#[derive(Debug, Clone)]
pub struct FeedbackCleanupConsumer {
    store: FeedbackStore,
}

impl FeedbackCleanupConsumer {
    pub fn new(store: FeedbackStore) -> Self {
        Self { store }
    }
}

#[async_trait]
impl EventHandler for FeedbackCleanupConsumer {
    fn name(&self) -> &'static str {
        "FeedbackCleanupConsumer"
    }

    async fn handle(&self, envelope: &EventEnvelope) -> Result<(), HandlerError> {
        if envelope.event_type != event_type::USER_DELETED {
            tracing::debug!(event_type = %envelope.event_type, "ignoring unknown event type");
            return Ok(());
        }
        let payload: UserDeleted = envelope.decode()?;

        let mut state = self.store.state.write().await;
        if state.applied.contains(&envelope.event_id) {
            skip_duplicate(self.name(), &envelope.event_id);
            return Ok(());
        }
        let before = state.rows.len();
        state.rows.retain(|f| f.user_id != payload.user_id);
        let removed = before - state.rows.len();
        state.applied.record(envelope.event_id);

        tracing::info!(user_id = %payload.user_id, removed, "feedback removed for deleted user");
        Ok(())
    }
}
