//! Enrollment service replica: who the members are and what they signed up for.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDateTime;
use common::{TrainingId, UserId};
use event_bus::topics::event_type;
use event_bus::{
    EnrollmentCreated, EventEnvelope, EventHandler, HandlerError, UserDeleted, UserRegistered,
};
use tokio::sync::RwLock;

use crate::applied::{AppliedEvents, skip_duplicate};

/// Local copy of a member's profile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberSnapshot {
    pub user_id: UserId,
    pub username: String,
    pub email: String,
    pub club_name: Option<String>,
    pub karate_rank: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Enrollment {
    pub user_id: UserId,
    pub training_id: TrainingId,
    pub description: String,
    pub starts_at: NaiveDateTime,
    pub ends_at: NaiveDateTime,
}

#[derive(Debug, Default)]
struct RosterState {
    members: HashMap<UserId, MemberSnapshot>,
    enrollments: BTreeMap<(UserId, TrainingId), Enrollment>,
    applied: AppliedEvents,
}

impl RosterState {
    fn apply_registered(&mut self, p: UserRegistered) {
        match self.members.get_mut(&p.user_id) {
            Some(member) => {
                member.username = p.username;
                member.email = p.email;
                if p.club_name.is_some() {
                    member.club_name = p.club_name;
                }
                if p.karate_rank.is_some() {
                    member.karate_rank = p.karate_rank;
                }
            }
            None => {
                self.members.insert(
                    p.user_id,
                    MemberSnapshot {
                        user_id: p.user_id,
                        username: p.username,
                        email: p.email,
                        club_name: p.club_name,
                        karate_rank: p.karate_rank,
                    },
                );
            }
        }
    }

    fn apply_enrollment(&mut self, p: EnrollmentCreated) {
        // The enrollment carries contact details only; club and rank stay.
        self.members
            .entry(p.user_id)
            .and_modify(|m| {
                m.username = p.username.clone();
                m.email = p.user_email.clone();
            })
            .or_insert_with(|| MemberSnapshot {
                user_id: p.user_id,
                username: p.username.clone(),
                email: p.user_email.clone(),
                club_name: None,
                karate_rank: None,
            });
        self.enrollments.insert(
            (p.user_id, p.training_id),
            Enrollment {
                user_id: p.user_id,
                training_id: p.training_id,
                description: p.training_description,
                starts_at: p.training_start,
                ends_at: p.training_end,
            },
        );
    }

    fn apply_deleted(&mut self, user_id: UserId) -> usize {
        let member = usize::from(self.members.remove(&user_id).is_some());
        let before = self.enrollments.len();
        self.enrollments.retain(|(user, _), _| *user != user_id);
        member + (before - self.enrollments.len())
    }
}

/// Keeps member snapshots and enrollments in step with the user and
/// enrollment topics.
#[derive(Clone, Default)]
pub struct EnrollmentRosterConsumer {
    state: Arc<RwLock<RosterState>>,
}

impl EnrollmentRosterConsumer {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn member(&self, user_id: UserId) -> Option<MemberSnapshot> {
        self.state.read().await.members.get(&user_id).cloned()
    }

    pub async fn enrollments_of(&self, user_id: UserId) -> Vec<Enrollment> {
        self.state
            .read()
            .await
            .enrollments
            .range((user_id, TrainingId::new(i64::MIN))..=(user_id, TrainingId::new(i64::MAX)))
            .map(|(_, e)| e.clone())
            .collect()
    }

    pub async fn member_count(&self) -> usize {
        self.state.read().await.members.len()
    }

    pub async fn applied_count(&self) -> usize {
        self.state.read().await.applied.len()
    }
}

#[async_trait]
impl EventHandler for EnrollmentRosterConsumer {
    fn name(&self) -> &'static str {
        "EnrollmentRosterConsumer"
    }

    #[tracing::instrument(skip(self, envelope), fields(event_id = %envelope.event_id, event_type = %envelope.event_type))]
    async fn handle(&self, envelope: &EventEnvelope) -> Result<(), HandlerError> {
        let mut state = self.state.write().await;
        if state.applied.contains(&envelope.event_id) {
            skip_duplicate(self.name(), &envelope.event_id);
            return Ok(());
        }

        match envelope.event_type.as_str() {
            event_type::USER_REGISTERED => {
                let payload: UserRegistered = envelope.decode()?;
                tracing::info!(user_id = %payload.user_id, "member snapshot upserted");
                state.apply_registered(payload);
            }
            event_type::ENROLLMENT_CREATED => {
                let payload: EnrollmentCreated = envelope.decode()?;
                tracing::info!(
                    user_id = %payload.user_id,
                    training_id = %payload.training_id,
                    "enrollment recorded"
                );
                state.apply_enrollment(payload);
            }
            event_type::USER_DELETED => {
                let payload: UserDeleted = envelope.decode()?;
                let removed = state.apply_deleted(payload.user_id);
                tracing::info!(user_id = %payload.user_id, removed, "member removed");
            }
            other => {
                tracing::debug!(event_type = other, "ignoring unknown event type");
                return Ok(());
            }
        }

        state.applied.record(envelope.event_id);
        Ok(())
    }
}
