//! Client contracts for the remote services the gateway talks to.
//!
//! Implementations report transport trouble as [`CallError::Transient`] or
//! [`CallError::Timeout`] and negative answers as the semantic variants.

use async_trait::async_trait;
use common::{ClubId, TrainingId, UserId};
use resilience::CallError;

/// Club as known by the club service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClubInfo {
    pub id: ClubId,
    pub name: String,
}

#[async_trait]
pub trait ClubDirectory: Send + Sync {
    async fn club_by_name(&self, name: &str) -> Result<ClubInfo, CallError>;

    async fn club_by_id(&self, id: ClubId) -> Result<ClubInfo, CallError>;
}

#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn user_exists(&self, id: UserId) -> Result<bool, CallError>;
}

/// The identity provider holding login names.
#[async_trait]
pub trait IdentityDirectory: Send + Sync {
    async fn user_id_by_username(&self, username: &str) -> Result<UserId, CallError>;

    async fn update_username(&self, id: UserId, username: &str) -> Result<(), CallError>;

    async fn delete_identity(&self, id: UserId) -> Result<(), CallError>;
}

#[async_trait]
pub trait TrainingDirectory: Send + Sync {
    async fn training_exists(&self, id: TrainingId) -> Result<bool, CallError>;
}
