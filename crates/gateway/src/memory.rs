//! In-memory stand-in for the remote services.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use common::{ClubId, TrainingId, UserId};
use resilience::CallError;

use crate::remote::{ClubDirectory, ClubInfo, IdentityDirectory, TrainingDirectory, UserDirectory};

#[derive(Debug, Default)]
struct DirectoryState {
    clubs: HashMap<ClubId, String>,
    users: HashSet<UserId>,
    usernames: HashMap<String, UserId>,
    trainings: HashSet<TrainingId>,
    outage: bool,
    latency: Option<Duration>,
}

/// Club, user, identity and training directory held in memory.
///
/// `set_outage` makes every call fail transiently and `set_latency` delays
/// every answer, which is enough to drive gates through their states.
#[derive(Debug, Clone, Default)]
pub struct InMemoryDirectory {
    state: Arc<RwLock<DirectoryState>>,
    calls: Arc<AtomicU32>,
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_club(&self, id: ClubId, name: impl Into<String>) {
        self.write(|s| {
            s.clubs.insert(id, name.into());
        });
    }

    pub fn add_user(&self, id: UserId, username: impl Into<String>) {
        self.write(|s| {
            s.users.insert(id);
            s.usernames.insert(username.into(), id);
        });
    }

    pub fn add_training(&self, id: TrainingId) {
        self.write(|s| {
            s.trainings.insert(id);
        });
    }

    /// Makes every subsequent call fail with a transport error.
    pub fn set_outage(&self, outage: bool) {
        self.write(|s| s.outage = outage);
    }

    pub fn set_latency(&self, latency: Option<Duration>) {
        self.write(|s| s.latency = latency);
    }

    /// Number of calls that reached this directory.
    pub fn call_count(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn username_of(&self, id: UserId) -> Option<String> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        state
            .usernames
            .iter()
            .find(|(_, user)| **user == id)
            .map(|(name, _)| name.clone())
    }

    fn write<R>(&self, f: impl FnOnce(&mut DirectoryState) -> R) -> R {
        f(&mut self.state.write().unwrap_or_else(PoisonError::into_inner))
    }

    /// Counts the call, applies latency and the outage switch.
    async fn enter(&self) -> Result<(), CallError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let (outage, latency) = {
            let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
            (state.outage, state.latency)
        };
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        if outage {
            return Err(CallError::Transient("connection refused".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl ClubDirectory for InMemoryDirectory {
    async fn club_by_name(&self, name: &str) -> Result<ClubInfo, CallError> {
        self.enter().await?;
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        state
            .clubs
            .iter()
            .find(|(_, club)| club.as_str() == name)
            .map(|(id, club)| ClubInfo {
                id: *id,
                name: club.clone(),
            })
            .ok_or_else(|| CallError::NotFound(format!("club {name}")))
    }

    async fn club_by_id(&self, id: ClubId) -> Result<ClubInfo, CallError> {
        self.enter().await?;
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        state
            .clubs
            .get(&id)
            .map(|name| ClubInfo {
                id,
                name: name.clone(),
            })
            .ok_or_else(|| CallError::NotFound(format!("club {id}")))
    }
}

#[async_trait]
impl UserDirectory for InMemoryDirectory {
    async fn user_exists(&self, id: UserId) -> Result<bool, CallError> {
        self.enter().await?;
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        Ok(state.users.contains(&id))
    }
}

#[async_trait]
impl IdentityDirectory for InMemoryDirectory {
    async fn user_id_by_username(&self, username: &str) -> Result<UserId, CallError> {
        self.enter().await?;
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        state
            .usernames
            .get(username)
            .copied()
            .ok_or_else(|| CallError::NotFound(format!("username {username}")))
    }

    async fn update_username(&self, id: UserId, username: &str) -> Result<(), CallError> {
        self.enter().await?;
        self.write(|s| {
            if let Some(owner) = s.usernames.get(username)
                && *owner != id
            {
                return Err(CallError::Conflict(format!("username {username} taken")));
            }
            if !s.users.contains(&id) {
                return Err(CallError::NotFound(format!("user {id}")));
            }
            s.usernames.retain(|_, user| *user != id);
            s.usernames.insert(username.to_string(), id);
            Ok(())
        })
    }

    async fn delete_identity(&self, id: UserId) -> Result<(), CallError> {
        self.enter().await?;
        self.write(|s| {
            s.users.remove(&id);
            s.usernames.retain(|_, user| *user != id);
        });
        Ok(())
    }
}

#[async_trait]
impl TrainingDirectory for InMemoryDirectory {
    async fn training_exists(&self, id: TrainingId) -> Result<bool, CallError> {
        self.enter().await?;
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        Ok(state.trainings.contains(&id))
    }
}
