use std::fmt::Debug;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;

use common::{ClubId, TrainingId, UserId};
use resilience::{CallError, GateError, GateRegistry};

use crate::cache::{CacheTtls, FactCache};
use crate::error::{Result, UpstreamError};
use crate::pending::PendingCall;
use crate::remote::{ClubDirectory, ClubInfo, IdentityDirectory, TrainingDirectory, UserDirectory};

/// Dependency names used as gate keys.
pub mod dependency {
    pub const CLUB: &str = "club-service";
    pub const USER: &str = "user-service";
    pub const IDENTITY: &str = "identity-service";
    pub const TRAINING: &str = "training-service";
}

/// Whether a read may be answered from cache when the remote is down.
///
/// Existence checks usually tolerate staleness; anything that decides about
/// money must not.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Staleness {
    Tolerate,
    Reject,
}

/// Remote clients the gateway reads through.
#[derive(Clone)]
pub struct Remotes {
    pub clubs: Arc<dyn ClubDirectory>,
    pub users: Arc<dyn UserDirectory>,
    pub identities: Arc<dyn IdentityDirectory>,
    pub trainings: Arc<dyn TrainingDirectory>,
}

impl Remotes {
    /// Uses one client for every dependency.
    pub fn uniform<D>(directory: Arc<D>) -> Self
    where
        D: ClubDirectory + UserDirectory + IdentityDirectory + TrainingDirectory + 'static,
    {
        Self {
            clubs: directory.clone(),
            users: directory.clone(),
            identities: directory.clone(),
            trainings: directory,
        }
    }
}

struct Caches {
    clubs_by_name: FactCache<String, ClubInfo>,
    clubs_by_id: FactCache<ClubId, ClubInfo>,
    users: FactCache<UserId, bool>,
    usernames: FactCache<String, UserId>,
    trainings: FactCache<TrainingId, bool>,
}

/// Facade over every remote fact this service needs.
///
/// Cheap to clone; clones share gates and caches.
#[derive(Clone)]
pub struct UpstreamGateway {
    remotes: Remotes,
    gates: Arc<GateRegistry>,
    caches: Arc<Caches>,
}

impl UpstreamGateway {
    pub fn new(remotes: Remotes, gates: Arc<GateRegistry>, ttls: CacheTtls) -> Self {
        Self {
            remotes,
            gates,
            caches: Arc::new(Caches {
                clubs_by_name: FactCache::new(ttls.club),
                clubs_by_id: FactCache::new(ttls.club),
                users: FactCache::new(ttls.user),
                usernames: FactCache::new(ttls.identity),
                trainings: FactCache::new(ttls.training),
            }),
        }
    }

    pub fn gates(&self) -> &GateRegistry {
        &self.gates
    }

    #[tracing::instrument(skip(self))]
    pub async fn club_by_name(&self, name: &str, policy: Staleness) -> Result<ClubInfo> {
        let club = self
            .read(
                dependency::CLUB,
                &self.caches.clubs_by_name,
                name.to_string(),
                policy,
                || self.remotes.clubs.club_by_name(name),
            )
            .await?;
        self.caches.clubs_by_id.put(club.id, club.clone());
        Ok(club)
    }

    #[tracing::instrument(skip(self))]
    pub async fn club_by_id(&self, id: ClubId, policy: Staleness) -> Result<ClubInfo> {
        let club = self
            .read(
                dependency::CLUB,
                &self.caches.clubs_by_id,
                id,
                policy,
                || self.remotes.clubs.club_by_id(id),
            )
            .await?;
        self.caches.clubs_by_name.put(club.name.clone(), club.clone());
        Ok(club)
    }

    #[tracing::instrument(skip(self))]
    pub async fn check_user_exists(&self, id: UserId, policy: Staleness) -> Result<bool> {
        self.read(dependency::USER, &self.caches.users, id, policy, || {
            self.remotes.users.user_exists(id)
        })
        .await
    }

    #[tracing::instrument(skip(self))]
    pub async fn user_id_by_username(&self, username: &str, policy: Staleness) -> Result<UserId> {
        self.read(
            dependency::IDENTITY,
            &self.caches.usernames,
            username.to_string(),
            policy,
            || self.remotes.identities.user_id_by_username(username),
        )
        .await
    }

    #[tracing::instrument(skip(self))]
    pub async fn check_training_exists(&self, id: TrainingId, policy: Staleness) -> Result<bool> {
        self.read(dependency::TRAINING, &self.caches.trainings, id, policy, || {
            self.remotes.trainings.training_exists(id)
        })
        .await
    }

    /// Renames a user at the identity provider without blocking the caller.
    ///
    /// The returned handle resolves once the remote confirms; dropping it
    /// leaves the remote call running.
    pub fn update_username(&self, id: UserId, username: impl Into<String>) -> PendingCall<()> {
        let username = username.into();
        let gateway = self.clone();
        PendingCall::spawn(dependency::IDENTITY, async move {
            let gate = gateway.gates.gate(dependency::IDENTITY);
            let identities = gateway.remotes.identities.clone();
            gate.call(|| identities.update_username(id, &username))
                .await
                .map_err(UpstreamError::from)?;
            gateway.caches.usernames.invalidate_where(|cached| *cached == id);
            gateway.caches.usernames.put(username, id);
            tracing::info!(%id, "username updated upstream");
            Ok(())
        })
    }

    /// Removes a user's identity without blocking the caller.
    pub fn delete_identity(&self, id: UserId) -> PendingCall<()> {
        let gateway = self.clone();
        PendingCall::spawn(dependency::IDENTITY, async move {
            let gate = gateway.gates.gate(dependency::IDENTITY);
            let identities = gateway.remotes.identities.clone();
            gate.call(|| identities.delete_identity(id))
                .await
                .map_err(UpstreamError::from)?;
            gateway.caches.usernames.invalidate_where(|cached| *cached == id);
            gateway.caches.users.invalidate(&id);
            tracing::info!(%id, "identity deleted upstream");
            Ok(())
        })
    }

    async fn read<K, V, F, Fut>(
        &self,
        dependency: &str,
        cache: &FactCache<K, V>,
        key: K,
        policy: Staleness,
        op: F,
    ) -> Result<V>
    where
        K: Eq + Hash + Debug,
        V: Clone,
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<V, CallError>>,
    {
        let gate = self.gates.gate(dependency);
        match gate.call(op).await {
            Ok(value) => {
                cache.put(key, value.clone());
                Ok(value)
            }
            Err(GateError::Unavailable { dependency, reason }) => {
                if policy == Staleness::Tolerate
                    && let Some(value) = cache.get_fresh(&key)
                {
                    metrics::counter!("gateway_stale_reads_total", "dependency" => dependency.clone())
                        .increment(1);
                    tracing::warn!(%dependency, %reason, ?key, "serving cached fact while upstream unavailable");
                    return Ok(value);
                }
                tracing::warn!(%dependency, %reason, ?policy, ?key, "upstream unavailable");
                Err(UpstreamError::Unavailable {
                    dependency,
                    reason: reason.to_string(),
                })
            }
            Err(semantic) => Err(semantic.into()),
        }
    }
}
