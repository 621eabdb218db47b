//! Short-lived cache of remote facts.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{PoisonError, RwLock};
use std::time::Duration;

use tokio::time::Instant;

/// Maximum age per fact kind before a cached answer is no longer served.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheTtls {
    pub club: Duration,
    pub user: Duration,
    pub identity: Duration,
    pub training: Duration,
}

impl Default for CacheTtls {
    fn default() -> Self {
        Self {
            club: Duration::from_secs(300),
            user: Duration::from_secs(60),
            identity: Duration::from_secs(60),
            training: Duration::from_secs(30),
        }
    }
}

impl CacheTtls {
    /// Reads `GATEWAY_CACHE_{CLUB,USER,IDENTITY,TRAINING}_TTL_SECS`.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let secs = |key: &str, default: Duration| {
            std::env::var(key)
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_secs)
                .unwrap_or(default)
        };
        Self {
            club: secs("GATEWAY_CACHE_CLUB_TTL_SECS", defaults.club),
            user: secs("GATEWAY_CACHE_USER_TTL_SECS", defaults.user),
            identity: secs("GATEWAY_CACHE_IDENTITY_TTL_SECS", defaults.identity),
            training: secs("GATEWAY_CACHE_TRAINING_TTL_SECS", defaults.training),
        }
    }
}

/// Cached answers of one kind, each stamped with the time it was fetched.
///
/// Entries are never authoritative; they only stand in for the remote while
/// it is unavailable.
#[derive(Debug)]
pub struct FactCache<K, V> {
    ttl: Duration,
    entries: RwLock<HashMap<K, (V, Instant)>>,
}

impl<K, V> FactCache<K, V>
where
    K: Eq + Hash,
    V: Clone,
{
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Stores a freshly fetched value and drops entries past the TTL, which
    /// can no longer be served.
    pub fn put(&self, key: K, value: V) {
        let ttl = self.ttl;
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries.retain(|_, (_, fetched_at)| fetched_at.elapsed() <= ttl);
        entries.insert(key, (value, Instant::now()));
    }

    /// Returns the value if it was fetched within the TTL.
    pub fn get_fresh(&self, key: &K) -> Option<V> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries
            .get(key)
            .filter(|(_, fetched_at)| fetched_at.elapsed() <= self.ttl)
            .map(|(value, _)| value.clone())
    }

    pub fn invalidate(&self, key: &K) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
    }

    /// Drops every entry whose value matches `predicate`.
    pub fn invalidate_where(&self, predicate: impl Fn(&V) -> bool) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|_, (value, _)| !predicate(value));
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
