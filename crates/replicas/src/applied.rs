use std::collections::{HashSet, VecDeque};
use std::time::Duration;

use event_bus::EventId;
use tokio::time::Instant;

/// How long an applied id is remembered. Matches the broker's redelivery
/// horizon; an envelope older than this is not replayed.
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Ids of envelopes a consumer has already applied.
///
/// Lives inside the same lock as the replica rows it guards. Ids are
/// forgotten once they are older than the retention window.
#[derive(Debug, Clone)]
pub struct AppliedEvents {
    retention: Duration,
    ids: HashSet<EventId>,
    recorded: VecDeque<(Instant, EventId)>,
}

impl Default for AppliedEvents {
    fn default() -> Self {
        Self::with_retention(DEFAULT_RETENTION)
    }
}

impl AppliedEvents {
    pub fn with_retention(retention: Duration) -> Self {
        Self {
            retention,
            ids: HashSet::new(),
            recorded: VecDeque::new(),
        }
    }

    pub fn contains(&self, id: &EventId) -> bool {
        self.ids.contains(id)
    }

    /// Records `id`; returns false if it was already present.
    pub fn record(&mut self, id: EventId) -> bool {
        let now = Instant::now();
        self.prune(now);
        if !self.ids.insert(id) {
            return false;
        }
        self.recorded.push_back((now, id));
        true
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    fn prune(&mut self, now: Instant) {
        while let Some(&(at, id)) = self.recorded.front()
            && now.duration_since(at) > self.retention
        {
            self.recorded.pop_front();
            self.ids.remove(&id);
        }
    }
}

/// Logs and counts a skipped redelivery.
pub(crate) fn skip_duplicate(consumer: &'static str, id: &EventId) {
    metrics::counter!("events_duplicates_skipped_total", "consumer" => consumer).increment(1);
    tracing::debug!(consumer, event_id = %id, "event already applied, skipping");
}
