use std::sync::Arc;

use async_trait::async_trait;
use tokio::task::JoinHandle;

use crate::error::{HandlerError, Result};
use crate::event::EventEnvelope;

/// Message broker client.
///
/// `publish` hands one envelope to the broker under a partition key; ordering
/// is only guaranteed between envelopes sharing a key. `subscribe` attaches a
/// handler to a topic as a member of a consumer group: every group sees every
/// message once (modulo redelivery).
#[async_trait]
pub trait Broker: Send + Sync {
    async fn publish(&self, topic: &str, key: &str, envelope: &EventEnvelope) -> Result<()>;

    async fn subscribe(
        &self,
        topic: &str,
        group: &str,
        handler: Arc<dyn EventHandler>,
    ) -> Result<Subscription>;
}

/// Consumer side of a subscription.
///
/// Implementations must be idempotent: applying the same `event_id` twice must
/// leave the same state as applying it once.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Name used in logs, metrics and dead letters.
    fn name(&self) -> &'static str;

    async fn handle(&self, envelope: &EventEnvelope) -> std::result::Result<(), HandlerError>;
}

/// Live subscription; owns the worker tasks feeding the handler.
#[derive(Debug)]
pub struct Subscription {
    topic: String,
    group: String,
    workers: Vec<JoinHandle<()>>,
}

impl Subscription {
    pub fn new(topic: impl Into<String>, group: impl Into<String>, workers: Vec<JoinHandle<()>>) -> Self {
        Self {
            topic: topic.into(),
            group: group.into(),
            workers,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    /// Stops the workers. Messages not yet handled stay with the broker.
    pub fn unsubscribe(self) {
        for worker in &self.workers {
            worker.abort();
        }
        tracing::info!(topic = %self.topic, group = %self.group, "unsubscribed");
    }
}
