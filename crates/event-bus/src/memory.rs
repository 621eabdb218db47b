use std::collections::HashMap;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use tokio::sync::{Notify, mpsc};

use crate::broker::{Broker, EventHandler, Subscription};
use crate::dead_letter::DeadLetterSink;
use crate::delivery::{DeliveryPolicy, Origin, deliver};
use crate::error::{EventBusError, Result};
use crate::event::EventEnvelope;

struct Delivery {
    key: String,
    envelope: EventEnvelope,
}

#[derive(Default)]
struct TopicState {
    /// Per group, one sender per partition.
    groups: HashMap<String, Vec<mpsc::UnboundedSender<Delivery>>>,
    published: Vec<(String, EventEnvelope)>,
}

/// Counts deliveries that are queued or being handled.
#[derive(Default)]
struct Tracker {
    in_flight: AtomicUsize,
    idle: Notify,
}

impl Tracker {
    fn start(&self) {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
    }

    fn finish(&self) {
        if self.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
    }

    async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.in_flight.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// Broker living inside the process.
///
/// Each topic has a fixed number of partitions; a key always maps to the same
/// partition and every (group, partition) pair has its own worker, so
/// envelopes with the same key are handled in publish order while different
/// keys proceed independently.
#[derive(Clone)]
pub struct InMemoryBroker {
    partitions: usize,
    policy: DeliveryPolicy,
    dead_letters: Arc<dyn DeadLetterSink>,
    topics: Arc<RwLock<HashMap<String, TopicState>>>,
    tracker: Arc<Tracker>,
    failing_publishes: Arc<AtomicU32>,
}

impl InMemoryBroker {
    pub fn new(partitions: usize, dead_letters: Arc<dyn DeadLetterSink>) -> Self {
        Self {
            partitions: partitions.max(1),
            policy: DeliveryPolicy::default(),
            dead_letters,
            topics: Arc::new(RwLock::new(HashMap::new())),
            tracker: Arc::new(Tracker::default()),
            failing_publishes: Arc::new(AtomicU32::new(0)),
        }
    }

    pub fn with_delivery_policy(mut self, policy: DeliveryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn partitions(&self) -> usize {
        self.partitions
    }

    /// Makes the next `count` publish calls fail.
    pub fn fail_next_publishes(&self, count: u32) {
        self.failing_publishes.store(count, Ordering::SeqCst);
    }

    /// Delivers an envelope again to every group, as a broker would after a
    /// consumer crash.
    pub fn redeliver(&self, topic: &str, key: &str, envelope: &EventEnvelope) {
        tracing::debug!(topic, key, event_id = %envelope.event_id, "redelivering");
        self.dispatch(topic, key, envelope, false);
    }

    /// Everything successfully published to `topic`, in order.
    pub fn published(&self, topic: &str) -> Vec<(String, EventEnvelope)> {
        self.topics
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(topic)
            .map(|state| state.published.clone())
            .unwrap_or_default()
    }

    /// Resolves once every queued delivery has been handled.
    pub async fn wait_idle(&self) {
        self.tracker.wait_idle().await;
    }

    fn partition_for(&self, key: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() % self.partitions as u64) as usize
    }

    fn dispatch(&self, topic: &str, key: &str, envelope: &EventEnvelope, record: bool) {
        let partition = self.partition_for(key);
        let mut topics = self.topics.write().unwrap_or_else(PoisonError::into_inner);
        let state = topics.entry(topic.to_string()).or_default();
        if record {
            state.published.push((key.to_string(), envelope.clone()));
        }
        for (group, senders) in &state.groups {
            self.tracker.start();
            let delivery = Delivery {
                key: key.to_string(),
                envelope: envelope.clone(),
            };
            if senders[partition].send(delivery).is_err() {
                tracing::warn!(topic, group = %group, partition, "worker gone, delivery dropped");
                self.tracker.finish();
            }
        }
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn publish(&self, topic: &str, key: &str, envelope: &EventEnvelope) -> Result<()> {
        if self
            .failing_publishes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(EventBusError::Broker(format!("publish to {topic} refused")));
        }
        self.dispatch(topic, key, envelope, true);
        Ok(())
    }

    async fn subscribe(
        &self,
        topic: &str,
        group: &str,
        handler: Arc<dyn EventHandler>,
    ) -> Result<Subscription> {
        let mut topics = self.topics.write().unwrap_or_else(PoisonError::into_inner);
        let state = topics.entry(topic.to_string()).or_default();
        if state.groups.contains_key(group) {
            return Err(EventBusError::Broker(format!(
                "group {group} already subscribed to {topic}"
            )));
        }

        let mut senders = Vec::with_capacity(self.partitions);
        let mut workers = Vec::with_capacity(self.partitions);
        for partition in 0..self.partitions {
            let (tx, rx) = mpsc::unbounded_channel();
            senders.push(tx);
            let worker = Worker {
                topic: topic.to_string(),
                group: group.to_string(),
                rx,
                handler: handler.clone(),
                policy: self.policy,
                dead_letters: self.dead_letters.clone(),
                tracker: self.tracker.clone(),
            };
            workers.push(tokio::spawn(worker.run(partition)));
        }
        state.groups.insert(group.to_string(), senders);

        tracing::info!(
            topic,
            group,
            handler = handler.name(),
            partitions = self.partitions,
            "subscribed"
        );
        Ok(Subscription::new(topic, group, workers))
    }
}

struct Worker {
    topic: String,
    group: String,
    rx: mpsc::UnboundedReceiver<Delivery>,
    handler: Arc<dyn EventHandler>,
    policy: DeliveryPolicy,
    dead_letters: Arc<dyn DeadLetterSink>,
    tracker: Arc<Tracker>,
}

impl Worker {
    async fn run(mut self, partition: usize) {
        tracing::debug!(topic = %self.topic, group = %self.group, partition, "worker started");
        while let Some(delivery) = self.rx.recv().await {
            let origin = Origin {
                topic: &self.topic,
                group: &self.group,
                key: &delivery.key,
            };
            deliver(
                self.handler.as_ref(),
                &delivery.envelope,
                origin,
                self.policy,
                self.dead_letters.as_ref(),
            )
            .await;
            self.tracker.finish();
        }
    }
}

impl Drop for Worker {
    // Queued deliveries die with an aborted worker.
    fn drop(&mut self) {
        while self.rx.try_recv().is_ok() {
            self.tracker.finish();
        }
    }
}
