use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use common::UserId;
use event_bus::topics;
use event_bus::{
    Broker, DeliveryPolicy, EventEnvelope, EventHandler, EventPublisher, HandlerError,
    InMemoryBroker, InMemoryDeadLetters, UserDeleted,
};

#[derive(Default)]
struct Recorder {
    seen: Mutex<Vec<EventEnvelope>>,
    transient_failures: AtomicU32,
}

impl Recorder {
    fn user_ids(&self) -> Vec<i64> {
        self.seen
            .lock()
            .unwrap()
            .iter()
            .map(|e| e.decode::<UserDeleted>().unwrap().user_id.as_i64())
            .collect()
    }
}

#[async_trait]
impl EventHandler for Recorder {
    fn name(&self) -> &'static str {
        "recorder"
    }

    async fn handle(&self, envelope: &EventEnvelope) -> Result<(), HandlerError> {
        if envelope.payload.get("userId").is_none() {
            return Err(HandlerError::Poison("missing userId".into()));
        }
        if self
            .transient_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(HandlerError::Transient("storage busy".into()));
        }
        self.seen.lock().unwrap().push(envelope.clone());
        Ok(())
    }
}

fn setup(partitions: usize) -> (InMemoryBroker, InMemoryDeadLetters) {
    let dead_letters = InMemoryDeadLetters::new();
    let broker = InMemoryBroker::new(partitions, Arc::new(dead_letters.clone()))
        .with_delivery_policy(DeliveryPolicy {
            max_attempts: 3,
            backoff: Duration::from_millis(10),
        });
    (broker, dead_letters)
}

fn deleted(id: i64) -> EventEnvelope {
    EventEnvelope::wrap(&UserDeleted {
        user_id: UserId::new(id),
    })
    .unwrap()
}

#[tokio::test]
async fn same_key_is_delivered_in_publish_order() {
    let (broker, _) = setup(4);
    let recorder = Arc::new(Recorder::default());
    broker
        .subscribe(topics::USER_DELETED, "feedback", recorder.clone())
        .await
        .unwrap();

    for _ in 0..20 {
        broker
            .publish(topics::USER_DELETED, "7", &deleted(7))
            .await
            .unwrap();
    }
    broker.wait_idle().await;

    let seen = recorder.seen.lock().unwrap().clone();
    let published: Vec<_> = broker
        .published(topics::USER_DELETED)
        .into_iter()
        .map(|(_, e)| e.event_id)
        .collect();
    assert_eq!(
        seen.iter().map(|e| e.event_id).collect::<Vec<_>>(),
        published
    );
}

#[tokio::test]
async fn every_group_gets_every_message() {
    let (broker, _) = setup(2);
    let payments = Arc::new(Recorder::default());
    let enrollments = Arc::new(Recorder::default());
    broker
        .subscribe(topics::USER_DELETED, "payment", payments.clone())
        .await
        .unwrap();
    broker
        .subscribe(topics::USER_DELETED, "enrollment", enrollments.clone())
        .await
        .unwrap();

    for id in 1..=5 {
        broker
            .publish(topics::USER_DELETED, &id.to_string(), &deleted(id))
            .await
            .unwrap();
    }
    broker.wait_idle().await;

    let mut a = payments.user_ids();
    let mut b = enrollments.user_ids();
    a.sort();
    b.sort();
    assert_eq!(a, vec![1, 2, 3, 4, 5]);
    assert_eq!(a, b);
}

#[tokio::test]
async fn duplicate_group_subscription_is_rejected() {
    let (broker, _) = setup(1);
    let recorder = Arc::new(Recorder::default());
    broker
        .subscribe(topics::USER_DELETED, "payment", recorder.clone())
        .await
        .unwrap();
    assert!(
        broker
            .subscribe(topics::USER_DELETED, "payment", recorder)
            .await
            .is_err()
    );
}

#[tokio::test]
async fn poison_message_is_dead_lettered_without_blocking() {
    let (broker, dead_letters) = setup(1);
    let recorder = Arc::new(Recorder::default());
    broker
        .subscribe(topics::USER_DELETED, "feedback", recorder.clone())
        .await
        .unwrap();

    let poison = EventEnvelope::builder()
        .event_type("USER_DELETED")
        .payload_raw(serde_json::json!({"id": "seven"}))
        .build()
        .unwrap();
    broker
        .publish(topics::USER_DELETED, "7", &poison)
        .await
        .unwrap();
    broker
        .publish(topics::USER_DELETED, "7", &deleted(7))
        .await
        .unwrap();
    broker.wait_idle().await;

    assert_eq!(recorder.user_ids(), vec![7]);
    let letters = dead_letters.letters();
    assert_eq!(letters.len(), 1);
    assert_eq!(letters[0].envelope.event_id, poison.event_id);
    assert_eq!(letters[0].handler, "recorder");
    assert_eq!(letters[0].attempts, 1);
}

#[tokio::test(start_paused = true)]
async fn transient_failures_are_retried_then_dead_lettered() {
    let (broker, dead_letters) = setup(1);
    let recorder = Arc::new(Recorder::default());
    recorder.transient_failures.store(2, Ordering::SeqCst);
    broker
        .subscribe(topics::USER_DELETED, "feedback", recorder.clone())
        .await
        .unwrap();

    broker
        .publish(topics::USER_DELETED, "1", &deleted(1))
        .await
        .unwrap();
    broker.wait_idle().await;
    assert_eq!(recorder.user_ids(), vec![1]);
    assert!(dead_letters.is_empty());

    recorder.transient_failures.store(5, Ordering::SeqCst);
    broker
        .publish(topics::USER_DELETED, "2", &deleted(2))
        .await
        .unwrap();
    broker.wait_idle().await;
    assert_eq!(recorder.user_ids(), vec![1]);
    assert_eq!(dead_letters.len(), 1);
    assert_eq!(dead_letters.letters()[0].attempts, 3);
}

#[tokio::test]
async fn redelivery_carries_the_same_event_id() {
    let (broker, _) = setup(2);
    let recorder = Arc::new(Recorder::default());
    broker
        .subscribe(topics::USER_DELETED, "feedback", recorder.clone())
        .await
        .unwrap();

    let envelope = deleted(3);
    broker
        .publish(topics::USER_DELETED, "3", &envelope)
        .await
        .unwrap();
    broker.redeliver(topics::USER_DELETED, "3", &envelope);
    broker.wait_idle().await;

    let seen = recorder.seen.lock().unwrap().clone();
    assert_eq!(seen.len(), 2);
    assert!(seen.iter().all(|e| e.event_id == envelope.event_id));
    assert_eq!(broker.published(topics::USER_DELETED).len(), 1);
}

#[tokio::test(start_paused = true)]
async fn publisher_parks_and_retries_on_broker_failure() {
    let (broker, _) = setup(1);
    let recorder = Arc::new(Recorder::default());
    broker
        .subscribe(topics::USER_DELETED, "feedback", recorder.clone())
        .await
        .unwrap();
    broker.fail_next_publishes(3);

    let publisher = Arc::new(
        EventPublisher::new(Arc::new(broker.clone()))
            .with_backoff(Duration::from_millis(100), Duration::from_secs(1)),
    );
    let event_id = publisher
        .publish(&UserDeleted {
            user_id: UserId::new(9),
        })
        .await
        .unwrap();
    assert_eq!(publisher.pending_retries(), 1);
    assert!(broker.published(topics::USER_DELETED).is_empty());

    let retry = tokio::spawn({
        let publisher = publisher.clone();
        async move { publisher.run_retry_loop().await }
    });
    while publisher.pending_retries() > 0 {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    broker.wait_idle().await;

    let published = broker.published(topics::USER_DELETED);
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].0, "9");
    assert_eq!(published[0].1.event_id, event_id);
    assert_eq!(recorder.user_ids(), vec![9]);

    // A second loop refuses to start.
    publisher.run_retry_loop().await;
    retry.abort();
}
