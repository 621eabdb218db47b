use std::sync::Arc;

use chrono::NaiveDate;
use common::{ClubId, TrainingId, UserId};
use event_bus::topics;
use event_bus::{
    Broker, EnrollmentCreated, EventEnvelope, EventPayload, InMemoryBroker, InMemoryDeadLetters,
    UserDeleted, UserRegistered,
};
use replicas::{
    EnrollmentRosterConsumer, FeedbackCleanupConsumer, FeedbackStore, NotificationConfig,
    NotificationConsumer, RecordingMailer,
};

struct Harness {
    broker: InMemoryBroker,
    dead_letters: InMemoryDeadLetters,
    roster: EnrollmentRosterConsumer,
    feedback: FeedbackStore,
    mailer: RecordingMailer,
}

async fn harness() -> Harness {
    let dead_letters = InMemoryDeadLetters::new();
    let broker = InMemoryBroker::new(4, Arc::new(dead_letters.clone()));
    let roster = EnrollmentRosterConsumer::new();
    let feedback = FeedbackStore::new();
    let mailer = RecordingMailer::new();
    let notifications =
        NotificationConsumer::new(Arc::new(mailer.clone()), NotificationConfig::default());

    for topic in [
        topics::USER_REGISTERED,
        topics::ENROLLMENT_CREATED,
        topics::USER_DELETED,
    ] {
        broker
            .subscribe(topic, "enrollment-service", Arc::new(roster.clone()))
            .await
            .unwrap();
    }
    broker
        .subscribe(
            topics::USER_DELETED,
            "feedback-service",
            Arc::new(FeedbackCleanupConsumer::new(feedback.clone())),
        )
        .await
        .unwrap();
    for topic in [topics::USER_REGISTERED, topics::ENROLLMENT_CREATED] {
        broker
            .subscribe(topic, "notification-service", Arc::new(notifications.clone()))
            .await
            .unwrap();
    }

    Harness {
        broker,
        dead_letters,
        roster,
        feedback,
        mailer,
    }
}

async fn publish<P: EventPayload>(broker: &InMemoryBroker, payload: &P) -> EventEnvelope {
    let envelope = EventEnvelope::wrap(payload).unwrap();
    broker
        .publish(P::TOPIC, &payload.partition_key(), &envelope)
        .await
        .unwrap();
    envelope
}

fn registered(id: i64) -> UserRegistered {
    UserRegistered {
        user_id: UserId::new(id),
        username: format!("member{id}"),
        email: format!("member{id}@dojo.test"),
        club_id: Some(ClubId::new(1)),
        club_name: Some("Tigers".into()),
        karate_rank: Some("5 kyu".into()),
        registration_date: NaiveDate::from_ymd_opt(2025, 1, 15),
    }
}

fn enrolled(id: i64, training: i64) -> EnrollmentCreated {
    let start = NaiveDate::from_ymd_opt(2025, 4, 2)
        .unwrap()
        .and_hms_opt(17, 30, 0)
        .unwrap();
    EnrollmentCreated {
        user_id: UserId::new(id),
        user_email: format!("member{id}@dojo.test"),
        username: format!("member{id}"),
        training_id: TrainingId::new(training),
        training_description: "Kumite".into(),
        training_start: start,
        training_end: start + chrono::Duration::hours(1),
    }
}

#[tokio::test]
async fn redelivery_leaves_the_same_state_as_one_delivery() {
    let h = harness().await;

    let registration = publish(&h.broker, &registered(1)).await;
    let enrollment = publish(&h.broker, &enrolled(1, 10)).await;
    h.broker.wait_idle().await;

    let member_once = h.roster.member(UserId::new(1)).await;
    let enrollments_once = h.roster.enrollments_of(UserId::new(1)).await;
    let mails_once = h.mailer.sent().len();

    for _ in 0..3 {
        h.broker.redeliver(topics::USER_REGISTERED, "1", &registration);
        h.broker.redeliver(topics::ENROLLMENT_CREATED, "1", &enrollment);
    }
    h.broker.wait_idle().await;

    assert_eq!(h.roster.member(UserId::new(1)).await, member_once);
    assert_eq!(h.roster.enrollments_of(UserId::new(1)).await, enrollments_once);
    assert_eq!(h.mailer.sent().len(), mails_once);
    assert_eq!(mails_once, 2);
}

#[tokio::test]
async fn deletion_before_registration_does_not_erase_later_insert() {
    let h = harness().await;

    publish(
        &h.broker,
        &UserDeleted {
            user_id: UserId::new(7),
        },
    )
    .await;
    h.broker.wait_idle().await;
    publish(&h.broker, &registered(7)).await;
    h.broker.wait_idle().await;

    let member = h.roster.member(UserId::new(7)).await.unwrap();
    assert_eq!(member.username, "member7");
}

#[tokio::test]
async fn deletion_cascades_across_services() {
    let h = harness().await;
    publish(&h.broker, &registered(3)).await;
    publish(&h.broker, &enrolled(3, 1)).await;
    publish(&h.broker, &enrolled(3, 2)).await;
    h.broker.wait_idle().await;
    h.feedback
        .add(UserId::new(3), TrainingId::new(1), "good pace", 4)
        .await;

    publish(
        &h.broker,
        &UserDeleted {
            user_id: UserId::new(3),
        },
    )
    .await;
    h.broker.wait_idle().await;

    assert!(h.roster.member(UserId::new(3)).await.is_none());
    assert!(h.roster.enrollments_of(UserId::new(3)).await.is_empty());
    assert!(h.feedback.for_user(UserId::new(3)).await.is_empty());
}

#[tokio::test]
async fn poison_event_is_parked_and_others_flow() {
    let h = harness().await;
    let poison = EventEnvelope::builder()
        .event_type("USER_REGISTERED")
        .payload_raw(serde_json::json!({"userId": 5, "username": 42}))
        .build()
        .unwrap();
    h.broker
        .publish(topics::USER_REGISTERED, "5", &poison)
        .await
        .unwrap();
    publish(&h.broker, &registered(5)).await;
    h.broker.wait_idle().await;

    assert!(h.roster.member(UserId::new(5)).await.is_some());
    // Both the roster and the notification consumer reject it.
    assert_eq!(h.dead_letters.len(), 2);
    assert!(
        h.dead_letters
            .letters()
            .iter()
            .all(|l| l.envelope.event_id == poison.event_id)
    );
}
