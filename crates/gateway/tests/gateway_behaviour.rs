use std::sync::Arc;
use std::time::Duration;

use common::{ClubId, TrainingId, UserId};
use gateway::{
    CacheTtls, InMemoryDirectory, Remotes, Staleness, UpstreamError, UpstreamGateway, dependency,
};
use resilience::{BreakerState, GateConfig, GateRegistry};

fn gate_config() -> GateConfig {
    GateConfig {
        window_size: 10,
        minimum_calls: 4,
        failure_rate_threshold: 0.5,
        cooldown: Duration::from_secs(30),
        call_timeout: Duration::from_millis(200),
        max_retries: 1,
        base_backoff: Duration::from_millis(10),
        max_backoff: Duration::from_millis(50),
        ..GateConfig::default()
    }
}

fn setup() -> (Arc<InMemoryDirectory>, UpstreamGateway) {
    let directory = Arc::new(InMemoryDirectory::new());
    directory.add_club(ClubId::new(1), "Tigers");
    directory.add_user(UserId::new(7), "kenji");
    directory.add_training(TrainingId::new(42));

    let gateway = UpstreamGateway::new(
        Remotes::uniform(directory.clone()),
        Arc::new(GateRegistry::new(gate_config())),
        CacheTtls {
            club: Duration::from_secs(60),
            user: Duration::from_secs(60),
            identity: Duration::from_secs(60),
            training: Duration::from_secs(5),
        },
    );
    (directory, gateway)
}

#[tokio::test(start_paused = true)]
async fn reads_through_to_remote() {
    let (_, gateway) = setup();

    let club = gateway
        .club_by_name("Tigers", Staleness::Reject)
        .await
        .unwrap();
    assert_eq!(club.id, ClubId::new(1));

    let by_id = gateway
        .club_by_id(ClubId::new(1), Staleness::Reject)
        .await
        .unwrap();
    assert_eq!(by_id.name, "Tigers");

    assert!(
        gateway
            .check_user_exists(UserId::new(7), Staleness::Tolerate)
            .await
            .unwrap()
    );
    assert_eq!(
        gateway
            .user_id_by_username("kenji", Staleness::Reject)
            .await
            .unwrap(),
        UserId::new(7)
    );
    assert!(
        !gateway
            .check_training_exists(TrainingId::new(99), Staleness::Tolerate)
            .await
            .unwrap()
    );
}

#[tokio::test(start_paused = true)]
async fn not_found_is_surfaced_immediately() {
    let (directory, gateway) = setup();

    let err = gateway
        .club_by_name("Dragons", Staleness::Tolerate)
        .await
        .unwrap_err();

    assert!(matches!(err, UpstreamError::NotFound(_)));
    assert_eq!(directory.call_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn tolerant_read_serves_cached_fact_during_outage() {
    let (directory, gateway) = setup();
    assert!(
        gateway
            .check_user_exists(UserId::new(7), Staleness::Tolerate)
            .await
            .unwrap()
    );

    directory.set_outage(true);

    let cached = gateway
        .check_user_exists(UserId::new(7), Staleness::Tolerate)
        .await;
    assert_eq!(cached, Ok(true));

    let strict = gateway
        .check_user_exists(UserId::new(7), Staleness::Reject)
        .await;
    assert!(matches!(strict, Err(UpstreamError::Unavailable { .. })));
}

#[tokio::test(start_paused = true)]
async fn expired_fact_is_not_served() {
    let (directory, gateway) = setup();
    gateway
        .check_training_exists(TrainingId::new(42), Staleness::Tolerate)
        .await
        .unwrap();

    directory.set_outage(true);
    tokio::time::advance(Duration::from_secs(6)).await;

    let err = gateway
        .check_training_exists(TrainingId::new(42), Staleness::Tolerate)
        .await
        .unwrap_err();
    assert!(err.is_unavailable());
}

#[tokio::test(start_paused = true)]
async fn repeated_outage_opens_circuit_and_stops_remote_calls() {
    let (directory, gateway) = setup();
    directory.set_outage(true);

    for _ in 0..2 {
        let _ = gateway
            .club_by_name("Tigers", Staleness::Reject)
            .await;
    }
    assert_eq!(
        gateway.gates().gate(dependency::CLUB).state(),
        BreakerState::Open
    );

    let before = directory.call_count();
    let err = gateway
        .club_by_id(ClubId::new(1), Staleness::Reject)
        .await
        .unwrap_err();
    assert!(err.is_unavailable());
    assert_eq!(directory.call_count(), before);

    // Other dependencies are unaffected.
    assert_eq!(
        gateway.gates().gate(dependency::TRAINING).state(),
        BreakerState::Closed
    );
}

#[tokio::test(start_paused = true)]
async fn update_username_completes_in_background() {
    let (directory, gateway) = setup();

    let pending = gateway.update_username(UserId::new(7), "kenji-sensei");
    pending.wait().await.unwrap();

    assert_eq!(
        directory.username_of(UserId::new(7)).as_deref(),
        Some("kenji-sensei")
    );
}

#[tokio::test(start_paused = true)]
async fn update_username_conflict_is_reported() {
    let (directory, gateway) = setup();
    directory.add_user(UserId::new(8), "mai");

    let err = gateway
        .update_username(UserId::new(8), "kenji")
        .wait()
        .await
        .unwrap_err();
    assert!(matches!(err, UpstreamError::Conflict(_)));
}

#[tokio::test(start_paused = true)]
async fn abandoned_wait_does_not_cancel_remote_call() {
    let (directory, gateway) = setup();
    directory.set_latency(Some(Duration::from_millis(150)));

    let err = gateway
        .delete_identity(UserId::new(7))
        .wait_timeout(Duration::from_millis(20))
        .await
        .unwrap_err();
    assert!(err.is_unavailable());

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(directory.username_of(UserId::new(7)), None);
}
