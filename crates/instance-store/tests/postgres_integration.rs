//! PostgreSQL integration tests
//!
//! These tests use a shared PostgreSQL container for efficiency.
//! Run with:
//!
//! ```bash
//! cargo test -p instance-store --test postgres_integration -- --test-threads=1
//! ```

use std::sync::Arc;

use chrono::{Duration, Utc};
use instance_store::{
    CorrelationId, InsertOutcome, InstanceQuery, InstanceStore, InstanceStoreExt, Payload,
    PostgresInstanceStore, SagaInstance, SagaState, StoreError, Version,
};
use sqlx::PgPool;
use testcontainers::{ContainerAsync, runners::AsyncRunner};
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;

/// Shared container info - container stays alive for all tests
struct ContainerInfo {
    #[allow(dead_code)] // Container must stay alive for tests
    container: ContainerAsync<Postgres>,
    connection_string: String,
}

/// Global shared container
static CONTAINER: OnceCell<Arc<ContainerInfo>> = OnceCell::const_new();

async fn get_container_info() -> Arc<ContainerInfo> {
    CONTAINER
        .get_or_init(|| async {
            let container = Postgres::default().start().await.unwrap();

            let host = container.get_host().await.unwrap();
            let port = container.get_host_port_ipv4(5432).await.unwrap();

            let connection_string =
                format!("postgres://postgres:postgres@{}:{}/postgres", host, port);

            let temp_pool = PgPool::connect(&connection_string).await.unwrap();
            sqlx::raw_sql(include_str!(
                "../../../migrations/001_create_saga_instances.sql"
            ))
            .execute(&temp_pool)
            .await
            .unwrap();
            temp_pool.close().await;

            Arc::new(ContainerInfo {
                container,
                connection_string,
            })
        })
        .await
        .clone()
}

/// Get a fresh store with its own pool and a cleared table
async fn get_test_store() -> PostgresInstanceStore {
    let info = get_container_info().await;

    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(5)
        .connect(&info.connection_string)
        .await
        .unwrap();

    sqlx::query("TRUNCATE TABLE saga_instances")
        .execute(&pool)
        .await
        .unwrap();

    PostgresInstanceStore::new(pool)
}

fn create_test_instance(id: &str, state: SagaState) -> SagaInstance {
    let mut payload = Payload::new();
    payload.insert("match_id".to_string(), serde_json::json!(id));
    SagaInstance::new(
        CorrelationId::new(id),
        "MatchAcceptance",
        state,
        payload,
        Utc::now(),
    )
}

#[tokio::test]
async fn insert_and_retrieve_instance() {
    let store = get_test_store().await;
    let instance = create_test_instance("C1", SagaState::step("AwaitingSlotReservation"));

    let outcome = store.insert_if_absent(&instance).await.unwrap();
    assert_eq!(outcome, InsertOutcome::Inserted);

    let stored = store.get_required(&instance.correlation_id).await.unwrap();
    assert_eq!(stored.process_type, "MatchAcceptance");
    assert_eq!(
        stored.current_state,
        SagaState::step("AwaitingSlotReservation")
    );
    assert_eq!(stored.payload["match_id"], "C1");
    assert_eq!(stored.version, Version::first());
    assert!(stored.completed_steps.is_empty());
}

#[tokio::test]
async fn duplicate_insert_is_a_no_op() {
    let store = get_test_store().await;
    let instance = create_test_instance("C1", SagaState::step("AwaitingSlotReservation"));

    store.insert_if_absent(&instance).await.unwrap();
    let mut duplicate = instance.clone();
    duplicate.process_type = "Other".to_string();
    let outcome = store.insert_if_absent(&duplicate).await.unwrap();

    assert_eq!(outcome, InsertOutcome::AlreadyExists);
    let stored = store.get_required(&instance.correlation_id).await.unwrap();
    assert_eq!(stored.process_type, "MatchAcceptance");
}

#[tokio::test]
async fn update_round_trips_all_fields() {
    let store = get_test_store().await;
    let mut instance = create_test_instance("C1", SagaState::step("AwaitingSlotReservation"));
    store.insert_if_absent(&instance).await.unwrap();

    let deadline = Utc::now() + Duration::seconds(30);
    instance.current_state = SagaState::compensating("ReserveSlot");
    instance.completed_steps = vec!["ReserveSlot".to_string()];
    instance.compensated_steps = vec!["Other".to_string()];
    instance.abandoned_compensations = vec!["Third".to_string()];
    instance.failure_reason = Some("NotificationsFailed".to_string());
    instance.attempt = 2;
    instance.deadline_at = Some(deadline);
    instance.version = Version::new(2);

    let version = store.update(&instance, Version::first()).await.unwrap();
    assert_eq!(version, Version::new(2));

    let stored = store.get_required(&instance.correlation_id).await.unwrap();
    assert_eq!(stored.current_state, SagaState::compensating("ReserveSlot"));
    assert_eq!(stored.completed_steps, vec!["ReserveSlot"]);
    assert_eq!(stored.compensated_steps, vec!["Other"]);
    assert_eq!(stored.abandoned_compensations, vec!["Third"]);
    assert_eq!(stored.failure_reason.as_deref(), Some("NotificationsFailed"));
    assert_eq!(stored.attempt, 2);
    assert_eq!(
        stored.deadline_at.map(|d| d.timestamp_millis()),
        Some(deadline.timestamp_millis())
    );
}

#[tokio::test]
async fn oversized_attempt_counter_saturates() {
    let store = get_test_store().await;
    let mut instance = create_test_instance("C1", SagaState::step("AwaitingSlotReservation"));
    instance.attempt = u32::MAX;
    store.insert_if_absent(&instance).await.unwrap();

    let stored = store.get_required(&instance.correlation_id).await.unwrap();
    assert_eq!(stored.attempt, i32::MAX as u32);

    instance.attempt = u32::MAX - 1;
    instance.version = Version::new(2);
    store.update(&instance, Version::first()).await.unwrap();
    let stored = store.get_required(&instance.correlation_id).await.unwrap();
    assert_eq!(stored.attempt, i32::MAX as u32);
}

#[tokio::test]
async fn optimistic_concurrency_conflict() {
    let store = get_test_store().await;
    let instance = create_test_instance("C1", SagaState::step("AwaitingSlotReservation"));
    store.insert_if_absent(&instance).await.unwrap();

    let mut winner = instance.clone();
    winner.current_state = SagaState::step("AwaitingNotifications");
    winner.version = Version::new(2);
    store.update(&winner, Version::first()).await.unwrap();

    let mut loser = instance.clone();
    loser.current_state = SagaState::Failed;
    loser.version = Version::new(2);
    let result = store.update(&loser, Version::first()).await;

    assert!(matches!(
        result,
        Err(StoreError::ConcurrencyConflict { actual, .. }) if actual == Version::new(2)
    ));
    let stored = store.get_required(&instance.correlation_id).await.unwrap();
    assert_eq!(
        stored.current_state,
        SagaState::step("AwaitingNotifications")
    );
}

#[tokio::test]
async fn concurrent_updates_have_exactly_one_winner() {
    let store = get_test_store().await;
    let instance = create_test_instance("C1", SagaState::step("AwaitingSlotReservation"));
    store.insert_if_absent(&instance).await.unwrap();

    let mut handles = Vec::new();
    for i in 0..8 {
        let store = store.clone();
        let mut candidate = instance.clone();
        candidate.version = Version::new(2);
        candidate.failure_reason = Some(format!("writer-{i}"));
        handles.push(tokio::spawn(async move {
            store.update(&candidate, Version::first()).await
        }));
    }

    let mut winners = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => winners += 1,
            Err(e) => assert!(e.is_conflict()),
        }
    }
    assert_eq!(winners, 1);
}

#[tokio::test]
async fn update_missing_instance_is_not_found() {
    let store = get_test_store().await;
    let mut instance = create_test_instance("ghost", SagaState::step("AwaitingSlotReservation"));
    instance.version = Version::new(2);

    let result = store.update(&instance, Version::first()).await;
    assert!(matches!(result, Err(StoreError::NotFound(_))));
}

#[tokio::test]
async fn query_and_count_by_state() {
    let store = get_test_store().await;
    for (id, state) in [
        ("C1", SagaState::step("AwaitingSlotReservation")),
        ("C2", SagaState::step("AwaitingSlotReservation")),
        ("C3", SagaState::step("AwaitingNotifications")),
        ("C4", SagaState::Completed),
    ] {
        store
            .insert_if_absent(&create_test_instance(id, state))
            .await
            .unwrap();
    }

    let stuck = store
        .query(
            InstanceQuery::for_process_type("MatchAcceptance")
                .state(SagaState::step("AwaitingSlotReservation")),
        )
        .await
        .unwrap();
    assert_eq!(stuck.len(), 2);

    let page = store
        .query(InstanceQuery::new().limit(2).offset(1))
        .await
        .unwrap();
    assert_eq!(page.len(), 2);

    let counts = store.count_by_state("MatchAcceptance").await.unwrap();
    let lookup = |state: &str| {
        counts
            .iter()
            .find(|c| c.state == state)
            .map(|c| c.count)
            .unwrap_or(0)
    };
    assert_eq!(lookup("AwaitingSlotReservation"), 2);
    assert_eq!(lookup("AwaitingNotifications"), 1);
    assert_eq!(lookup("Completed"), 1);
}

#[tokio::test]
async fn pending_deadlines_exclude_terminal_instances() {
    let store = get_test_store().await;
    let now = Utc::now();

    let mut armed = create_test_instance("armed", SagaState::step("AwaitingSlotReservation"));
    armed.deadline_at = Some(now + Duration::seconds(10));
    let mut finished = create_test_instance("finished", SagaState::Compensated);
    finished.deadline_at = Some(now);
    let unarmed = create_test_instance("unarmed", SagaState::step("AwaitingNotifications"));

    for instance in [&armed, &finished, &unarmed] {
        store.insert_if_absent(instance).await.unwrap();
    }

    let pending = store.find_pending_deadlines().await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].correlation_id.as_str(), "armed");
}
