//! Optimistic mutations through the client: debounce, reconciliation, invalidation.

mod common;

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::ScriptedTransport;
use repsync::hub::topic;
use repsync::{
    CacheKey, EntityRef, MutationResolution, ResourceDescriptor, SyncClient, SyncError, SyncEvent,
};
use serde_json::{Value, json};

fn client(transport: &Arc<ScriptedTransport>) -> SyncClient {
    SyncClient::builder()
        .transport(transport.clone())
        .build()
        .unwrap()
}

fn workout(id: &str) -> EntityRef {
    EntityRef::new("workout", id)
}

/// Collects every event published on `topic`.
fn record(client: &SyncClient, topic: String) -> (Arc<Mutex<Vec<SyncEvent>>>, repsync::Subscription) {
    let log = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&log);
    let sub = client.subscribe(topic, move |event| sink.lock().unwrap().push(event.clone()));
    (log, sub)
}

fn resolutions(log: &Mutex<Vec<SyncEvent>>) -> Vec<MutationResolution> {
    log.lock()
        .unwrap()
        .iter()
        .filter_map(|e| match e {
            SyncEvent::Mutation(m) => Some(m.resolution.clone()),
            _ => None,
        })
        .collect()
}

/// Final resolutions with the token each was published under.
fn finals(log: &Mutex<Vec<SyncEvent>>) -> Vec<(u64, MutationResolution)> {
    log.lock()
        .unwrap()
        .iter()
        .filter_map(|e| match e {
            SyncEvent::Mutation(m) if m.resolution.is_final() => {
                Some((m.token, m.resolution.clone()))
            }
            _ => None,
        })
        .collect()
}

fn seed(client: &SyncClient, entity: &EntityRef, value: Value) {
    client.cache().put(
        CacheKey::entity(entity),
        value,
        Duration::from_secs(600),
        BTreeSet::from([entity.kind.clone()]),
    );
}

#[tokio::test(start_paused = true)]
async fn patches_within_window_send_once_with_latest_state() {
    let transport = Arc::new(ScriptedTransport::new());
    let client = client(&transport);
    let entity = workout("1");

    client.mutate(entity.clone(), &json!({"v": 1}));
    tokio::time::sleep(Duration::from_millis(150)).await;
    client.mutate(entity.clone(), &json!({"v": 2}));
    tokio::time::sleep(Duration::from_millis(150)).await;
    client.mutate(entity.clone(), &json!({"v": 3}));
    tokio::time::sleep(Duration::from_secs(2)).await;

    assert_eq!(transport.writes(), vec![json!({"v": 3})]);
    assert!(!client.is_pending(&entity));
    assert_eq!(client.local(&entity), Some(json!({"v": 3})));
}

#[tokio::test(start_paused = true)]
async fn optimistic_state_is_visible_before_send() {
    let transport = Arc::new(ScriptedTransport::new());
    let client = client(&transport);
    let entity = workout("1");
    seed(&client, &entity, json!({"name": "legs", "sets": 3}));
    let (log, _sub) = record(&client, topic::entity(&entity));

    client.mutate(entity.clone(), &json!({"sets": 4}));

    let expected = json!({"name": "legs", "sets": 4});
    assert_eq!(client.local(&entity), Some(expected.clone()));
    let read = client
        .read(&ResourceDescriptor::entity(&entity))
        .await
        .unwrap();
    assert_eq!(read, expected);
    assert_eq!(transport.call_count(), 0);
    assert_eq!(
        resolutions(&log),
        vec![MutationResolution::Optimistic { value: expected }]
    );
}

#[tokio::test(start_paused = true)]
async fn rejected_send_rolls_back_to_last_confirmed_state() {
    let transport = Arc::new(ScriptedTransport::new());
    transport.fail("workout/1", 1, SyncError::validation("sets must be positive"));
    let client = client(&transport);
    let entity = workout("1");
    seed(&client, &entity, json!({"sets": 3}));
    let (log, _sub) = record(&client, topic::entity(&entity));

    client.mutate(entity.clone(), &json!({"sets": -1}));
    tokio::time::sleep(Duration::from_secs(1)).await;

    assert_eq!(client.local(&entity), Some(json!({"sets": 3})));
    let resolutions = resolutions(&log);
    assert_eq!(resolutions.len(), 2);
    assert!(matches!(
        &resolutions[1],
        MutationResolution::RolledBack {
            restored: Some(v),
            error: SyncError::ValidationFailed { .. },
        } if *v == json!({"sets": 3})
    ));
}

#[tokio::test(start_paused = true)]
async fn server_error_rolls_back_too() {
    let transport = Arc::new(ScriptedTransport::new());
    transport.fail(
        "workout/1",
        1,
        SyncError::ServerError {
            status: 503,
            message: "maintenance".into(),
        },
    );
    let client = client(&transport);
    let entity = workout("1");
    let (log, _sub) = record(&client, topic::entity(&entity));

    client.mutate(entity.clone(), &json!({"sets": 5}));
    tokio::time::sleep(Duration::from_secs(1)).await;

    // Nothing was cached before the mutation, so nothing is restored.
    assert_eq!(client.local(&entity), None);
    assert!(matches!(
        resolutions(&log).last(),
        Some(MutationResolution::RolledBack { restored: None, .. })
    ));
}

#[tokio::test(start_paused = true)]
async fn not_found_removes_instead_of_rolling_back() {
    let transport = Arc::new(ScriptedTransport::new());
    transport.fail("workout/1", 1, SyncError::NotFound("workout 1".into()));
    let client = client(&transport);
    let entity = workout("1");
    seed(&client, &entity, json!({"sets": 3}));
    let (entity_log, _a) = record(&client, topic::entity(&entity));
    let (group_log, _b) = record(&client, topic::group("workout"));

    client.mutate(entity.clone(), &json!({"sets": 4}));
    tokio::time::sleep(Duration::from_secs(1)).await;

    assert_eq!(client.local(&entity), None);
    assert!(matches!(
        resolutions(&entity_log).last(),
        Some(MutationResolution::Removed { error: SyncError::NotFound(_) })
    ));
    assert!(group_log.lock().unwrap().iter().any(
        |e| matches!(e, SyncEvent::Invalidated { group } if group == "workout")
    ));

    // Subsequent reads go back to the server instead of a cached copy.
    let descriptor = ResourceDescriptor::entity(&entity);
    transport.fail(descriptor.key().as_str(), 1, SyncError::NotFound("workout 1".into()));
    let read = client.read(&descriptor).await;
    assert!(matches!(read, Err(SyncError::NotFound(_))));
    assert_eq!(transport.calls_to(descriptor.key().as_str()).len(), 1);
    assert_eq!(client.local(&entity), None);
}

#[tokio::test(start_paused = true)]
async fn confirmation_invalidates_group_and_forces_refetch() {
    let transport = Arc::new(ScriptedTransport::new());
    let client = client(&transport);
    let list = ResourceDescriptor::new("workouts")
        .param("page", 1)
        .group("workout");

    let first = client.read(&list).await.unwrap();
    let again = client.read(&list).await.unwrap();
    assert_eq!(first, again);
    assert_eq!(transport.call_count(), 1);

    client.mutate(workout("1"), &json!({"status": "completed"}));
    tokio::time::sleep(Duration::from_secs(1)).await;

    let after = client.read(&list).await.unwrap();
    assert_ne!(after, first);
    assert_eq!(transport.calls_to(list.key().as_str()).len(), 2);
}

#[tokio::test(start_paused = true)]
async fn canonical_server_state_replaces_optimistic_value() {
    let transport = Arc::new(ScriptedTransport::new());
    transport.script(
        "workout/1",
        [Ok(json!({"sets": 4, "updated_at": "2026-01-01T00:00:00Z"}))],
    );
    let client = client(&transport);
    let entity = workout("1");
    let (log, _sub) = record(&client, topic::entity(&entity));

    client.mutate(entity.clone(), &json!({"sets": 4}));
    tokio::time::sleep(Duration::from_secs(1)).await;

    let canonical = json!({"sets": 4, "updated_at": "2026-01-01T00:00:00Z"});
    assert_eq!(client.local(&entity), Some(canonical.clone()));
    assert_eq!(
        resolutions(&log).last(),
        Some(&MutationResolution::Confirmed { value: canonical })
    );
}

#[tokio::test(start_paused = true)]
async fn newer_intent_waits_for_in_flight_send() {
    let transport = Arc::new(ScriptedTransport::new());
    transport.slow("workout/1", Duration::from_secs(1));
    let client = client(&transport);
    let entity = workout("1");
    let (log, _sub) = record(&client, topic::entity(&entity));

    client.mutate(entity.clone(), &json!({"v": 1}));
    // First send goes out at 400ms and is in flight until 1400ms.
    tokio::time::sleep(Duration::from_millis(500)).await;
    client.mutate(entity.clone(), &json!({"v": 2}));
    assert_eq!(client.local(&entity), Some(json!({"v": 2})));
    tokio::time::sleep(Duration::from_secs(5)).await;

    let calls = transport.calls_to("workout/1");
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[1].at - calls[0].at, Duration::from_secs(1));
    assert_eq!(transport.writes(), vec![json!({"v": 1}), json!({"v": 2})]);

    // The superseded confirmation is silent; only the latest intent resolves.
    let finals: Vec<_> = resolutions(&log)
        .into_iter()
        .filter(MutationResolution::is_final)
        .collect();
    assert_eq!(
        finals,
        vec![MutationResolution::Confirmed { value: json!({"v": 2}) }]
    );
}

#[tokio::test(start_paused = true)]
async fn distinct_entities_do_not_coalesce() {
    let transport = Arc::new(ScriptedTransport::new());
    let client = client(&transport);

    client.mutate(workout("1"), &json!({"v": 1}));
    client.mutate(workout("2"), &json!({"v": 2}));
    assert_eq!(client.mutations().pending_count(), 2);
    tokio::time::sleep(Duration::from_secs(1)).await;

    assert_eq!(transport.calls_to("workout/1").len(), 1);
    assert_eq!(transport.calls_to("workout/2").len(), 1);
    assert_eq!(client.mutations().pending_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn clear_drops_pending_mutations() {
    let transport = Arc::new(ScriptedTransport::new());
    let client = client(&transport);

    client.mutate(workout("1"), &json!({"v": 1}));
    client.clear().unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;

    assert_eq!(transport.call_count(), 0);
    assert_eq!(client.local(&workout("1")), None);
}

#[tokio::test(start_paused = true)]
async fn list_read_in_flight_during_confirmation_is_not_cached() {
    let transport = Arc::new(ScriptedTransport::new());
    let client = Arc::new(client(&transport));
    let list = ResourceDescriptor::new("workouts").group("workout");
    let route = list.key().to_string();
    transport.slow(&route, Duration::from_secs(2));

    let reader = {
        let client = Arc::clone(&client);
        let list = list.clone();
        tokio::spawn(async move { client.read(&list).await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    client.mutate(workout("1"), &json!({"status": "completed"}));

    // Confirmed and invalidated at 410ms, long before the read lands.
    let stale = reader.await.unwrap().unwrap();
    assert_eq!(stale["call"], 1);

    let next = client.read(&list).await.unwrap();
    assert_eq!(next["call"], 2);
    assert_eq!(transport.calls_to(&route).len(), 2);
}

#[tokio::test(start_paused = true)]
async fn entity_read_in_flight_during_removal_does_not_resurrect() {
    let transport = Arc::new(ScriptedTransport::new());
    let client = Arc::new(client(&transport));
    let entity = workout("9");
    let descriptor = ResourceDescriptor::entity(&entity);
    let route = descriptor.key().to_string();
    transport.slow(&route, Duration::from_secs(2));
    transport.fail("workout/9", 1, SyncError::NotFound("workout 9".into()));
    let (log, _sub) = record(&client, topic::entity(&entity));

    let reader = {
        let client = Arc::clone(&client);
        let descriptor = descriptor.clone();
        tokio::spawn(async move { client.read(&descriptor).await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    client.mutate(entity.clone(), &json!({"sets": 1}));
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(matches!(
        finals(&log).as_slice(),
        [(_, MutationResolution::Removed { .. })]
    ));

    reader.await.unwrap().unwrap();
    assert_eq!(client.local(&entity), None);

    transport.fail(&route, 1, SyncError::NotFound("workout 9".into()));
    assert!(matches!(
        client.read(&descriptor).await,
        Err(SyncError::NotFound(_))
    ));
    assert_eq!(transport.calls_to(&route).len(), 2);
}

#[tokio::test(start_paused = true)]
async fn superseded_success_becomes_rollback_target() {
    let transport = Arc::new(ScriptedTransport::new());
    transport.slow("workout/1", Duration::from_secs(1));
    transport.script(
        "workout/1",
        [
            Ok(json!({"v": 1, "rev": 1})),
            Err(SyncError::ServerError {
                status: 500,
                message: "boom".into(),
            }),
        ],
    );
    let client = client(&transport);
    let entity = workout("1");
    seed(&client, &entity, json!({"v": 0}));
    let (log, _sub) = record(&client, topic::entity(&entity));

    client.mutate(entity.clone(), &json!({"v": 1}));
    // First send is in flight from 400ms to 1400ms.
    tokio::time::sleep(Duration::from_millis(500)).await;
    let latest = client.mutate(entity.clone(), &json!({"v": 2}));
    tokio::time::sleep(Duration::from_secs(5)).await;

    assert_eq!(transport.writes(), vec![json!({"v": 1}), json!({"v": 2})]);
    let server_state = json!({"v": 1, "rev": 1});
    assert_eq!(client.local(&entity), Some(server_state.clone()));
    let finals = finals(&log);
    assert_eq!(finals.len(), 1);
    assert!(matches!(
        &finals[0],
        (token, MutationResolution::RolledBack { restored: Some(v), error: SyncError::ServerError { .. } })
            if *token == latest && *v == server_state
    ));
}

#[tokio::test(start_paused = true)]
async fn superseded_not_found_cancels_newer_intent() {
    let transport = Arc::new(ScriptedTransport::new());
    transport.slow("workout/1", Duration::from_secs(1));
    transport.fail("workout/1", 1, SyncError::NotFound("workout 1".into()));
    let client = client(&transport);
    let entity = workout("1");
    seed(&client, &entity, json!({"v": 0}));
    let (log, _sub) = record(&client, topic::entity(&entity));

    client.mutate(entity.clone(), &json!({"v": 1}));
    tokio::time::sleep(Duration::from_millis(500)).await;
    let latest = client.mutate(entity.clone(), &json!({"v": 2}));
    assert!(client.is_pending(&entity));
    tokio::time::sleep(Duration::from_secs(5)).await;

    assert_eq!(transport.writes(), vec![json!({"v": 1})]);
    assert!(!client.is_pending(&entity));
    assert_eq!(client.local(&entity), None);
    let finals = finals(&log);
    assert_eq!(finals.len(), 1);
    assert!(matches!(
        &finals[0],
        (token, MutationResolution::Removed { error: SyncError::NotFound(_) }) if *token == latest
    ));
}

#[tokio::test(start_paused = true)]
async fn superseded_failure_is_ignored_when_newer_intent_succeeds() {
    let transport = Arc::new(ScriptedTransport::new());
    transport.slow("workout/1", Duration::from_secs(1));
    transport.fail(
        "workout/1",
        1,
        SyncError::ServerError {
            status: 502,
            message: "bad gateway".into(),
        },
    );
    let client = client(&transport);
    let entity = workout("1");
    let (log, _sub) = record(&client, topic::entity(&entity));

    client.mutate(entity.clone(), &json!({"v": 1}));
    tokio::time::sleep(Duration::from_millis(500)).await;
    let latest = client.mutate(entity.clone(), &json!({"v": 2}));
    tokio::time::sleep(Duration::from_secs(5)).await;

    assert_eq!(transport.writes(), vec![json!({"v": 1}), json!({"v": 2})]);
    assert_eq!(client.local(&entity), Some(json!({"v": 2})));
    assert_eq!(
        finals(&log),
        vec![(latest, MutationResolution::Confirmed { value: json!({"v": 2}) })]
    );
}
