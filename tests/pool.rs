//! End-to-end scenarios that exercise [`connpool::Pool`] purely through its public surface,
//! the way an embedding driver would: construct a pool with the `test-util` mock collaborators,
//! drive it through checkout/checkin/clear/maintenance, and assert on what the pool reports
//! back (connections, events, errors) without reaching into any crate-internal module.

use std::{sync::Arc, time::Duration};

use connpool::{
    collab::Credential,
    error::ErrorKind,
    event::{EventListener, PoolEvent},
    options::{Address, PoolOptions},
    testkit::{MockAuthenticator, MockDialer, MockHandshaker, RecordingListener},
    Pool,
};

type TestPool = Pool<MockDialer, MockHandshaker, MockAuthenticator>;

fn build_pool(
    credential: Option<Credential>,
    customize: impl FnOnce(&mut PoolOptions),
) -> (TestPool, RecordingListener, MockAuthenticator) {
    let listener = RecordingListener::new();
    let authenticator = MockAuthenticator::new();
    let mut options = PoolOptions::builder()
        .pause_enabled(false)
        .event_listener(Arc::new(listener.clone()) as Arc<dyn EventListener>)
        .build();
    customize(&mut options);

    let pool = Pool::new(
        Address::new("localhost", Some(27017)),
        options,
        MockDialer::new(),
        MockHandshaker::new(),
        authenticator.clone(),
        credential,
    )
    .expect("a validly configured pool must construct successfully");

    (pool, listener, authenticator)
}

#[tokio::test(flavor = "multi_thread")]
async fn a_full_checkout_checkin_clear_cycle_is_observable_end_to_end() {
    let (pool, listener, _authenticator) = build_pool(None, |o| o.max_pool_size = Some(2));

    let first = pool.check_out().await.expect("first checkout should succeed against a READY pool");
    let first_id = first.id();
    assert_eq!(first.generation(), 0);
    drop(first);

    assert!(listener.wait_for_count("CheckedIn", 1, Duration::from_secs(1)).await);

    pool.clear(false).await;
    assert_eq!(pool.generation(), 1, "clear() must bump the generation even without pausing");

    let second = pool.check_out().await.expect("checkout must still succeed after a non-pausing clear");
    assert_ne!(second.id(), first_id, "the pre-clear connection must not be handed back out");
    assert_eq!(second.generation(), 1);

    assert_eq!(listener.count("PoolCreated"), 1);
    assert_eq!(listener.count("PoolCleared"), 1);
    assert!(listener.count("ConnectionCreated") >= 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn credentials_reach_the_authenticator_collaborator_on_every_fresh_connection() {
    let credential = Credential {
        mechanism: Some("SCRAM-SHA-256".to_string()),
        source: Some("admin".to_string()),
        username: Some("driver-integration-test".to_string()),
        password: Some("hunter2".to_string()),
    };

    let (pool, _listener, authenticator) = build_pool(Some(credential.clone()), |_| {});

    let connection = pool.check_out().await.unwrap();
    drop(connection);

    let seen = authenticator.seen_credentials();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0], credential);
}

#[tokio::test(flavor = "multi_thread")]
async fn a_paused_pool_rejects_checkouts_until_mark_ready_and_then_recovers() {
    let listener = RecordingListener::new();
    let options = PoolOptions::builder()
        .event_listener(Arc::new(listener.clone()) as Arc<dyn EventListener>)
        .build();
    let pool: TestPool = Pool::new(
        Address::new("localhost", Some(27017)),
        options,
        MockDialer::new(),
        MockHandshaker::new(),
        MockAuthenticator::new(),
        None,
    )
    .unwrap();

    let error = pool.check_out().await.expect_err("a pool with pause_enabled left at its default must start PAUSED");
    assert!(matches!(&*error.kind, ErrorKind::PoolPaused { .. }));
    assert_eq!(listener.count("CheckOutFailed"), 1);

    pool.mark_ready().await;
    let connection = pool
        .check_out()
        .await
        .expect("checkout must succeed once the pool has been explicitly marked ready");
    drop(connection);

    assert!(listener
        .events()
        .iter()
        .any(|event| matches!(event, PoolEvent::PoolReady(_))));
}

#[tokio::test(flavor = "multi_thread")]
async fn maintenance_backfills_min_pool_size_and_later_prunes_idle_connections() {
    let (pool, _listener, _authenticator) = build_pool(None, |o| {
        o.min_pool_size = Some(2);
        o.max_idle_time = Some(Duration::from_millis(20));
    });

    pool.run_maintenance_once().await;

    let a = pool.check_out().await.unwrap();
    let b = pool.check_out().await.unwrap();
    let a_id = a.id();
    drop(a);
    drop(b);

    tokio::time::sleep(Duration::from_millis(40)).await;
    pool.run_maintenance_once().await;

    let fresh = pool.check_out().await.unwrap();
    assert_ne!(fresh.id(), a_id, "idle-pruned connections must never be handed back out");
}

#[test]
fn unix_socket_addresses_are_recognized_without_constructing_a_pool() {
    let unix = Address::new("/tmp/connpool-integration.sock", None);
    assert!(unix.is_unix_socket());
    assert_eq!(unix.to_string(), "/tmp/connpool-integration.sock");

    let tcp = Address::new("db.example.com", Some(27017));
    assert!(!tcp.is_unix_socket());
    assert_eq!(tcp.to_string(), "db.example.com:27017");
}
