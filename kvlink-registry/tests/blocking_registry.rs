mod common;

use std::path::PathBuf;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use common::{fast_options, strict_options, FakeConnector};
use kvlink_client::Endpoint;
use kvlink_registry::{
    CancellationToken, CloseOutcome, ConfigSource, ProbeOutcome, Registry, RegistryError,
};

fn registry() -> (Registry<FakeConnector>, FakeConnector) {
    let connector = FakeConnector::default();
    (Registry::with_options(connector.clone(), fast_options()), connector)
}

#[test]
fn init_twice_creates_one_pool() {
    let (registry, fake) = registry();
    registry.init(0).unwrap();
    registry.init(0).unwrap();
    assert_eq!(fake.state.opened(), 1);
    assert_eq!(registry.indices(), vec![0]);
}

#[test]
fn get_initializes_once_and_returns_same_pool() {
    let (registry, fake) = registry();
    let first = registry.get(5).unwrap();
    let second = registry.get(5).unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(fake.state.opened(), 1);
    assert_eq!(first.handle.db, 5);
}

#[test]
fn indices_get_independent_pools() {
    let (registry, fake) = registry();
    let zero = registry.get(0).unwrap();
    let three = registry.get(3).unwrap();
    assert!(!Arc::ptr_eq(&zero, &three));
    assert_eq!(fake.state.opened(), 2);
    assert_eq!(registry.indices(), vec![0, 3]);
}

#[test]
fn concurrent_get_for_new_index_creates_one_pool() {
    let connector = FakeConnector {
        open_delay: Duration::from_millis(20),
        ..FakeConnector::default()
    };
    let registry = Registry::with_options(connector.clone(), fast_options());
    let barrier = Arc::new(Barrier::new(8));

    let workers: Vec<_> = (0..8)
        .map(|_| {
            let registry = registry.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                registry.get(7).unwrap()
            })
        })
        .collect();
    let handles: Vec<_> = workers.into_iter().map(|w| w.join().unwrap()).collect();

    assert_eq!(connector.state.opened(), 1);
    assert!(handles.iter().all(|h| Arc::ptr_eq(h, &handles[0])));
}

#[test]
fn init_retries_connection_failures_until_ready() {
    let (registry, fake) = registry();
    fake.state.fail_next_pings(3);
    registry.init(0).unwrap();

    assert_eq!(fake.state.pings(), 4);
    assert_eq!(fake.state.opened(), 4);
    // Each unreachable pool is closed before the next attempt.
    assert_eq!(fake.state.closed(), 3);
    assert!(registry.get(0).is_ok());
}

#[test]
fn swallowed_failure_leaves_index_broken() {
    let (registry, fake) = registry();
    fake.state.reject_auth();

    registry.init(2).unwrap();
    assert_eq!(registry.indices(), vec![2]);
    assert!(matches!(registry.get(2), Err(RegistryError::Unavailable { db: 2 })));

    // Present means attempted: no second attempt until close.
    registry.init(2).unwrap();
    assert_eq!(fake.state.pings(), 0);

    assert_eq!(registry.close().unwrap(), CloseOutcome::Closed(0));
    assert!(registry.indices().is_empty());
}

#[test]
fn propagated_failure_leaves_index_absent() {
    let connector = FakeConnector::default();
    let registry = Registry::with_options(connector.clone(), strict_options());
    connector.state.reject_auth();

    let err = registry.init(1).unwrap_err();
    assert!(matches!(err, RegistryError::Init { db: 1, .. }));
    assert!(registry.indices().is_empty());
    assert!(matches!(registry.get(1), Err(RegistryError::Init { db: 1, .. })));
}

#[test]
fn bad_environment_is_an_init_failure() {
    let connector = FakeConnector::default();
    let options = fast_options().with_source(ConfigSource::fixed([("REDIS_MAX_CONNECTIONS", "plenty")]));
    let registry = Registry::with_options(connector.clone(), options);

    registry.init(0).unwrap();
    assert!(matches!(registry.get(0), Err(RegistryError::Unavailable { db: 0 })));
    assert_eq!(connector.state.opened(), 0);
}

#[test]
fn cancel_stops_retry_loop() {
    let (registry, fake) = registry();
    fake.state.set_down(true);
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    thread::spawn(move || {
        thread::sleep(Duration::from_millis(30));
        trigger.cancel();
    });

    let err = registry.init_with_cancel(0, &cancel).unwrap_err();
    assert!(matches!(err, RegistryError::Cancelled { db: 0 }));
    assert!(registry.indices().is_empty());
    assert!(fake.state.pings() >= 1);
}

#[test]
fn tcp_transport_selected_when_host_and_port_set() {
    let (registry, fake) = registry();
    registry.init(0).unwrap();
    let config = fake.state.last_config().unwrap();
    assert_eq!(
        config.endpoint,
        Endpoint::Tcp {
            host: "localhost".to_string(),
            port: 6379
        }
    );
    assert!(config.decode_responses);
}

#[test]
fn socket_transport_selected_without_port() {
    let connector = FakeConnector::default();
    let source = ConfigSource::fixed([
        ("REDIS_HOST", "localhost"),
        ("REDIS_UNIX_SOCKET_PATH", "/tmp/redis.sock"),
    ]);
    let registry = Registry::with_options(connector.clone(), fast_options().with_source(source));
    registry.init(4).unwrap();

    let config = connector.state.last_config().unwrap();
    assert_eq!(config.endpoint, Endpoint::Unix(PathBuf::from("/tmp/redis.sock")));
    assert_eq!(config.db, 4);
}

#[test]
fn probe_on_empty_registry_makes_no_calls() {
    let (registry, fake) = registry();
    assert_eq!(registry.reconnect_probe(30, 5).unwrap(), ProbeOutcome::NotInitialized);
    assert_eq!(fake.state.pings(), 0);
    assert_eq!(fake.state.opened(), 0);
}

#[test]
fn probe_times_out_when_outage_outlasts_budget() {
    let (registry, fake) = registry();
    registry.init(0).unwrap();
    // Down for 20 units at a 5-unit poll interval.
    fake.state.fail_next_pings(4);

    assert_eq!(registry.reconnect_probe(5, 5).unwrap(), ProbeOutcome::TimedOut);
    assert_eq!(fake.state.pings(), 2);
}

#[test]
fn probe_recovers_within_budget() {
    let (registry, fake) = registry();
    registry.init(0).unwrap();
    fake.state.fail_next_pings(4);

    assert_eq!(registry.reconnect_probe(30, 5).unwrap(), ProbeOutcome::Connected);
    assert_eq!(fake.state.pings(), 1 + 5);
    assert_eq!(fake.state.opened(), 1);
}

#[test]
fn probe_budget_above_limit_is_reset() {
    let (registry, fake) = registry();
    registry.init(0).unwrap();
    fake.state.set_down(true);

    assert_eq!(registry.reconnect_probe(100, 5).unwrap(), ProbeOutcome::TimedOut);
    // 30 / 5 polls after the one ping made by init.
    assert_eq!(fake.state.pings(), 1 + 6);
}

#[test]
fn probe_touches_only_one_index() {
    let (registry, fake) = registry();
    registry.init(2).unwrap();
    registry.init(9).unwrap();
    let before = fake.state.pings();

    assert!(registry.reconnect_probe(30, 5).unwrap().is_connected());
    assert_eq!(fake.state.pings(), before + 1);
    assert_eq!(fake.state.opened(), 2);
}

#[test]
fn close_on_empty_registry_does_not_fail() {
    let (registry, _) = registry();
    assert_eq!(registry.close().unwrap(), CloseOutcome::NotInitialized);
}

#[test]
fn close_then_init_recreates_pool() {
    let (registry, fake) = registry();
    let before = registry.get(0).unwrap();

    assert_eq!(registry.close().unwrap(), CloseOutcome::Closed(1));
    assert_eq!(fake.state.closed(), 1);
    assert!(registry.indices().is_empty());

    registry.init(0).unwrap();
    let after = registry.get(0).unwrap();
    assert!(!Arc::ptr_eq(&before, &after));
    assert_eq!(fake.state.opened(), 2);
}

#[test]
fn close_failures_propagate_after_every_pool_is_attempted() {
    let (registry, fake) = registry();
    registry.init(0).unwrap();
    registry.init(1).unwrap();
    fake.state.fail_closes();

    match registry.close() {
        Err(RegistryError::Close { failures }) => {
            let dbs: Vec<u32> = failures.iter().map(|f| f.db).collect();
            assert_eq!(dbs, vec![0, 1]);
        }
        other => panic!("expected close failure, got {:?}", other),
    }
    assert_eq!(fake.state.closed(), 2);
    assert!(registry.indices().is_empty());
}

#[test]
fn lifespan_initializes_default_db_and_closes_on_drop() {
    let (registry, fake) = registry();
    {
        let lifespan = registry.scoped_lifespan().unwrap();
        assert_eq!(lifespan.indices(), vec![0]);
        lifespan.get(0).unwrap();
    }
    assert_eq!(fake.state.closed(), 1);
    assert!(registry.indices().is_empty());
}

#[test]
fn lifespan_finish_reports_close_result() {
    let (registry, fake) = registry();
    let lifespan = registry.scoped_lifespan().unwrap();
    assert_eq!(lifespan.finish().unwrap(), CloseOutcome::Closed(1));
    assert_eq!(fake.state.closed(), 1);
}

#[test]
fn dropping_last_registry_closes_remaining_pools() {
    let (registry, fake) = registry();
    registry.init(0).unwrap();
    let clone = registry.clone();
    drop(registry);
    assert_eq!(fake.state.closed(), 0);
    drop(clone);
    assert_eq!(fake.state.closed(), 1);
}

#[test]
fn unparsable_redis_db_does_not_break_init() {
    let connector = FakeConnector::default();
    let source = ConfigSource::fixed([
        ("REDIS_HOST", "localhost"),
        ("REDIS_PORT", "6379"),
        ("REDIS_DB", "primary"),
    ]);
    let registry = Registry::with_options(connector.clone(), fast_options().with_source(source));

    let pool = registry.get(2).unwrap();
    assert_eq!(pool.handle.db, 2);
    assert_eq!(connector.state.last_config().unwrap().db, 2);
}
