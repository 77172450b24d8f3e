mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{fast_options, strict_options, AsyncFakeConnector};
use kvlink_registry::{AsyncRegistry, CancellationToken, CloseOutcome, ProbeOutcome, RegistryError};

fn registry() -> (AsyncRegistry<AsyncFakeConnector>, AsyncFakeConnector) {
    let connector = AsyncFakeConnector::default();
    (AsyncRegistry::with_options(connector.clone(), fast_options()), connector)
}

#[tokio::test]
async fn get_initializes_once_and_returns_same_pool() {
    let (registry, fake) = registry();
    registry.init(0).await.unwrap();
    let first = registry.get(0).await.unwrap();
    let second = registry.get_default().await.unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(fake.state.opened(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_get_for_new_index_creates_one_pool() {
    let connector = AsyncFakeConnector {
        open_delay: Duration::from_millis(20),
        ..AsyncFakeConnector::default()
    };
    let registry = AsyncRegistry::with_options(connector.clone(), fast_options());

    let tasks: Vec<_> = (0..8)
        .map(|_| {
            let registry = registry.clone();
            tokio::spawn(async move { registry.get(3).await.unwrap() })
        })
        .collect();
    let mut handles = Vec::new();
    for task in tasks {
        handles.push(task.await.unwrap());
    }

    assert_eq!(connector.state.opened(), 1);
    assert!(handles.iter().all(|h| Arc::ptr_eq(h, &handles[0])));
}

#[tokio::test]
async fn slow_index_does_not_block_others() {
    let (registry, fake) = registry();
    fake.state.set_down(true);
    let cancel = CancellationToken::new();

    let stuck = {
        let registry = registry.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { registry.init_with_cancel(1, &cancel).await })
    };
    tokio::time::sleep(Duration::from_millis(15)).await;

    fake.state.set_down(false);
    registry.get(0).await.unwrap();
    cancel.cancel();

    let result = stuck.await.unwrap();
    // The retry loop may have seen the recovered server before the cancel.
    assert!(matches!(result, Ok(()) | Err(RegistryError::Cancelled { db: 1 })));
}

#[tokio::test]
async fn init_retries_connection_failures_until_ready() {
    let (registry, fake) = registry();
    fake.state.fail_next_pings(2);
    registry.init(0).await.unwrap();
    assert_eq!(fake.state.pings(), 3);
    assert_eq!(fake.state.closed(), 2);
}

#[tokio::test]
async fn swallowed_failure_leaves_index_broken() {
    let (registry, fake) = registry();
    fake.state.reject_auth();
    registry.init(0).await.unwrap();
    assert!(matches!(registry.get(0).await, Err(RegistryError::Unavailable { db: 0 })));
    assert_eq!(registry.indices(), vec![0]);
}

#[tokio::test]
async fn propagated_failure_leaves_index_absent() {
    let connector = AsyncFakeConnector::default();
    let registry = AsyncRegistry::with_options(connector.clone(), strict_options());
    connector.state.reject_auth();

    assert!(matches!(registry.init(0).await, Err(RegistryError::Init { db: 0, .. })));
    assert!(registry.indices().is_empty());
}

#[tokio::test]
async fn cancel_stops_retry_loop() {
    let (registry, fake) = registry();
    fake.state.set_down(true);
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(30)).await;
        trigger.cancel();
    });

    let err = registry.init_with_cancel(2, &cancel).await.unwrap_err();
    assert!(matches!(err, RegistryError::Cancelled { db: 2 }));
    assert!(registry.indices().is_empty());
}

#[tokio::test]
async fn probe_on_empty_registry_makes_no_calls() {
    let (registry, fake) = registry();
    assert_eq!(registry.reconnect_probe(30, 5).await.unwrap(), ProbeOutcome::NotInitialized);
    assert_eq!(fake.state.pings(), 0);
}

#[tokio::test]
async fn probe_times_out_then_recovers() {
    let (registry, fake) = registry();
    registry.init(0).await.unwrap();

    fake.state.fail_next_pings(4);
    assert_eq!(registry.reconnect_probe(5, 5).await.unwrap(), ProbeOutcome::TimedOut);

    // Three failures remain; a 30-unit budget outlasts them.
    assert_eq!(registry.reconnect_probe(30, 5).await.unwrap(), ProbeOutcome::Connected);
    assert_eq!(fake.state.pings(), 1 + 1 + 4);
}

#[tokio::test]
async fn probe_budget_above_limit_is_reset() {
    let (registry, fake) = registry();
    registry.init(0).await.unwrap();
    fake.state.set_down(true);

    assert_eq!(registry.reconnect_probe(100, 5).await.unwrap(), ProbeOutcome::TimedOut);
    assert_eq!(fake.state.pings(), 1 + 6);
}

#[tokio::test]
async fn close_then_init_recreates_pool() {
    let (registry, fake) = registry();
    assert_eq!(registry.close().await.unwrap(), CloseOutcome::NotInitialized);

    let before = registry.get(0).await.unwrap();
    assert_eq!(registry.close().await.unwrap(), CloseOutcome::Closed(1));
    let after = registry.get(0).await.unwrap();

    assert!(!Arc::ptr_eq(&before, &after));
    assert_eq!(fake.state.opened(), 2);
    assert_eq!(fake.state.closed(), 1);
}

#[tokio::test]
async fn close_failures_propagate_after_every_pool_is_attempted() {
    let (registry, fake) = registry();
    registry.init(0).await.unwrap();
    registry.init(5).await.unwrap();
    fake.state.fail_closes();

    match registry.close().await {
        Err(RegistryError::Close { failures }) => assert_eq!(failures.len(), 2),
        other => panic!("expected close failure, got {:?}", other),
    }
    assert!(registry.indices().is_empty());
}

#[tokio::test]
async fn lifespan_finish_closes_registry() {
    let (registry, fake) = registry();
    let lifespan = registry.scoped_lifespan().await.unwrap();
    lifespan.get(0).await.unwrap();
    assert_eq!(lifespan.finish().await.unwrap(), CloseOutcome::Closed(1));
    assert_eq!(fake.state.closed(), 1);
}

#[tokio::test]
async fn dropped_lifespan_closes_in_background() {
    let (registry, fake) = registry();
    {
        let _lifespan = registry.scoped_lifespan().await.unwrap();
    }
    for _ in 0..100 {
        if fake.state.closed() == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(fake.state.closed(), 1);
    assert!(registry.indices().is_empty());
}

#[tokio::test]
async fn run_scoped_closes_after_body() {
    let (registry, fake) = registry();
    let db = registry
        .run_scoped(|registry| async move {
            let pool = registry.get_default().await.unwrap();
            pool.handle.db
        })
        .await
        .unwrap();

    assert_eq!(db, 0);
    assert_eq!(fake.state.opened(), 1);
    assert_eq!(fake.state.closed(), 1);
    assert!(registry.indices().is_empty());
}
