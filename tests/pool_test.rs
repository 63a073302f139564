mod common;

use common::{endpoint, FakeConnector, FakeServer};
use ftp_turbo::config::PoolConfig;
use ftp_turbo::error::{EngineError, ErrorKind};
use ftp_turbo::metrics::{InMemoryMetrics, NoopMetrics};
use ftp_turbo::pool::ConnectionPool;
use proptest::prelude::*;
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn small_pool(server: &FakeServer) -> ConnectionPool {
    let config = PoolConfig {
        max_connections: 2,
        max_queue_wait_time: Duration::from_millis(500),
        ..PoolConfig::default()
    };
    ConnectionPool::new(config, server.connector(), Arc::new(NoopMetrics))
}

#[tokio::test(start_paused = true)]
async fn test_third_request_waits_for_release() {
    let server = FakeServer::new();
    let pool = small_pool(&server);
    let endpoint = endpoint();

    let first = pool.acquire(&endpoint).await.unwrap();
    let second = pool.acquire(&endpoint).await.unwrap();

    let waiter = {
        let pool = pool.clone();
        let endpoint = endpoint.clone();
        tokio::spawn(async move { pool.acquire(&endpoint).await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!waiter.is_finished());
    assert_eq!(pool.stats_for(&endpoint.server_key()).unwrap().queued, 1);

    let first_id = first.id().to_string();
    pool.release(first).await;
    let third = waiter.await.unwrap().unwrap();

    // Handed over, not reconnected.
    assert_eq!(third.id(), first_id);
    assert_eq!(server.state().connects, 2);
    assert!(server.max_live() <= 2);

    pool.release(second).await;
    pool.release(third).await;
}

#[tokio::test(start_paused = true)]
async fn test_queued_request_times_out() {
    let server = FakeServer::new();
    let pool = small_pool(&server);
    let endpoint = endpoint();

    let _first = pool.acquire(&endpoint).await.unwrap();
    let _second = pool.acquire(&endpoint).await.unwrap();

    let started = tokio::time::Instant::now();
    let err = pool.acquire(&endpoint).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::QueueTimeout);
    assert!(matches!(err, EngineError::QueueTimeout { waited, .. } if waited == Duration::from_millis(500)));
    assert!(started.elapsed() >= Duration::from_millis(500));

    let stats = pool.stats_for(&endpoint.server_key()).unwrap();
    assert_eq!(stats.queued, 0);
    assert_eq!(stats.failed_requests, 1);
    assert_eq!(stats.total_requests, 3);
}

#[tokio::test(start_paused = true)]
async fn test_waiters_are_served_in_arrival_order() {
    let server = FakeServer::new();
    let config = PoolConfig {
        max_connections: 1,
        ..PoolConfig::default()
    };
    let pool = ConnectionPool::new(config, server.connector(), Arc::new(NoopMetrics));
    let endpoint = endpoint();
    let order = Arc::new(Mutex::new(Vec::new()));

    let held = pool.acquire(&endpoint).await.unwrap();
    let mut handles = Vec::new();
    for label in ["a", "b", "c"] {
        let pool = pool.clone();
        let endpoint = endpoint.clone();
        let order = order.clone();
        handles.push(tokio::spawn(async move {
            let session = pool.acquire(&endpoint).await.unwrap();
            order.lock().unwrap().push(label);
            tokio::time::sleep(Duration::from_millis(10)).await;
            pool.release(session).await;
        }));
        // Let this waiter enqueue before the next one arrives.
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    pool.release(held).await;
    for handle in handles {
        handle.await.unwrap();
    }

    assert_eq!(*order.lock().unwrap(), vec!["a", "b", "c"]);
    assert_eq!(server.state().connects, 1);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_acquisitions_never_exceed_cap() {
    let server = FakeServer::new();
    let connector = FakeConnector::with_delay(&server, Duration::from_millis(20));
    let config = PoolConfig {
        max_connections: 3,
        ..PoolConfig::default()
    };
    let metrics = Arc::new(InMemoryMetrics::new());
    let pool = ConnectionPool::new(config, connector, metrics.clone());
    let endpoint = endpoint();

    // All arrive in the same scheduling turn, while every dial is still pending.
    let handles: Vec<_> = (0..10)
        .map(|_| {
            let pool = pool.clone();
            let endpoint = endpoint.clone();
            tokio::spawn(async move {
                let session = pool.acquire(&endpoint).await.unwrap();
                tokio::time::sleep(Duration::from_millis(50)).await;
                pool.release(session).await;
            })
        })
        .collect();
    for handle in handles {
        handle.await.unwrap();
    }

    assert_eq!(server.max_live(), 3);
    assert_eq!(server.state().connects, 3);
    let summary = metrics.summary();
    assert_eq!(summary.pool_misses, 3);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_closes_idle_sessions() {
    let server = FakeServer::new();
    let pool = small_pool(&server);
    let endpoint = endpoint();

    let a = pool.acquire(&endpoint).await.unwrap();
    let b = pool.acquire(&endpoint).await.unwrap();
    pool.release(a).await;
    pool.release(b).await;
    assert_eq!(server.state().live, 2);

    pool.shutdown().await;
    assert_eq!(server.state().live, 0);
    assert!(matches!(
        pool.acquire(&endpoint).await,
        Err(EngineError::PoolShutdown)
    ));
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn prop_live_sessions_bounded_by_cap(max in 1_usize..4, tasks in 1_usize..12, hold_ms in 1_u64..30) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .start_paused(true)
            .build()
            .unwrap();

        let (max_live, served) = runtime.block_on(async move {
            let server = FakeServer::new();
            let config = PoolConfig {
                max_connections: max,
                min_connections: 1,
                max_queue_wait_time: Duration::from_secs(60),
                ..PoolConfig::default()
            };
            let pool = ConnectionPool::new(config, server.connector(), Arc::new(NoopMetrics));
            let endpoint = endpoint();

            let handles: Vec<_> = (0..tasks)
                .map(|_| {
                    let pool = pool.clone();
                    let endpoint = endpoint.clone();
                    tokio::spawn(async move {
                        let session = pool.acquire(&endpoint).await?;
                        tokio::time::sleep(Duration::from_millis(hold_ms)).await;
                        pool.release(session).await;
                        Ok::<_, EngineError>(())
                    })
                })
                .collect();
            let mut served = 0;
            for handle in handles {
                if handle.await.unwrap().is_ok() {
                    served += 1;
                }
            }
            (server.max_live(), served)
        });

        prop_assert!(max_live <= max);
        prop_assert_eq!(served, tasks);
    }
}
