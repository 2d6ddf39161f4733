//! Connection pool tests against the in-memory directory.
//!
//! Invariants checked:
//! - Live connections never exceed `max`
//! - Every lease is released exactly once (borrowed == released at rest)
//! - Broken connections are discarded and replaced on demand
//! - Exhaustion surfaces as an error within the acquire timeout

use std::time::{Duration, Instant};

use dsmlgw_core::{
    ConnectionPool, Constraints, DirectoryConnection, MemoryConnector, MemoryDirectory,
    PoolConfig, PoolError,
};

fn pool(dir: &MemoryDirectory, min: usize, max: usize) -> ConnectionPool<MemoryConnector> {
    ConnectionPool::new("test", dir.connector(), PoolConfig {
        min,
        max,
        acquire_timeout: Duration::from_millis(100),
        constraints: Constraints { default_size_limit: 50, ..Constraints::default() },
    })
}

// Oracle: nothing outstanding and every lease came back
fn assert_balanced(pool: &ConnectionPool<MemoryConnector>) {
    let stats = pool.stats();
    assert_eq!(stats.borrowed, stats.released, "lease leaked: {stats:?}");
    assert_eq!(stats.in_use(), 0);
}

#[tokio::test]
async fn warm_up_opens_min_connections() {
    let dir = MemoryDirectory::new();
    let pool = pool(&dir, 3, 5);

    pool.warm_up().await.unwrap();

    assert_eq!(pool.stats().idle, 3);
    assert_eq!(dir.connections_opened(), 3);
}

#[tokio::test]
async fn warm_up_counts_outstanding_leases() {
    let dir = MemoryDirectory::new();
    let pool = pool(&dir, 2, 2);

    let a = pool.borrow().await.unwrap();
    let b = pool.borrow().await.unwrap();
    pool.warm_up().await.unwrap();
    assert_eq!(dir.connections_opened(), 2);
    assert_eq!(pool.stats().idle, 0);

    drop(a);
    pool.warm_up().await.unwrap();
    assert_eq!(dir.connections_opened(), 2);

    drop(b);
    assert_eq!(pool.stats().idle, 2);
    assert_balanced(&pool);
}

#[tokio::test]
async fn warm_up_tops_up_to_min() {
    let dir = MemoryDirectory::new();
    let pool = pool(&dir, 3, 4);

    let lease = pool.borrow().await.unwrap();
    pool.warm_up().await.unwrap();

    // One leased plus two idle.
    assert_eq!(pool.stats().idle, 2);
    assert_eq!(dir.connections_opened(), 3);
    drop(lease);
    assert_balanced(&pool);
}

#[tokio::test]
async fn released_connections_are_reused() {
    let dir = MemoryDirectory::new();
    let pool = pool(&dir, 0, 2);

    for _ in 0..10 {
        let conn = pool.borrow().await.unwrap();
        drop(conn);
    }

    assert_eq!(dir.connections_opened(), 1);
    assert_balanced(&pool);
}

#[tokio::test]
async fn release_resets_constraints() {
    let dir = MemoryDirectory::new();
    let pool = pool(&dir, 0, 1);

    {
        let mut conn = pool.borrow().await.unwrap();
        conn.set_constraints(Constraints {
            proxied_authorization: Some("dn:uid=bo".into()),
            ..Constraints::default()
        });
    }

    let conn = pool.borrow().await.unwrap();
    assert_eq!(conn.constraints().proxied_authorization, None);
    assert_eq!(conn.constraints().default_size_limit, 50);
}

#[tokio::test]
async fn exhaustion_times_out() {
    let dir = MemoryDirectory::new();
    let pool = pool(&dir, 0, 2);

    let _a = pool.borrow().await.unwrap();
    let _b = pool.borrow().await.unwrap();

    let started = Instant::now();
    let err = pool.borrow().await.unwrap_err();
    assert!(matches!(err, PoolError::Exhausted { .. }));
    assert!(started.elapsed() >= Duration::from_millis(100));
    assert_eq!(dir.connections_opened(), 2);
}

#[tokio::test]
async fn waiting_borrower_gets_released_slot() {
    let dir = MemoryDirectory::new();
    let pool = pool(&dir, 0, 1);

    let held = pool.borrow().await.unwrap();
    let waiter = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.borrow().await.map(drop) })
    };

    tokio::time::sleep(Duration::from_millis(20)).await;
    drop(held);

    assert!(waiter.await.unwrap().is_ok());
    assert_balanced(&pool);
}

#[tokio::test]
async fn broken_lease_is_discarded_and_replaced() {
    let dir = MemoryDirectory::new();
    let pool = pool(&dir, 0, 1);

    {
        let mut conn = pool.borrow().await.unwrap();
        conn.mark_broken();
    }
    assert_eq!(pool.stats().discarded, 1);
    assert_eq!(pool.stats().idle, 0);

    let _conn = pool.borrow().await.unwrap();
    assert_eq!(dir.connections_opened(), 2);
}

#[tokio::test]
async fn connections_broken_while_idle_are_skipped() {
    let dir = MemoryDirectory::new();
    let pool = pool(&dir, 2, 2);
    pool.warm_up().await.unwrap();

    dir.break_connections();
    let conn = pool.borrow().await.unwrap();

    assert!(!conn.is_broken());
    assert_eq!(pool.stats().discarded, 2);
    assert_eq!(dir.connections_opened(), 3);
}

#[tokio::test]
async fn connect_failure_frees_the_slot() {
    let dir = MemoryDirectory::new();
    let pool = pool(&dir, 0, 1);

    dir.fail_next_connects(1);
    assert!(matches!(pool.borrow().await, Err(PoolError::Connect { .. })));

    // The failed attempt must not have consumed the only permit.
    assert!(pool.borrow().await.is_ok());
}

#[tokio::test]
async fn closed_pool_refuses_borrows() {
    let dir = MemoryDirectory::new();
    let pool = pool(&dir, 1, 2);
    pool.warm_up().await.unwrap();

    let outstanding = pool.borrow().await.unwrap();
    pool.close().await;

    assert!(matches!(pool.borrow().await, Err(PoolError::Closed(_))));
    drop(outstanding);
    assert_eq!(pool.stats().idle, 0);
    assert_balanced(&pool);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_borrowers_stay_within_bounds() {
    let dir = MemoryDirectory::new();
    let pool = ConnectionPool::new("test", dir.connector(), PoolConfig {
        min: 0,
        max: 3,
        acquire_timeout: Duration::from_secs(5),
        constraints: Constraints::default(),
    });

    let mut tasks = Vec::new();
    for _ in 0..32 {
        let pool = pool.clone();
        tasks.push(tokio::spawn(async move {
            for _ in 0..10 {
                let conn = pool.borrow().await.unwrap();
                assert!(pool.stats().in_use() <= 3);
                tokio::task::yield_now().await;
                drop(conn);
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    assert!(dir.connections_opened() <= 3);
    assert_eq!(pool.stats().borrowed, 320);
    assert_balanced(&pool);
}
