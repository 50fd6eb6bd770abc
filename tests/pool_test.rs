//! Connection pool behavior under contention, failure and shutdown.

mod common;

use common::{FakeConnector, FakeState, fake_session, pool_settings};
use db_tool_server::db::{Lease, Pool};
use db_tool_server::error::ErrorKind;
use db_tool_server::models::AccessPolicy;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio_test::{assert_pending, assert_ready_ok, task};

const WAIT: Duration = Duration::from_secs(5);

fn pool(max: u32) -> (Arc<Pool<FakeConnector>>, Arc<FakeState>) {
    let connector = FakeConnector::new(0);
    let state = Arc::clone(&connector.state);
    (Pool::new("main", connector, pool_settings(max)), state)
}

#[tokio::test]
async fn test_second_acquire_waits_for_release_then_pool_closes() {
    let (pool, state) = pool(1);

    let first = pool.acquire(WAIT).await.unwrap();
    let mut second = task::spawn({
        let pool = Arc::clone(&pool);
        async move { pool.acquire(WAIT).await }
    });
    assert_pending!(second.poll());
    assert_pending!(second.poll());
    assert_eq!(pool.stats().outstanding, 1);

    let first_conn = first.connection_id();
    first.release();
    assert!(second.is_woken());
    let lease = assert_ready_ok!(second.poll());
    assert_eq!(lease.connection_id(), first_conn);
    assert_eq!(FakeState::count(&state.connects), 1);
    lease.release();

    pool.shutdown(Duration::from_millis(100)).await;
    let err = pool.acquire(WAIT).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PoolClosed);
    assert!(pool.stats().closed);
}

#[tokio::test]
async fn test_waiters_are_served_in_arrival_order() {
    let (pool, _state) = pool(1);
    let held = pool.acquire(WAIT).await.unwrap();

    let mut early = task::spawn({
        let pool = Arc::clone(&pool);
        async move { pool.acquire(WAIT).await }
    });
    let mut late = task::spawn({
        let pool = Arc::clone(&pool);
        async move { pool.acquire(WAIT).await }
    });
    assert_pending!(early.poll());
    assert_pending!(late.poll());

    held.release();
    assert_pending!(late.poll());
    let lease = assert_ready_ok!(early.poll());
    lease.release();
    let lease = assert_ready_ok!(late.poll());
    lease.release();
}

#[tokio::test]
async fn test_shutdown_fails_queued_waiters() {
    let (pool, _state) = pool(1);
    let held = pool.acquire(WAIT).await.unwrap();

    let mut waiter = task::spawn({
        let pool = Arc::clone(&pool);
        async move { pool.acquire(WAIT).await }
    });
    assert_pending!(waiter.poll());

    let shutdown = tokio::spawn({
        let pool = Arc::clone(&pool);
        async move { pool.shutdown(WAIT).await }
    });
    tokio::task::yield_now().await;
    held.release();
    shutdown.await.unwrap();

    match waiter.poll() {
        std::task::Poll::Ready(Err(err)) => assert_eq!(err.kind(), ErrorKind::PoolClosed),
        other => panic!("expected PoolClosed, got {other:?}"),
    }
    assert_eq!(pool.stats().size, 0);
}

#[tokio::test]
async fn test_connection_reset_mid_query_replaces_connection() {
    let (session, state) = fake_session(AccessPolicy::ReadOnly, 5);
    state
        .reset_next_fetch
        .store(true, std::sync::atomic::Ordering::SeqCst);

    let err = session
        .dispatch(
            "executeQuery",
            json!({"datasource": "main", "sql": "SELECT * FROM orders"}),
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConnectionFatal);

    let pool = Arc::clone(session.datasource("main").unwrap().pool);
    let stats = pool.stats();
    assert_eq!(stats.size, 0);
    assert_eq!(stats.outstanding, 0);

    let lease = pool.acquire(WAIT).await.unwrap();
    assert_eq!(FakeState::count(&state.connects), 2);
    lease.release();

    let ok = session
        .dispatch(
            "executeQuery",
            json!({"datasource": "main", "sql": "SELECT * FROM orders"}),
        )
        .await
        .unwrap();
    assert_eq!(ok["rowCount"], 5);
    assert_eq!(FakeState::count(&state.connects), 2);
}

#[tokio::test]
async fn test_failed_connect_gives_slot_back() {
    let (pool, state) = pool(1);
    state
        .fail_connects
        .store(true, std::sync::atomic::Ordering::SeqCst);
    let err = pool.acquire(WAIT).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConnectionFatal);
    assert_eq!(pool.stats().size, 0);

    state
        .fail_connects
        .store(false, std::sync::atomic::Ordering::SeqCst);
    let lease = pool.acquire(WAIT).await.unwrap();
    lease.release();
}

#[tokio::test]
async fn test_cancelled_acquire_leaves_no_trace() {
    let (pool, _state) = pool(1);
    let held = pool.acquire(WAIT).await.unwrap();

    let mut waiter = task::spawn({
        let pool = Arc::clone(&pool);
        async move { pool.acquire(WAIT).await }
    });
    assert_pending!(waiter.poll());
    drop(waiter);

    held.release();
    let stats = pool.stats();
    assert_eq!(stats.outstanding, 0);
    assert_eq!(stats.size, 1);
    let lease = pool.acquire(Duration::from_millis(10)).await.unwrap();
    lease.release();
}

enum Op {
    Acquire,
    Release,
    Invalidate,
    Drop,
}

#[tokio::test(start_paused = true)]
async fn test_random_interleavings_respect_bounds() {
    const MAX: u32 = 3;

    for seed in [1u64, 7, 42, 1337, 0xdead_beef] {
        let (pool, _state) = pool(MAX);
        let mut rng = StdRng::seed_from_u64(seed);
        let mut held: Vec<Lease<FakeConnector>> = Vec::new();

        for step in 0..300 {
            let op = match rng.gen_range(0..10) {
                0..=3 => Op::Acquire,
                4..=6 => Op::Release,
                7..=8 => Op::Invalidate,
                _ => Op::Drop,
            };
            match op {
                Op::Acquire => match pool.acquire(Duration::from_millis(20)).await {
                    Ok(lease) => held.push(lease),
                    Err(err) => {
                        assert_eq!(err.kind(), ErrorKind::AcquireTimeout, "seed {seed} step {step}");
                        assert_eq!(held.len(), MAX as usize, "seed {seed} step {step}");
                    }
                },
                Op::Release | Op::Invalidate | Op::Drop if !held.is_empty() => {
                    let lease = held.swap_remove(rng.gen_range(0..held.len()));
                    match op {
                        Op::Release => lease.release(),
                        Op::Invalidate => lease.invalidate(),
                        _ => drop(lease),
                    }
                }
                _ => {}
            }

            let stats = pool.stats();
            assert!(stats.outstanding <= MAX, "seed {seed} step {step}: {stats:?}");
            assert!(stats.size <= MAX, "seed {seed} step {step}: {stats:?}");
            assert_eq!(stats.outstanding as usize, held.len(), "seed {seed} step {step}");
            assert_eq!(stats.size, stats.idle + stats.outstanding, "seed {seed} step {step}");
        }

        for lease in held.drain(..) {
            lease.release();
        }
        pool.shutdown(Duration::from_millis(10)).await;
        assert_eq!(pool.stats().size, 0);
    }
}
