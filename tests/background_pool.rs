//! Lazy cells driven by an explicitly configured background pool.

#[macro_use]
mod common;

use common::*;
use lazy_coalesce::{
    AsyncLazy, BackgroundPool, CancelToken, Deferred, ErrorKind, PoolConfig, Spawn,
};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn small_pool() -> Arc<BackgroundPool> {
    Arc::new(
        BackgroundPool::new(PoolConfig {
            min_threads: 0,
            max_threads: 2,
            idle_timeout: Duration::from_millis(100),
            thread_name_prefix: "cells".to_string(),
        })
        .expect("valid pool config"),
    )
}

#[test]
fn cell_runs_pending_computation_on_its_pool() {
    init_test_logging();
    test_phase!("cell_runs_pending_computation_on_its_pool");
    let pool = small_pool();
    let cell = AsyncLazy::builder()
        .spawner(pool.clone())
        .build(|_| async {
            sleep(Duration::from_millis(10)).await?;
            let name = thread::current().name().map(str::to_string);
            Ok::<_, lazy_coalesce::Error>(name)
        });

    let name = cell
        .get_blocking(&CancelToken::none())
        .expect("computation succeeds")
        .expect("pool threads are named");
    assert!(name.starts_with("cells-worker-"), "ran on {name}");
    test_complete!("cell_runs_pending_computation_on_its_pool");
}

#[test]
fn shut_down_pool_rejects_new_rounds() {
    init_test_logging();
    test_phase!("shut_down_pool_rejects_new_rounds");
    let pool = small_pool();
    assert!(pool.shutdown_and_wait(Duration::from_secs(2)));

    let cell: AsyncLazy<u8> = AsyncLazy::builder()
        .spawner(pool)
        .build(|_| async move { sleep(Duration::from_millis(1)).await.map(|()| 1) });

    assert_err_kind!(cell.get_blocking(&CancelToken::none()), ErrorKind::Spawn);
    assert!(!cell.is_cached());
    test_complete!("shut_down_pool_rejects_new_rounds");
}

#[test]
fn computation_stranded_by_shutdown_releases_waiters() {
    init_test_logging();
    test_phase!("computation_stranded_by_shutdown_releases_waiters");
    let pool = small_pool();
    let (gate_completer, gate) = Deferred::<u8>::pending();
    let cell = AsyncLazy::builder().spawner(pool.clone()).build(move |_| {
        let gate = gate.clone();
        async move { gate.await }
    });

    let waiter = cell.get_async(&CancelToken::none());
    assert!(wait_until(Duration::from_secs(2), || pool.active_threads() > 0));
    assert!(pool.shutdown_and_wait(Duration::from_secs(2)));
    assert!(!waiter.is_completed());

    test_section!("wake after the last worker exited");
    gate_completer.complete(Ok(3));
    assert_err_kind!(waiter.wait(), ErrorKind::Spawn);
    assert!(!cell.is_cached());
    test_complete!("computation_stranded_by_shutdown_releases_waiters");
}

#[test]
fn pool_is_usable_as_a_plain_spawner() {
    init_test_logging();
    let pool = small_pool();
    let (completer, deferred) = Deferred::pending();
    pool.spawn(Box::pin(async move {
        let value = sleep(Duration::from_millis(5)).await.map(|()| "done");
        completer.complete(value);
    }))
    .expect("spawn");
    assert_eq!(deferred.wait().ok(), Some("done"));
}
