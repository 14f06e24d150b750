//! Unit tests for the floating IP pool.

use std::collections::BTreeSet;
use std::sync::Arc;

use rstest::rstest;

use super::*;
use crate::test_support::MemoryProvider;

fn pool_with(capacity: usize, ids: &[&str]) -> ResourcePool {
    let pool = ResourcePool::new(capacity);
    for id in ids {
        pool.release(*id).expect("seed pool");
    }
    pool
}

#[rstest]
fn empty_pool_acquire_returns_none() {
    let pool = ResourcePool::new(2);
    assert_eq!(pool.try_acquire(), None);
    assert_eq!(pool.available(), 0);
}

#[rstest]
fn acquire_is_first_in_first_out() {
    let pool = pool_with(3, &["fip-a", "fip-b"]);
    assert_eq!(pool.try_acquire().as_deref(), Some("fip-a"));
    assert_eq!(pool.snapshot(), vec![String::from("fip-b")]);
}

#[rstest]
fn release_beyond_capacity_is_refused() {
    let pool = pool_with(1, &["fip-a"]);
    let err = pool.release("fip-b").expect_err("pool full");
    assert_eq!(
        err,
        PoolError::Full {
            id: String::from("fip-b"),
            capacity: 1
        }
    );
    assert_eq!(err.id(), "fip-b");
    assert_eq!(pool.available(), 1);
}

#[rstest]
fn concurrent_acquires_never_share_an_identifier() {
    let ids: Vec<String> = (0..64).map(|n| format!("fip-{n}")).collect();
    let pool = Arc::new(ResourcePool::new(ids.len()));
    for id in &ids {
        pool.release(id.clone()).expect("seed");
    }

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let shared = Arc::clone(&pool);
            std::thread::spawn(move || {
                let mut taken = Vec::new();
                while let Some(id) = shared.try_acquire() {
                    taken.push(id);
                }
                taken
            })
        })
        .collect();

    let mut all = Vec::new();
    for handle in handles {
        all.extend(handle.join().expect("worker"));
    }
    let unique: BTreeSet<_> = all.iter().cloned().collect();
    assert_eq!(all.len(), ids.len());
    assert_eq!(unique.len(), ids.len());
    assert_eq!(pool.available(), 0);
}

#[tokio::test]
async fn drain_deletes_everything_and_closes() {
    let provider = MemoryProvider::new();
    let first = provider.seed_floating_ip();
    let second = provider.seed_floating_ip();
    let pool = pool_with(4, &[first.as_str(), second.as_str()]);

    let report = pool.drain_and_destroy(&provider).await;

    assert!(report.is_clean());
    assert_eq!(report.deleted, vec![first.clone(), second]);
    assert!(provider.floating_ip_ids().is_empty());
    assert!(pool.is_closed());
    assert_eq!(pool.try_acquire(), None);
    assert_eq!(
        pool.release(first.clone()),
        Err(PoolError::Closed { id: first })
    );
}

#[tokio::test]
async fn drain_continues_past_failures() {
    let provider = MemoryProvider::new();
    let stuck = provider.seed_floating_ip();
    let fine = provider.seed_floating_ip();
    provider.fail_delete_floating_ip(&stuck);
    let pool = pool_with(2, &[stuck.as_str(), fine.as_str()]);

    let report = pool.drain_and_destroy(&provider).await;

    assert!(!report.is_clean());
    assert_eq!(report.deleted, vec![fine]);
    let [(failed_id, _)] = report.failed.as_slice() else {
        panic!("expected one failure, got {:?}", report.failed);
    };
    assert_eq!(failed_id, &stuck);
    assert_eq!(provider.floating_ip_ids(), vec![stuck]);
}
