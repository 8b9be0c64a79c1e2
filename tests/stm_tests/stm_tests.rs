//! Tests for the optimistic transaction engine
//!
//! These tests verify:
//! - Commit publishes writes, errors discard them
//! - Concurrent conflicting transactions re-run until they all commit
//! - Deferred loads run before the body is re-run
//! - Commit / rollback effects
//! - Held-open commits (continuations) block conflicting writers
//! - Nested transaction bodies are rejected
//! - Map misses leave no slots behind and never disturb concurrent iteration

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use atlasrepo::stm::{Stm, TMap, TVar};
use atlasrepo::RepoError;

const TIMEOUT: Duration = Duration::from_secs(10);

// =============================================================================
// Basic Commit / Abort
// =============================================================================

#[test]
fn test_commit_publishes_writes() {
    let stm = Stm::new();
    let var = TVar::new(1u64);

    let seen = stm
        .run(TIMEOUT, |txn| {
            var.set(txn, 2)?;
            Ok(*var.get(txn)?)
        })
        .unwrap();

    assert_eq!(seen, 2);
    assert_eq!(*var.load().unwrap(), 2);
}

#[test]
fn test_error_discards_writes() {
    let stm = Stm::new();
    let var = TVar::new(String::from("before"));

    let err = stm
        .run(TIMEOUT, |txn| {
            var.set(txn, String::from("after"))?;
            Err::<(), _>(RepoError::NotFound("nope".to_string()))
        })
        .unwrap_err();

    assert!(matches!(err, RepoError::NotFound(_)));
    assert_eq!(*var.load().unwrap(), "before");
}

#[test]
fn test_nested_body_is_rejected() {
    let stm = Stm::new();

    let err = stm
        .run(TIMEOUT, |_outer| {
            assert!(Stm::in_transaction());
            stm.run(TIMEOUT, |_inner| Ok(()))
        })
        .unwrap_err();

    assert!(matches!(err, RepoError::Protocol(_)));
    assert!(!Stm::in_transaction());
}

// =============================================================================
// Conflicts
// =============================================================================

#[test]
fn test_concurrent_increments_all_commit() {
    let stm = Arc::new(Stm::new());
    let counter = TVar::new(0u64);
    let threads = 8;
    let per_thread = 100;

    let handles: Vec<_> = (0..threads)
        .map(|_| {
            let stm = Arc::clone(&stm);
            let counter = counter.clone();
            thread::spawn(move || {
                for _ in 0..per_thread {
                    stm.run(TIMEOUT, |txn| counter.modify(txn, |v| *v += 1)).unwrap();
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(*counter.load().unwrap(), threads * per_thread);
    assert!(stm.stats().commits.load(Ordering::Relaxed) >= threads * per_thread);
}

#[test]
fn test_transfer_preserves_total() {
    let stm = Arc::new(Stm::new());
    let a = TVar::new(1000i64);
    let b = TVar::new(1000i64);

    let handles: Vec<_> = (0..4)
        .map(|i| {
            let (stm, a, b) = (Arc::clone(&stm), a.clone(), b.clone());
            thread::spawn(move || {
                for _ in 0..200 {
                    let (from, to) = if i % 2 == 0 { (&a, &b) } else { (&b, &a) };
                    stm.run(TIMEOUT, |txn| {
                        from.modify(txn, |v| *v -= 1)?;
                        to.modify(txn, |v| *v += 1)
                    })
                    .unwrap();
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    let total = stm
        .run(TIMEOUT, |txn| Ok(*a.get(txn)? + *b.get(txn)?))
        .unwrap();
    assert_eq!(total, 2000);
}

// =============================================================================
// Deferred Effects
// =============================================================================

#[test]
fn test_deferred_load_runs_before_retry() {
    let stm = Stm::new();
    let loaded = Arc::new(AtomicBool::new(false));
    let runs = AtomicUsize::new(0);

    let result = stm
        .run(TIMEOUT, |txn| {
            runs.fetch_add(1, Ordering::SeqCst);
            if loaded.load(Ordering::SeqCst) {
                return Ok("loaded");
            }
            let flag = Arc::clone(&loaded);
            txn.defer_load(move || {
                flag.store(true, Ordering::SeqCst);
                Ok(())
            });
            Err(txn.retry())
        })
        .unwrap();

    assert_eq!(result, "loaded");
    assert_eq!(runs.load(Ordering::SeqCst), 2);
    assert_eq!(stm.stats().load_retries.load(Ordering::Relaxed), 1);
}

#[test]
fn test_failed_deferred_load_aborts() {
    let stm = Stm::new();

    let err = stm
        .run(TIMEOUT, |txn| {
            txn.defer_load(|| Err(RepoError::Network("unreachable".to_string())));
            Err::<(), _>(txn.retry())
        })
        .unwrap_err();

    assert!(matches!(err, RepoError::Network(_)));
}

#[test]
fn test_commit_and_rollback_effects() {
    let stm = Stm::new();
    let committed = Arc::new(AtomicUsize::new(0));
    let rolled_back = Arc::new(AtomicUsize::new(0));

    let (c, r) = (Arc::clone(&committed), Arc::clone(&rolled_back));
    stm.run(TIMEOUT, move |txn| {
        let c = Arc::clone(&c);
        let r = Arc::clone(&r);
        txn.on_commit(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        txn.on_rollback(move || {
            r.fetch_add(1, Ordering::SeqCst);
        });
        Ok(())
    })
    .unwrap();
    assert_eq!(committed.load(Ordering::SeqCst), 1);
    assert_eq!(rolled_back.load(Ordering::SeqCst), 0);

    let (c, r) = (Arc::clone(&committed), Arc::clone(&rolled_back));
    let _ = stm.run(TIMEOUT, move |txn| {
        let c = Arc::clone(&c);
        let r = Arc::clone(&r);
        txn.on_commit(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        txn.on_rollback(move || {
            r.fetch_add(1, Ordering::SeqCst);
        });
        Err::<(), _>(RepoError::Concurrency("stale".to_string()))
    });
    assert_eq!(committed.load(Ordering::SeqCst), 1);
    assert_eq!(rolled_back.load(Ordering::SeqCst), 1);
}

// =============================================================================
// Continuations
// =============================================================================

#[test]
fn test_continuation_blocks_conflicting_writer() {
    let stm = Arc::new(Stm::new());
    let var = TVar::new(0u32);

    let ((), continuation) = stm.run_to_commit(TIMEOUT, |txn| var.set(txn, 1)).unwrap();

    // A writer touching the locked cell cannot commit while it is held
    let (stm2, var2) = (Arc::clone(&stm), var.clone());
    let blocked = thread::spawn(move || {
        stm2.run(Duration::from_millis(100), |txn| var2.modify(txn, |v| *v += 10))
    })
    .join()
    .unwrap();
    assert!(matches!(blocked, Err(RepoError::Timeout(_))));

    continuation.commit().unwrap();
    assert_eq!(*var.load().unwrap(), 1);

    stm.run(TIMEOUT, |txn| var.modify(txn, |v| *v += 10)).unwrap();
    assert_eq!(*var.load().unwrap(), 11);
}

#[test]
fn test_dropped_continuation_rolls_back() {
    let stm = Stm::new();
    let var = TVar::new(5u32);

    {
        let (_, continuation) = stm.run_to_commit(TIMEOUT, |txn| var.set(txn, 6)).unwrap();
        assert!(!continuation.is_completed());
    }

    assert_eq!(*var.load().unwrap(), 5);
    stm.run(TIMEOUT, |txn| var.set(txn, 7)).unwrap();
    assert_eq!(*var.load().unwrap(), 7);
}

#[test]
fn test_continuation_on_commit_runs_after_publish() {
    let stm = Stm::new();
    let var = TVar::new(0u32);
    let observed = Arc::new(AtomicUsize::new(usize::MAX));

    let (_, mut continuation) = stm.run_to_commit(TIMEOUT, |txn| var.set(txn, 3)).unwrap();
    let (seen, v) = (Arc::clone(&observed), var.clone());
    continuation
        .on_commit(move || {
            seen.store(*v.load().unwrap() as usize, Ordering::SeqCst);
        })
        .unwrap();
    continuation.commit().unwrap();

    assert_eq!(observed.load(Ordering::SeqCst), 3);
}

// =============================================================================
// Transactional Map
// =============================================================================

#[test]
fn test_map_point_operations() {
    let stm = Stm::new();
    let map: TMap<u32, String> = TMap::new();

    stm.run(TIMEOUT, |txn| {
        map.insert(txn, 1, "one".to_string())?;
        map.insert(txn, 2, "two".to_string())
    })
    .unwrap();
    assert_eq!(map.committed_len(), 2);

    let removed = stm.run(TIMEOUT, |txn| map.remove(txn, &1)).unwrap();
    assert_eq!(removed.as_deref().map(String::as_str), Some("one"));

    let (missing, keys) = stm
        .run(TIMEOUT, |txn| Ok((map.get(txn, &1)?, map.keys(txn)?)))
        .unwrap();
    assert!(missing.is_none());
    assert_eq!(keys, vec![2]);
    assert_eq!(map.committed_len(), 1);
}

#[test]
fn test_map_writes_are_isolated_until_commit() {
    let stm = Arc::new(Stm::new());
    let map: Arc<TMap<u32, u32>> = Arc::new(TMap::new());

    let (_, continuation) = stm
        .run_to_commit(TIMEOUT, |txn| map.insert(txn, 7, 70))
        .unwrap();
    assert_eq!(map.committed_len(), 0);

    continuation.commit().unwrap();
    assert_eq!(map.committed_len(), 1);
}

#[test]
fn test_map_misses_allocate_nothing() {
    let stm = Stm::new();
    let map: TMap<u32, u32> = TMap::new();

    let found = stm
        .run(TIMEOUT, |txn| {
            let mut found = 0;
            for key in 0..10_000 {
                if map.contains_key(txn, &key)? {
                    found += 1;
                }
                map.remove(txn, &key)?;
            }
            Ok(found)
        })
        .unwrap();

    assert_eq!(found, 0);
    assert_eq!(map.slot_count(), 0);
    assert_eq!(map.generation(), 0);
}

#[test]
fn test_map_reclaims_removed_and_aborted_slots() {
    let stm = Stm::new();
    let map: TMap<u32, u32> = TMap::new();

    stm.run(TIMEOUT, |txn| map.insert(txn, 1, 10)).unwrap();
    assert_eq!(map.slot_count(), 1);
    assert_eq!(map.generation(), 1);

    stm.run(TIMEOUT, |txn| map.remove(txn, &1)).unwrap();
    assert_eq!(map.slot_count(), 0);

    let err = stm
        .run(TIMEOUT, |txn| {
            map.insert(txn, 2, 20)?;
            Err::<(), _>(RepoError::NotFound("abandon".to_string()))
        })
        .unwrap_err();
    assert!(matches!(err, RepoError::NotFound(_)));
    assert_eq!(map.slot_count(), 0);
    assert_eq!(map.committed_len(), 0);

    let reinserted = stm
        .run(TIMEOUT, |txn| {
            map.insert(txn, 1, 11)?;
            map.get(txn, &1)
        })
        .unwrap();
    assert_eq!(reinserted.as_deref(), Some(&11));
    assert_eq!(map.committed_len(), 1);
}

#[test]
fn test_concurrent_miss_does_not_restart_iteration() {
    let stm = Arc::new(Stm::new());
    let map: Arc<TMap<u32, u32>> = Arc::new(TMap::new());
    let total = TVar::new(0u32);
    stm.run(TIMEOUT, |txn| map.insert(txn, 1, 5)).unwrap();

    let attempts = AtomicUsize::new(0);
    stm.run(TIMEOUT, |txn| {
        let sum: u32 = map.values(txn)?.iter().map(|v| **v).sum();
        if attempts.fetch_add(1, Ordering::SeqCst) == 0 {
            let (stm, map) = (Arc::clone(&stm), Arc::clone(&map));
            thread::spawn(move || {
                stm.run(TIMEOUT, |txn| map.get(txn, &99)).unwrap();
            })
            .join()
            .unwrap();
        }
        total.set(txn, sum)
    })
    .unwrap();

    assert_eq!(attempts.load(Ordering::SeqCst), 1);
    assert_eq!(*total.load().unwrap(), 5);
}

#[test]
fn test_concurrent_insert_restarts_iteration() {
    let stm = Arc::new(Stm::new());
    let map: Arc<TMap<u32, u32>> = Arc::new(TMap::new());
    let total = TVar::new(0u32);
    stm.run(TIMEOUT, |txn| map.insert(txn, 1, 5)).unwrap();

    let attempts = AtomicUsize::new(0);
    stm.run(TIMEOUT, |txn| {
        let sum: u32 = map.values(txn)?.iter().map(|v| **v).sum();
        if attempts.fetch_add(1, Ordering::SeqCst) == 0 {
            let (stm, map) = (Arc::clone(&stm), Arc::clone(&map));
            thread::spawn(move || {
                stm.run(TIMEOUT, |txn| map.insert(txn, 2, 7)).unwrap();
            })
            .join()
            .unwrap();
        }
        total.set(txn, sum)
    })
    .unwrap();

    assert_eq!(attempts.load(Ordering::SeqCst), 2);
    assert_eq!(*total.load().unwrap(), 12);
}

#[test]
fn test_missed_key_inserted_concurrently_restarts() {
    let stm = Arc::new(Stm::new());
    let map: Arc<TMap<u32, u32>> = Arc::new(TMap::new());
    let claimed = TVar::new(false);

    let attempts = AtomicUsize::new(0);
    stm.run(TIMEOUT, |txn| {
        let taken = map.contains_key(txn, &7)?;
        if attempts.fetch_add(1, Ordering::SeqCst) == 0 {
            let (stm, map) = (Arc::clone(&stm), Arc::clone(&map));
            thread::spawn(move || {
                stm.run(TIMEOUT, |txn| map.insert(txn, 7, 70)).unwrap();
            })
            .join()
            .unwrap();
        }
        claimed.set(txn, !taken)
    })
    .unwrap();

    assert_eq!(attempts.load(Ordering::SeqCst), 2);
    assert!(!*claimed.load().unwrap());
}
