//! Distributed lock scenarios across a four-peer set.

use std::sync::Arc;
use std::time::Duration;
use vaultio_lock::{DRWLock, LocalLocker, LockOptions, Locker, SimLocker};

fn local_peers(n: usize) -> (Vec<Arc<LocalLocker>>, Arc<Vec<Arc<dyn Locker>>>) {
    let tables: Vec<Arc<LocalLocker>> = (0..n).map(|_| Arc::new(LocalLocker::new())).collect();
    let peers: Vec<Arc<dyn Locker>> = tables
        .iter()
        .map(|t| Arc::clone(t) as Arc<dyn Locker>)
        .collect();
    (tables, Arc::new(peers))
}

fn sim_peers(n: usize) -> (Vec<Arc<SimLocker>>, Arc<Vec<Arc<dyn Locker>>>) {
    let sims: Vec<Arc<SimLocker>> = (0..n)
        .map(|_| Arc::new(SimLocker::new(Arc::new(LocalLocker::new()))))
        .collect();
    let peers: Vec<Arc<dyn Locker>> = sims
        .iter()
        .map(|s| Arc::clone(s) as Arc<dyn Locker>)
        .collect();
    (sims, Arc::new(peers))
}

fn opts(timeout_ms: u64) -> LockOptions {
    LockOptions {
        timeout: Duration::from_millis(timeout_ms),
        call_timeout: Duration::from_millis(250),
        refresh_interval: Duration::from_millis(50),
    }
}

/// Holder A keeps the write lock for 200 ms. A contender with a 100 ms
/// deadline must time out; one with a much longer deadline must win
/// after A releases.
#[tokio::test]
async fn test_write_lock_contention_deadlines() {
    let (_tables, peers) = local_peers(4);

    let a = Arc::new(DRWLock::new(
        Arc::clone(&peers),
        "owner-a",
        vec!["b/k".into()],
    ));
    assert!(a.lock("thread-a", &opts(1000)).await);

    let a2 = Arc::clone(&a);
    let holder = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        a2.unlock().await;
    });

    let b = DRWLock::new(Arc::clone(&peers), "owner-b", vec!["b/k".into()]);
    assert!(!b.lock("thread-b", &opts(100)).await, "B must time out");

    let c = DRWLock::new(Arc::clone(&peers), "owner-c", vec!["b/k".into()]);
    assert!(c.lock("thread-c", &opts(2000)).await, "C must win eventually");
    c.unlock().await;

    holder.await.unwrap();
}

#[tokio::test]
async fn test_parallel_readers_then_writer() {
    let (_tables, peers) = local_peers(4);

    let readers: Vec<Arc<DRWLock>> = (0..3)
        .map(|_| {
            Arc::new(DRWLock::new(
                Arc::clone(&peers),
                "reader",
                vec!["b/shared".into()],
            ))
        })
        .collect();
    for r in &readers {
        assert!(r.rlock("reader", &opts(500)).await);
    }

    let w = DRWLock::new(Arc::clone(&peers), "writer", vec!["b/shared".into()]);
    assert!(!w.lock("writer", &opts(100)).await);

    for r in &readers {
        r.runlock().await;
    }
    assert!(w.lock("writer", &opts(1000)).await);
    w.unlock().await;
}

/// The write/read invariant observed across the quorum: a writer never
/// coexists with readers on any peer.
#[tokio::test]
async fn test_no_writer_reader_overlap_on_peers() {
    let (tables, peers) = local_peers(4);

    let w = DRWLock::new(Arc::clone(&peers), "writer", vec!["b/x".into()]);
    assert!(w.lock("writer", &opts(500)).await);
    for table in &tables {
        let entries = table.entries("b/x");
        assert!(entries.len() <= 1);
        assert!(entries.iter().all(|e| e.writer));
    }
    w.unlock().await;
    for table in &tables {
        assert!(table.entries("b/x").is_empty());
    }
}

/// Lock acquisition survives up to `n - quorum` unreachable peers.
#[tokio::test]
async fn test_tolerates_minority_peer_failure() {
    let (sims, peers) = sim_peers(4);
    sims[0].set_unreachable(true);

    let lock = DRWLock::new(Arc::clone(&peers), "owner", vec!["b/k".into()]);
    assert!(lock.lock("test", &opts(1000)).await);
    lock.unlock().await;

    // Two unreachable peers leave only 2 of 4: below quorum (3).
    sims[1].set_unreachable(true);
    let lock = DRWLock::new(Arc::clone(&peers), "owner", vec!["b/k".into()]);
    assert!(!lock.lock("test", &opts(300)).await);
}

/// The slow-lock-server scenario: a peer delay below the acquisition
/// deadline succeeds, a delay above it fails, and failure leaves no
/// stray entries behind.
#[tokio::test]
async fn test_slow_lock_servers() {
    let (sims, peers) = sim_peers(4);

    for sim in &sims {
        sim.set_response_delay(Some(Duration::from_millis(100)));
    }
    let lock = DRWLock::new(Arc::clone(&peers), "owner", vec!["xyz".into()]);
    let fast_opts = LockOptions {
        timeout: Duration::from_millis(500),
        call_timeout: Duration::from_millis(500),
        refresh_interval: Duration::from_secs(10),
    };
    assert!(lock.rlock("slow-test", &fast_opts).await);
    lock.runlock().await;

    for sim in &sims {
        sim.set_response_delay(Some(Duration::from_millis(600)));
    }
    let lock = DRWLock::new(Arc::clone(&peers), "owner", vec!["xyz".into()]);
    assert!(!lock.rlock("slow-test", &fast_opts).await);

    for sim in &sims {
        sim.set_response_delay(None);
    }
    // A failed acquisition must leave every peer clean.
    let probe = DRWLock::new(Arc::clone(&peers), "owner", vec!["xyz".into()]);
    assert!(probe.lock("probe", &opts(500)).await);
    probe.unlock().await;
}

/// A holder that cannot refresh a quorum observes the lock as lost.
#[tokio::test]
async fn test_refresh_failure_marks_lock_lost() {
    let (tables, peers) = local_peers(4);

    let lock = DRWLock::new(Arc::clone(&peers), "owner", vec!["b/r".into()]);
    assert!(lock.lock("test", &opts(500)).await);
    assert!(!lock.is_lost());

    // Simulate peer-side expiry of every entry.
    for table in &tables {
        table.reset();
    }
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(lock.is_lost());
}
