//! Distributed read/write mutex
//!
//! Each acquisition picks a fresh UID, fans out to every peer in
//! parallel with a per-call deadline, and succeeds when a quorum
//! grants. Partial grants are rolled back immediately; transient
//! failures retry with randomized backoff until the caller's deadline.
//!
//! A granted lock is kept alive by a background refresher; when a
//! refresh quorum fails, the lock is flagged lost and the holder must
//! abort its critical section.

use crate::{lock_quorum, LockArgs, Locker};
use futures::future::join_all;
use parking_lot::Mutex;
use rand::Rng;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

/// Acquisition options.
#[derive(Clone, Copy, Debug)]
pub struct LockOptions {
    /// Overall acquisition deadline.
    pub timeout: Duration,
    /// Per-peer call deadline within one attempt.
    pub call_timeout: Duration,
    /// Cadence of background refreshes while held.
    pub refresh_interval: Duration,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            call_timeout: Duration::from_secs(5),
            refresh_interval: Duration::from_secs(10),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum Held {
    None,
    Read(String),
    Write(String),
}

/// A distributed read/write mutex over a fixed peer set.
pub struct DRWLock {
    resources: Vec<String>,
    owner: String,
    peers: Arc<Vec<Arc<dyn Locker>>>,
    held: Mutex<Held>,
    lost: Arc<AtomicBool>,
    refresher: Mutex<Option<JoinHandle<()>>>,
}

impl DRWLock {
    /// Create a mutex for `resources` over `peers`.
    #[must_use]
    pub fn new(
        peers: Arc<Vec<Arc<dyn Locker>>>,
        owner: impl Into<String>,
        resources: Vec<String>,
    ) -> Self {
        Self {
            resources,
            owner: owner.into(),
            peers,
            held: Mutex::new(Held::None),
            lost: Arc::new(AtomicBool::new(false)),
            refresher: Mutex::new(None),
        }
    }

    /// Whether a held lock has been lost to refresh failure.
    #[must_use]
    pub fn is_lost(&self) -> bool {
        self.lost.load(Ordering::SeqCst)
    }

    /// Acquire the write lock. Returns false on deadline expiry.
    pub async fn lock(&self, source: &str, opts: &LockOptions) -> bool {
        self.acquire(source, opts, true).await
    }

    /// Acquire a read lock. Returns false on deadline expiry.
    pub async fn rlock(&self, source: &str, opts: &LockOptions) -> bool {
        self.acquire(source, opts, false).await
    }

    /// Release the write lock.
    ///
    /// # Panics
    /// Panics when the write lock is not held: that is a programmer
    /// error, not a runtime condition.
    pub async fn unlock(&self) {
        let uid = {
            let mut held = self.held.lock();
            match std::mem::replace(&mut *held, Held::None) {
                Held::Write(uid) => uid,
                other => {
                    *held = other;
                    panic!("unlock of unheld DRWLock");
                }
            }
        };
        self.stop_refresher();
        self.release(&uid, true).await;
    }

    /// Release a read lock.
    ///
    /// # Panics
    /// Panics when no read lock is held.
    pub async fn runlock(&self) {
        let uid = {
            let mut held = self.held.lock();
            match std::mem::replace(&mut *held, Held::None) {
                Held::Read(uid) => uid,
                other => {
                    *held = other;
                    panic!("runlock of unheld DRWLock");
                }
            }
        };
        self.stop_refresher();
        self.release(&uid, false).await;
    }

    fn args(&self, uid: &str, source: &str) -> LockArgs {
        LockArgs {
            uid: uid.to_string(),
            resources: self.resources.clone(),
            owner: self.owner.clone(),
            source: source.to_string(),
        }
    }

    async fn acquire(&self, source: &str, opts: &LockOptions, writer: bool) -> bool {
        assert!(
            matches!(*self.held.lock(), Held::None),
            "acquire on an already-held DRWLock"
        );

        let deadline = Instant::now() + opts.timeout;
        let quorum = lock_quorum(self.peers.len());

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }

            // Fresh UID per attempt so a stale grant from a timed-out
            // attempt can never be confused with the current one.
            let uid = Uuid::new_v4().to_string();
            let args = self.args(&uid, source);
            let call_timeout = opts.call_timeout.min(remaining);

            let results = join_all(self.peers.iter().map(|peer| {
                let args = args.clone();
                let peer = Arc::clone(peer);
                async move {
                    let call = async {
                        if writer {
                            peer.lock(&args).await
                        } else {
                            peer.rlock(&args).await
                        }
                    };
                    matches!(tokio::time::timeout(call_timeout, call).await, Ok(Ok(true)))
                }
            }))
            .await;

            let granted: Vec<usize> = results
                .iter()
                .enumerate()
                .filter_map(|(i, ok)| ok.then_some(i))
                .collect();

            if granted.len() >= quorum {
                debug!(
                    resources = ?self.resources,
                    granted = granted.len(),
                    quorum,
                    writer,
                    "distributed lock granted"
                );
                *self.held.lock() = if writer {
                    Held::Write(uid.clone())
                } else {
                    Held::Read(uid.clone())
                };
                self.lost.store(false, Ordering::SeqCst);
                self.start_refresher(uid, source.to_string(), opts, quorum);
                return true;
            }

            // Below quorum: roll back partial grants before backing off.
            if !granted.is_empty() {
                let rollback = self.args(&uid, source);
                let peers = Arc::clone(&self.peers);
                join_all(granted.into_iter().map(|i| {
                    let args = rollback.clone();
                    let peer = Arc::clone(&peers[i]);
                    async move {
                        let call = async {
                            if writer {
                                peer.unlock(&args).await
                            } else {
                                peer.runlock(&args).await
                            }
                        };
                        let _ = tokio::time::timeout(call_timeout, call).await;
                    }
                }))
                .await;
            }

            let backoff = Duration::from_millis(rand::thread_rng().gen_range(25..250));
            if Instant::now() + backoff >= deadline {
                return false;
            }
            tokio::time::sleep(backoff).await;
        }
    }

    async fn release(&self, uid: &str, writer: bool) {
        let args = self.args(uid, "unlock");
        // Fire-and-forget to every peer: a peer that missed the grant
        // no-ops, so delivery only has to be attempted, not confirmed.
        join_all(self.peers.iter().map(|peer| {
            let args = args.clone();
            let peer = Arc::clone(peer);
            async move {
                let call = async {
                    if writer {
                        peer.unlock(&args).await
                    } else {
                        peer.runlock(&args).await
                    }
                };
                if tokio::time::timeout(Duration::from_secs(5), call).await.is_err() {
                    warn!(peer = %peer.endpoint(), "timed out releasing lock");
                }
            }
        }))
        .await;
    }

    fn start_refresher(&self, uid: String, source: String, opts: &LockOptions, quorum: usize) {
        let peers = Arc::clone(&self.peers);
        let lost = Arc::clone(&self.lost);
        let resources = self.resources.clone();
        let owner = self.owner.clone();
        let interval = opts.refresh_interval;
        let call_timeout = opts.call_timeout;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await; // immediate first tick
            loop {
                ticker.tick().await;
                let args = LockArgs {
                    uid: uid.clone(),
                    resources: resources.clone(),
                    owner: owner.clone(),
                    source: source.clone(),
                };
                let refreshed = join_all(peers.iter().map(|peer| {
                    let args = args.clone();
                    let peer = Arc::clone(peer);
                    async move {
                        matches!(
                            tokio::time::timeout(call_timeout, peer.refresh(&args)).await,
                            Ok(Ok(true))
                        )
                    }
                }))
                .await
                .into_iter()
                .filter(|ok| *ok)
                .count();

                if refreshed < quorum {
                    warn!(
                        ?resources,
                        refreshed, quorum, "lock refresh below quorum; lock lost"
                    );
                    lost.store(true, Ordering::SeqCst);
                    return;
                }
            }
        });

        if let Some(old) = self.refresher.lock().replace(handle) {
            old.abort();
        }
    }

    fn stop_refresher(&self) {
        if let Some(handle) = self.refresher.lock().take() {
            handle.abort();
        }
    }
}

impl Drop for DRWLock {
    fn drop(&mut self) {
        if let Some(handle) = self.refresher.lock().take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::LocalLocker;

    fn peers(n: usize) -> Arc<Vec<Arc<dyn Locker>>> {
        Arc::new((0..n).map(|_| Arc::new(LocalLocker::new()) as Arc<dyn Locker>).collect())
    }

    fn quick() -> LockOptions {
        LockOptions {
            timeout: Duration::from_millis(500),
            call_timeout: Duration::from_millis(250),
            refresh_interval: Duration::from_millis(50),
        }
    }

    #[tokio::test]
    async fn test_lock_and_unlock() {
        let peers = peers(4);
        let lock = DRWLock::new(Arc::clone(&peers), "owner", vec!["b/o".into()]);
        assert!(lock.lock("test", &quick()).await);
        lock.unlock().await;
        // Reacquire proves every peer released.
        assert!(lock.lock("test", &quick()).await);
        lock.unlock().await;
    }

    #[tokio::test]
    async fn test_writers_exclude() {
        let peers = peers(4);
        let a = DRWLock::new(Arc::clone(&peers), "owner", vec!["b/o".into()]);
        let b = DRWLock::new(Arc::clone(&peers), "owner", vec!["b/o".into()]);
        assert!(a.lock("a", &quick()).await);
        assert!(
            !b.lock(
                "b",
                &LockOptions {
                    timeout: Duration::from_millis(150),
                    ..quick()
                }
            )
            .await
        );
        a.unlock().await;
    }

    #[tokio::test]
    async fn test_readers_share() {
        let peers = peers(4);
        let a = DRWLock::new(Arc::clone(&peers), "owner", vec!["b/o".into()]);
        let b = DRWLock::new(Arc::clone(&peers), "owner", vec!["b/o".into()]);
        assert!(a.rlock("a", &quick()).await);
        assert!(b.rlock("b", &quick()).await);
        a.runlock().await;
        b.runlock().await;
    }

    #[tokio::test]
    #[should_panic(expected = "unlock of unheld DRWLock")]
    async fn test_unlock_panics_when_unheld() {
        let lock = DRWLock::new(peers(4), "owner", vec!["b/o".into()]);
        lock.unlock().await;
    }

    #[tokio::test]
    #[should_panic(expected = "runlock of unheld DRWLock")]
    async fn test_runlock_panics_when_unheld() {
        let lock = DRWLock::new(peers(4), "owner", vec!["b/o".into()]);
        lock.runlock().await;
    }

    #[tokio::test]
    #[should_panic(expected = "runlock of unheld DRWLock")]
    async fn test_runlock_panics_on_write_held() {
        let lock = DRWLock::new(peers(4), "owner", vec!["b/o".into()]);
        assert!(lock.lock("test", &quick()).await);
        lock.runlock().await;
    }
}
