//! In-process peer lock table
//!
//! Per-resource invariant, enforced under one mutex with brief critical
//! sections: at most one writer entry, or any number of reader entries,
//! never both.

use crate::{LockArgs, Locker};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, info};
use vaultio_common::{LockConfig, Result};

/// One lock grant on one peer.
#[derive(Clone, Debug)]
pub struct LockEntry {
    pub writer: bool,
    pub uid: String,
    pub owner: String,
    pub source: String,
    pub acquired_at: Instant,
    pub last_refreshed: Instant,
}

/// The in-memory lock table of one peer.
#[derive(Default)]
pub struct LocalLocker {
    lock_map: Mutex<HashMap<String, Vec<LockEntry>>>,
}

impl LocalLocker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of resources currently holding entries.
    #[must_use]
    pub fn resource_count(&self) -> usize {
        self.lock_map.lock().len()
    }

    /// Entries held on one resource (diagnostics and tests).
    #[must_use]
    pub fn entries(&self, resource: &str) -> Vec<LockEntry> {
        self.lock_map
            .lock()
            .get(resource)
            .cloned()
            .unwrap_or_default()
    }

    /// Drop entries whose last refresh is older than `max_age`.
    /// Returns the number of expired entries.
    pub fn expire_old_locks(&self, max_age: Duration) -> usize {
        let mut map = self.lock_map.lock();
        let mut expired = 0;
        map.retain(|resource, entries| {
            let before = entries.len();
            entries.retain(|e| e.last_refreshed.elapsed() < max_age);
            let dropped = before - entries.len();
            if dropped > 0 {
                expired += dropped;
                debug!(resource, dropped, "expired stale lock entries");
            }
            !entries.is_empty()
        });
        expired
    }

    /// Clear the whole table (tests).
    pub fn reset(&self) {
        self.lock_map.lock().clear();
    }
}

#[async_trait]
impl Locker for LocalLocker {
    async fn lock(&self, args: &LockArgs) -> Result<bool> {
        let mut map = self.lock_map.lock();
        // All-or-nothing across the requested resources.
        if args
            .resources
            .iter()
            .any(|r| map.get(r).is_some_and(|e| !e.is_empty()))
        {
            return Ok(false);
        }
        let now = Instant::now();
        for resource in &args.resources {
            map.entry(resource.clone()).or_default().push(LockEntry {
                writer: true,
                uid: args.uid.clone(),
                owner: args.owner.clone(),
                source: args.source.clone(),
                acquired_at: now,
                last_refreshed: now,
            });
        }
        Ok(true)
    }

    async fn unlock(&self, args: &LockArgs) -> Result<bool> {
        let mut map = self.lock_map.lock();
        for resource in &args.resources {
            if let Some(entries) = map.get_mut(resource) {
                entries.retain(|e| !(e.writer && e.uid == args.uid));
                if entries.is_empty() {
                    map.remove(resource);
                }
            }
        }
        // Idempotent: an unseen uid is a successful no-op.
        Ok(true)
    }

    async fn rlock(&self, args: &LockArgs) -> Result<bool> {
        let mut map = self.lock_map.lock();
        if args
            .resources
            .iter()
            .any(|r| map.get(r).is_some_and(|entries| entries.iter().any(|e| e.writer)))
        {
            return Ok(false);
        }
        let now = Instant::now();
        for resource in &args.resources {
            map.entry(resource.clone()).or_default().push(LockEntry {
                writer: false,
                uid: args.uid.clone(),
                owner: args.owner.clone(),
                source: args.source.clone(),
                acquired_at: now,
                last_refreshed: now,
            });
        }
        Ok(true)
    }

    async fn runlock(&self, args: &LockArgs) -> Result<bool> {
        let mut map = self.lock_map.lock();
        for resource in &args.resources {
            if let Some(entries) = map.get_mut(resource) {
                // Remove at most one reader entry per resource for this
                // uid; the same uid may hold reads via several mutexes.
                if let Some(pos) = entries.iter().position(|e| !e.writer && e.uid == args.uid) {
                    entries.remove(pos);
                }
                if entries.is_empty() {
                    map.remove(resource);
                }
            }
        }
        Ok(true)
    }

    async fn refresh(&self, args: &LockArgs) -> Result<bool> {
        let mut map = self.lock_map.lock();
        let now = Instant::now();
        let mut found = false;
        for entries in map.values_mut() {
            for entry in entries.iter_mut().filter(|e| e.uid == args.uid) {
                entry.last_refreshed = now;
                found = true;
            }
        }
        Ok(found)
    }

    async fn force_unlock(&self, args: &LockArgs) -> Result<bool> {
        let mut map = self.lock_map.lock();
        if args.resources.is_empty() {
            map.clear();
            return Ok(true);
        }
        for resource in &args.resources {
            map.remove(resource);
        }
        Ok(true)
    }

    fn endpoint(&self) -> String {
        "local".to_string()
    }
}

/// Configuration of one peer lock server.
#[derive(Clone, Copy, Debug, Default)]
pub struct LockServerConfig {
    pub lock: LockConfig,
}

/// Owned peer-server subsystem: the lock table plus its expiry sweeper.
///
/// `start` spawns the sweeper; `stop` shuts it down. No ambient
/// singletons.
pub struct LockServer {
    locker: Arc<LocalLocker>,
    sweeper: JoinHandle<()>,
}

impl LockServer {
    /// Start a peer lock server with a background expiry sweep.
    #[must_use]
    pub fn start(config: LockServerConfig) -> Self {
        let locker = Arc::new(LocalLocker::new());
        let sweep_target = Arc::clone(&locker);
        let expiry = config.lock.expiry();
        // Sweep a few times per expiry window so stale entries do not
        // linger much past their deadline.
        let interval = expiry / 4;
        let sweeper = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(50)));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let expired = sweep_target.expire_old_locks(expiry);
                if expired > 0 {
                    info!(expired, "lock expiry sweep released stranded entries");
                }
            }
        });
        Self { locker, sweeper }
    }

    /// The peer table served by this server.
    #[must_use]
    pub fn locker(&self) -> Arc<LocalLocker> {
        Arc::clone(&self.locker)
    }

    /// Stop the expiry sweeper.
    pub fn stop(self) {
        self.sweeper.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(uid: &str, resource: &str) -> LockArgs {
        LockArgs {
            uid: uid.to_string(),
            resources: vec![resource.to_string()],
            owner: "owner-1".to_string(),
            source: "local.rs".to_string(),
        }
    }

    #[tokio::test]
    async fn test_writer_excludes_everyone() {
        let locker = LocalLocker::new();
        assert!(locker.lock(&args("w1", "b/o")).await.unwrap());
        assert!(!locker.lock(&args("w2", "b/o")).await.unwrap());
        assert!(!locker.rlock(&args("r1", "b/o")).await.unwrap());

        locker.unlock(&args("w1", "b/o")).await.unwrap();
        assert!(locker.rlock(&args("r1", "b/o")).await.unwrap());
    }

    #[tokio::test]
    async fn test_readers_share_writers_wait() {
        let locker = LocalLocker::new();
        assert!(locker.rlock(&args("r1", "b/o")).await.unwrap());
        assert!(locker.rlock(&args("r2", "b/o")).await.unwrap());
        assert!(!locker.lock(&args("w1", "b/o")).await.unwrap());

        locker.runlock(&args("r1", "b/o")).await.unwrap();
        assert!(!locker.lock(&args("w1", "b/o")).await.unwrap());
        locker.runlock(&args("r2", "b/o")).await.unwrap();
        assert!(locker.lock(&args("w1", "b/o")).await.unwrap());
    }

    #[tokio::test]
    async fn test_unlock_is_idempotent() {
        let locker = LocalLocker::new();
        assert!(locker.unlock(&args("ghost", "b/o")).await.unwrap());
        assert!(locker.runlock(&args("ghost", "b/o")).await.unwrap());
        assert_eq!(locker.resource_count(), 0);
    }

    #[tokio::test]
    async fn test_multi_resource_all_or_nothing() {
        let locker = LocalLocker::new();
        assert!(locker.lock(&args("w1", "b/a")).await.unwrap());

        let multi = LockArgs {
            uid: "w2".into(),
            resources: vec!["b/a".into(), "b/b".into()],
            owner: "owner-1".into(),
            source: "test".into(),
        };
        assert!(!locker.lock(&multi).await.unwrap());
        // The free resource must not have picked up a stray entry.
        assert!(locker.entries("b/b").is_empty());
    }

    #[tokio::test]
    async fn test_refresh_and_expiry() {
        let locker = LocalLocker::new();
        assert!(locker.lock(&args("w1", "b/o")).await.unwrap());
        assert!(locker.refresh(&args("w1", "b/o")).await.unwrap());
        assert!(!locker.refresh(&args("unknown", "b/o")).await.unwrap());

        // Nothing is younger than an hour, so nothing expires.
        assert_eq!(locker.expire_old_locks(Duration::from_secs(3600)), 0);
        // Everything is older than zero.
        assert_eq!(locker.expire_old_locks(Duration::ZERO), 1);
        assert_eq!(locker.resource_count(), 0);
    }

    #[tokio::test]
    async fn test_force_unlock() {
        let locker = LocalLocker::new();
        assert!(locker.lock(&args("w1", "b/o")).await.unwrap());
        assert!(locker.force_unlock(&args("", "b/o")).await.unwrap());
        assert!(locker.lock(&args("w2", "b/o")).await.unwrap());
    }
}
