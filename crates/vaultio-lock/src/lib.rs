//! Vaultio Lock - quorum-based distributed read/write lock
//!
//! A named resource (`bucket` or `bucket/object`) is locked by fanning
//! out to every peer lock server in parallel; the lock is granted when
//! at least `⌊n/2⌋ + 1` peers accept. Entries expire on peers unless
//! the holder refreshes them, which releases locks stranded by crashed
//! holders.
//!
//! The guarantee, aggregated across peers: no writer overlaps any
//! reader, and no two writers overlap, tolerating up to `n - quorum`
//! failed peers.
//!
//! [`LocalLocker`] is the in-process peer table, served over REST by
//! [`rest::lock_router`] and consumed remotely through
//! [`rest::HttpLocker`]. [`DRWLock`] is the holder-side distributed
//! mutex.

pub mod drw;
pub mod local;
pub mod rest;
pub mod sim;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use vaultio_common::Result;

pub use drw::{DRWLock, LockOptions};
pub use local::{LocalLocker, LockEntry, LockServer, LockServerConfig};
pub use rest::{lock_router, HttpLocker};
pub use sim::SimLocker;

/// Arguments carried by every lock RPC.
///
/// `uid` is opaque and unique per acquisition; `source` identifies the
/// caller for diagnostics only.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct LockArgs {
    pub uid: String,
    pub resources: Vec<String>,
    pub owner: String,
    pub source: String,
}

/// Capability interface of one peer lock server.
///
/// `unlock`/`runlock` must be idempotent: a peer that never saw the
/// original grant simply no-ops.
#[async_trait]
pub trait Locker: Send + Sync {
    /// Take a write lock; `Ok(false)` means the resource is busy.
    async fn lock(&self, args: &LockArgs) -> Result<bool>;

    /// Release a write lock; absent entries are a no-op.
    async fn unlock(&self, args: &LockArgs) -> Result<bool>;

    /// Take a read lock; fails only while a writer holds the resource.
    async fn rlock(&self, args: &LockArgs) -> Result<bool>;

    /// Release a read lock; absent entries are a no-op.
    async fn runlock(&self, args: &LockArgs) -> Result<bool>;

    /// Bump the refresh time of every entry held under `args.uid`.
    /// `Ok(false)` means the peer no longer knows the uid.
    async fn refresh(&self, args: &LockArgs) -> Result<bool>;

    /// Operator escape hatch: drop all entries for the resources.
    async fn force_unlock(&self, args: &LockArgs) -> Result<bool>;

    /// Peer address for diagnostics.
    fn endpoint(&self) -> String;

    /// Whether the peer is believed reachable.
    fn is_online(&self) -> bool {
        true
    }
}

/// Quorum for both read and write acquisitions across `n` peers.
#[must_use]
pub const fn lock_quorum(n: usize) -> usize {
    n / 2 + 1
}
