//! Simulated lock peer for tests: controllable response delay and
//! forced failure, as exercised by the slow-lock-server scenario.

use crate::{LockArgs, Locker};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use vaultio_common::{Error, Result};

#[derive(Default)]
struct Faults {
    response_delay: Option<Duration>,
    unreachable: bool,
}

/// Wraps any peer with injectable latency and unreachability.
pub struct SimLocker {
    inner: Arc<dyn Locker>,
    faults: Arc<Mutex<Faults>>,
}

impl SimLocker {
    #[must_use]
    pub fn new(inner: Arc<dyn Locker>) -> Self {
        Self {
            inner,
            faults: Arc::new(Mutex::new(Faults::default())),
        }
    }

    /// Delay every response; `None` removes the delay.
    pub fn set_response_delay(&self, delay: Option<Duration>) {
        self.faults.lock().response_delay = delay;
    }

    /// Make the peer unreachable.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.faults.lock().unreachable = unreachable;
    }

    async fn gate(&self) -> Result<()> {
        let (delay, unreachable) = {
            let f = self.faults.lock();
            (f.response_delay, f.unreachable)
        };
        if let Some(d) = delay {
            tokio::time::sleep(d).await;
        }
        if unreachable {
            return Err(Error::PeerUnreachable(self.inner.endpoint()));
        }
        Ok(())
    }
}

#[async_trait]
impl Locker for SimLocker {
    async fn lock(&self, args: &LockArgs) -> Result<bool> {
        self.gate().await?;
        self.inner.lock(args).await
    }

    async fn unlock(&self, args: &LockArgs) -> Result<bool> {
        self.gate().await?;
        self.inner.unlock(args).await
    }

    async fn rlock(&self, args: &LockArgs) -> Result<bool> {
        self.gate().await?;
        self.inner.rlock(args).await
    }

    async fn runlock(&self, args: &LockArgs) -> Result<bool> {
        self.gate().await?;
        self.inner.runlock(args).await
    }

    async fn refresh(&self, args: &LockArgs) -> Result<bool> {
        self.gate().await?;
        self.inner.refresh(args).await
    }

    async fn force_unlock(&self, args: &LockArgs) -> Result<bool> {
        self.gate().await?;
        self.inner.force_unlock(args).await
    }

    fn endpoint(&self) -> String {
        self.inner.endpoint()
    }

    fn is_online(&self) -> bool {
        !self.faults.lock().unreachable
    }
}
