//! REST transport for the peer lock protocol
//!
//! Each peer serves the table over plain HTTP; every call carries a
//! JSON [`LockArgs`] body and answers `{ "ok": bool }`. Unlock
//! delivery is idempotent, so retries and duplicate deliveries are
//! harmless.

use crate::{LocalLocker, LockArgs, Locker};
use async_trait::async_trait;
use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use vaultio_common::{Error, Result};

/// Wire response of every lock call.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct LockResponse {
    pub ok: bool,
}

macro_rules! handler {
    ($name:ident, $method:ident) => {
        async fn $name(
            State(locker): State<Arc<LocalLocker>>,
            Json(args): Json<LockArgs>,
        ) -> Json<LockResponse> {
            let ok = locker.$method(&args).await.unwrap_or(false);
            Json(LockResponse { ok })
        }
    };
}

handler!(lock_handler, lock);
handler!(unlock_handler, unlock);
handler!(rlock_handler, rlock);
handler!(runlock_handler, runlock);
handler!(refresh_handler, refresh);
handler!(force_unlock_handler, force_unlock);

/// Router exposing one peer's lock table.
pub fn lock_router(locker: Arc<LocalLocker>) -> Router {
    Router::new()
        .route("/v1/lock", post(lock_handler))
        .route("/v1/unlock", post(unlock_handler))
        .route("/v1/rlock", post(rlock_handler))
        .route("/v1/runlock", post(runlock_handler))
        .route("/v1/refresh", post(refresh_handler))
        .route("/v1/force-unlock", post(force_unlock_handler))
        .with_state(locker)
}

/// Client side of the peer protocol.
pub struct HttpLocker {
    endpoint: String,
    client: reqwest::Client,
}

impl HttpLocker {
    /// Connect to a peer at `endpoint` (e.g. `http://host:9010`).
    pub fn new(endpoint: impl Into<String>, call_timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(call_timeout)
            .build()
            .map_err(|e| Error::internal(e.to_string()))?;
        Ok(Self {
            endpoint: endpoint.into(),
            client,
        })
    }

    async fn call(&self, path: &str, args: &LockArgs) -> Result<bool> {
        let url = format!("{}/v1/{}", self.endpoint.trim_end_matches('/'), path);
        let resp = self
            .client
            .post(&url)
            .json(args)
            .send()
            .await
            .map_err(|e| Error::PeerUnreachable(format!("{}: {e}", self.endpoint)))?;
        if !resp.status().is_success() {
            return Err(Error::PeerUnreachable(format!(
                "{}: status {}",
                self.endpoint,
                resp.status()
            )));
        }
        let body: LockResponse = resp
            .json()
            .await
            .map_err(|e| Error::PeerUnreachable(format!("{}: {e}", self.endpoint)))?;
        Ok(body.ok)
    }
}

#[async_trait]
impl Locker for HttpLocker {
    async fn lock(&self, args: &LockArgs) -> Result<bool> {
        self.call("lock", args).await
    }

    async fn unlock(&self, args: &LockArgs) -> Result<bool> {
        self.call("unlock", args).await
    }

    async fn rlock(&self, args: &LockArgs) -> Result<bool> {
        self.call("rlock", args).await
    }

    async fn runlock(&self, args: &LockArgs) -> Result<bool> {
        self.call("runlock", args).await
    }

    async fn refresh(&self, args: &LockArgs) -> Result<bool> {
        self.call("refresh", args).await
    }

    async fn force_unlock(&self, args: &LockArgs) -> Result<bool> {
        self.call("force-unlock", args).await
    }

    fn endpoint(&self) -> String {
        self.endpoint.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn serve(locker: Arc<LocalLocker>) -> String {
        let app = lock_router(locker);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.ok();
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn test_lock_over_rest() {
        let table = Arc::new(LocalLocker::new());
        let endpoint = serve(Arc::clone(&table)).await;
        let peer = HttpLocker::new(endpoint, Duration::from_secs(2)).unwrap();

        let args = LockArgs {
            uid: "uid-1".into(),
            resources: vec!["bucket/obj".into()],
            owner: "owner".into(),
            source: "rest.rs".into(),
        };

        assert!(peer.lock(&args).await.unwrap());
        assert_eq!(table.entries("bucket/obj").len(), 1);

        let mut second = args.clone();
        second.uid = "uid-2".into();
        assert!(!peer.lock(&second).await.unwrap());

        assert!(peer.refresh(&args).await.unwrap());
        assert!(peer.unlock(&args).await.unwrap());
        assert_eq!(table.resource_count(), 0);
    }

    #[tokio::test]
    async fn test_unreachable_peer() {
        let peer = HttpLocker::new("http://127.0.0.1:1", Duration::from_millis(200)).unwrap();
        let args = LockArgs::default();
        assert!(matches!(
            peer.lock(&args).await,
            Err(Error::PeerUnreachable(_))
        ));
    }
}
