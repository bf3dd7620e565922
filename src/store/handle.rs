//! Async seam over the synchronous store (§4.1).
//!
//! Mirrors the teacher's `db.call(move |db| {...}).await` convention: callers pass a
//! closure that sees a plain `&mut ConductorDb`; the closure runs on a blocking thread
//! so SQLite's own locking, not the async runtime, serializes concurrent writers.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use tokio::sync::Mutex;

use super::db::ConductorDb;

#[derive(Clone)]
pub struct StoreHandle {
    inner: Arc<Mutex<Option<ConductorDb>>>,
}

impl StoreHandle {
    pub async fn open(path: &Path) -> Result<Self> {
        let path = path.to_owned();
        let db = tokio::task::spawn_blocking(move || ConductorDb::open(&path))
            .await
            .context("store init task panicked")??;
        Ok(Self { inner: Arc::new(Mutex::new(Some(db))) })
    }

    pub async fn open_in_memory() -> Result<Self> {
        let db = tokio::task::spawn_blocking(ConductorDb::open_in_memory)
            .await
            .context("store init task panicked")??;
        Ok(Self { inner: Arc::new(Mutex::new(Some(db))) })
    }

    /// Runs `f` against the store on a blocking thread. Fails with a `NotReady`-flavored
    /// error if called after `shutdown` (§4.1 — "use after shutdown fails with NotReady").
    pub async fn call<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut ConductorDb) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = inner.blocking_lock();
            let db = guard.as_mut().ok_or_else(|| anyhow!("store is not ready (closed)"))?;
            f(db)
        })
        .await
        .context("store task panicked")?
    }

    /// Double-shutdown is a no-op (§4.1).
    pub async fn shutdown(&self) {
        let mut guard = self.inner.lock().await;
        *guard = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn call_after_shutdown_fails() {
        let store = StoreHandle::open_in_memory().await.unwrap();
        store.shutdown().await;
        let result = store.call(|db| db.transaction(|_tx| Ok(()))).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn double_shutdown_is_a_no_op() {
        let store = StoreHandle::open_in_memory().await.unwrap();
        store.shutdown().await;
        store.shutdown().await;
    }
}
