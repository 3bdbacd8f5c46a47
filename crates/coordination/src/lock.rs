//! Leases and the lock guards built on top of them.

use kilnforge_core::Result;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::warn;

/// A leased session with the coordination store.
///
/// Granting a lease starts a background keep-alive task that renews it at
/// roughly a third of its TTL, the same margin `etcd-client`'s own
/// concurrency helpers use. Dropping the lease cancels the keep-alive task
/// and lets the lease expire on its own; anything locked under it (a
/// checkpoint leader election, a single-consumer worker's mutex) is
/// released within one TTL of the process dying, without needing a clean
/// shutdown path.
pub struct Lease {
    pub(crate) id: i64,
    keepalive: Option<JoinHandle<()>>,
}

impl Lease {
    pub(crate) fn new(id: i64, keepalive: JoinHandle<()>) -> Self {
        Lease {
            id,
            keepalive: Some(keepalive),
        }
    }

    /// The lease id, as assigned by the coordination store.
    pub fn id(&self) -> i64 {
        self.id
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if let Some(h) = self.keepalive.take() {
            h.abort();
        }
    }
}

/// Releases a lock previously taken at `key`. Implemented by
/// [`crate::etcd::EtcdStore`] over a real `LockClient`; test fakes
/// implement it directly over an in-memory cell, so [`LockGuard`] is
/// constructible without a live etcd connection.
pub trait Unlocker: Send + Sync {
    /// Release the lock at `key`. Called at most once per [`LockGuard`].
    fn unlock<'a>(
        &'a self,
        key: &'a [u8],
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + 'a>>;
}

/// An exclusive lock held on one key, scoped to a [`Lease`].
///
/// The lock is released when this guard is dropped. Because `Drop` cannot
/// run async code, release is best-effort and fire-and-forget: the guard
/// spawns a task to call [`Unlocker::unlock`], and relies on the owning
/// lease's TTL as the backstop if that task never gets to run (process
/// exit, runtime shutdown).
pub struct LockGuard {
    key: Vec<u8>,
    unlocker: Arc<dyn Unlocker>,
}

impl LockGuard {
    /// Build a guard over an already-acquired lock.
    pub fn new(key: Vec<u8>, unlocker: Arc<dyn Unlocker>) -> Self {
        LockGuard { key, unlocker }
    }

    /// Release the lock and wait for the coordination store to confirm it.
    /// Prefer this over relying on `Drop` when the caller can await —
    /// `Drop` only fires a best-effort background release.
    pub async fn release(mut self) -> Result<()> {
        let key = std::mem::take(&mut self.key);
        self.unlocker.unlock(&key).await
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.key.is_empty() {
            return;
        }
        let key = std::mem::take(&mut self.key);
        let unlocker = self.unlocker.clone();
        tokio::spawn(async move {
            if let Err(e) = unlocker.unlock(&key).await {
                warn!(error = %e, "best-effort lock release failed, relying on lease TTL");
            }
        });
    }
}
