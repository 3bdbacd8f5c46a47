//! The `CoordinationStore` trait and the types its operations speak in.

use async_trait::async_trait;
use kilnforge_core::Result;
use std::time::Duration;

/// One key/value pair as returned by `get`/`list`, annotated with the
/// store's internal revision so callers can build compare-and-swap
/// operations against it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    /// The key, always returned without its store-wide prefix stripped.
    pub key: String,
    /// The value bytes.
    pub value: Vec<u8>,
    /// The store's modify revision for this key, used as the `expect`
    /// argument to a later `compare_and_swap`.
    pub mod_revision: i64,
}

/// One change observed by a `watch`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    /// `key` was created or overwritten; `value` is the new value.
    Put {
        /// The key that changed.
        key: String,
        /// Its new value.
        value: Vec<u8>,
        /// Its new modify revision.
        mod_revision: i64,
    },
    /// `key` was removed.
    Delete {
        /// The key that was removed.
        key: String,
    },
}

/// A strongly-consistent, linearizable key/value store with
/// compare-and-swap writes, prefix reads/watches, and lease-backed locks.
///
/// Every method is safe to call concurrently from many tasks; ordering
/// guarantees only apply within a single key (CAS on `k1` never races with
/// a plain read of `k2`, but two concurrent `compare_and_swap` calls on the
/// same key are guaranteed exactly one winner).
#[async_trait]
pub trait CoordinationStore: Send + Sync + 'static {
    /// Fetch one key. `Ok(None)` if it does not exist.
    async fn get(&self, key: &str) -> Result<Option<KeyValue>>;

    /// Fetch every key with the given prefix, ordered lexicographically by
    /// key.
    async fn list(&self, prefix: &str) -> Result<Vec<KeyValue>>;

    /// Unconditionally write `value` to `key`.
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()>;

    /// Write `value` to `key` iff its current modify revision equals
    /// `expect_revision` (`0` means "key must not exist"). Returns
    /// `Err(Error::Conflict)` if the precondition fails.
    async fn compare_and_swap(
        &self,
        key: &str,
        value: Vec<u8>,
        expect_revision: i64,
    ) -> Result<()>;

    /// Remove `key`. Not an error if it was already absent.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Subscribe to every `Put`/`Delete` under `prefix` from the current
    /// revision onward. The returned stream never ends on its own; it
    /// ends only when the store connection is lost, which callers observe
    /// as the stream yielding `None`.
    async fn watch(
        &self,
        prefix: &str,
    ) -> Result<std::pin::Pin<Box<dyn futures::Stream<Item = WatchEvent> + Send>>>;

    /// Grant a new lease with the given time-to-live. The lease is kept
    /// alive automatically by a background task until the returned
    /// [`Lease`] is dropped or explicitly revoked.
    async fn grant_lease(&self, ttl: Duration) -> Result<Lease>;

    /// Acquire an exclusive lock on `key`, scoped to `lease`. Blocks until
    /// acquired or the lease expires. Returns a guard that releases the
    /// lock on drop.
    async fn lock(&self, key: &str, lease: &Lease) -> Result<LockGuard>;

    /// Attempt to acquire an exclusive lock on `key` without blocking.
    /// Returns `Ok(None)` immediately if another holder has it, instead of
    /// waiting in the contention queue.
    async fn try_lock(&self, key: &str, lease: &Lease) -> Result<Option<LockGuard>>;
}
