//! The object-store abstraction used to durably hold flushed WAL segments
//! and checkpoints once they leave the coordination store's short-horizon
//! WAL.
//!
//! Segments are content-addressed by their key, never overwritten, and
//! deleted only by the Data Manager's garbage collector once every reader
//! has moved past them. [`S3Store`] is the only implementation here,
//! backed by `aws-sdk-s3`; it works against any S3-compatible endpoint,
//! not just AWS.

#![warn(missing_docs)]
#![warn(clippy::all)]

mod s3;

pub use s3::S3Store;

use async_trait::async_trait;
use kilnforge_core::Result;

/// A durable, content-addressed blob store.
///
/// Implementations must make `put` idempotent: writing the same key twice
/// with the same bytes is not an error, because the Data Manager's flush
/// protocol may retry a put whose response was lost without knowing
/// whether the write actually landed.
#[async_trait]
pub trait ObjectStore: Send + Sync + 'static {
    /// Write `value` under `key`, creating or overwriting it.
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()>;

    /// Read the object at `key`. `Ok(None)` if it does not exist.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// List every object key under `prefix`, ordered lexicographically.
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;

    /// Remove the object at `key`. Not an error if it was already absent.
    async fn delete(&self, key: &str) -> Result<()>;
}
