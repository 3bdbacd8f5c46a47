//! The coordination-store abstraction: a strongly-consistent key/value
//! store with compare-and-swap writes, prefix watches and lease-backed
//! distributed locks.
//!
//! The Data Manager's WAL tail and the single-consumer worker's mutex both
//! sit on top of [`CoordinationStore`]. The only implementation shipped
//! here is [`etcd::EtcdStore`], backed by `etcd-client`; anything that
//! speaks the same primitives (a Raft-backed KV store with CAS and leases)
//! can implement the trait instead.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod etcd;
pub mod lock;
pub mod store;

pub use etcd::EtcdStore;
pub use lock::{Lease, LockGuard, Unlocker};
pub use store::{CoordinationStore, KeyValue, WatchEvent};
