//! Shared state every background loop and public method reads or updates.

use kilnforge_core::{ChangeNotification, DataManagerConfig, Sequence};
use kilnforge_coordination::CoordinationStore;
use kilnforge_objectstore::ObjectStore;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, Notify};

/// A committed batch handed from the write path to the flush loop.
///
/// `raw_keys` are the CS keys (`wal/<first_seq>`) this batch was written
/// under, kept so the flush loop can delete them once the batch is safely
/// in an OST segment.
pub(crate) struct FlushBatch {
    pub(crate) first_seq: Sequence,
    pub(crate) last_seq: Sequence,
    pub(crate) entries: Vec<kilnforge_core::WalEntry>,
    pub(crate) raw_key: String,
}

/// One item of the `Subscribe` stream (§4.1).
#[derive(Debug, Clone)]
pub enum ChangeEvent {
    /// A committed change.
    Change(ChangeNotification),
    /// The subscriber fell behind the bounded buffer; it must re-read from
    /// ReadDB before trusting further notifications.
    Overflow,
}

/// State shared by [`crate::manager::DataManager`] and every background
/// loop it spawns.
pub(crate) struct Shared {
    pub(crate) base_path: String,
    pub(crate) data_types: HashSet<String>,
    pub(crate) config: DataManagerConfig,
    pub(crate) cs: Arc<dyn CoordinationStore>,
    pub(crate) ost: Arc<dyn ObjectStore>,
    pub(crate) committed: AtomicU64,
    pub(crate) committed_notify: Notify,
    pub(crate) flushed_seq: AtomicU64,
    pub(crate) change_tx: broadcast::Sender<ChangeNotification>,
    pub(crate) flush_tx: mpsc::Sender<FlushBatch>,
}

impl Shared {
    pub(crate) fn key(&self, suffix: &str) -> String {
        format!("{}/{suffix}", self.base_path)
    }

    pub(crate) fn committed_sequence(&self) -> Sequence {
        Sequence(self.committed.load(Ordering::Acquire))
    }

    pub(crate) fn set_committed(&self, seq: Sequence) {
        self.committed.store(seq.0, Ordering::Release);
        self.committed_notify.notify_waiters();
    }

    pub(crate) fn flushed_sequence(&self) -> Sequence {
        Sequence(self.flushed_seq.load(Ordering::Acquire))
    }

    pub(crate) fn set_flushed(&self, seq: Sequence) {
        self.flushed_seq.store(seq.0, Ordering::Release);
    }
}
