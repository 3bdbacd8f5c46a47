//! The `DataManager` public API (§4.1).

use crate::state::{ChangeEvent, Shared};
use crate::{append, checkpoint, flush, gc, recovery};
use futures::{Stream, StreamExt};
use kilnforge_core::{ChangeNotification, DataManagerConfig, Result, Sequence, WalEntry};
use kilnforge_coordination::CoordinationStore;
use kilnforge_objectstore::ObjectStore;
use std::collections::HashSet;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};

/// Owns the durable, totally ordered log of typed mutations for one
/// service (configstore, runservice, ...), rooted at
/// [`DataManagerConfig::base_path`].
///
/// Construct one, call [`DataManager::run`] in a background task, wait on
/// the ready channel it signals, then start issuing [`DataManager::append`]
/// calls and/or subscribing to [`DataManager::subscribe`].
pub struct DataManager {
    shared: Arc<Shared>,
    flush_rx: tokio::sync::Mutex<Option<mpsc::Receiver<crate::state::FlushBatch>>>,
}

impl DataManager {
    /// Build a new Data Manager. Does not touch CS/OST until [`run`] is
    /// called.
    ///
    /// [`run`]: DataManager::run
    pub fn new(
        config: DataManagerConfig,
        cs: Arc<dyn CoordinationStore>,
        ost: Arc<dyn ObjectStore>,
    ) -> Self {
        let (change_tx, _) = broadcast::channel(config.subscribe_buffer);
        let (flush_tx, flush_rx) = mpsc::channel(256);
        let data_types: HashSet<String> = config.data_types.iter().cloned().collect();
        let base_path = config.base_path.clone();

        let shared = Arc::new(Shared {
            base_path,
            data_types,
            config,
            cs,
            ost,
            committed: AtomicU64::new(0),
            committed_notify: Notify::new(),
            flushed_seq: AtomicU64::new(0),
            change_tx,
            flush_tx,
        });

        DataManager {
            shared,
            flush_rx: tokio::sync::Mutex::new(Some(flush_rx)),
        }
    }

    /// Append a batch of entries. See §4.1 for the constraints each entry
    /// must satisfy and the error kinds this can return.
    pub async fn append(&self, entries: Vec<WalEntry>) -> Result<Sequence> {
        append::append(&self.shared, entries).await
    }

    /// The key/object prefix this instance owns, as configured at
    /// construction.
    pub fn base_path(&self) -> &str {
        &self.shared.base_path
    }

    /// A non-blocking snapshot of the highest sequence guaranteed durable.
    pub fn committed_sequence(&self) -> Sequence {
        self.shared.committed_sequence()
    }

    /// Block until the committed position is at least `seq`, or `cancel`
    /// fires first.
    pub async fn wait_committed(&self, seq: Sequence, cancel: &CancellationToken) -> Result<()> {
        loop {
            if self.shared.committed_sequence() >= seq {
                return Ok(());
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(kilnforge_core::Error::Unavailable(
                    "wait_committed canceled".into(),
                )),
                _ = self.shared.committed_notify.notified() => {}
            }
        }
    }

    /// Subscribe to committed changes from "now" onward. Lags beyond the
    /// configured buffer surface as [`ChangeEvent::Overflow`]; the
    /// consumer must re-read from ReadDB after seeing one.
    pub fn subscribe(&self) -> impl Stream<Item = ChangeEvent> {
        let rx = self.shared.change_tx.subscribe();
        tokio_stream::wrappers::BroadcastStream::new(rx).filter_map(|item| async move {
            match item {
                Ok(notification) => Some(ChangeEvent::Change(notification)),
                Err(tokio_stream::wrappers::errors::BroadcastStreamRecvError::Lagged(_)) => {
                    Some(ChangeEvent::Overflow)
                }
            }
        })
    }

    /// Run recovery, then drive the flush, checkpoint and GC loops until
    /// `cancel` fires. Signals `ready` once recovery has completed and the
    /// committed position is initialized — see §4.1 "Recovery".
    #[instrument(skip(self, ready, cancel), fields(base_path = %self.shared.base_path))]
    pub async fn run(&self, ready: oneshot::Sender<()>, cancel: CancellationToken) -> Result<()> {
        let outcome = recovery::recover(&self.shared).await?;
        self.shared.set_flushed(outcome.flushed_seq);
        self.shared.set_committed(outcome.tail);

        let flush_rx = self
            .flush_rx
            .lock()
            .await
            .take()
            .expect("run called more than once");

        let _ = ready.send(());
        info!(
            tail = outcome.tail.0,
            flushed_seq = outcome.flushed_seq.0,
            "data manager recovered, starting background loops"
        );

        let flush_task = tokio::spawn(flush::run(self.shared.clone(), flush_rx, cancel.clone()));
        let checkpoint_task = tokio::spawn(checkpoint::run(self.shared.clone(), cancel.clone()));
        let gc_task = tokio::spawn(gc::run(self.shared.clone(), cancel.clone()));

        cancel.cancelled().await;
        let _ = tokio::join!(flush_task, checkpoint_task, gc_task);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeCoordinationStore, FakeObjectStore};
    use kilnforge_core::DataManagerConfig;
    use std::time::Duration;

    fn config() -> DataManagerConfig {
        DataManagerConfig {
            base_path: "configdata".into(),
            data_types: vec!["user".into()],
            segment_max_bytes: 64 * 1024 * 1024,
            segment_max_age: Duration::from_secs(300),
            segment_max_keys: 100_000,
            gc_safety_window: 10_000,
            checkpoint_interval: Duration::from_secs(3600),
            subscribe_buffer: 16,
        }
    }

    async fn start() -> (DataManager, CancellationToken) {
        let dm = DataManager::new(config(), FakeCoordinationStore::new(), FakeObjectStore::new());
        let cancel = CancellationToken::new();
        (dm, cancel)
    }

    #[tokio::test]
    async fn append_rejects_empty_id() {
        let (dm, _cancel) = start().await;
        let err = dm.append(vec![WalEntry::put("user", "", vec![1])]).await.unwrap_err();
        assert!(matches!(err, kilnforge_core::Error::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn append_rejects_undeclared_data_type() {
        let (dm, _cancel) = start().await;
        let err = dm
            .append(vec![WalEntry::put("org", "o1", vec![1])])
            .await
            .unwrap_err();
        assert!(matches!(err, kilnforge_core::Error::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn append_assigns_dense_increasing_sequences() {
        let (dm, _cancel) = start().await;
        let s1 = dm
            .append(vec![WalEntry::put("user", "u1", vec![1])])
            .await
            .unwrap();
        let s2 = dm
            .append(vec![WalEntry::put("user", "u2", vec![2])])
            .await
            .unwrap();
        assert_eq!(s1, Sequence(1));
        assert_eq!(s2, Sequence(2));
        assert_eq!(dm.committed_sequence(), Sequence(2));
    }

    #[tokio::test]
    async fn append_batch_shares_contiguous_sequences() {
        let (dm, _cancel) = start().await;
        let last = dm
            .append(vec![
                WalEntry::put("user", "u1", vec![1]),
                WalEntry::put("user", "u2", vec![2]),
            ])
            .await
            .unwrap();
        assert_eq!(last, Sequence(2));
    }

    #[tokio::test]
    async fn run_recovers_and_signals_ready() {
        let (dm, cancel) = start().await;
        let (ready_tx, ready_rx) = oneshot::channel();
        let dm_cancel = cancel.clone();
        let run_handle = tokio::spawn(async move { dm.run(ready_tx, dm_cancel).await });
        ready_rx.await.expect("ready channel dropped without firing");
        cancel.cancel();
        run_handle.await.unwrap().unwrap();
    }
}
