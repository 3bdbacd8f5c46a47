//! `Run` (§4.2): determine the stored position, catch up from a
//! checkpoint and/or the segment chain, then tail newly committed
//! entries. Falls back to a full reset when a required sequence has
//! already aged out of the safety window.

use crate::schema::RecordSchema;
use crate::state::ReadDbState;
use crate::store::ReadStore;
use futures::StreamExt;
use kilnforge_core::{Error, Result, Sequence, WalEntry};
use kilnforge_coordination::CoordinationStore;
use kilnforge_datamanager::{wire, DataManager};
use kilnforge_objectstore::ObjectStore;
use parking_lot::Mutex;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

/// A queryable, indexed local projection of one Data Manager's log.
pub struct ReadDb {
    store: ReadStore,
    cs: Arc<dyn CoordinationStore>,
    ost: Arc<dyn ObjectStore>,
    dm: Arc<DataManager>,
    state: Mutex<ReadDbState>,
    position_notify: Notify,
}

/// Why the tail loop stopped.
enum TailOutcome {
    Cancelled,
    NeedsReset,
}

impl ReadDb {
    /// Open (or create) the local store at `data_dir` and bind it to
    /// `dm`'s log, projecting payloads through `schema`.
    pub fn new(
        data_dir: &Path,
        cs: Arc<dyn CoordinationStore>,
        ost: Arc<dyn ObjectStore>,
        dm: Arc<DataManager>,
        schema: Arc<dyn RecordSchema>,
    ) -> Result<Arc<Self>> {
        let store = ReadStore::open(data_dir, schema)?;
        Ok(Arc::new(ReadDb {
            store,
            cs,
            ost,
            dm,
            state: Mutex::new(ReadDbState::Stopped),
            position_notify: Notify::new(),
        }))
    }

    /// The current lifecycle phase.
    pub fn state(&self) -> ReadDbState {
        *self.state.lock()
    }

    fn set_state(&self, s: ReadDbState) {
        let mut guard = self.state.lock();
        if *guard != s {
            info!(from = %*guard, to = %s, "readdb state transition");
        }
        *guard = s;
    }

    /// A non-blocking snapshot of the committed position.
    pub fn position(&self) -> Sequence {
        self.store.position()
    }

    /// Block until the local position is at least `seq`, or `cancel`
    /// fires.
    pub async fn wait_position(&self, seq: Sequence, cancel: &CancellationToken) -> Result<()> {
        loop {
            if self.store.position() >= seq {
                return Ok(());
            }
            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(Error::Unavailable("wait_position canceled".into()));
                }
                _ = self.position_notify.notified() => {}
            }
        }
    }

    /// Fetch one record.
    pub fn query(&self, data_type: &str, id: &str) -> Result<Option<Vec<u8>>> {
        self.store.query(data_type, id)
    }

    /// Fetch every record filed under `index`/`key`, ordered by id.
    pub fn list(&self, index: &str, key: &str) -> Result<Vec<Vec<u8>>> {
        self.store.list(index, key)
    }

    /// Drive this instance until `cancel` fires.
    #[instrument(skip(self, cancel))]
    pub async fn run(self: &Arc<Self>, cancel: CancellationToken) -> Result<()> {
        loop {
            self.set_state(ReadDbState::Initializing);
            self.initialize().await?;

            self.set_state(ReadDbState::Tailing);
            match self.tail(&cancel).await? {
                TailOutcome::Cancelled => {
                    self.set_state(ReadDbState::Stopped);
                    return Ok(());
                }
                TailOutcome::NeedsReset => {
                    self.set_state(ReadDbState::Resetting);
                    self.store.clear()?;
                    continue;
                }
            }
        }
    }

    fn base_path(&self) -> &str {
        self.dm.base_path()
    }

    fn key(&self, suffix: &str) -> String {
        format!("{}/{suffix}", self.base_path())
    }

    async fn newest_checkpoint(&self) -> Result<Option<(Sequence, String)>> {
        let prefix = self.key("checkpoints/");
        let mut keys = self.ost.list(&prefix).await?;
        keys.sort();
        Ok(keys.last().and_then(|k| {
            k.rsplit('/')
                .next()
                .and_then(|s| s.parse().ok())
                .map(|seq| (Sequence(seq), k.clone()))
        }))
    }

    #[instrument(skip(self))]
    async fn initialize(&self) -> Result<()> {
        self.set_state(ReadDbState::CatchingUp);
        let mut position = self.store.position();

        if let Some((covered_up_to, key)) = self.newest_checkpoint().await? {
            if position < covered_up_to {
                info!(position = position.0, covered_up_to = covered_up_to.0, "loading checkpoint");
                self.store.clear()?;
                if let Some(bytes) = self.ost.get(&key).await? {
                    let records = wire::decode_checkpoint(&bytes)?;
                    self.store.load_checkpoint(&records, covered_up_to)?;
                }
                position = covered_up_to;
            }
        }

        let entries = self.collect_entries_after(position).await?;
        if !entries.is_empty() && entries[0].sequence.0 != position.0 + 1 {
            warn!(
                position = position.0,
                first_available = entries[0].sequence.0,
                "gap beyond safety window detected during catch-up, forcing full reset"
            );
            self.store.clear()?;
            if let Some((covered_up_to, key)) = self.newest_checkpoint().await? {
                if let Some(bytes) = self.ost.get(&key).await? {
                    let records = wire::decode_checkpoint(&bytes)?;
                    self.store.load_checkpoint(&records, covered_up_to)?;
                }
                position = covered_up_to;
            } else {
                position = Sequence::ZERO;
            }
            let entries = self.collect_entries_after(position).await?;
            self.apply_all(entries)?;
        } else {
            self.apply_all(entries)?;
        }

        Ok(())
    }

    fn apply_all(&self, entries: Vec<WalEntry>) -> Result<()> {
        for entry in entries {
            self.store.apply(&entry)?;
            self.position_notify.notify_waiters();
        }
        Ok(())
    }

    /// Gather every entry with `sequence > after`, from flushed OST
    /// segments first, then any not-yet-flushed raw CS records, sorted by
    /// sequence.
    async fn collect_entries_after(&self, after: Sequence) -> Result<Vec<WalEntry>> {
        let mut entries = Vec::new();

        let segments_prefix = self.key("wal-segments/");
        let mut segment_keys = self.ost.list(&segments_prefix).await?;
        segment_keys.sort_by_key(|k| wire::parse_segment_range(k).map(|(f, _)| f.0).unwrap_or(u64::MAX));
        for key in segment_keys {
            let Some((_, last)) = wire::parse_segment_range(&key) else {
                continue;
            };
            if last <= after {
                continue;
            }
            if let Some(bytes) = self.ost.get(&key).await? {
                entries.extend(wire::decode_segment(&bytes)?.into_iter().filter(|e| e.sequence > after));
            }
        }

        let wal_prefix = self.key("wal/");
        let mut raw = self.cs.list(&wal_prefix).await?;
        raw.retain(|kv| {
            kv.key
                .rsplit('/')
                .next()
                .map(|s| s.chars().all(|c| c.is_ascii_digit()) && !s.is_empty())
                .unwrap_or(false)
        });
        raw.sort_by_key(|kv| kv.key.clone());
        for kv in raw {
            entries.extend(
                wire::decode_segment(&kv.value)?
                    .into_iter()
                    .filter(|e| e.sequence > after),
            );
        }

        entries.sort_by_key(|e| e.sequence.0);
        entries.dedup_by_key(|e| e.sequence.0);
        Ok(entries)
    }

    #[instrument(skip(self, cancel))]
    async fn tail(&self, cancel: &CancellationToken) -> Result<TailOutcome> {
        let mut changes = self.dm.subscribe();
        let mut ticker = tokio::time::interval(Duration::from_millis(250));

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(TailOutcome::Cancelled),
                change = changes.next() => {
                    if change.is_none() {
                        return Ok(TailOutcome::Cancelled);
                    }
                }
                _ = ticker.tick() => {}
            }

            let target = self.dm.committed_sequence();
            let position = self.store.position();
            if position >= target {
                continue;
            }

            let entries = self.collect_entries_after(position).await?;
            if entries.is_empty() {
                continue;
            }
            if entries[0].sequence.0 != position.0 + 1 {
                return Ok(TailOutcome::NeedsReset);
            }
            self.apply_all(entries)?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::NoIndexSchema;
    use crate::testing::{FakeCoordinationStore, FakeObjectStore};
    use kilnforge_core::DataManagerConfig;
    use std::time::Duration as StdDuration;
    use tempfile::tempdir;
    use tokio::sync::oneshot;

    fn dm_config() -> DataManagerConfig {
        DataManagerConfig {
            base_path: "configdata".into(),
            data_types: vec!["user".into()],
            segment_max_bytes: 64 * 1024 * 1024,
            segment_max_age: StdDuration::from_secs(300),
            segment_max_keys: 100_000,
            gc_safety_window: 10_000,
            checkpoint_interval: StdDuration::from_secs(3600),
            subscribe_buffer: 16,
        }
    }

    #[tokio::test]
    async fn catches_up_to_entries_written_before_run() {
        let cs = FakeCoordinationStore::new();
        let ost = FakeObjectStore::new();
        let dm = Arc::new(DataManager::new(dm_config(), cs.clone(), ost.clone()));

        let cancel = CancellationToken::new();
        let (ready_tx, ready_rx) = oneshot::channel();
        let dm_for_run = dm.clone();
        let dm_cancel = cancel.clone();
        let dm_handle = tokio::spawn(async move { dm_for_run.run(ready_tx, dm_cancel).await });
        ready_rx.await.unwrap();

        dm.append(vec![WalEntry::put("user", "u1", b"alice".to_vec())])
            .await
            .unwrap();
        dm.append(vec![WalEntry::put("user", "u2", b"bob".to_vec())])
            .await
            .unwrap();

        let dir = tempdir().unwrap();
        let readdb = ReadDb::new(dir.path(), cs, ost, dm.clone(), Arc::new(NoIndexSchema)).unwrap();

        let readdb_cancel = cancel.clone();
        let readdb_for_run = readdb.clone();
        let readdb_handle = tokio::spawn(async move { readdb_for_run.run(readdb_cancel).await });

        readdb
            .wait_position(Sequence(2), &cancel)
            .await
            .expect("should catch up within the test timeout");

        assert_eq!(readdb.query("user", "u1").unwrap(), Some(b"alice".to_vec()));
        assert_eq!(readdb.query("user", "u2").unwrap(), Some(b"bob".to_vec()));

        cancel.cancel();
        dm_handle.await.unwrap().unwrap();
        readdb_handle.await.unwrap().unwrap();
    }
}
