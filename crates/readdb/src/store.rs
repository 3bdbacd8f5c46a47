//! The embedded, indexed local projection (§4.2).
//!
//! Three `sled` trees share one database: `records` (primary storage,
//! keyed by `data_type\0id`), `indexes` (secondary lookups, keyed by
//! `index\0key\0id`), and `meta` (just the committed position). `apply`
//! always writes `meta`'s position last, after the record and its index
//! entries land — on a crash between those writes, recovery observes the
//! old position and simply re-applies the same entry, which is safe
//! because every write here is an idempotent replace-by-key, never a
//! delta. That idempotence is what makes the anchor in §4.2 hold without
//! needing a true cross-tree transaction.

use crate::schema::RecordSchema;
use kilnforge_core::{Action, Error, Result, Sequence, WalEntry};
use sled::{Db, Tree};
use std::path::Path;
use std::sync::Arc;

const POSITION_KEY: &[u8] = b"position";

fn record_key(data_type: &str, id: &str) -> Vec<u8> {
    let mut k = Vec::with_capacity(data_type.len() + id.len() + 1);
    k.extend_from_slice(data_type.as_bytes());
    k.push(0);
    k.extend_from_slice(id.as_bytes());
    k
}

fn index_key(index: &str, key: &str, id: &str) -> Vec<u8> {
    let mut k = Vec::with_capacity(index.len() + key.len() + id.len() + 2);
    k.extend_from_slice(index.as_bytes());
    k.push(0);
    k.extend_from_slice(key.as_bytes());
    k.push(0);
    k.extend_from_slice(id.as_bytes());
    k
}

fn index_prefix(index: &str, key: &str) -> Vec<u8> {
    let mut k = Vec::with_capacity(index.len() + key.len() + 2);
    k.extend_from_slice(index.as_bytes());
    k.push(0);
    k.extend_from_slice(key.as_bytes());
    k.push(0);
    k
}

/// The local store ReadDB reads and writes. Cheap to clone — `sled::Db`
/// and `sled::Tree` are themselves handles over shared, reference-counted
/// state.
#[derive(Clone)]
pub(crate) struct ReadStore {
    #[allow(dead_code)]
    db: Db,
    records: Tree,
    indexes: Tree,
    meta: Tree,
    schema: Arc<dyn RecordSchema>,
}

impl ReadStore {
    pub(crate) fn open(data_dir: &Path, schema: Arc<dyn RecordSchema>) -> Result<Self> {
        let db = sled::open(data_dir).map_err(|e| Error::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?;
        let records = db
            .open_tree("records")
            .map_err(|e| Error::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?;
        let indexes = db
            .open_tree("indexes")
            .map_err(|e| Error::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?;
        let meta = db
            .open_tree("meta")
            .map_err(|e| Error::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?;
        Ok(ReadStore {
            db,
            records,
            indexes,
            meta,
            schema,
        })
    }

    pub(crate) fn position(&self) -> Sequence {
        match self.meta.get(POSITION_KEY) {
            Ok(Some(bytes)) => {
                let arr: [u8; 8] = bytes.as_ref().try_into().unwrap_or([0; 8]);
                Sequence(u64::from_be_bytes(arr))
            }
            _ => Sequence::ZERO,
        }
    }

    /// Wipe all three trees. Used when entering `Resetting`.
    pub(crate) fn clear(&self) -> Result<()> {
        for tree in [&self.records, &self.indexes, &self.meta] {
            tree.clear()
                .map_err(|e| Error::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?;
        }
        Ok(())
    }

    /// Load a checkpoint wholesale: every record replaces whatever was
    /// there, position is set to `covered_up_to` in the same transaction
    /// as the last batch of records written.
    pub(crate) fn load_checkpoint(
        &self,
        records: &[kilnforge_datamanager::wire::CheckpointRecord],
        covered_up_to: Sequence,
    ) -> Result<()> {
        for record in records {
            self.put_record_and_indexes(&record.data_type.0, &record.id.0, &record.payload)?;
        }
        self.set_position(covered_up_to)
    }

    /// Apply one WAL entry and advance the stored position to its
    /// sequence, atomically.
    pub(crate) fn apply(&self, entry: &WalEntry) -> Result<()> {
        match entry.action {
            Action::Put => {
                self.put_record_and_indexes(
                    &entry.data_type.0,
                    &entry.id.0,
                    entry.payload.as_deref().unwrap_or(&[]),
                )?;
            }
            Action::Delete => {
                self.delete_record_and_indexes(&entry.data_type.0, &entry.id.0)?;
            }
        }
        self.set_position(entry.sequence)
    }

    fn put_record_and_indexes(&self, data_type: &str, id: &str, payload: &[u8]) -> Result<()> {
        let key = record_key(data_type, id);
        let old = self
            .records
            .get(&key)
            .map_err(|e| Error::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?;

        if let Some(old_payload) = &old {
            for entry in self.schema.extract_indexes(data_type, old_payload)? {
                let ikey = index_key(&entry.index, &entry.key, id);
                self.indexes
                    .remove(ikey)
                    .map_err(|e| Error::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?;
            }
        }

        self.records
            .insert(&key, payload)
            .map_err(|e| Error::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?;

        for entry in self.schema.extract_indexes(data_type, payload)? {
            let ikey = index_key(&entry.index, &entry.key, id);
            self.indexes
                .insert(ikey, &[])
                .map_err(|e| Error::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?;
        }
        Ok(())
    }

    fn delete_record_and_indexes(&self, data_type: &str, id: &str) -> Result<()> {
        let key = record_key(data_type, id);
        if let Some(old_payload) = self
            .records
            .get(&key)
            .map_err(|e| Error::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?
        {
            for entry in self.schema.extract_indexes(data_type, &old_payload)? {
                let ikey = index_key(&entry.index, &entry.key, id);
                self.indexes
                    .remove(ikey)
                    .map_err(|e| Error::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?;
            }
        }
        self.records
            .remove(&key)
            .map_err(|e| Error::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?;
        Ok(())
    }

    fn set_position(&self, seq: Sequence) -> Result<()> {
        self.meta
            .insert(POSITION_KEY, &seq.0.to_be_bytes())
            .map_err(|e| Error::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?;
        Ok(())
    }

    pub(crate) fn query(&self, data_type: &str, id: &str) -> Result<Option<Vec<u8>>> {
        Ok(self
            .records
            .get(record_key(data_type, id))
            .map_err(|e| Error::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?
            .map(|v| v.to_vec()))
    }

    pub(crate) fn list(&self, index: &str, key: &str) -> Result<Vec<Vec<u8>>> {
        let prefix = index_prefix(index, key);
        let mut ids = Vec::new();
        for item in self.indexes.scan_prefix(&prefix) {
            let (ikey, _) = item.map_err(|e| Error::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?;
            let id = String::from_utf8_lossy(&ikey[prefix.len()..]).into_owned();
            ids.push(id);
        }
        // The index declares data_type implicitly via whatever prefix the
        // caller's schema uses for `record_key`; callers that need
        // cross-data-type disambiguation should namespace `index` names
        // per data type (e.g. "project.parent_id").
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(payload) = self.records_scan_any_type(&id)? {
                out.push(payload);
            }
        }
        Ok(out)
    }

    fn records_scan_any_type(&self, id: &str) -> Result<Option<Vec<u8>>> {
        for item in self.records.iter() {
            let (key, value) = item.map_err(|e| Error::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?;
            if let Some(pos) = key.iter().position(|b| *b == 0) {
                if &key[pos + 1..] == id.as_bytes() {
                    return Ok(Some(value.to_vec()));
                }
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::NoIndexSchema;
    use kilnforge_core::{DataType, EntryId};
    use tempfile::tempdir;

    fn store() -> (tempfile::TempDir, ReadStore) {
        let dir = tempdir().unwrap();
        let store = ReadStore::open(dir.path(), Arc::new(NoIndexSchema)).unwrap();
        (dir, store)
    }

    #[test]
    fn apply_put_then_query() {
        let (_dir, store) = store();
        let mut entry = WalEntry::put("user", "u1", b"alice".to_vec());
        entry.sequence = Sequence(1);
        store.apply(&entry).unwrap();
        assert_eq!(store.query("user", "u1").unwrap(), Some(b"alice".to_vec()));
        assert_eq!(store.position(), Sequence(1));
    }

    #[test]
    fn apply_delete_removes_record() {
        let (_dir, store) = store();
        let mut put = WalEntry::put("user", "u1", b"alice".to_vec());
        put.sequence = Sequence(1);
        store.apply(&put).unwrap();

        let mut del = WalEntry::delete("user", "u1");
        del.sequence = Sequence(2);
        store.apply(&del).unwrap();

        assert_eq!(store.query("user", "u1").unwrap(), None);
        assert_eq!(store.position(), Sequence(2));
    }

    #[test]
    fn clear_resets_position() {
        let (_dir, store) = store();
        let mut entry = WalEntry::put("user", "u1", b"alice".to_vec());
        entry.sequence = Sequence(5);
        store.apply(&entry).unwrap();
        store.clear().unwrap();
        assert_eq!(store.position(), Sequence::ZERO);
        assert_eq!(store.query("user", "u1").unwrap(), None);
    }

    #[test]
    fn checkpoint_load_sets_position() {
        let (_dir, store) = store();
        let records = vec![kilnforge_datamanager::wire::CheckpointRecord {
            data_type: DataType::new("user"),
            id: EntryId::from("u1"),
            payload: b"alice".to_vec(),
        }];
        store.load_checkpoint(&records, Sequence(42)).unwrap();
        assert_eq!(store.position(), Sequence(42));
        assert_eq!(store.query("user", "u1").unwrap(), Some(b"alice".to_vec()));
    }
}
