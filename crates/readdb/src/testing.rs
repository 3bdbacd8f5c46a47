//! In-memory fakes for [`CoordinationStore`] and [`ObjectStore`], used by
//! this crate's catch-up/tail tests. Mirrors `kilnforge-datamanager`'s own
//! test fakes; kept separate rather than shared so each crate's tests
//! depend only on its own public surface.

#![cfg(test)]

use async_trait::async_trait;
use kilnforge_coordination::{CoordinationStore, KeyValue, Lease, LockGuard, WatchEvent};
use kilnforge_core::{Error, Result};
use kilnforge_objectstore::ObjectStore;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

#[derive(Default)]
struct Entry {
    value: Vec<u8>,
    revision: i64,
}

#[derive(Default)]
pub(crate) struct FakeCoordinationStore {
    entries: Mutex<BTreeMap<String, Entry>>,
    next_revision: Mutex<i64>,
}

impl FakeCoordinationStore {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(FakeCoordinationStore::default())
    }
}

#[async_trait]
impl CoordinationStore for FakeCoordinationStore {
    async fn get(&self, key: &str) -> Result<Option<KeyValue>> {
        Ok(self.entries.lock().get(key).map(|e| KeyValue {
            key: key.to_string(),
            value: e.value.clone(),
            mod_revision: e.revision,
        }))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<KeyValue>> {
        Ok(self
            .entries
            .lock()
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(k, e)| KeyValue {
                key: k.clone(),
                value: e.value.clone(),
                mod_revision: e.revision,
            })
            .collect())
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()> {
        let mut next = self.next_revision.lock();
        *next += 1;
        let revision = *next;
        self.entries.lock().insert(key.to_string(), Entry { value, revision });
        Ok(())
    }

    async fn compare_and_swap(&self, key: &str, value: Vec<u8>, expect_revision: i64) -> Result<()> {
        let current_revision = self.entries.lock().get(key).map(|e| e.revision).unwrap_or(0);
        if current_revision != expect_revision {
            return Err(Error::Conflict(format!(
                "expected revision {expect_revision}, found {current_revision}"
            )));
        }
        self.put(key, value).await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.lock().remove(key);
        Ok(())
    }

    async fn watch(
        &self,
        _prefix: &str,
    ) -> Result<std::pin::Pin<Box<dyn futures::Stream<Item = WatchEvent> + Send>>> {
        Ok(Box::pin(futures::stream::empty()))
    }

    async fn grant_lease(&self, _ttl: Duration) -> Result<Lease> {
        unimplemented!("not needed for readdb tests")
    }

    async fn lock(&self, _key: &str, _lease: &Lease) -> Result<LockGuard> {
        unimplemented!("not needed for readdb tests")
    }

    async fn try_lock(&self, _key: &str, _lease: &Lease) -> Result<Option<LockGuard>> {
        unimplemented!("not needed for readdb tests")
    }
}

#[derive(Default)]
pub(crate) struct FakeObjectStore {
    objects: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl FakeObjectStore {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(FakeObjectStore::default())
    }
}

#[async_trait]
impl ObjectStore for FakeObjectStore {
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()> {
        self.objects.lock().insert(key.to_string(), value);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.objects.lock().get(key).cloned())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self.objects.lock().keys().filter(|k| k.starts_with(prefix)).cloned().collect())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.objects.lock().remove(key);
        Ok(())
    }
}
