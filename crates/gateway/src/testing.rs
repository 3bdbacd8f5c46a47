//! In-memory fakes for this crate's shell/health tests. Mirrors
//! `kilnforge-datamanager`'s and `kilnforge-readdb`'s own copies; each
//! crate's tests depend only on its own public surface.

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
        unimplemented!("checkpoint interval outlives these tests, never called")
    }

    async fn lock(&self, _key: &str, _lease: &Lease) -> Result<LockGuard> {
        unimplemented!("checkpoint interval outlives these tests, never called")
    }

    async fn try_lock(&self, _key: &str, _lease: &Lease) -> Result<Option<LockGuard>> {
        unimplemented!("checkpoint interval outlives these tests, never called")
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::health_router;
    use crate::shell::run_background;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use kilnforge_core::DataManagerConfig;
    use kilnforge_datamanager::DataManager;
    use kilnforge_readdb::{NoIndexSchema, ReadDb};
    use std::time::Duration as StdDuration;
    use tempfile::tempdir;
    use tokio_util::sync::CancellationToken;
    use tower::ServiceExt;

    fn config() -> DataManagerConfig {
        DataManagerConfig {
            base_path: "gatewaytest".into(),
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
    async fn readyz_flips_once_readdb_catches_up() {
        let cs = FakeCoordinationStore::new();
        let ost = FakeObjectStore::new();
        let dm = Arc::new(DataManager::new(config(), cs.clone(), ost.clone()));
        let dir = tempdir().unwrap();
        let readdb = ReadDb::new(dir.path(), cs, ost, dm.clone(), Arc::new(NoIndexSchema)).unwrap();

        let router = health_router(readdb.clone());

        let resp = router
            .clone()
            .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = router
            .clone()
            .oneshot(Request::builder().uri("/readyz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);

        let cancel = CancellationToken::new();
        let background_cancel = cancel.clone();
        let background = tokio::spawn(run_background(dm, readdb.clone(), background_cancel));

        // No writes happen in this test; just give the background tasks a
        // moment to run recovery and reach the Tailing state.
        tokio::time::sleep(StdDuration::from_millis(50)).await;

        let resp = router
            .oneshot(Request::builder().uri("/readyz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        cancel.cancel();
        background.await.unwrap().unwrap();
    }
}
