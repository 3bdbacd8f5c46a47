//! In-memory fakes for worker tests.
//!
//! The [`Unlocker`] refactor in `kilnforge-coordination` exists so this
//! module can hand out real [`LockGuard`]s backed by nothing more than a
//! shared in-memory set, letting tests exercise the single-consumer
//! mutex's exclusivity without a live etcd cluster.

use async_trait::async_trait;
use futures::Stream;
use kilnforge_core::Result;
use kilnforge_coordination::{CoordinationStore, KeyValue, Lease, LockGuard, Unlocker, WatchEvent};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;

/// A coordination store fake whose locks are backed by a shared in-memory
/// set, so cloned handles contend with each other exactly like replicas
/// sharing one etcd cluster would. `get`/`put` are backed by a plain map,
/// enough to exercise the worker's cursor persistence.
#[derive(Clone, Default)]
pub struct FakeCoordinationStore {
    held: Arc<Mutex<HashSet<String>>>,
    values: Arc<Mutex<HashMap<String, Vec<u8>>>>,
}

struct FakeUnlocker {
    held: Arc<Mutex<HashSet<String>>>,
}

impl Unlocker for FakeUnlocker {
    fn unlock<'a>(
        &'a self,
        key: &'a [u8],
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        let held = self.held.clone();
        Box::pin(async move {
            let key = String::from_utf8_lossy(key).into_owned();
            held.lock().unwrap().remove(&key);
            Ok(())
        })
    }
}

#[async_trait]
impl CoordinationStore for FakeCoordinationStore {
    async fn get(&self, key: &str) -> Result<Option<KeyValue>> {
        Ok(self.values.lock().unwrap().get(key).map(|value| KeyValue {
            key: key.to_string(),
            value: value.clone(),
            mod_revision: 0,
        }))
    }

    async fn list(&self, _prefix: &str) -> Result<Vec<KeyValue>> {
        unimplemented!("not needed by worker tests")
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()> {
        self.values.lock().unwrap().insert(key.to_string(), value);
        Ok(())
    }

    async fn compare_and_swap(&self, _key: &str, _value: Vec<u8>, _expect: i64) -> Result<()> {
        unimplemented!("not needed by worker tests")
    }

    async fn delete(&self, _key: &str) -> Result<()> {
        unimplemented!("not needed by worker tests")
    }

    async fn watch(
        &self,
        _prefix: &str,
    ) -> Result<Pin<Box<dyn Stream<Item = WatchEvent> + Send>>> {
        unimplemented!("not needed by worker tests")
    }

    async fn grant_lease(&self, ttl: Duration) -> Result<Lease> {
        // No real keep-alive traffic to send; just a handle with the
        // right shape so `Lease::id` and `Drop` behave.
        let handle = tokio::spawn(async move {
            tokio::time::sleep(ttl).await;
        });
        Ok(Lease::new(1, handle))
    }

    async fn lock(&self, key: &str, lease: &Lease) -> Result<LockGuard> {
        loop {
            if let Some(guard) = self.try_lock(key, lease).await? {
                return Ok(guard);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    async fn try_lock(&self, key: &str, _lease: &Lease) -> Result<Option<LockGuard>> {
        let mut held = self.held.lock().unwrap();
        if held.contains(key) {
            return Ok(None);
        }
        held.insert(key.to_string());
        drop(held);
        Ok(Some(LockGuard::new(
            key.as_bytes().to_vec(),
            Arc::new(FakeUnlocker {
                held: self.held.clone(),
            }),
        )))
    }
}

/// Spawn a one-shot HTTP server on localhost that writes `body` as an SSE
/// response to the first connection it accepts, then closes. Returns the
/// URL to fetch it from.
pub async fn spawn_sse_server(body: &'static str) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        if let Ok((mut socket, _)) = listener.accept().await {
            use tokio::io::{AsyncReadExt, AsyncWriteExt};
            let mut discard = [0u8; 1024];
            let _ = socket.read(&mut discard).await;
            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: text/event-stream\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                body.len(),
                body
            );
            let _ = socket.write_all(response.as_bytes()).await;
            let _ = socket.shutdown().await;
        }
    });
    format!("http://{addr}/")
}
