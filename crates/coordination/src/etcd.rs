//! [`CoordinationStore`] backed by a real etcd cluster via `etcd-client`.

use crate::lock::Unlocker;
use crate::store::{CoordinationStore, KeyValue, WatchEvent};
use crate::{Lease, LockGuard};
use async_trait::async_trait;
use etcd_client::{
    Client, Compare, CompareOp, ConnectOptions, EventType, GetOptions, LockClient, LockOptions,
    PutOptions, TlsOptions, Txn, TxnOp, WatchOptions,
};
use futures::StreamExt;
use kilnforge_core::{CoordinationConfig, Error, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, error, instrument, warn};

struct EtcdUnlocker {
    lock_client: AsyncMutex<LockClient>,
    kv_client: AsyncMutex<etcd_client::KvClient>,
    probe_key: Option<Vec<u8>>,
}

impl Unlocker for EtcdUnlocker {
    fn unlock<'a>(
        &'a self,
        key: &'a [u8],
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            self.lock_client
                .lock()
                .await
                .unlock(key.to_vec())
                .await
                .map(|_| ())
                .map_err(|e| Error::Coordination(e.to_string()))?;

            // `try_lock`'s probe key has no other owner once the real lock is
            // released; clean it up promptly so the next `try_lock` on this
            // key doesn't see a stale holder. Its lease is the backstop if
            // this delete never runs.
            if let Some(probe_key) = &self.probe_key {
                if let Err(e) = self.kv_client.lock().await.delete(probe_key.clone(), None).await
                {
                    warn!(error = %e, "failed to delete try_lock probe key, relying on lease TTL");
                }
            }
            Ok(())
        })
    }
}

/// A connected etcd client implementing [`CoordinationStore`].
///
/// Cloning an `EtcdStore` is cheap — `etcd_client::Client` is itself a
/// handle over a shared gRPC channel.
#[derive(Clone)]
pub struct EtcdStore {
    client: Client,
}

impl EtcdStore {
    /// Connect to the cluster described by `config`.
    #[instrument(skip(config), fields(endpoints = ?config.endpoints))]
    pub async fn connect(config: &CoordinationConfig) -> Result<Self> {
        let mut options = ConnectOptions::new();
        if let (Some(user), Some(pass)) = (&config.username, &config.password) {
            options = options.with_user(user.clone(), pass.clone());
        }
        if let (Some(cert), Some(key)) = (&config.cert_file, &config.key_file) {
            let cert = std::fs::read_to_string(cert).map_err(Error::Io)?;
            let key = std::fs::read_to_string(key).map_err(Error::Io)?;
            let identity = etcd_client::Identity::from_pem(cert, key);
            options = options.with_tls(TlsOptions::new().identity(identity));
        }

        let client = Client::connect(&config.endpoints, Some(options))
            .await
            .map_err(|e| Error::Coordination(format!("connect: {e}")))?;

        Ok(EtcdStore { client })
    }
}

#[async_trait]
impl CoordinationStore for EtcdStore {
    async fn get(&self, key: &str) -> Result<Option<KeyValue>> {
        let mut kv = self.client.kv_client();
        let resp = kv
            .get(key, None)
            .await
            .map_err(|e| Error::Coordination(format!("get {key}: {e}")))?;
        Ok(resp.kvs().first().map(|kv| KeyValue {
            key: String::from_utf8_lossy(kv.key()).into_owned(),
            value: kv.value().to_vec(),
            mod_revision: kv.mod_revision(),
        }))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<KeyValue>> {
        let mut kv = self.client.kv_client();
        let resp = kv
            .get(prefix, Some(GetOptions::new().with_prefix().with_sort(
                etcd_client::SortTarget::Key,
                etcd_client::SortOrder::Ascend,
            )))
            .await
            .map_err(|e| Error::Coordination(format!("list {prefix}: {e}")))?;
        Ok(resp
            .kvs()
            .iter()
            .map(|kv| KeyValue {
                key: String::from_utf8_lossy(kv.key()).into_owned(),
                value: kv.value().to_vec(),
                mod_revision: kv.mod_revision(),
            })
            .collect())
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()> {
        let mut kv = self.client.kv_client();
        kv.put(key, value, None)
            .await
            .map_err(|e| Error::Coordination(format!("put {key}: {e}")))?;
        Ok(())
    }

    #[instrument(skip(self, value), fields(key, expect_revision))]
    async fn compare_and_swap(
        &self,
        key: &str,
        value: Vec<u8>,
        expect_revision: i64,
    ) -> Result<()> {
        let mut kv = self.client.kv_client();
        let cmp = if expect_revision == 0 {
            Compare::create_revision(key, CompareOp::Equal, 0)
        } else {
            Compare::mod_revision(key, CompareOp::Equal, expect_revision)
        };

        let txn = Txn::new()
            .when(vec![cmp])
            .and_then(vec![TxnOp::put(key, value, Some(PutOptions::new()))]);

        let resp = kv
            .txn(txn)
            .await
            .map_err(|e| Error::Coordination(format!("cas {key}: {e}")))?;

        if resp.succeeded() {
            Ok(())
        } else {
            debug!(key, "compare-and-swap lost the race");
            Err(Error::Conflict(format!(
                "key {key} was modified since revision {expect_revision}"
            )))
        }
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut kv = self.client.kv_client();
        kv.delete(key, None)
            .await
            .map_err(|e| Error::Coordination(format!("delete {key}: {e}")))?;
        Ok(())
    }

    async fn watch(
        &self,
        prefix: &str,
    ) -> Result<std::pin::Pin<Box<dyn futures::Stream<Item = WatchEvent> + Send>>> {
        let mut watch_client = self.client.watch_client();
        let (watcher, mut stream) = watch_client
            .watch(prefix, Some(WatchOptions::new().with_prefix()))
            .await
            .map_err(|e| Error::Coordination(format!("watch {prefix}: {e}")))?;

        let (tx, rx) = tokio::sync::mpsc::channel(256);
        let prefix = prefix.to_string();
        tokio::spawn(async move {
            // Keep the watcher handle alive for the lifetime of the forwarding
            // task; dropping it early would cancel the watch server-side.
            let _watcher = watcher;
            while let Some(resp) = stream.next().await {
                let resp = match resp {
                    Ok(r) => r,
                    Err(e) => {
                        error!(prefix, error = %e, "watch stream error, ending");
                        break;
                    }
                };
                if resp.canceled() {
                    warn!(prefix, "watch canceled by server");
                    break;
                }
                for event in resp.events() {
                    let Some(kv) = event.kv() else { continue };
                    let key = String::from_utf8_lossy(kv.key()).into_owned();
                    let notification = match event.event_type() {
                        EventType::Put => WatchEvent::Put {
                            key,
                            value: kv.value().to_vec(),
                            mod_revision: kv.mod_revision(),
                        },
                        EventType::Delete => WatchEvent::Delete { key },
                    };
                    if tx.send(notification).await.is_err() {
                        break;
                    }
                }
            }
        });

        Ok(Box::pin(tokio_stream::wrappers::ReceiverStream::new(rx)))
    }

    #[instrument(skip(self))]
    async fn grant_lease(&self, ttl: Duration) -> Result<Lease> {
        let mut lease_client = self.client.lease_client();
        let resp = lease_client
            .grant(ttl.as_secs() as i64, None)
            .await
            .map_err(|e| Error::Coordination(format!("lease grant: {e}")))?;
        let lease_id = resp.id();

        let mut keeper_client = self.client.lease_client();
        let keepalive_interval = ttl / 3;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(keepalive_interval);
            loop {
                ticker.tick().await;
                if let Err(e) = keeper_client.keep_alive(lease_id).await {
                    warn!(lease_id, error = %e, "lease keep-alive failed, lease will expire");
                    break;
                }
            }
        });

        Ok(Lease::new(lease_id, handle))
    }

    async fn lock(&self, key: &str, lease: &Lease) -> Result<LockGuard> {
        let mut lock = self.client.lock_client();
        let resp = lock
            .lock(key, Some(LockOptions::new().with_lease(lease.id())))
            .await
            .map_err(|e| Error::Coordination(format!("lock {key}: {e}")))?;
        Ok(LockGuard::new(
            resp.key().to_vec(),
            Arc::new(EtcdUnlocker {
                lock_client: AsyncMutex::new(self.client.lock_client()),
                kv_client: AsyncMutex::new(self.client.kv_client()),
                probe_key: None,
            }),
        ))
    }

    async fn try_lock(&self, key: &str, lease: &Lease) -> Result<Option<LockGuard>> {
        // etcd-client's lock RPC blocks in the server's contention queue;
        // there is no native try-lock. We approximate one with a CAS write
        // to a sibling key, falling back to the blocking lock only once we
        // know we'd win it immediately. The probe key is put under the same
        // lease as the lock (so a crash still expires it within one TTL) and
        // is also deleted explicitly when the guard unlocks, so a clean
        // release doesn't leave the next `try_lock` permanently shadowed.
        let probe_key = format!("{key}/holder");
        let mut kv = self.client.kv_client();
        let cmp = Compare::create_revision(&probe_key, CompareOp::Equal, 0);
        let put_opts = PutOptions::new().with_lease(lease.id());
        let txn = Txn::new().when(vec![cmp]).and_then(vec![TxnOp::put(
            probe_key.clone(),
            lease.id().to_string().into_bytes(),
            Some(put_opts),
        )]);
        let resp = kv
            .txn(txn)
            .await
            .map_err(|e| Error::Coordination(format!("cas {probe_key}: {e}")))?;

        if !resp.succeeded() {
            return Ok(None);
        }

        // We've won the probe; the real lock RPC against this same lease is
        // now guaranteed to resolve immediately rather than queue.
        let mut lock = self.client.lock_client();
        let lock_resp = lock
            .lock(key, Some(LockOptions::new().with_lease(lease.id())))
            .await;
        match lock_resp {
            Ok(lock_resp) => Ok(Some(LockGuard::new(
                lock_resp.key().to_vec(),
                Arc::new(EtcdUnlocker {
                    lock_client: AsyncMutex::new(self.client.lock_client()),
                    kv_client: AsyncMutex::new(self.client.kv_client()),
                    probe_key: Some(probe_key.into_bytes()),
                }),
            ))),
            Err(e) => {
                if let Err(delete_err) = self.delete(&probe_key).await {
                    warn!(error = %delete_err, "failed to clean up try_lock probe key after lock failure");
                }
                Err(Error::Coordination(format!("lock {key}: {e}")))
            }
        }
    }
}
