//! The single-consumer worker (§4.3): a lease+mutex guarded loop that
//! streams server-sent events from an upstream and hands decoded records
//! to a caller-supplied handler.

use crate::sse::SseReader;
use async_trait::async_trait;
use futures::StreamExt;
use kilnforge_core::{Error, Result};
use kilnforge_coordination::CoordinationStore;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::io::StreamReader;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

/// Tunables for one worker instance.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// The CS lock key this worker contends for, e.g.
    /// `locks/notification-runevents`.
    pub lock_key: String,
    /// Lease TTL backing the mutex (§5: default 5s).
    pub lease_ttl: Duration,
    /// Sleep between retries after any error, including a lost
    /// `try_lock` (§4.3: default 1s).
    pub retry_cooldown: Duration,
    /// Upstream URL to stream server-sent events from.
    pub upstream_url: String,
    /// CS key the worker's cursor is persisted under (§9 Open Question
    /// (a)). On (re)connect the worker loads the last cursor from here
    /// and passes it to the upstream as a `cursor` query parameter,
    /// resuming from the last checkpointed position rather than from
    /// "now" — the preferred resolution the source left undecided.
    pub cursor_key: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        WorkerConfig {
            lock_key: "locks/worker".to_string(),
            lease_ttl: Duration::from_secs(5),
            retry_cooldown: Duration::from_secs(1),
            upstream_url: String::new(),
            cursor_key: "locks/worker/cursor".to_string(),
        }
    }
}

/// Processes one decoded event. Implementations provide no dedup — §4.3
/// is explicit that delivery is at-least-once and idempotence of side
/// effects is the caller's responsibility.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Handle one event payload, already parsed from JSON.
    async fn handle(&self, event: serde_json::Value) -> Result<()>;
}

/// Runs one [`EventHandler`] under the single-consumer protocol.
pub struct Worker<H> {
    cs: Arc<dyn CoordinationStore>,
    http: reqwest::Client,
    config: WorkerConfig,
    handler: H,
}

impl<H: EventHandler> Worker<H> {
    /// Build a worker bound to `cs` for locking and `handler` for
    /// processing.
    pub fn new(cs: Arc<dyn CoordinationStore>, config: WorkerConfig, handler: H) -> Self {
        Worker {
            cs,
            http: reqwest::Client::new(),
            config,
            handler,
        }
    }

    /// Run until `cancel` fires. Never returns `Err` from a single failed
    /// streaming attempt — those are logged and retried after
    /// `retry_cooldown`, per §4.3.
    #[instrument(skip(self, cancel), fields(lock_key = %self.config.lock_key))]
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        loop {
            if cancel.is_cancelled() {
                return Ok(());
            }

            match self.try_acquire_and_stream(&cancel).await {
                Ok(()) => {}
                Err(e) => {
                    warn!(error = %e, "worker attempt ended, cooling down before retry");
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep(self.config.retry_cooldown) => {}
            }
        }
    }

    async fn try_acquire_and_stream(&self, cancel: &CancellationToken) -> Result<()> {
        let lease = self.cs.grant_lease(self.config.lease_ttl).await?;

        // §9 Open Question (b): prefer `try_lock` over the blocking
        // `lock` so N replicas racing for the same key don't queue behind
        // the server's contention lock, which is what the original
        // implementation's TODO flagged as a thundering-herd risk.
        let guard = match self.cs.try_lock(&self.config.lock_key, &lease).await? {
            Some(g) => g,
            None => {
                info!("lock held by another replica, will retry after cooldown");
                return Ok(());
            }
        };

        info!("acquired lock, starting upstream stream");
        let result = self.stream_events(cancel).await;
        guard.release().await.ok();
        result
    }

    async fn stream_events(&self, cancel: &CancellationToken) -> Result<()> {
        let cursor = self.cs.get(&self.config.cursor_key).await?;
        let mut request = self.http.get(self.config.upstream_url.as_str());
        if let Some(kv) = &cursor {
            let cursor = String::from_utf8_lossy(&kv.value);
            request = request.query(&[("cursor", cursor.as_ref())]);
        }

        let response = request
            .send()
            .await
            .map_err(|e| Error::Unavailable(format!("upstream request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(Error::Unavailable(format!(
                "upstream returned {}",
                response.status()
            )));
        }

        let byte_stream = response
            .bytes_stream()
            .map(|r| r.map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e)));
        let async_read = StreamReader::new(byte_stream);
        let buffered = tokio::io::BufReader::new(async_read);
        let mut sse = SseReader::new(buffered);

        loop {
            let frame = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                frame = sse.next_frame() => frame?,
            };

            let Some(frame) = frame else {
                info!("upstream stream ended cleanly");
                return Ok(());
            };

            let event: serde_json::Value = serde_json::from_str(&frame)
                .map_err(|e| Error::Corruption(format!("invalid event JSON: {e}")))?;

            self.handler.handle(event.clone()).await?;
            self.persist_cursor(&event).await;
        }
    }

    /// Best-effort: a failed cursor write costs a worker its resumption
    /// point on the next restart, not correctness of the current run, so
    /// it is logged rather than propagated.
    async fn persist_cursor(&self, event: &serde_json::Value) {
        let Some(sequence) = event.get("sequence") else {
            return;
        };
        let value = sequence.to_string().into_bytes();
        if let Err(e) = self.cs.put(&self.config.cursor_key, value).await {
            warn!(error = %e, "failed to persist upstream cursor");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{spawn_sse_server, FakeCoordinationStore};
    use std::sync::Mutex as StdMutex;

    struct CollectingHandler {
        events: Arc<StdMutex<Vec<serde_json::Value>>>,
    }

    #[async_trait]
    impl EventHandler for CollectingHandler {
        async fn handle(&self, event: serde_json::Value) -> Result<()> {
            self.events.lock().unwrap().push(event);
            Ok(())
        }
    }

    #[tokio::test]
    async fn consumes_events_until_upstream_closes() {
        let url = spawn_sse_server("data: {\"id\":1}\n\ndata: {\"id\":2}\n\n").await;
        let cs = Arc::new(FakeCoordinationStore::default());
        let events = Arc::new(StdMutex::new(Vec::new()));
        let worker = Worker::new(
            cs,
            WorkerConfig {
                upstream_url: url,
                ..WorkerConfig::default()
            },
            CollectingHandler {
                events: events.clone(),
            },
        );

        let cancel = CancellationToken::new();
        let cancel_inner = cancel.clone();
        let handle = tokio::spawn(async move { worker.run(cancel_inner).await });

        // One connection yields exactly two frames then the server closes;
        // the worker's retry loop will try to reconnect and fail since the
        // listener only serves one connection. Give it time to process the
        // first attempt, then cancel.
        tokio::time::sleep(Duration::from_millis(200)).await;
        cancel.cancel();
        handle.await.unwrap().unwrap();

        let collected = events.lock().unwrap();
        assert_eq!(collected.len(), 2);
        assert_eq!(collected[0]["id"], 1);
        assert_eq!(collected[1]["id"], 2);
    }

    #[tokio::test]
    async fn lock_held_elsewhere_skips_this_replica_without_erroring() {
        let cs = Arc::new(FakeCoordinationStore::default());
        let config = WorkerConfig {
            lock_key: "locks/shared".to_string(),
            retry_cooldown: Duration::from_millis(20),
            upstream_url: "http://127.0.0.1:1/unused".to_string(),
            ..WorkerConfig::default()
        };

        // Another replica already holds the lock for the whole test.
        let lease = cs.grant_lease(config.lease_ttl).await.unwrap();
        let _holder_guard = cs.try_lock(&config.lock_key, &lease).await.unwrap().unwrap();

        let events = Arc::new(StdMutex::new(Vec::new()));
        let worker = Worker::new(
            cs,
            config,
            CollectingHandler {
                events: events.clone(),
            },
        );

        let cancel = CancellationToken::new();
        let cancel_inner = cancel.clone();
        let handle = tokio::spawn(async move { worker.run(cancel_inner).await });

        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();
        handle.await.unwrap().unwrap();

        assert!(events.lock().unwrap().is_empty());
    }
}
