//! The flush loop (§4.1 "Flush protocol"): accumulate committed batches
//! into a segment buffer, flush to OST once a threshold is crossed, then
//! clean up the corresponding CS WAL keys.

use crate::state::{FlushBatch, Shared};
use crate::wire;
use kilnforge_core::Sequence;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

struct PendingSegment {
    entries: Vec<kilnforge_core::WalEntry>,
    raw_keys: Vec<String>,
    byte_size: u64,
    opened_at: Instant,
}

impl PendingSegment {
    fn new() -> Self {
        PendingSegment {
            entries: Vec::new(),
            raw_keys: Vec::new(),
            byte_size: 0,
            opened_at: Instant::now(),
        }
    }

    fn push(&mut self, batch: FlushBatch) {
        if self.entries.is_empty() {
            self.opened_at = Instant::now();
        }
        self.byte_size += batch.entries.iter().map(|e| e.approx_size() as u64).sum::<u64>();
        self.entries.extend(batch.entries);
        self.raw_keys.push(batch.raw_key);
    }

    fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn should_flush(&self, shared: &Shared) -> bool {
        if self.is_empty() {
            return false;
        }
        self.byte_size >= shared.config.segment_max_bytes
            || self.entries.len() as u64 >= shared.config.segment_max_keys
            || self.opened_at.elapsed() >= shared.config.segment_max_age
    }
}

/// Drives the flush loop until `cancel` fires or the sender side of
/// `flush_rx` is dropped.
pub(crate) async fn run(
    shared: Arc<Shared>,
    mut flush_rx: mpsc::Receiver<FlushBatch>,
    cancel: CancellationToken,
) {
    let mut pending = PendingSegment::new();
    let mut ticker = tokio::time::interval(Duration::from_millis(500));

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                if !pending.is_empty() {
                    flush_with_retry(&shared, &mut pending, &cancel).await;
                }
                return;
            }
            batch = flush_rx.recv() => {
                match batch {
                    Some(b) => pending.push(b),
                    None => {
                        if !pending.is_empty() {
                            flush_with_retry(&shared, &mut pending, &cancel).await;
                        }
                        return;
                    }
                }
            }
            _ = ticker.tick() => {}
        }

        if pending.should_flush(&shared) {
            flush_with_retry(&shared, &mut pending, &cancel).await;
        }
    }
}

#[instrument(skip(shared, pending, cancel))]
async fn flush_with_retry(shared: &Arc<Shared>, pending: &mut PendingSegment, cancel: &CancellationToken) {
    let first_seq = pending.entries.first().map(|e| e.sequence).unwrap_or(Sequence::ZERO);
    let last_seq = pending.entries.last().map(|e| e.sequence).unwrap_or(Sequence::ZERO);
    let body = wire::encode_segment(&pending.entries);
    let key = wire::segment_key(&shared.base_path, first_seq, last_seq);

    let mut backoff = Duration::from_millis(200);
    loop {
        match shared.ost.put(&key, body.clone()).await {
            Ok(()) => break,
            Err(e) => {
                warn!(error = %e, key, "segment flush failed, retrying");
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(backoff) => {}
                }
                backoff = (backoff * 2).min(Duration::from_secs(30));
            }
        }
    }

    for raw_key in &pending.raw_keys {
        if let Err(e) = shared.cs.delete(raw_key).await {
            warn!(error = %e, raw_key, "failed to delete flushed wal key, recovery will reconcile it");
        }
    }

    let flushed_seq_key = shared.key("dm/state/flushed-seq");
    if let Err(e) = shared.cs.put(&flushed_seq_key, last_seq.0.to_string().into_bytes()).await {
        error!(error = %e, "failed to record flushed-seq, recovery will reconcile it on restart");
    } else {
        shared.set_flushed(last_seq);
    }

    info!(first_seq = first_seq.0, last_seq = last_seq.0, bytes = body.len(), "flushed segment");
    *pending = PendingSegment::new();
}
