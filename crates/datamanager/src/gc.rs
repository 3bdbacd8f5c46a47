//! Segment garbage collection (§4.1 "Checkpoint protocol", safety window).
//!
//! A segment covered by a checkpoint is not deleted immediately: it is
//! marked pending-deletion with a durable timestamp, and only reaped once
//! `safety_window` has elapsed, so a ReadDB replica that is still tailing
//! the old segment chain has time to catch up or fall back to a full
//! reset.

use crate::state::Shared;
use crate::wire;
use chrono::{DateTime, Utc};
use kilnforge_core::{Error, Result, Sequence};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

fn pending_key(shared: &Shared, key: &str) -> String {
    let name = key.rsplit('/').next().unwrap_or(key);
    shared.key(&format!("dm/state/gc-pending/{name}"))
}

/// Mark every OST segment fully covered by `covered_up_to` as a GC
/// candidate, recording the marking time so the sweep loop can honor the
/// safety window.
pub(crate) async fn mark_segments_for_gc(shared: &Arc<Shared>, covered_up_to: Sequence) -> Result<()> {
    let segments_prefix = shared.key("wal-segments/");
    let segment_keys = shared.ost.list(&segments_prefix).await?;
    let now = Utc::now().to_rfc3339();

    for key in segment_keys {
        let Some((_, last)) = wire::parse_segment_range(&key) else {
            continue;
        };
        if last > covered_up_to {
            continue;
        }
        let marker = pending_key(shared, &key);
        if shared.cs.get(&marker).await?.is_some() {
            continue;
        }
        shared.cs.put(&marker, now.clone().into_bytes()).await?;
    }
    Ok(())
}

/// Drives the GC sweep loop: reaps segments whose pending marker is older
/// than `safety_window`.
pub(crate) async fn run(shared: Arc<Shared>, cancel: CancellationToken) {
    let safety_window = safety_window(&shared);
    let mut ticker = tokio::time::interval(Duration::from_secs(60).min(safety_window / 2));
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {
                if let Err(e) = sweep_once(&shared, safety_window).await {
                    warn!(error = %e, "gc sweep failed, will retry next tick");
                }
            }
        }
    }
}

fn safety_window(shared: &Shared) -> Duration {
    shared
        .config
        .checkpoint_interval
        .max(Duration::from_secs(3600))
}

#[instrument(skip(shared))]
async fn sweep_once(shared: &Arc<Shared>, safety_window: Duration) -> Result<()> {
    let pending_prefix = shared.key("dm/state/gc-pending/");
    let pending = shared.cs.list(&pending_prefix).await?;
    let now = Utc::now();

    for kv in pending {
        let marked_at = match std::str::from_utf8(&kv.value)
            .ok()
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        {
            Some(dt) => dt.with_timezone(&Utc),
            None => {
                warn!(key = %kv.key, "unparseable gc-pending marker, skipping");
                continue;
            }
        };
        if now.signed_duration_since(marked_at).to_std().unwrap_or_default() < safety_window {
            continue;
        }

        let segment_name = kv
            .key
            .rsplit('/')
            .next()
            .ok_or_else(|| Error::Corruption(format!("malformed gc-pending key {}", kv.key)))?;
        let segment_key = shared.key(&format!("wal-segments/{segment_name}"));

        shared.ost.delete(&segment_key).await?;
        shared.cs.delete(&kv.key).await?;
        info!(segment = segment_name, "reaped segment past safety window");
    }
    Ok(())
}
