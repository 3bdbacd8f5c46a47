//! The checkpoint loop (§4.1 "Checkpoint protocol"): fold the newest
//! checkpoint plus the segment chain into a fresh snapshot, guarded by a
//! CS lease lock so only one DM replica does this work at a time.

use crate::state::Shared;
use crate::wire::{self, CheckpointRecord};
use kilnforge_core::{Action, Sequence};
use kilnforge_coordination::CoordinationStore;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

const CHECKPOINT_LOCK_KEY: &str = "locks/dm-checkpoint";
const LEASE_TTL: Duration = Duration::from_secs(30);

/// Drives the checkpoint loop until `cancel` fires.
pub(crate) async fn run(shared: Arc<Shared>, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(shared.config.checkpoint_interval);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {
                if let Err(e) = try_checkpoint_once(&shared, &cancel).await {
                    warn!(error = %e, "checkpoint attempt failed, will retry next interval");
                }
            }
        }
    }
}

#[instrument(skip(shared, cancel))]
async fn try_checkpoint_once(
    shared: &Arc<Shared>,
    cancel: &CancellationToken,
) -> kilnforge_core::Result<()> {
    let lock_key = shared.key(CHECKPOINT_LOCK_KEY);
    let lease = shared.cs.grant_lease(LEASE_TTL).await?;
    let guard = match shared.cs.try_lock(&lock_key, &lease).await? {
        Some(g) => g,
        None => {
            info!("another replica holds the checkpoint lock, skipping this interval");
            return Ok(());
        }
    };

    let result = build_and_write_checkpoint(shared, cancel).await;
    guard.release().await.ok();
    result
}

async fn build_and_write_checkpoint(
    shared: &Arc<Shared>,
    cancel: &CancellationToken,
) -> kilnforge_core::Result<()> {
    let checkpoints_prefix = shared.key("checkpoints/");
    let mut checkpoint_keys = shared.ost.list(&checkpoints_prefix).await?;
    checkpoint_keys.sort();
    let newest_checkpoint = checkpoint_keys.last().cloned();

    let mut state: BTreeMap<(String, String), Vec<u8>> = BTreeMap::new();
    let mut covered_up_to = Sequence::ZERO;

    if let Some(key) = &newest_checkpoint {
        if let Some(bytes) = shared.ost.get(key).await? {
            for record in wire::decode_checkpoint(&bytes)? {
                state.insert((record.data_type.0, record.id.0), record.payload);
            }
        }
        if let Some(seq) = key.rsplit('/').next().and_then(|s| s.parse().ok()) {
            covered_up_to = Sequence(seq);
        }
    }

    let segments_prefix = shared.key("wal-segments/");
    let mut segment_keys = shared.ost.list(&segments_prefix).await?;
    segment_keys.sort_by_key(|k| wire::parse_segment_range(k).map(|(f, _)| f.0).unwrap_or(u64::MAX));

    let flushed = shared.flushed_sequence();
    let mut new_covered_up_to = covered_up_to;

    for key in &segment_keys {
        if cancel.is_cancelled() {
            return Ok(());
        }
        let Some((first, last)) = wire::parse_segment_range(key) else {
            continue;
        };
        if first <= covered_up_to || first > flushed {
            continue;
        }
        let Some(bytes) = shared.ost.get(key).await? else {
            continue;
        };
        for entry in wire::decode_segment(&bytes)? {
            match entry.action {
                Action::Put => {
                    state.insert(
                        (entry.data_type.0.clone(), entry.id.0.clone()),
                        entry.payload.unwrap_or_default(),
                    );
                }
                Action::Delete => {
                    state.remove(&(entry.data_type.0.clone(), entry.id.0.clone()));
                }
            }
        }
        if last > new_covered_up_to {
            new_covered_up_to = last;
        }
    }

    if new_covered_up_to <= covered_up_to {
        info!("no new segments since last checkpoint, skipping");
        return Ok(());
    }

    let records: Vec<CheckpointRecord> = state
        .into_iter()
        .map(|((data_type, id), payload)| CheckpointRecord {
            data_type: kilnforge_core::DataType::new(data_type),
            id: kilnforge_core::EntryId::from(id),
            payload,
        })
        .collect();

    let body = wire::encode_checkpoint(&records);
    let key = wire::checkpoint_key(&shared.base_path, new_covered_up_to);
    shared.ost.put(&key, body).await?;

    info!(
        covered_up_to = new_covered_up_to.0,
        records = records.len(),
        "wrote checkpoint"
    );

    crate::gc::mark_segments_for_gc(shared, new_covered_up_to).await?;

    Ok(())
}
