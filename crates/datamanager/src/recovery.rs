//! Recovery on `Run` (§4.1 "Recovery").
//!
//! Reconciles `dm/state/flushed-seq` against what actually landed in OST:
//! a crash between a segment's OST put and the CS cleanup of its `wal/<i>`
//! keys leaves those keys stranded. Recovery deletes them idempotently and
//! advances `flushed-seq` to match, so the flush loop never double-counts
//! a segment that already exists.

use crate::append::decode_tail;
use crate::state::Shared;
use crate::wire;
use kilnforge_core::{Result, Sequence};
use std::sync::Arc;
use tracing::{info, instrument, warn};

/// What recovery determined before the background loops start.
pub(crate) struct RecoveryOutcome {
    pub(crate) tail: Sequence,
    pub(crate) flushed_seq: Sequence,
}

#[instrument(skip(shared))]
pub(crate) async fn recover(shared: &Arc<Shared>) -> Result<RecoveryOutcome> {
    let tail = match shared.cs.get(&shared.key("wal/tail")).await? {
        Some(kv) => Sequence(decode_tail(&kv.value)?),
        None => Sequence::ZERO,
    };

    let mut flushed_seq = match shared.cs.get(&shared.key("dm/state/flushed-seq")).await? {
        Some(kv) => Sequence(decode_tail(&kv.value)?),
        None => Sequence::ZERO,
    };

    let segments_prefix = shared.key("wal-segments/");
    let segment_keys = shared.ost.list(&segments_prefix).await?;

    for key in segment_keys {
        let Some((first, last)) = wire::parse_segment_range(&key) else {
            warn!(key, "unparseable segment key during recovery, skipping");
            continue;
        };
        if last <= flushed_seq {
            continue;
        }

        info!(
            first = first.0,
            last = last.0,
            "segment in OST beyond flushed-seq, reconciling stranded wal key"
        );
        // The write path (`append::append`) writes a whole batch under the
        // single key `wal/<first_seq>`, not one key per sequence, so that's
        // the only key stranded by a crash between the OST put and cleanup.
        let raw_key = shared.key(&format!("wal/{}", first.0));
        if let Err(e) = shared.cs.delete(&raw_key).await {
            warn!(error = %e, raw_key, "failed to delete stranded wal key during recovery");
        }
        shared
            .cs
            .put(
                &shared.key("dm/state/flushed-seq"),
                last.0.to_string().into_bytes(),
            )
            .await?;
        flushed_seq = last;
    }

    // Any in-flight checkpoint lock from a prior crashed instance is
    // reclaimed automatically once its lease expires; nothing to do here
    // beyond waiting, since the lock is lease-scoped rather than held by
    // this process.

    Ok(RecoveryOutcome { tail, flushed_seq })
}
