//! The write protocol (§4.1 "Write protocol"): CAS-append a batch to the
//! CS WAL, retrying on a lost race, then hand it to the flush loop.

use crate::state::{FlushBatch, Shared};
use crate::wire;
use kilnforge_core::{ChangeNotification, Error, Result, Sequence, WalEntry};
use std::sync::Arc;
use tracing::{debug, warn};

/// Bounded retries on a `wal/tail` CAS race before surfacing `Conflict`.
const MAX_CAS_ATTEMPTS: u32 = 8;

pub(crate) async fn append(shared: &Arc<Shared>, mut entries: Vec<WalEntry>) -> Result<Sequence> {
    if entries.is_empty() {
        return Err(Error::InvalidRequest("batch must not be empty".into()));
    }
    for e in &entries {
        if e.id.is_empty() {
            return Err(Error::InvalidRequest("entry id must not be empty".into()));
        }
        if !shared.data_types.contains(&e.data_type.0) {
            return Err(Error::InvalidRequest(format!(
                "undeclared data type {}",
                e.data_type
            )));
        }
        e.validate().map_err(Error::InvalidRequest)?;
    }

    let approx_size: usize = entries.iter().map(WalEntry::approx_size).sum();
    if approx_size as u64 > shared.config.segment_max_bytes {
        return Err(Error::TooLarge(format!(
            "batch of {approx_size} bytes exceeds segment_max_bytes {}",
            shared.config.segment_max_bytes
        )));
    }

    let tail_key = shared.key("wal/tail");

    for attempt in 0..MAX_CAS_ATTEMPTS {
        let tail_kv = shared
            .cs
            .get(&tail_key)
            .await
            .map_err(|e| Error::Unavailable(e.to_string()))?;
        let (last, revision) = match &tail_kv {
            Some(kv) => (decode_tail(&kv.value)?, kv.mod_revision),
            None => (0, 0),
        };

        let first_seq = Sequence(last + 1);
        for (i, e) in entries.iter_mut().enumerate() {
            e.sequence = Sequence(last + 1 + i as u64);
        }
        let last_seq = entries.last().expect("checked non-empty above").sequence;

        let raw_key = shared.key(&format!("wal/{}", first_seq.0));
        let record_bytes = wire::encode_segment(&entries);

        if let Err(e) = shared.cs.compare_and_swap(&raw_key, record_bytes, 0).await {
            if matches!(e, Error::Conflict(_)) {
                debug!(attempt, "wal record key collision, retrying");
                continue;
            }
            return Err(e);
        }

        match shared
            .cs
            .compare_and_swap(&tail_key, encode_tail(last_seq.0), revision)
            .await
        {
            Ok(()) => {
                shared.set_committed(last_seq);
                for e in &entries {
                    let _ = shared
                        .change_tx
                        .send(ChangeNotification::from(e));
                }
                if shared
                    .flush_tx
                    .send(FlushBatch {
                        first_seq,
                        last_seq,
                        entries,
                        raw_key,
                    })
                    .await
                    .is_err()
                {
                    warn!("flush loop is gone, batch will be recovered from CS on restart");
                }
                return Ok(last_seq);
            }
            Err(Error::Conflict(_)) => {
                debug!(attempt, "wal/tail CAS lost the race, retrying");
                continue;
            }
            Err(e) => return Err(e),
        }
    }

    Err(Error::Conflict(format!(
        "exhausted {MAX_CAS_ATTEMPTS} CAS attempts on {tail_key}"
    )))
}

pub(crate) fn decode_tail(bytes: &[u8]) -> Result<u64> {
    let s = std::str::from_utf8(bytes)
        .map_err(|e| Error::Corruption(format!("wal/tail not utf8: {e}")))?;
    s.parse()
        .map_err(|e| Error::Corruption(format!("wal/tail not a u64: {e}")))
}

pub(crate) fn encode_tail(seq: u64) -> Vec<u8> {
    seq.to_string().into_bytes()
}
