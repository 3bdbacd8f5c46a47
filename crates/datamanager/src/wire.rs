//! Binary formats for segments and checkpoints (§6).
//!
//! A segment is a length-prefixed sequence of `WalEntry` records with a
//! trailing CRC32 over the whole body. A checkpoint is the same framing
//! applied to `(data_type, id, payload)` triples, sorted by key. Both use
//! the same record-by-record encoding so `decode_records`/`encode_records`
//! are shared.

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use kilnforge_core::{Action, DataType, EntryId, Error, Result, Sequence, WalEntry};
use std::io::{Cursor, Read, Write};

/// One record as stored in a checkpoint: the latest surviving state for a
/// `(data_type, id)` pair. Checkpoints never contain tombstones — a
/// `delete` simply omits the key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointRecord {
    /// Data type of the entity.
    pub data_type: DataType,
    /// Id of the entity.
    pub id: EntryId,
    /// The entity's current serialized payload.
    pub payload: Vec<u8>,
}

fn write_record(out: &mut Vec<u8>, data_type: &str, id: &str, payload: &[u8]) {
    out.write_u32::<BigEndian>(data_type.len() as u32).unwrap();
    out.extend_from_slice(data_type.as_bytes());
    out.write_u32::<BigEndian>(id.len() as u32).unwrap();
    out.extend_from_slice(id.as_bytes());
    out.write_u32::<BigEndian>(payload.len() as u32).unwrap();
    out.extend_from_slice(payload);
}

fn read_string(cursor: &mut Cursor<&[u8]>) -> Result<String> {
    let len = cursor
        .read_u32::<BigEndian>()
        .map_err(|e| Error::Corruption(format!("truncated length prefix: {e}")))? as usize;
    let mut buf = vec![0u8; len];
    cursor
        .read_exact(&mut buf)
        .map_err(|e| Error::Corruption(format!("truncated field: {e}")))?;
    String::from_utf8(buf).map_err(|e| Error::Corruption(format!("non-utf8 field: {e}")))
}

fn read_bytes(cursor: &mut Cursor<&[u8]>) -> Result<Vec<u8>> {
    let len = cursor
        .read_u32::<BigEndian>()
        .map_err(|e| Error::Corruption(format!("truncated length prefix: {e}")))? as usize;
    let mut buf = vec![0u8; len];
    cursor
        .read_exact(&mut buf)
        .map_err(|e| Error::Corruption(format!("truncated field: {e}")))?;
    Ok(buf)
}

/// Encode a contiguous run of WAL entries as a segment body, appending a
/// trailing CRC32 over everything written before it.
pub fn encode_segment(entries: &[WalEntry]) -> Vec<u8> {
    let mut out = Vec::new();
    out.write_u32::<BigEndian>(entries.len() as u32).unwrap();
    for e in entries {
        out.write_u64::<BigEndian>(e.sequence.0).unwrap();
        out.write_u8(match e.action {
            Action::Put => 0,
            Action::Delete => 1,
        })
        .unwrap();
        write_record(
            &mut out,
            &e.data_type.0,
            &e.id.0,
            e.payload.as_deref().unwrap_or(&[]),
        );
    }
    let crc = crc32fast::hash(&out);
    out.write_u32::<BigEndian>(crc).unwrap();
    out
}

/// Decode a segment body produced by [`encode_segment`], verifying its
/// trailing CRC before returning any entries.
pub fn decode_segment(bytes: &[u8]) -> Result<Vec<WalEntry>> {
    if bytes.len() < 4 {
        return Err(Error::Corruption("segment shorter than CRC trailer".into()));
    }
    let (body, crc_bytes) = bytes.split_at(bytes.len() - 4);
    let expected_crc = Cursor::new(crc_bytes).read_u32::<BigEndian>().unwrap();
    let actual_crc = crc32fast::hash(body);
    if actual_crc != expected_crc {
        return Err(Error::Corruption(format!(
            "segment CRC mismatch: expected {expected_crc:#x}, got {actual_crc:#x}"
        )));
    }

    let mut cursor = Cursor::new(body);
    let count = cursor
        .read_u32::<BigEndian>()
        .map_err(|e| Error::Corruption(format!("truncated record count: {e}")))?;
    let mut entries = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let sequence = Sequence(
            cursor
                .read_u64::<BigEndian>()
                .map_err(|e| Error::Corruption(format!("truncated sequence: {e}")))?,
        );
        let action_tag = cursor
            .read_u8()
            .map_err(|e| Error::Corruption(format!("truncated action tag: {e}")))?;
        let action = match action_tag {
            0 => Action::Put,
            1 => Action::Delete,
            other => return Err(Error::Corruption(format!("unknown action tag {other}"))),
        };
        let data_type = DataType::new(read_string(&mut cursor)?);
        let id = EntryId::from(read_string(&mut cursor)?);
        let payload_bytes = read_bytes(&mut cursor)?;
        let payload = match action {
            Action::Put => Some(payload_bytes),
            Action::Delete => None,
        };
        entries.push(WalEntry {
            sequence,
            action,
            data_type,
            id,
            payload,
        });
    }
    Ok(entries)
}

/// Encode a checkpoint body: records sorted by `(data_type, id)`, with a
/// trailing CRC32 as in [`encode_segment`].
pub fn encode_checkpoint(records: &[CheckpointRecord]) -> Vec<u8> {
    let mut sorted: Vec<&CheckpointRecord> = records.iter().collect();
    sorted.sort_by(|a, b| (&a.data_type.0, &a.id.0).cmp(&(&b.data_type.0, &b.id.0)));

    let mut out = Vec::new();
    out.write_u32::<BigEndian>(sorted.len() as u32).unwrap();
    for r in sorted {
        write_record(&mut out, &r.data_type.0, &r.id.0, &r.payload);
    }
    let crc = crc32fast::hash(&out);
    out.write_u32::<BigEndian>(crc).unwrap();
    out
}

/// Decode a checkpoint body produced by [`encode_checkpoint`].
pub fn decode_checkpoint(bytes: &[u8]) -> Result<Vec<CheckpointRecord>> {
    if bytes.len() < 4 {
        return Err(Error::Corruption(
            "checkpoint shorter than CRC trailer".into(),
        ));
    }
    let (body, crc_bytes) = bytes.split_at(bytes.len() - 4);
    let expected_crc = Cursor::new(crc_bytes).read_u32::<BigEndian>().unwrap();
    let actual_crc = crc32fast::hash(body);
    if actual_crc != expected_crc {
        return Err(Error::Corruption(format!(
            "checkpoint CRC mismatch: expected {expected_crc:#x}, got {actual_crc:#x}"
        )));
    }

    let mut cursor = Cursor::new(body);
    let count = cursor
        .read_u32::<BigEndian>()
        .map_err(|e| Error::Corruption(format!("truncated record count: {e}")))?;
    let mut records = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let data_type = DataType::new(read_string(&mut cursor)?);
        let id = EntryId::from(read_string(&mut cursor)?);
        let payload = read_bytes(&mut cursor)?;
        records.push(CheckpointRecord {
            data_type,
            id,
            payload,
        });
    }
    Ok(records)
}

/// Parse the `wal-segments/<first>-<last>` key suffix into its bounds.
pub fn parse_segment_range(key: &str) -> Option<(Sequence, Sequence)> {
    let name = key.rsplit('/').next()?;
    let (first, last) = name.split_once('-')?;
    Some((Sequence(first.parse().ok()?), Sequence(last.parse().ok()?)))
}

/// Render a segment object key for the given inclusive bounds.
pub fn segment_key(base_path: &str, first: Sequence, last: Sequence) -> String {
    format!("{base_path}/wal-segments/{}-{}", first.0, last.0)
}

/// Render a checkpoint object key for the given covered-up-to sequence.
pub fn checkpoint_key(base_path: &str, covered_up_to: Sequence) -> String {
    format!("{base_path}/checkpoints/{}", covered_up_to.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_entries() -> Vec<WalEntry> {
        vec![
            WalEntry {
                sequence: Sequence(1),
                ..WalEntry::put("user", "u1", b"alice".to_vec())
            },
            WalEntry {
                sequence: Sequence(2),
                ..WalEntry::delete("user", "u1")
            },
        ]
    }

    #[test]
    fn segment_round_trips() {
        let entries = sample_entries();
        let encoded = encode_segment(&entries);
        let decoded = decode_segment(&encoded).unwrap();
        assert_eq!(decoded, entries);
    }

    #[test]
    fn segment_detects_corruption() {
        let mut encoded = encode_segment(&sample_entries());
        let last = encoded.len() - 1;
        encoded[last] ^= 0xFF;
        assert!(decode_segment(&encoded).unwrap_err().is_fatal());
    }

    #[test]
    fn checkpoint_round_trips_sorted() {
        let records = vec![
            CheckpointRecord {
                data_type: DataType::new("user"),
                id: EntryId::from("u2"),
                payload: b"bob".to_vec(),
            },
            CheckpointRecord {
                data_type: DataType::new("user"),
                id: EntryId::from("u1"),
                payload: b"alice".to_vec(),
            },
        ];
        let encoded = encode_checkpoint(&records);
        let decoded = decode_checkpoint(&encoded).unwrap();
        assert_eq!(decoded[0].id, EntryId::from("u1"));
        assert_eq!(decoded[1].id, EntryId::from("u2"));
    }

    #[test]
    fn segment_key_parses_back() {
        let key = segment_key("configdata", Sequence(10), Sequence(20));
        assert_eq!(key, "configdata/wal-segments/10-20");
        assert_eq!(
            parse_segment_range(&key),
            Some((Sequence(10), Sequence(20)))
        );
    }
}
