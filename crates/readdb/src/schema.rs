//! Index declarations, provided at construction, that tell ReadDB which
//! secondary lookups to maintain per `data-type` (§9 "Polymorphic
//! payloads": a tag-keyed lookup table, not a class hierarchy).

use kilnforge_core::Result;

/// One secondary index entry extracted from a record's payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    /// Index name, e.g. `"parent_id"` or `"name_within_parent"`.
    pub index: String,
    /// The key this record is filed under within that index.
    pub key: String,
}

/// Extracts secondary index keys from a record's opaque payload.
///
/// DM never interprets payloads; ReadDB only does so through this
/// schema, selected per `data_type` — a variant discriminator, not
/// dynamic dispatch on a payload class hierarchy.
pub trait RecordSchema: Send + Sync {
    /// Derive the index entries `payload` should be filed under for
    /// `data_type`. Returning an empty vec is valid for data types with no
    /// secondary lookups.
    fn extract_indexes(&self, data_type: &str, payload: &[u8]) -> Result<Vec<IndexEntry>>;
}

/// A schema that declares no secondary indexes for any data type — useful
/// for tests and for services whose records are only ever looked up by
/// primary id.
pub struct NoIndexSchema;

impl RecordSchema for NoIndexSchema {
    fn extract_indexes(&self, _data_type: &str, _payload: &[u8]) -> Result<Vec<IndexEntry>> {
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_index_schema_extracts_nothing() {
        let schema = NoIndexSchema;
        assert!(schema.extract_indexes("user", b"{}").unwrap().is_empty());
    }
}
