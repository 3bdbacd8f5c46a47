//! The WAL entry format shared by the Data Manager and ReadDB.
//!
//! A [`WalEntry`] is the only unit of durable mutation in the system. The
//! Data Manager assigns it a [`Sequence`], the coordination store makes it
//! durable, and ReadDB folds it into its local projection. Neither layer
//! interprets `payload` — it is opaque bytes the service shell (configstore,
//! runservice, ...) encoded and will decode again on read.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A dense, strictly increasing position in the durable log.
///
/// Sequences are assigned by the Data Manager and are monotonically
/// increasing across the lifetime of the log, including across process
/// restarts (a new epoch never reuses a sequence a prior epoch committed).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Sequence(pub u64);

impl Sequence {
    /// The sentinel value meaning "no entry has ever been committed".
    pub const ZERO: Sequence = Sequence(0);

    /// The next sequence after this one.
    pub fn next(self) -> Sequence {
        Sequence(self.0 + 1)
    }
}

impl fmt::Display for Sequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The data-type tag a [`WalEntry`] is filed under.
///
/// Data types are declared by the owning service at [`DataManagerConfig`]
/// construction time (e.g. `user`, `org`, `project`, `secret`) and form a
/// closed enumeration for the lifetime of the process — the Data Manager
/// rejects an entry whose tag was not declared at startup.
///
/// [`DataManagerConfig`]: crate::config::DataManagerConfig
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DataType(pub String);

impl DataType {
    /// Build a data type tag from anything string-like.
    pub fn new(tag: impl Into<String>) -> Self {
        DataType(tag.into())
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for DataType {
    fn from(s: &str) -> Self {
        DataType(s.to_string())
    }
}

/// The stable identifier of a logical entity within its data type.
///
/// Ids are opaque to the Data Manager beyond one constraint: they must be
/// non-empty (`Append` rejects `id == ""` with `InvalidRequest`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntryId(pub String);

impl EntryId {
    /// True if this id fails the Data Manager's non-empty constraint.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for EntryId {
    fn from(s: &str) -> Self {
        EntryId(s.to_string())
    }
}

impl From<String> for EntryId {
    fn from(s: String) -> Self {
        EntryId(s)
    }
}

/// The mutation a [`WalEntry`] applies to `(data_type, id)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Action {
    /// Replace (or create) the record for `(data_type, id)`.
    Put,
    /// Remove the record for `(data_type, id)`.
    Delete,
}

/// One durable mutation, addressed to a logical `(data_type, id)` pair.
///
/// `payload` is only present for [`Action::Put`]; it is `None` for deletes.
/// Entries are immutable once assigned a sequence — nothing in the system
/// ever rewrites an entry in place.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalEntry {
    /// Position of this entry in the durable log. Assigned by the Data
    /// Manager; `Sequence::ZERO` before `Append` assigns a real one.
    pub sequence: Sequence,
    /// What this entry does to `(data_type, id)`.
    pub action: Action,
    /// The data type this entry belongs to.
    pub data_type: DataType,
    /// The entity this entry mutates.
    pub id: EntryId,
    /// Opaque serialized record. `None` for [`Action::Delete`].
    pub payload: Option<Vec<u8>>,
}

impl WalEntry {
    /// Build a `put` entry. `sequence` is filled in by `Append`; pass
    /// `Sequence::ZERO` when constructing a request that hasn't been
    /// accepted yet.
    pub fn put(data_type: impl Into<DataType>, id: impl Into<EntryId>, payload: Vec<u8>) -> Self {
        WalEntry {
            sequence: Sequence::ZERO,
            action: Action::Put,
            data_type: data_type.into(),
            id: id.into(),
            payload: Some(payload),
        }
    }

    /// Build a `delete` entry. `sequence` is filled in by `Append`.
    pub fn delete(data_type: impl Into<DataType>, id: impl Into<EntryId>) -> Self {
        WalEntry {
            sequence: Sequence::ZERO,
            action: Action::Delete,
            data_type: data_type.into(),
            id: id.into(),
            payload: None,
        }
    }

    /// Validate the request-level invariants `Append` enforces before it
    /// will assign a sequence: non-empty id, and a payload present iff the
    /// action is `Put`.
    pub fn validate(&self) -> Result<(), String> {
        if self.id.is_empty() {
            return Err("entry id must not be empty".to_string());
        }
        match self.action {
            Action::Put if self.payload.is_none() => {
                Err("put entry must carry a payload".to_string())
            }
            Action::Delete if self.payload.is_some() => {
                Err("delete entry must not carry a payload".to_string())
            }
            _ => Ok(()),
        }
    }

    /// Approximate on-wire size, used to decide when a batch exceeds
    /// `SegmentMaxBytes`.
    pub fn approx_size(&self) -> usize {
        8 + 1 + self.data_type.0.len() + self.id.0.len() + self.payload.as_ref().map_or(0, |p| p.len())
    }
}

/// An ephemeral notification of a committed change, delivered best-effort
/// to `Subscribe` consumers and never itself persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeNotification {
    /// Sequence of the entry this notification describes.
    pub sequence: Sequence,
    /// The mutation that was applied.
    pub action: Action,
    /// Data type of the changed entity.
    pub data_type: DataType,
    /// Id of the changed entity.
    pub id: EntryId,
}

impl From<&WalEntry> for ChangeNotification {
    fn from(e: &WalEntry) -> Self {
        ChangeNotification {
            sequence: e.sequence,
            action: e.action,
            data_type: e.data_type.clone(),
            id: e.id.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_id() {
        let e = WalEntry::put("user", "", vec![1]);
        assert!(e.validate().is_err());
    }

    #[test]
    fn put_requires_payload() {
        let mut e = WalEntry::put("user", "u1", vec![1]);
        e.payload = None;
        assert!(e.validate().is_err());
    }

    #[test]
    fn delete_rejects_payload() {
        let mut e = WalEntry::delete("user", "u1");
        e.payload = Some(vec![1]);
        assert!(e.validate().is_err());
    }

    #[test]
    fn sequence_ordering() {
        assert!(Sequence(1) < Sequence(2));
        assert_eq!(Sequence(1).next(), Sequence(2));
    }

    #[test]
    fn change_notification_from_entry() {
        let mut e = WalEntry::put("user", "u1", vec![1, 2, 3]);
        e.sequence = Sequence(7);
        let n = ChangeNotification::from(&e);
        assert_eq!(n.sequence, Sequence(7));
        assert_eq!(n.id, EntryId::from("u1"));
    }
}
