// ABOUTME: Change records and transaction-id windows consumed by the sync cycle
// ABOUTME: Shared vocabulary between replication slots, change buffers and the resolver

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::session::Row;

/// A 64-bit (epoch-extended) transaction id.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Txid(pub u64);

impl Txid {
    pub const ZERO: Txid = Txid(0);

    /// Extend a 32-bit `xid` into the epoch of `reference`.
    ///
    /// An xid that would land after `reference` belongs to the previous
    /// epoch.
    pub fn widen(xid: u32, reference: Txid) -> Txid {
        let epoch = reference.0 >> 32;
        let candidate = (epoch << 32) | xid as u64;
        if candidate > reference.0 && epoch > 0 {
            Txid(candidate - (1u64 << 32))
        } else {
            Txid(candidate)
        }
    }
}

impl fmt::Display for Txid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Half-open transaction window `(txmin, txmax]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxWindow {
    pub txmin: Txid,
    pub txmax: Txid,
}

impl TxWindow {
    pub fn new(txmin: Txid, txmax: Txid) -> Self {
        Self { txmin, txmax }
    }

    pub fn contains(&self, txid: Txid) -> bool {
        txid > self.txmin && txid <= self.txmax
    }

    /// A window with no transactions in it.
    pub fn is_empty(&self) -> bool {
        self.txmin >= self.txmax
    }
}

impl fmt::Display for TxWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}]", self.txmin, self.txmax)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

impl From<change_buffer::ChangeOperation> for ChangeKind {
    fn from(op: change_buffer::ChangeOperation) -> Self {
        match op {
            change_buffer::ChangeOperation::Insert => ChangeKind::Insert,
            change_buffer::ChangeOperation::Update => ChangeKind::Update,
            change_buffer::ChangeOperation::Delete => ChangeKind::Delete,
        }
    }
}

impl From<ChangeKind> for change_buffer::ChangeOperation {
    fn from(kind: ChangeKind) -> Self {
        match kind {
            ChangeKind::Insert => change_buffer::ChangeOperation::Insert,
            ChangeKind::Update => change_buffer::ChangeOperation::Update,
            ChangeKind::Delete => change_buffer::ChangeOperation::Delete,
        }
    }
}

/// One decoded row mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub table: String,
    pub kind: ChangeKind,
    /// Primary-key columns of the row after the change (before, for deletes).
    pub primary_key_values: Row,
    /// Primary-key columns before an update that changed the key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_primary_key_values: Option<Row>,
    /// Full new tuple when the producer has it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub values: Option<Row>,
    pub transaction_id: Txid,
    /// Commit order within the producing source.
    #[serde(default)]
    pub position: u64,
}

impl ChangeRecord {
    pub fn new(table: impl Into<String>, kind: ChangeKind, primary_key_values: Row) -> Self {
        Self {
            table: table.into(),
            kind,
            primary_key_values,
            old_primary_key_values: None,
            values: None,
            transaction_id: Txid::ZERO,
            position: 0,
        }
    }

    /// True when an update moved the row to a different primary key.
    pub fn primary_key_changed(&self) -> bool {
        match &self.old_primary_key_values {
            Some(old) => old != &self.primary_key_values,
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_bounds() {
        let window = TxWindow::new(Txid(10), Txid(20));
        assert!(!window.contains(Txid(10)));
        assert!(window.contains(Txid(11)));
        assert!(window.contains(Txid(20)));
        assert!(!window.contains(Txid(21)));
        assert!(TxWindow::new(Txid(5), Txid(5)).is_empty());
    }

    #[test]
    fn test_widen_xid() {
        let reference = Txid((3u64 << 32) | 100);
        assert_eq!(Txid::widen(50, reference), Txid((3u64 << 32) | 50));
        // An xid past the reference wrapped from the previous epoch
        assert_eq!(Txid::widen(200, reference), Txid((2u64 << 32) | 200));
        assert_eq!(Txid::widen(7, Txid(9)), Txid(7));
    }

    #[test]
    fn test_primary_key_changed() {
        let mut new_key = Row::new();
        new_key.insert("isbn".into(), "002".into());
        let mut record = ChangeRecord::new("book", ChangeKind::Update, new_key.clone());
        assert!(!record.primary_key_changed());

        record.old_primary_key_values = Some(new_key);
        assert!(!record.primary_key_changed());

        let mut old_key = Row::new();
        old_key.insert("isbn".into(), "001".into());
        record.old_primary_key_values = Some(old_key);
        assert!(record.primary_key_changed());
    }

    #[test]
    fn test_record_json_shape() {
        let mut key = Row::new();
        key.insert("id".into(), 1.into());
        let record = ChangeRecord::new("publisher", ChangeKind::Delete, key);
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["kind"], "delete");
        assert!(json.get("values").is_none());
        let back: ChangeRecord = serde_json::from_value(json).unwrap();
        assert_eq!(back, record);
    }
}
