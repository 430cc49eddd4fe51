use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeOperation {
    Insert,
    Update,
    Delete,
}

impl ChangeOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeOperation::Insert => "insert",
            ChangeOperation::Update => "update",
            ChangeOperation::Delete => "delete",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown change op: {0}")]
pub struct ParseOperationError(pub String);

impl FromStr for ChangeOperation {
    type Err = ParseOperationError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "insert" => Ok(ChangeOperation::Insert),
            "update" => Ok(ChangeOperation::Update),
            "delete" => Ok(ChangeOperation::Delete),
            _ => Err(ParseOperationError(value.to_string())),
        }
    }
}

/// A change notification not yet persisted to the queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewEntry {
    pub table_name: String,
    pub operation: ChangeOperation,
    /// Primary key rendered as text, composite keys joined with `|`.
    pub primary_key: String,
    /// Opaque serialized payload owned by the producer.
    pub payload: Option<Vec<u8>>,
    pub txid: Option<i64>,
}

impl NewEntry {
    pub fn with_json_payload<T: Serialize>(
        table_name: impl Into<String>,
        operation: ChangeOperation,
        primary_key: impl Into<String>,
        payload: &T,
        txid: Option<i64>,
    ) -> serde_json::Result<Self> {
        Ok(Self {
            table_name: table_name.into(),
            operation,
            primary_key: primary_key.into(),
            payload: Some(serde_json::to_vec(payload)?),
            txid,
        })
    }
}

/// A change notification as stored in the queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferEntry {
    pub entry_id: i64,
    pub table_name: String,
    pub operation: ChangeOperation,
    pub primary_key: String,
    pub payload: Option<Vec<u8>>,
    pub txid: Option<i64>,
}

impl BufferEntry {
    pub fn json_payload<T: for<'de> Deserialize<'de>>(&self) -> serde_json::Result<Option<T>> {
        self.payload
            .as_deref()
            .map(serde_json::from_slice)
            .transpose()
    }
}
