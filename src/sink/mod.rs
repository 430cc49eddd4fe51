// ABOUTME: Document sink abstraction and adapters (memory, Elasticsearch HTTP, PostgreSQL JSONB)
// ABOUTME: The writer layers digests, retries and orphan reconciliation over any sink

pub mod elasticsearch;
pub mod jsonb;
pub mod memory;
pub mod writer;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::document::Document;

pub use elasticsearch::ElasticsearchSink;
pub use jsonb::JsonbSink;
pub use memory::MemorySink;
pub use writer::{DocumentWriter, WriteOutcome};

#[derive(Debug, Error)]
pub enum SinkError {
    /// Backend unreachable or overloaded.
    #[error("sink unavailable: {0}")]
    Unavailable(String),

    #[error("sink request timed out: {0}")]
    Timeout(String),

    /// The backend refused this document; retrying will not help.
    #[error("document {identity} rejected: {reason}")]
    Rejected { identity: String, reason: String },

    #[error("sink error: {0:#}")]
    Other(#[from] anyhow::Error),
}

impl SinkError {
    pub fn is_transient(&self) -> bool {
        matches!(self, SinkError::Unavailable(_) | SinkError::Timeout(_))
    }
}

/// A store of derived documents.
///
/// Upserts are idempotent and deleting a missing identity is a no-op.
#[async_trait]
pub trait Sink: Send + Sync {
    async fn upsert(&self, document: &Document) -> Result<(), SinkError>;

    async fn delete(&self, index: &str, identity: &str) -> Result<(), SinkError>;

    /// Make prior writes visible to readers.
    async fn refresh(&self, index: &str) -> Result<(), SinkError>;

    /// Identities of documents whose `_meta.<table>.<column>` contains the
    /// given value for every `(column, value)` in `key`.
    ///
    /// `None` means the sink cannot answer meta lookups.
    async fn find_by_meta(
        &self,
        index: &str,
        table: &str,
        key: &[(String, Value)],
    ) -> Result<Option<Vec<String>>, SinkError>;

    /// Every identity stored under `index`, if the sink can enumerate them.
    async fn identities(&self, _index: &str) -> Result<Option<Vec<String>>, SinkError> {
        Ok(None)
    }
}
