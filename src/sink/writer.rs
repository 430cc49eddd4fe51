// ABOUTME: Document writer - idempotent upserts and deletes with retries over a sink
// ABOUTME: Keeps a content digest per identity and reconciles orphaned documents

use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use super::{Sink, SinkError};
use crate::document::Document;
use crate::error::{SyncError, SyncResult};
use crate::utils::{retry_when, RetryPolicy};

/// What a single write did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    Upserted,
    /// Same content as the last successful upsert; nothing sent.
    Unchanged,
    Deleted,
    /// The sink refused the record permanently.
    Rejected(String),
}

/// Applies documents for one index.
///
/// Transient sink errors are retried with backoff; once retries are
/// exhausted they surface as [`SyncError::Transport`] so the cycle aborts
/// without advancing its checkpoint. Permanent errors only affect the
/// record at hand and come back as [`WriteOutcome::Rejected`].
pub struct DocumentWriter {
    sink: Arc<dyn Sink>,
    index: String,
    retry: RetryPolicy,
    /// identity -> SHA-256 of the last document written
    ledger: HashMap<String, String>,
}

impl DocumentWriter {
    pub fn new(sink: Arc<dyn Sink>, index: impl Into<String>, retry: RetryPolicy) -> Self {
        Self {
            sink,
            index: index.into(),
            retry,
            ledger: HashMap::new(),
        }
    }

    pub fn index(&self) -> &str {
        &self.index
    }

    /// Identities written in this process.
    pub fn written(&self) -> impl Iterator<Item = &String> {
        self.ledger.keys()
    }

    pub fn digest(document: &Document) -> String {
        let mut hasher = Sha256::new();
        // Serializing a serde_json map cannot fail
        if let Ok(bytes) = serde_json::to_vec(document) {
            hasher.update(&bytes);
        }
        format!("{:x}", hasher.finalize())
    }

    pub async fn upsert(&mut self, document: &Document) -> SyncResult<WriteOutcome> {
        let digest = Self::digest(document);
        if self.ledger.get(&document.identity) == Some(&digest) {
            tracing::debug!(identity = %document.identity, "document unchanged, skipping");
            return Ok(WriteOutcome::Unchanged);
        }

        let sink = self.sink.as_ref();
        let result = retry_when(
            move || sink.upsert(document),
            SinkError::is_transient,
            self.retry.max_retries,
            self.retry.initial_delay,
        )
        .await;

        match result {
            Ok(()) => {
                self.ledger.insert(document.identity.clone(), digest);
                Ok(WriteOutcome::Upserted)
            }
            Err(e) => self.record_failure(&document.identity, e),
        }
    }

    pub async fn delete(&mut self, identity: &str) -> SyncResult<WriteOutcome> {
        let sink = self.sink.as_ref();
        let index = self.index.as_str();
        let result = retry_when(
            move || sink.delete(index, identity),
            SinkError::is_transient,
            self.retry.max_retries,
            self.retry.initial_delay,
        )
        .await;

        match result {
            Ok(()) => {
                self.ledger.remove(identity);
                Ok(WriteOutcome::Deleted)
            }
            Err(e) => self.record_failure(identity, e),
        }
    }

    pub async fn refresh(&self) -> SyncResult<()> {
        let sink = self.sink.as_ref();
        let index = self.index.as_str();
        retry_when(
            move || sink.refresh(index),
            SinkError::is_transient,
            self.retry.max_retries,
            self.retry.initial_delay,
        )
        .await
        .map_err(|e| SyncError::Transport(anyhow::Error::new(e)))
    }

    pub async fn find_by_meta(
        &self,
        table: &str,
        key: &[(String, Value)],
    ) -> SyncResult<Option<Vec<String>>> {
        let sink = self.sink.as_ref();
        let index = self.index.as_str();
        retry_when(
            move || sink.find_by_meta(index, table, key),
            SinkError::is_transient,
            self.retry.max_retries,
            self.retry.initial_delay,
        )
        .await
        .map_err(|e| SyncError::Transport(anyhow::Error::new(e)))
    }

    /// Delete every known identity that is not in `seen`.
    ///
    /// Known identities come from the sink when it can enumerate them,
    /// otherwise from this writer's ledger. Returns the number deleted.
    pub async fn reconcile(&mut self, seen: &HashSet<String>) -> SyncResult<u64> {
        let sink = self.sink.as_ref();
        let index = self.index.as_str();
        let listed = retry_when(
            move || sink.identities(index),
            SinkError::is_transient,
            self.retry.max_retries,
            self.retry.initial_delay,
        )
        .await
        .map_err(|e| SyncError::Transport(anyhow::Error::new(e)))?;

        let known: Vec<String> = match listed {
            Some(identities) => identities,
            None => self.ledger.keys().cloned().collect(),
        };

        let mut orphans: Vec<String> = known.into_iter().filter(|id| !seen.contains(id)).collect();
        orphans.sort();

        let mut deleted = 0u64;
        for identity in orphans {
            if let WriteOutcome::Deleted = self.delete(&identity).await? {
                deleted += 1;
            }
        }
        if deleted > 0 {
            tracing::info!("Deleted {} orphaned documents from {}", deleted, self.index);
        }
        Ok(deleted)
    }

    fn record_failure(&self, identity: &str, error: SinkError) -> SyncResult<WriteOutcome> {
        if error.is_transient() {
            return Err(SyncError::Transport(anyhow::Error::new(error)));
        }
        tracing::warn!(
            "Skipping document {} in {}: {}",
            identity,
            self.index,
            error
        );
        Ok(WriteOutcome::Rejected(error.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::MemorySink;
    use serde_json::{json, Map};
    use std::time::Duration;

    fn doc(identity: &str, title: &str) -> Document {
        let mut source = Map::new();
        source.insert("title".into(), json!(title));
        source.insert("_meta".into(), json!({}));
        Document {
            identity: identity.into(),
            index: "books".into(),
            source,
        }
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            max_retries: 2,
            initial_delay: Duration::from_millis(1),
        }
    }

    #[tokio::test]
    async fn test_unchanged_documents_are_skipped() {
        let sink = Arc::new(MemorySink::new());
        let mut writer = DocumentWriter::new(sink.clone(), "books", fast_retry());

        assert_eq!(writer.upsert(&doc("1", "A")).await.unwrap(), WriteOutcome::Upserted);
        assert_eq!(writer.upsert(&doc("1", "A")).await.unwrap(), WriteOutcome::Unchanged);
        assert_eq!(writer.upsert(&doc("1", "B")).await.unwrap(), WriteOutcome::Upserted);
        assert_eq!(sink.write_count(), 2);
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let sink = Arc::new(MemorySink::new());
        let mut writer = DocumentWriter::new(sink.clone(), "books", fast_retry());

        sink.fail_next(2);
        assert_eq!(writer.upsert(&doc("1", "A")).await.unwrap(), WriteOutcome::Upserted);

        sink.fail_next(5);
        let err = writer.upsert(&doc("2", "B")).await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_rejections_are_reported_not_raised() {
        let sink = Arc::new(MemorySink::new());
        let mut writer = DocumentWriter::new(sink.clone(), "books", fast_retry());
        sink.reject("bad");

        let outcome = writer.upsert(&doc("bad", "A")).await.unwrap();
        assert!(matches!(outcome, WriteOutcome::Rejected(_)));
        assert!(sink.get("books", "bad").is_none());
    }

    #[tokio::test]
    async fn test_reconcile_deletes_unseen_identities() {
        let sink = Arc::new(MemorySink::new());
        let mut writer = DocumentWriter::new(sink.clone(), "books", fast_retry());
        writer.upsert(&doc("1", "A")).await.unwrap();
        writer.upsert(&doc("2", "B")).await.unwrap();

        let seen: HashSet<String> = ["1".to_string()].into_iter().collect();
        assert_eq!(writer.reconcile(&seen).await.unwrap(), 1);
        assert!(sink.get("books", "2").is_none());
        assert!(sink.get("books", "1").is_some());
        assert_eq!(writer.written().count(), 1);
    }
}
