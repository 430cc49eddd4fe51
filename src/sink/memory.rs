// ABOUTME: In-memory document sink with write counters and failure injection
// ABOUTME: Backs the integration tests and dry runs

use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;

use super::{Sink, SinkError};
use crate::document::Document;
use crate::session::compare_values;

#[derive(Default)]
struct State {
    indices: HashMap<String, BTreeMap<String, Document>>,
    upserts: u64,
    deletes: u64,
    refreshes: u64,
    transient_failures: u32,
    rejected: HashSet<String>,
}

/// Documents kept in process memory, keyed by index then identity.
pub struct MemorySink {
    state: Mutex<State>,
    meta_lookups: bool,
}

impl MemorySink {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            meta_lookups: true,
        }
    }

    /// A sink that answers `find_by_meta` with `None`.
    pub fn without_meta_lookups() -> Self {
        Self {
            state: Mutex::new(State::default()),
            meta_lookups: false,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Documents in `index`, ordered by identity.
    pub fn documents(&self, index: &str) -> Vec<Document> {
        self.lock()
            .indices
            .get(index)
            .map(|docs| docs.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn get(&self, index: &str, identity: &str) -> Option<Document> {
        self.lock()
            .indices
            .get(index)
            .and_then(|docs| docs.get(identity).cloned())
    }

    /// Upserts and deletes that reached the store.
    pub fn write_count(&self) -> u64 {
        let state = self.lock();
        state.upserts + state.deletes
    }

    pub fn refresh_count(&self) -> u64 {
        self.lock().refreshes
    }

    /// Fail the next `count` calls with [`SinkError::Unavailable`].
    pub fn fail_next(&self, count: u32) {
        self.lock().transient_failures = count;
    }

    /// Reject every upsert of `identity`.
    pub fn reject(&self, identity: &str) {
        self.lock().rejected.insert(identity.to_string());
    }

    fn take_failure(state: &mut State) -> Result<(), SinkError> {
        if state.transient_failures > 0 {
            state.transient_failures -= 1;
            return Err(SinkError::Unavailable("injected failure".into()));
        }
        Ok(())
    }
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Sink for MemorySink {
    async fn upsert(&self, document: &Document) -> Result<(), SinkError> {
        let mut state = self.lock();
        Self::take_failure(&mut state)?;
        if state.rejected.contains(&document.identity) {
            return Err(SinkError::Rejected {
                identity: document.identity.clone(),
                reason: "rejected by test sink".into(),
            });
        }
        state
            .indices
            .entry(document.index.clone())
            .or_default()
            .insert(document.identity.clone(), document.clone());
        state.upserts += 1;
        Ok(())
    }

    async fn delete(&self, index: &str, identity: &str) -> Result<(), SinkError> {
        let mut state = self.lock();
        Self::take_failure(&mut state)?;
        let removed = state
            .indices
            .get_mut(index)
            .and_then(|docs| docs.remove(identity));
        if removed.is_some() {
            state.deletes += 1;
        }
        Ok(())
    }

    async fn refresh(&self, _index: &str) -> Result<(), SinkError> {
        let mut state = self.lock();
        Self::take_failure(&mut state)?;
        state.refreshes += 1;
        Ok(())
    }

    async fn find_by_meta(
        &self,
        index: &str,
        table: &str,
        key: &[(String, Value)],
    ) -> Result<Option<Vec<String>>, SinkError> {
        if !self.meta_lookups {
            return Ok(None);
        }
        let state = self.lock();
        let docs = match state.indices.get(index) {
            Some(docs) => docs,
            None => return Ok(Some(Vec::new())),
        };

        let found = docs
            .values()
            .filter(|doc| {
                let table_meta = doc
                    .meta()
                    .and_then(|meta| meta.get(table))
                    .and_then(Value::as_object);
                match table_meta {
                    Some(columns) => key.iter().all(|(column, value)| {
                        columns
                            .get(column)
                            .and_then(Value::as_array)
                            .map(|values| {
                                values
                                    .iter()
                                    .any(|v| compare_values(v, value) == std::cmp::Ordering::Equal)
                            })
                            .unwrap_or(false)
                    }),
                    None => false,
                }
            })
            .map(|doc| doc.identity.clone())
            .collect();
        Ok(Some(found))
    }

    async fn identities(&self, index: &str) -> Result<Option<Vec<String>>, SinkError> {
        let state = self.lock();
        Ok(Some(
            state
                .indices
                .get(index)
                .map(|docs| docs.keys().cloned().collect())
                .unwrap_or_default(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Map};

    fn doc(identity: &str, meta: Value) -> Document {
        let mut source = Map::new();
        source.insert("_meta".into(), meta);
        Document {
            identity: identity.into(),
            index: "books".into(),
            source,
        }
    }

    #[tokio::test]
    async fn test_upsert_delete_counts() {
        let sink = MemorySink::new();
        sink.upsert(&doc("1", json!({}))).await.unwrap();
        sink.upsert(&doc("1", json!({}))).await.unwrap();
        sink.delete("books", "1").await.unwrap();
        // Deleting a missing identity is a no-op
        sink.delete("books", "1").await.unwrap();
        assert_eq!(sink.write_count(), 3);
        assert!(sink.documents("books").is_empty());
    }

    #[tokio::test]
    async fn test_find_by_meta_intersects_columns() {
        let sink = MemorySink::new();
        sink.upsert(&doc("1", json!({"review": {"id": [3, 7]}})))
            .await
            .unwrap();
        sink.upsert(&doc("2", json!({"review": {"id": [8]}})))
            .await
            .unwrap();

        let found = sink
            .find_by_meta("books", "review", &[("id".into(), json!(7))])
            .await
            .unwrap();
        assert_eq!(found, Some(vec!["1".to_string()]));

        let none = sink
            .find_by_meta("books", "publisher", &[("id".into(), json!(7))])
            .await
            .unwrap();
        assert_eq!(none, Some(vec![]));

        let unsupported = MemorySink::without_meta_lookups()
            .find_by_meta("books", "review", &[("id".into(), json!(7))])
            .await
            .unwrap();
        assert!(unsupported.is_none());
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let sink = MemorySink::new();
        sink.fail_next(1);
        assert!(sink.upsert(&doc("1", json!({}))).await.unwrap_err().is_transient());
        sink.upsert(&doc("1", json!({}))).await.unwrap();

        sink.reject("2");
        let err = sink.upsert(&doc("2", json!({}))).await.unwrap_err();
        assert!(!err.is_transient());
    }
}
