// ABOUTME: In-memory relational database with sessions, transaction ids and a change log
// ABOUTME: Implements Session, ReplicationSource and SchemaCatalog for tests and dry runs

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::schema::{Schema, SchemaCatalog, TableSchema};
use crate::session::{compare_tuples, tuple_of, values_match, Query, Row, Select, Session};
use crate::sync::buffer::MemoryBuffer;
use crate::sync::change::{ChangeKind, ChangeRecord, TxWindow, Txid};
use crate::sync::replication::{ChangePage, ReplicationSource, SlotHandle};

#[derive(Debug, Clone)]
struct StoredRow {
    values: Row,
    xmin: Txid,
}

#[derive(Debug, Clone)]
struct SlotState {
    /// Log position the slot was created at; earlier changes are invisible.
    start: u64,
    reclaimed_up_to: Txid,
}

#[derive(Default)]
struct DbState {
    schema: Schema,
    tables: HashMap<String, Vec<StoredRow>>,
    last_txid: u64,
    next_position: u64,
    log: Vec<ChangeRecord>,
    slots: HashMap<String, SlotState>,
    feeds: Vec<Arc<MemoryBuffer>>,
}

/// A process-local database.
///
/// Every committed transaction that writes gets the next transaction id and
/// appends its change records to a shared log that slots read from. Reads
/// never consume a transaction id.
#[derive(Clone, Default)]
pub struct MemoryDatabase {
    state: Arc<Mutex<DbState>>,
}

impl MemoryDatabase {
    pub fn new(schema: Schema) -> Self {
        let db = Self::default();
        db.lock().schema = schema;
        db
    }

    fn lock(&self) -> MutexGuard<'_, DbState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn schema(&self) -> Schema {
        self.lock().schema.clone()
    }

    /// A new session with its own transaction stack.
    pub fn session(&self) -> MemorySession {
        MemorySession {
            db: self.clone(),
            frames: Mutex::new(Vec::new()),
        }
    }

    /// Push every committed change record into `buffer`, the way a
    /// notification trigger would.
    pub fn attach_buffer(&self, buffer: Arc<MemoryBuffer>) {
        self.lock().feeds.push(buffer);
    }

    pub fn last_txid(&self) -> Txid {
        Txid(self.lock().last_txid)
    }

    /// Apply `queries` atomically as one transaction.
    pub fn apply(&self, queries: Vec<Query>) -> Result<Txid> {
        self.commit(queries)?;
        Ok(self.last_txid())
    }

    pub fn insert(&self, table: &str, row: Value) -> Result<Txid> {
        self.apply(vec![Query::Insert {
            table: table.to_string(),
            row: as_row(row)?,
        }])
    }

    pub fn update(&self, table: &str, key: Value, values: Value) -> Result<Txid> {
        self.apply(vec![Query::Update {
            table: table.to_string(),
            key: as_row(key)?,
            values: as_row(values)?,
        }])
    }

    pub fn delete(&self, table: &str, key: Value) -> Result<Txid> {
        self.apply(vec![Query::Delete {
            table: table.to_string(),
            key: as_row(key)?,
        }])
    }

    /// Rows of `table` in insertion order, without system columns.
    pub fn rows(&self, table: &str) -> Vec<Row> {
        self.lock()
            .tables
            .get(table)
            .map(|rows| rows.iter().map(|r| r.values.clone()).collect())
            .unwrap_or_default()
    }

    /// Change records a slot could still return.
    pub fn retained_changes(&self, slot: &str) -> usize {
        let state = self.lock();
        match state.slots.get(slot) {
            Some(slot) => state
                .log
                .iter()
                .filter(|r| r.position >= slot.start && r.transaction_id > slot.reclaimed_up_to)
                .count(),
            None => 0,
        }
    }

    pub fn has_slot(&self, name: &str) -> bool {
        self.lock().slots.contains_key(name)
    }

    /// Apply writes as one transaction. Nothing is applied if any write
    /// fails. Read-only batches do not consume a transaction id.
    fn commit(&self, queries: Vec<Query>) -> Result<Vec<Row>> {
        let mut state = self.lock();
        let txid = Txid(state.last_txid + 1);
        let mut tables = state.tables.clone();
        let mut affected = Vec::new();
        let mut records = Vec::new();
        for query in &queries {
            let (rows, record) = apply_query(&state.schema, &mut tables, query, txid)?;
            affected.extend(rows);
            records.extend(record);
        }
        if records.is_empty() {
            return Ok(affected);
        }

        state.tables = tables;
        state.last_txid = txid.0;
        for mut record in records {
            record.position = state.next_position;
            state.next_position += 1;
            for feed in &state.feeds {
                feed.enqueue(record.clone());
            }
            state.log.push(record);
        }
        Ok(affected)
    }

    /// Evaluate `select` against committed data with `pending` applied on
    /// top.
    fn select(&self, select: &Select, pending: &[Query]) -> Result<Vec<Row>> {
        let state = self.lock();
        let table = state
            .schema
            .table(&select.table)
            .ok_or_else(|| anyhow!("relation \"{}\" does not exist", select.table))?
            .clone();

        let overlay;
        let tables = if pending.is_empty() {
            &state.tables
        } else {
            let mut scratch = state.tables.clone();
            let txid = Txid(state.last_txid + 1);
            for query in pending {
                apply_query(&state.schema, &mut scratch, query, txid)?;
            }
            overlay = scratch;
            &overlay
        };

        let columns = if select.columns.is_empty() {
            table.column_names()
        } else {
            select.columns.clone()
        };
        for column in &columns {
            if !table.is_selectable(column) {
                bail!("column \"{}\" of relation \"{}\" does not exist", column, table.name);
            }
        }

        let mut rows: Vec<Row> = tables
            .get(&select.table)
            .map(|rows| rows.iter().map(with_system_columns).collect())
            .unwrap_or_default();
        rows.retain(|row| select.filter.matches(row));
        if !select.order_by.is_empty() {
            rows.sort_by(|a, b| compare_tuples(&tuple_of(a, &select.order_by), &tuple_of(b, &select.order_by)));
        }
        if let Some(after) = &select.after {
            rows.retain(|row| compare_tuples(&tuple_of(row, &select.order_by), after) == Ordering::Greater);
        }
        if let Some(limit) = select.limit {
            rows.truncate(limit);
        }

        Ok(rows
            .into_iter()
            .map(|row| {
                columns
                    .iter()
                    .map(|c| (c.clone(), row.get(c).cloned().unwrap_or(Value::Null)))
                    .collect()
            })
            .collect())
    }
}

fn as_row(value: Value) -> Result<Row> {
    match value {
        Value::Object(map) => Ok(map),
        other => bail!("expected a JSON object for a row, got {}", other),
    }
}

fn with_system_columns(stored: &StoredRow) -> Row {
    let mut row = stored.values.clone();
    row.insert("xmin".to_string(), Value::from(stored.xmin.0));
    row
}

fn key_matches(row: &Row, key: &Row) -> bool {
    key.iter()
        .all(|(column, expected)| values_match(row.get(column).unwrap_or(&Value::Null), expected))
}

fn primary_key_of(table: &TableSchema, row: &Row) -> Row {
    table
        .primary_key
        .iter()
        .map(|c| (c.clone(), row.get(c).cloned().unwrap_or(Value::Null)))
        .collect()
}

fn check_columns(table: &TableSchema, row: &Row) -> Result<()> {
    for column in row.keys() {
        if !table.has_column(column) {
            bail!("column \"{}\" of relation \"{}\" does not exist", column, table.name);
        }
    }
    Ok(())
}

fn check_unique(table: &TableSchema, rows: &[StoredRow], key: &Row, skip: Option<usize>) -> Result<()> {
    if key.values().any(Value::is_null) {
        bail!("null value in primary key of relation \"{}\"", table.name);
    }
    let duplicate = rows
        .iter()
        .enumerate()
        .any(|(i, r)| Some(i) != skip && key_matches(&r.values, key));
    if duplicate {
        bail!("duplicate key value violates unique constraint on \"{}\"", table.name);
    }
    Ok(())
}

/// Apply one statement to `tables`. Returns the affected rows and the
/// change record a write produced.
fn apply_query(
    schema: &Schema,
    tables: &mut HashMap<String, Vec<StoredRow>>,
    query: &Query,
    txid: Txid,
) -> Result<(Vec<Row>, Option<ChangeRecord>)> {
    let table_name = match query {
        Query::Select(select) => bail!("select on {} cannot run as a write", select.table),
        Query::Insert { table, .. } | Query::Update { table, .. } | Query::Delete { table, .. } => table,
    };
    let table = schema
        .table(table_name)
        .ok_or_else(|| anyhow!("relation \"{}\" does not exist", table_name))?;
    let rows = tables.entry(table_name.clone()).or_default();

    match query {
        Query::Select(_) => Ok((Vec::new(), None)),
        Query::Insert { row, .. } => {
            check_columns(table, row)?;
            let values: Row = table
                .columns
                .iter()
                .map(|c| (c.name.clone(), row.get(&c.name).cloned().unwrap_or(Value::Null)))
                .collect();
            let key = primary_key_of(table, &values);
            check_unique(table, rows, &key, None)?;

            rows.push(StoredRow {
                values: values.clone(),
                xmin: txid,
            });
            let mut record = ChangeRecord::new(table_name.clone(), ChangeKind::Insert, key);
            record.values = Some(values.clone());
            record.transaction_id = txid;
            Ok((vec![values], Some(record)))
        }
        Query::Update { key, values, .. } => {
            check_columns(table, values)?;
            let idx = match rows.iter().position(|r| key_matches(&r.values, key)) {
                Some(idx) => idx,
                None => return Ok((Vec::new(), None)),
            };

            let old_key = primary_key_of(table, &rows[idx].values);
            let mut updated = rows[idx].values.clone();
            for (column, value) in values {
                updated.insert(column.clone(), value.clone());
            }
            let new_key = primary_key_of(table, &updated);
            if new_key != old_key {
                check_unique(table, rows, &new_key, Some(idx))?;
            }

            rows[idx] = StoredRow {
                values: updated.clone(),
                xmin: txid,
            };
            let mut record = ChangeRecord::new(table_name.clone(), ChangeKind::Update, new_key.clone());
            if new_key != old_key {
                record.old_primary_key_values = Some(old_key);
            }
            record.values = Some(updated.clone());
            record.transaction_id = txid;
            Ok((vec![updated], Some(record)))
        }
        Query::Delete { key, .. } => {
            let idx = match rows.iter().position(|r| key_matches(&r.values, key)) {
                Some(idx) => idx,
                None => return Ok((Vec::new(), None)),
            };
            let removed = rows.remove(idx);
            let mut record = ChangeRecord::new(
                table_name.clone(),
                ChangeKind::Delete,
                primary_key_of(table, &removed.values),
            );
            record.transaction_id = txid;
            Ok((vec![removed.values], Some(record)))
        }
    }
}

/// A session over a [`MemoryDatabase`].
///
/// Writes inside a transaction are buffered per scope and become visible to
/// the session's own reads immediately. The outermost commit applies them
/// under one transaction id; releasing a savepoint folds its writes into the
/// enclosing scope.
pub struct MemorySession {
    db: MemoryDatabase,
    frames: Mutex<Vec<Vec<Query>>>,
}

impl MemorySession {
    fn frames(&self) -> MutexGuard<'_, Vec<Vec<Query>>> {
        match self.frames.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn depth(&self) -> usize {
        self.frames().len()
    }
}

#[async_trait]
impl Session for MemorySession {
    async fn execute(&self, query: Query) -> Result<Vec<Row>> {
        let mut frames = self.frames();
        if let Query::Select(select) = &query {
            let pending: Vec<Query> = frames.iter().flatten().cloned().collect();
            return self.db.select(select, &pending);
        }
        if frames.is_empty() {
            return self.db.commit(vec![query]);
        }

        // Validate against everything this session has written so far
        let pending: Vec<Query> = frames.iter().flatten().cloned().collect();
        let affected = {
            let state = self.db.lock();
            let mut scratch = state.tables.clone();
            let txid = Txid(state.last_txid + 1);
            for earlier in &pending {
                apply_query(&state.schema, &mut scratch, earlier, txid)?;
            }
            apply_query(&state.schema, &mut scratch, &query, txid)?.0
        };
        if let Some(frame) = frames.last_mut() {
            frame.push(query);
        }
        Ok(affected)
    }

    async fn current_transaction_id(&self) -> Result<Txid> {
        Ok(self.db.last_txid())
    }

    async fn begin(&self) -> Result<()> {
        self.frames().push(Vec::new());
        Ok(())
    }

    async fn commit(&self) -> Result<()> {
        let mut frames = self.frames();
        let frame = frames.pop().ok_or_else(|| anyhow!("commit without an open transaction"))?;
        if let Some(parent) = frames.last_mut() {
            parent.extend(frame);
            return Ok(());
        }
        drop(frames);
        self.db.commit(frame).map(|_| ())
    }

    async fn rollback(&self) -> Result<()> {
        self.frames()
            .pop()
            .map(|_| ())
            .ok_or_else(|| anyhow!("rollback without an open transaction"))
    }

    fn abandon(&self) {
        self.frames().pop();
    }
}

#[async_trait]
impl ReplicationSource for MemoryDatabase {
    async fn open_slot(&self, name: &str) -> Result<SlotHandle> {
        let mut state = self.lock();
        let start = state.next_position;
        let last_txid = Txid(state.last_txid);
        state.slots.entry(name.to_string()).or_insert(SlotState {
            start,
            reclaimed_up_to: last_txid,
        });
        Ok(SlotHandle {
            name: name.to_string(),
        })
    }

    async fn pull_changes(
        &self,
        slot: &SlotHandle,
        window: TxWindow,
        max_count: usize,
        offset: usize,
    ) -> Result<ChangePage> {
        let state = self.lock();
        let slot_state = state
            .slots
            .get(&slot.name)
            .ok_or_else(|| anyhow!("replication slot \"{}\" does not exist", slot.name))?;
        Ok(ChangePage::unfiltered(
            state
                .log
                .iter()
                .filter(|r| r.position >= slot_state.start && r.transaction_id > slot_state.reclaimed_up_to)
                .filter(|r| window.contains(r.transaction_id))
                .skip(offset)
                .take(max_count)
                .cloned()
                .collect(),
        ))
    }

    async fn reclaim(&self, slot: &SlotHandle, up_to: Txid) -> Result<()> {
        let mut state = self.lock();
        let slot_state = state
            .slots
            .get_mut(&slot.name)
            .ok_or_else(|| anyhow!("replication slot \"{}\" does not exist", slot.name))?;
        slot_state.reclaimed_up_to = slot_state.reclaimed_up_to.max(up_to);
        Ok(())
    }
}

#[async_trait]
impl SchemaCatalog for MemoryDatabase {
    async fn describe_table(&self, table: &str) -> Result<Option<TableSchema>> {
        Ok(self.lock().schema.table(table).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{transaction, Filter};
    use serde_json::json;

    fn db() -> MemoryDatabase {
        MemoryDatabase::new(
            Schema::new().with_table(
                TableSchema::new("book")
                    .column("isbn", "character varying")
                    .column("title", "character varying")
                    .primary_key(&["isbn"]),
            ),
        )
    }

    #[tokio::test]
    async fn test_writes_get_increasing_txids() {
        let db = db();
        assert_eq!(db.last_txid(), Txid(0));
        assert_eq!(db.insert("book", json!({"isbn": "a", "title": "A"})).unwrap(), Txid(1));
        assert_eq!(db.update("book", json!({"isbn": "a"}), json!({"title": "B"})).unwrap(), Txid(2));

        // Reads and no-op writes leave the txid alone
        let session = db.session();
        session.execute(Select::from("book").into()).await.unwrap();
        db.delete("book", json!({"isbn": "missing"})).unwrap();
        assert_eq!(db.last_txid(), Txid(2));
    }

    #[tokio::test]
    async fn test_select_projects_orders_and_pages() {
        let db = db();
        for isbn in ["c", "a", "b"] {
            db.insert("book", json!({"isbn": isbn, "title": isbn.to_uppercase()})).unwrap();
        }
        let session = db.session();
        let columns = vec!["isbn".to_string(), "xmin".to_string()];
        let order = vec!["isbn".to_string()];
        let rows = session
            .execute(
                Select::from("book")
                    .columns(&columns)
                    .order_by(&order)
                    .after(Some(vec![json!("a")]))
                    .limit(1)
                    .into(),
            )
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("isbn"), Some(&json!("b")));
        assert_eq!(rows[0].get("xmin"), Some(&json!(3)));
        assert_eq!(rows[0].keys().cloned().collect::<Vec<_>>(), columns);
    }

    #[tokio::test]
    async fn test_transaction_is_atomic_and_visible_to_itself() {
        let db = db();
        let session = db.session();

        let seen = transaction(&session, |s| {
            Box::pin(async move {
                s.execute(Query::Insert {
                    table: "book".into(),
                    row: as_row(json!({"isbn": "a", "title": "A"}))?,
                })
                .await?;
                let rows = s.execute(Select::from("book").into()).await?;
                Ok::<_, anyhow::Error>(rows.len())
            })
        })
        .await
        .unwrap();
        assert_eq!(seen, 1);
        assert_eq!(db.rows("book").len(), 1);

        let failed: Result<()> = transaction(&session, |s| {
            Box::pin(async move {
                s.execute(Query::Insert {
                    table: "book".into(),
                    row: as_row(json!({"isbn": "b", "title": "B"}))?,
                })
                .await?;
                Err::<(), _>(anyhow!("boom"))
            })
        })
        .await;
        assert!(failed.is_err());
        assert_eq!(db.rows("book").len(), 1);
        assert_eq!(session.depth(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_primary_key_is_rejected() {
        let db = db();
        db.insert("book", json!({"isbn": "a", "title": "A"})).unwrap();
        assert!(db.insert("book", json!({"isbn": "a", "title": "B"})).is_err());
        assert_eq!(db.last_txid(), Txid(1));
    }

    #[tokio::test]
    async fn test_slot_pulls_window_and_reclaims() {
        let db = db();
        db.insert("book", json!({"isbn": "before", "title": "x"})).unwrap();
        let slot = db.open_slot("books").await.unwrap();
        db.insert("book", json!({"isbn": "a", "title": "A"})).unwrap();
        db.update("book", json!({"isbn": "a"}), json!({"isbn": "b"})).unwrap();

        let all = db
            .pull_changes(&slot, TxWindow::new(Txid(0), Txid(3)), 10, 0)
            .await
            .unwrap()
            .records;
        assert_eq!(all.len(), 2);
        assert_eq!(all[1].old_primary_key_values, Some(as_row(json!({"isbn": "a"})).unwrap()));
        assert!(all[0].position < all[1].position);

        let paged = db.pull_changes(&slot, TxWindow::new(Txid(0), Txid(3)), 1, 1).await.unwrap();
        assert_eq!(paged.records, vec![all[1].clone()]);
        assert_eq!(paged.consumed, 1);

        db.reclaim(&slot, Txid(2)).await.unwrap();
        assert_eq!(db.retained_changes("books"), 1);
    }

    #[tokio::test]
    async fn test_filter_by_text_key_matches_typed_column() {
        let db = MemoryDatabase::new(
            Schema::new().with_table(
                TableSchema::new("review")
                    .column("id", "integer")
                    .primary_key(&["id"]),
            ),
        );
        db.insert("review", json!({"id": 7})).unwrap();
        let rows = db
            .session()
            .execute(
                Select::from("review")
                    .filter(Filter::eq(&["id".to_string()], vec![json!("7")]))
                    .into(),
            )
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
    }
}
