// ABOUTME: Change resolution - coalesces change records and maps them to root documents
// ABOUTME: Child changes find their roots through _meta lookups and upward foreign-key walks

use serde_json::Value;
use std::collections::{HashMap, HashSet};

use super::change::ChangeRecord;
use crate::document::{identity_of, IDENTITY_SEPARATOR};
use crate::error::{SyncError, SyncResult};
use crate::node::NodePlan;
use crate::session::{tuple_of, Filter, Row, Select, Session};
use crate::sink::DocumentWriter;

/// Re-derive one root document: upsert it if its row exists, delete it
/// otherwise.
#[derive(Debug, Clone, PartialEq)]
pub struct RootOp {
    pub identity: String,
    /// Root primary-key values in primary-key column order.
    pub key: Vec<Value>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Resolution {
    /// Root operations in application order, one per identity.
    pub ops: Vec<RootOp>,
    /// The sink could not answer a meta lookup; every root must be
    /// re-derived.
    pub rederive_all: bool,
}

/// Keep the latest record per `(table, primary key)`, in arrival order.
///
/// Records for tables outside the plan are dropped. A replaced record's
/// previous key is carried forward so a key change followed by further
/// updates still deletes the old identity.
pub fn coalesce(plan: &NodePlan, records: Vec<ChangeRecord>) -> Vec<ChangeRecord> {
    let mut latest: HashMap<(String, String), usize> = HashMap::new();
    let mut kept: Vec<Option<ChangeRecord>> = Vec::with_capacity(records.len());

    for record in records {
        let pk_columns = match plan.nodes_for_table(&record.table).first() {
            Some(&idx) => plan.node(idx).primary_key.clone(),
            None => continue,
        };
        let key = (
            record.table.clone(),
            identity_of(&tuple_of(&record.primary_key_values, &pk_columns)),
        );

        let mut record = record;
        if let Some(prev_idx) = latest.get(&key).copied() {
            if let Some(prev) = kept[prev_idx].take() {
                if record.old_primary_key_values.is_none() {
                    record.old_primary_key_values = prev.old_primary_key_values;
                }
            }
        }
        latest.insert(key, kept.len());
        kept.push(Some(record));
    }

    kept.into_iter().flatten().collect()
}

/// Turn coalesced records into root operations.
pub async fn resolve<S>(
    plan: &NodePlan,
    session: &S,
    writer: &DocumentWriter,
    records: &[ChangeRecord],
) -> SyncResult<Resolution>
where
    S: Session + ?Sized,
{
    let root = plan.root();
    let mut ops = OpList::default();
    let mut rederive_all = false;

    for record in records {
        if record.table == root.table {
            if record.primary_key_changed() {
                if let Some(old) = &record.old_primary_key_values {
                    let key = tuple_of(old, &root.primary_key);
                    ops.push(identity_of(&key), key);
                }
            }
            let key = tuple_of(&record.primary_key_values, &root.primary_key);
            ops.push(identity_of(&key), key);
            continue;
        }

        for idx in plan.nodes_for_table(&record.table) {
            let node = plan.node(idx);

            let mut lookups = vec![&record.primary_key_values];
            if let Some(old) = &record.old_primary_key_values {
                lookups.push(old);
            }
            for lookup in lookups {
                let pairs: Vec<(String, Value)> = node
                    .primary_key
                    .iter()
                    .map(|c| (c.clone(), lookup.get(c).cloned().unwrap_or(Value::Null)))
                    .collect();
                match writer.find_by_meta(&node.table, &pairs).await? {
                    Some(identities) => {
                        for identity in identities {
                            let key = split_identity(&identity, root.primary_key.len());
                            ops.push(identity, key);
                        }
                    }
                    None => rederive_all = true,
                }
            }

            for key in walk_to_roots(plan, session, idx, record).await? {
                ops.push(identity_of(&key), key);
            }
        }
    }

    Ok(Resolution {
        ops: ops.into_ops(),
        rederive_all,
    })
}

/// Root keys reachable from the changed row by following joins upward.
async fn walk_to_roots<S>(
    plan: &NodePlan,
    session: &S,
    idx: usize,
    record: &ChangeRecord,
) -> SyncResult<Vec<Vec<Value>>>
where
    S: Session + ?Sized,
{
    let node = plan.node(idx);
    let row = match &record.values {
        Some(values) => values.clone(),
        None => {
            let key = tuple_of(&record.primary_key_values, &node.primary_key);
            let select = Select::from(node.table.clone())
                .columns(&node.fetch_columns)
                .filter(Filter::eq(&node.primary_key, key));
            match session
                .execute(select.into())
                .await
                .map_err(SyncError::Transport)?
                .into_iter()
                .next()
            {
                Some(row) => row,
                // Gone already; _meta lookups cover deleted rows
                None => return Ok(Vec::new()),
            }
        }
    };

    let mut rows: Vec<Row> = vec![row];
    let mut current = idx;
    while let (Some(parent_idx), Some(join)) = (plan.node(current).parent, &plan.node(current).join) {
        let parent = plan.node(parent_idx);
        let mut seen = HashSet::new();
        let tuples: Vec<Vec<Value>> = rows
            .iter()
            .map(|r| tuple_of(r, &join.child_columns))
            .filter(|t| !t.iter().any(Value::is_null))
            .filter(|t| seen.insert(Value::Array(t.clone()).to_string()))
            .collect();
        if tuples.is_empty() {
            return Ok(Vec::new());
        }

        let select = Select::from(parent.table.clone())
            .columns(&parent.fetch_columns)
            .filter(Filter::In {
                columns: join.parent_columns.clone(),
                tuples,
            });
        rows = session
            .execute(select.into())
            .await
            .map_err(SyncError::Transport)?;
        current = parent_idx;
    }

    let root = plan.root();
    Ok(rows.iter().map(|r| tuple_of(r, &root.primary_key)).collect())
}

/// Recover key values from an identity. Values come back as strings, which
/// sessions compare against typed columns by their text form.
fn split_identity(identity: &str, columns: usize) -> Vec<Value> {
    if columns <= 1 {
        return vec![Value::String(identity.to_string())];
    }
    identity
        .splitn(columns, IDENTITY_SEPARATOR)
        .map(|part| Value::String(part.to_string()))
        .collect()
}

/// Ordered, de-duplicated root operations. A repeated identity moves to
/// the position of its latest occurrence.
#[derive(Default)]
struct OpList {
    ops: Vec<Option<RootOp>>,
    index: HashMap<String, usize>,
}

impl OpList {
    fn push(&mut self, identity: String, key: Vec<Value>) {
        if let Some(prev) = self.index.get(&identity).copied() {
            self.ops[prev] = None;
        }
        self.index.insert(identity.clone(), self.ops.len());
        self.ops.push(Some(RootOp { identity, key }));
    }

    fn into_ops(self) -> Vec<RootOp> {
        self.ops.into_iter().flatten().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::Node;
    use crate::schema::{Schema, TableSchema};
    use crate::sync::change::ChangeKind;
    use serde_json::json;

    fn plan() -> NodePlan {
        let schema = Schema::new()
            .with_table(
                TableSchema::new("book")
                    .column("isbn", "character varying")
                    .column("title", "character varying")
                    .primary_key(&["isbn"]),
            )
            .with_table(
                TableSchema::new("review")
                    .column("id", "integer")
                    .column("book_isbn", "character varying")
                    .primary_key(&["id"])
                    .foreign_key(&["book_isbn"], "book", &["isbn"]),
            );
        NodePlan::build(&Node::new("book").with_child(Node::new("review")), &schema).unwrap()
    }

    fn key(column: &str, value: Value) -> Row {
        let mut row = Row::new();
        row.insert(column.into(), value);
        row
    }

    #[test]
    fn test_coalesce_keeps_latest_per_key() {
        let mut first = ChangeRecord::new("book", ChangeKind::Insert, key("isbn", json!("a")));
        first.position = 1;
        let mut second = ChangeRecord::new("book", ChangeKind::Update, key("isbn", json!("a")));
        second.position = 2;
        let other = ChangeRecord::new("book", ChangeKind::Insert, key("isbn", json!("b")));
        let ignored = ChangeRecord::new("magazine", ChangeKind::Insert, key("id", json!(1)));

        let out = coalesce(&plan(), vec![first, other.clone(), second.clone(), ignored]);
        assert_eq!(out, vec![other, second]);
    }

    #[test]
    fn test_coalesce_carries_old_key_forward() {
        let mut moved = ChangeRecord::new("book", ChangeKind::Update, key("isbn", json!("b")));
        moved.old_primary_key_values = Some(key("isbn", json!("a")));
        let touched = ChangeRecord::new("book", ChangeKind::Update, key("isbn", json!("b")));

        let out = coalesce(&plan(), vec![moved, touched]);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].old_primary_key_values, Some(key("isbn", json!("a"))));
        assert!(out[0].primary_key_changed());
    }

    #[test]
    fn test_op_list_moves_repeats_to_latest_position() {
        let mut ops = OpList::default();
        ops.push("a".into(), vec![json!("a")]);
        ops.push("b".into(), vec![json!("b")]);
        ops.push("a".into(), vec![json!("a")]);
        let identities: Vec<String> = ops.into_ops().into_iter().map(|op| op.identity).collect();
        assert_eq!(identities, vec!["b", "a"]);
    }

    #[test]
    fn test_split_identity() {
        assert_eq!(split_identity("a|b", 1), vec![json!("a|b")]);
        assert_eq!(split_identity("1|x|y", 2), vec![json!("1"), json!("x|y")]);
    }
}
