// ABOUTME: Document compiler - folds a row tree into a document following a node plan
// ABOUTME: Pure and deterministic: identical plans and rows give byte-identical documents

use serde_json::{Map, Value};
use std::collections::BTreeMap;

use super::{identity_of, Document, RowTree};
use crate::error::{SyncError, SyncResult};
use crate::node::{JoinKind, NodePlan, PlanNode, META_FIELD};
use crate::session::{compare_values, tuple_of};

/// child table -> primary-key column -> values seen in the subtree
type MetaMap = BTreeMap<String, BTreeMap<String, Vec<Value>>>;

/// Compile one root row tree into a document for `index`.
///
/// Fails with [`SyncError::Application`] if the root row lacks a value for
/// a primary-key column.
pub fn compile(plan: &NodePlan, index: &str, tree: &RowTree) -> SyncResult<Document> {
    let root = plan.root();
    let key = tuple_of(&tree.row, &root.primary_key);
    if let Some(pos) = key.iter().position(Value::is_null) {
        return Err(SyncError::Application {
            table: root.table.clone(),
            identity: identity_of(&key),
            message: format!("primary key column \"{}\" is null", root.primary_key[pos]),
        });
    }

    let mut meta = MetaMap::new();
    let mut source = compile_node(plan, 0, tree, &mut meta);
    source.insert(META_FIELD.to_string(), meta_value(meta));

    Ok(Document {
        identity: identity_of(&key),
        index: index.to_string(),
        source,
    })
}

fn compile_node(plan: &NodePlan, idx: usize, tree: &RowTree, meta: &mut MetaMap) -> Map<String, Value> {
    let node = plan.node(idx);
    let mut source = Map::new();

    for column in &node.output_columns {
        let value = tree.row.get(column).cloned().unwrap_or(Value::Null);
        source.insert(node.field_name(column).to_string(), value);
    }

    for (slot, &child_idx) in node.children.iter().enumerate() {
        let child = plan.node(child_idx);
        let rows = tree.children.get(slot).map(Vec::as_slice).unwrap_or(&[]);

        let mut compiled = Vec::with_capacity(rows.len());
        for child_tree in rows {
            record_meta(meta, child, child_tree);
            compiled.push(Value::Object(compile_node(plan, child_idx, child_tree, meta)));
        }

        let value = match child.join.as_ref().map(|j| j.kind) {
            Some(JoinKind::ManyToOne) => compiled
                .into_iter()
                .next()
                .unwrap_or_else(|| Value::Object(Map::new())),
            _ => Value::Array(compiled),
        };
        source.insert(child.field.clone(), value);
    }

    source
}

fn record_meta(meta: &mut MetaMap, node: &PlanNode, tree: &RowTree) {
    let columns = meta.entry(node.table.clone()).or_default();
    for pk in &node.primary_key {
        let value = tree.row.get(pk).cloned().unwrap_or(Value::Null);
        if value.is_null() {
            continue;
        }
        columns.entry(pk.clone()).or_default().push(value);
    }
}

fn meta_value(meta: MetaMap) -> Value {
    let mut out = Map::new();
    for (table, columns) in meta {
        let mut table_meta = Map::new();
        for (column, mut values) in columns {
            values.sort_by(compare_values);
            values.dedup_by(|a, b| compare_values(a, b) == std::cmp::Ordering::Equal);
            table_meta.insert(column, Value::Array(values));
        }
        out.insert(table, Value::Object(table_meta));
    }
    Value::Object(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::Node;
    use crate::schema::{Schema, TableSchema};
    use crate::session::Row;
    use serde_json::json;

    fn schema() -> Schema {
        Schema::new()
            .with_table(
                TableSchema::new("book")
                    .column("isbn", "character varying")
                    .column("title", "character varying")
                    .column("publisher_id", "integer")
                    .primary_key(&["isbn"])
                    .foreign_key(&["publisher_id"], "publisher", &["id"]),
            )
            .with_table(
                TableSchema::new("publisher")
                    .column("id", "integer")
                    .column("name", "character varying")
                    .primary_key(&["id"]),
            )
            .with_table(
                TableSchema::new("review")
                    .column("id", "integer")
                    .column("book_isbn", "character varying")
                    .column("stars", "integer")
                    .primary_key(&["id"])
                    .foreign_key(&["book_isbn"], "book", &["isbn"]),
            )
    }

    fn row(value: Value) -> Row {
        match value {
            Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    fn plan() -> NodePlan {
        let node = Node::new("book")
            .with_columns(&["isbn", "title"])
            .with_rename("title", "name")
            .with_child(Node::new("publisher").with_columns(&["name"]))
            .with_child(Node::new("review").with_columns(&["stars"]));
        NodePlan::build(&node, &schema()).unwrap()
    }

    #[test]
    fn test_compile_nested_tree() {
        let tree = RowTree {
            row: row(json!({"isbn": "001", "title": "It", "publisher_id": 1})),
            children: vec![
                vec![RowTree::new(row(json!({"id": 1, "name": "Penguin"})), 0)],
                vec![
                    RowTree::new(row(json!({"id": 7, "book_isbn": "001", "stars": 5})), 0),
                    RowTree::new(row(json!({"id": 3, "book_isbn": "001", "stars": null})), 0),
                ],
            ],
        };

        let doc = compile(&plan(), "books", &tree).unwrap();
        assert_eq!(doc.identity, "001");
        assert_eq!(
            Value::Object(doc.source.clone()),
            json!({
                "isbn": "001",
                "name": "It",
                "publisher": {"name": "Penguin"},
                "review": [{"stars": 5}, {"stars": null}],
                "_meta": {
                    "publisher": {"id": [1]},
                    "review": {"id": [3, 7]}
                }
            })
        );
        let keys: Vec<&String> = doc.source.keys().collect();
        assert_eq!(keys, vec!["isbn", "name", "publisher", "review", "_meta"]);
    }

    #[test]
    fn test_missing_children_render_empty_containers() {
        let tree = RowTree::new(row(json!({"isbn": "002", "title": null, "publisher_id": null})), 2);
        let doc = compile(&plan(), "books", &tree).unwrap();
        assert_eq!(doc.source["publisher"], json!({}));
        assert_eq!(doc.source["review"], json!([]));
        assert_eq!(doc.source["name"], Value::Null);
        assert_eq!(doc.source["_meta"], json!({}));
    }

    #[test]
    fn test_compile_is_deterministic() {
        let tree = RowTree::new(row(json!({"isbn": "003", "title": "A", "publisher_id": 2})), 2);
        let a = serde_json::to_string(&compile(&plan(), "books", &tree).unwrap()).unwrap();
        let b = serde_json::to_string(&compile(&plan(), "books", &tree).unwrap()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_null_primary_key_is_application_error() {
        let tree = RowTree::new(row(json!({"isbn": null, "title": "A"})), 2);
        let err = compile(&plan(), "books", &tree).unwrap_err();
        assert!(matches!(err, SyncError::Application { .. }));
    }
}
