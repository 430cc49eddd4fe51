// ABOUTME: Node plan - a node tree validated against the schema and lowered to an arena
// ABOUTME: Resolves projections, renames, identities and parent/child join columns

use std::collections::{BTreeMap, HashSet};

use super::declaration::Node;
use crate::error::{SyncError, SyncResult};
use crate::schema::{Schema, TableSchema};

/// Reserved source field recording nested identities.
pub const META_FIELD: &str = "_meta";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinKind {
    /// The child table holds a foreign key to the parent: many child rows.
    OneToMany,
    /// The parent table holds a foreign key to the child: at most one row.
    ManyToOne,
}

/// How a plan node's rows relate to its parent's rows.
///
/// `parent_columns[i]` on the parent row equals `child_columns[i]` on the
/// child row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Join {
    pub kind: JoinKind,
    pub parent_columns: Vec<String>,
    pub child_columns: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanNode {
    pub table: String,
    pub label: Option<String>,
    /// Field name under which this node's rows appear in the parent source.
    pub field: String,
    /// Projected columns in schema order.
    pub output_columns: Vec<String>,
    pub renames: BTreeMap<String, String>,
    /// Every column that has to be read: projection, identity and joins.
    pub fetch_columns: Vec<String>,
    pub primary_key: Vec<String>,
    pub parent: Option<usize>,
    pub join: Option<Join>,
    pub children: Vec<usize>,
    pub depth: usize,
}

impl PlanNode {
    pub fn field_name<'a>(&'a self, column: &'a str) -> &'a str {
        self.renames.get(column).map(|s| s.as_str()).unwrap_or(column)
    }
}

/// A validated node tree. `nodes[0]` is the root; children always follow
/// their parent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodePlan {
    nodes: Vec<PlanNode>,
}

impl NodePlan {
    /// Validate `node` against `schema` and build the plan.
    ///
    /// Fails with a structural [`SyncError`] on unknown tables, unknown
    /// columns, missing primary keys, unrelated children or colliding
    /// output fields.
    pub fn build(node: &Node, schema: &Schema) -> SyncResult<Self> {
        let mut nodes = Vec::new();
        add_node(&mut nodes, node, schema, None)?;
        finalize_fetch_columns(&mut nodes, schema);
        Ok(Self { nodes })
    }

    pub fn root(&self) -> &PlanNode {
        &self.nodes[0]
    }

    pub fn node(&self, idx: usize) -> &PlanNode {
        &self.nodes[idx]
    }

    pub fn nodes(&self) -> &[PlanNode] {
        &self.nodes
    }

    /// Plan nodes reading from `table`.
    pub fn nodes_for_table(&self, table: &str) -> Vec<usize> {
        self.nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| n.table == table)
            .map(|(idx, _)| idx)
            .collect()
    }

    pub fn contains_table(&self, table: &str) -> bool {
        self.nodes.iter().any(|n| n.table == table)
    }

    pub fn tables(&self) -> Vec<String> {
        let mut seen = Vec::new();
        for node in &self.nodes {
            if !seen.contains(&node.table) {
                seen.push(node.table.clone());
            }
        }
        seen
    }
}

fn add_node(
    nodes: &mut Vec<PlanNode>,
    node: &Node,
    schema: &Schema,
    parent: Option<usize>,
) -> SyncResult<usize> {
    let table = schema
        .table(&node.table)
        .ok_or_else(|| SyncError::UnknownTable {
            table: node.table.clone(),
        })?;

    if table.primary_key.is_empty() {
        return Err(SyncError::invalid_node(
            &node.table,
            format!("table \"{}\" has no primary key", node.table),
        ));
    }

    let output_columns = resolve_columns(node, table)?;

    for source in node.transform.rename.keys() {
        if !table.is_selectable(source) {
            return Err(SyncError::UnknownColumn {
                column: source.clone(),
                table: node.table.clone(),
            });
        }
    }

    let join = match parent {
        Some(parent_idx) => Some(resolve_join(&nodes[parent_idx].table, table, schema)?),
        None => None,
    };

    let idx = nodes.len();
    nodes.push(PlanNode {
        table: node.table.clone(),
        label: node.label.clone(),
        field: node.table.clone(),
        output_columns,
        renames: node.transform.rename.clone(),
        fetch_columns: Vec::new(),
        primary_key: table.primary_key.clone(),
        parent,
        join,
        children: Vec::new(),
        depth: parent.map(|p| nodes[p].depth + 1).unwrap_or(0),
    });

    for child in &node.children {
        let child_idx = add_node(nodes, child, schema, Some(idx))?;
        nodes[idx].children.push(child_idx);
    }

    check_field_collisions(nodes, idx)?;
    Ok(idx)
}

/// Requested columns ordered by schema position, or every schema column.
fn resolve_columns(node: &Node, table: &TableSchema) -> SyncResult<Vec<String>> {
    if node.columns.is_empty() {
        return Ok(table.column_names());
    }

    let mut columns: Vec<String> = Vec::with_capacity(node.columns.len());
    for column in &node.columns {
        if !table.is_selectable(column) {
            return Err(SyncError::UnknownColumn {
                column: column.clone(),
                table: node.table.clone(),
            });
        }
        if !columns.contains(column) {
            columns.push(column.clone());
        }
    }
    columns.sort_by_key(|c| table.position(c));
    Ok(columns)
}

fn resolve_join(parent_table: &str, child: &TableSchema, schema: &Schema) -> SyncResult<Join> {
    if let Some(fk) = child.foreign_keys_to(parent_table).next() {
        return Ok(Join {
            kind: JoinKind::OneToMany,
            parent_columns: fk.referenced_columns.clone(),
            child_columns: fk.columns.clone(),
        });
    }

    let parent = schema
        .table(parent_table)
        .ok_or_else(|| SyncError::UnknownTable {
            table: parent_table.to_string(),
        })?;
    if let Some(fk) = parent.foreign_keys_to(&child.name).next() {
        return Ok(Join {
            kind: JoinKind::ManyToOne,
            parent_columns: fk.columns.clone(),
            child_columns: fk.referenced_columns.clone(),
        });
    }

    Err(SyncError::RelationshipNotFound {
        parent: parent_table.to_string(),
        child: child.name.clone(),
    })
}

fn check_field_collisions(nodes: &[PlanNode], idx: usize) -> SyncResult<()> {
    let node = &nodes[idx];
    let mut seen: HashSet<&str> = HashSet::new();
    seen.insert(META_FIELD);

    let fields = node
        .output_columns
        .iter()
        .map(|c| node.field_name(c))
        .chain(node.children.iter().map(|c| nodes[*c].field.as_str()));

    for field in fields {
        if !seen.insert(field) {
            return Err(SyncError::invalid_node(
                &node.table,
                format!("output field \"{}\" is produced more than once", field),
            ));
        }
    }
    Ok(())
}

/// Fetch columns: projection plus identity plus every join column this
/// node participates in, in schema order.
fn finalize_fetch_columns(nodes: &mut [PlanNode], schema: &Schema) {
    for idx in 0..nodes.len() {
        let mut needed: Vec<String> = nodes[idx].output_columns.clone();
        needed.extend(nodes[idx].primary_key.iter().cloned());
        if let Some(join) = &nodes[idx].join {
            needed.extend(join.child_columns.iter().cloned());
        }
        for child in nodes[idx].children.clone() {
            if let Some(join) = &nodes[child].join {
                needed.extend(join.parent_columns.iter().cloned());
            }
        }

        let mut fetch: Vec<String> = Vec::with_capacity(needed.len());
        for column in needed {
            if !fetch.contains(&column) {
                fetch.push(column);
            }
        }
        if let Some(table) = schema.table(&nodes[idx].table) {
            fetch.sort_by_key(|c| table.position(c));
        }
        nodes[idx].fetch_columns = fetch;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::TableSchema;

    fn schema() -> Schema {
        Schema::new()
            .with_table(
                TableSchema::new("book")
                    .column("isbn", "character varying")
                    .column("title", "character varying")
                    .column("description", "character varying")
                    .column("copyright", "character varying")
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
            .with_table(
                TableSchema::new("orphan")
                    .column("id", "integer")
                    .primary_key(&["id"]),
            )
    }

    #[test]
    fn test_columns_follow_schema_order() {
        let node = Node::new("book").with_columns(&["title", "isbn"]);
        let plan = NodePlan::build(&node, &schema()).unwrap();
        assert_eq!(plan.root().output_columns, vec!["isbn", "title"]);
    }

    #[test]
    fn test_empty_columns_resolve_to_schema() {
        let plan = NodePlan::build(&Node::new("book"), &schema()).unwrap();
        assert_eq!(
            plan.root().output_columns,
            vec!["isbn", "title", "description", "copyright", "publisher_id"]
        );
    }

    #[test]
    fn test_fetch_columns_include_identity_and_xmin() {
        let node = Node::new("book").with_columns(&["xmin", "title"]);
        let plan = NodePlan::build(&node, &schema()).unwrap();
        assert_eq!(plan.root().output_columns, vec!["title", "xmin"]);
        assert_eq!(plan.root().fetch_columns, vec!["isbn", "title", "xmin"]);
    }

    #[test]
    fn test_unknown_column() {
        let node = Node::new("book").with_columns(&["foo"]);
        let err = NodePlan::build(&node, &schema()).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Column \"foo\" not present on table \"book\""
        );
    }

    #[test]
    fn test_unknown_rename_source() {
        let node = Node::new("book").with_rename("nope", "x");
        assert!(matches!(
            NodePlan::build(&node, &schema()),
            Err(SyncError::UnknownColumn { .. })
        ));
    }

    #[test]
    fn test_joins_resolve_both_directions() {
        let node = Node::new("book")
            .with_child(Node::new("publisher"))
            .with_child(Node::new("review"));
        let plan = NodePlan::build(&node, &schema()).unwrap();

        let publisher = plan.node(1);
        let join = publisher.join.as_ref().unwrap();
        assert_eq!(join.kind, JoinKind::ManyToOne);
        assert_eq!(join.parent_columns, vec!["publisher_id"]);
        assert_eq!(join.child_columns, vec!["id"]);

        let review = plan.node(2);
        let join = review.join.as_ref().unwrap();
        assert_eq!(join.kind, JoinKind::OneToMany);
        assert_eq!(join.parent_columns, vec!["isbn"]);
        assert_eq!(join.child_columns, vec!["book_isbn"]);
        assert_eq!(plan.nodes_for_table("review"), vec![2]);
    }

    #[test]
    fn test_parent_fetches_join_columns_even_when_not_projected() {
        let node = Node::new("book")
            .with_columns(&["title"])
            .with_child(Node::new("publisher"));
        let plan = NodePlan::build(&node, &schema()).unwrap();
        assert_eq!(
            plan.root().fetch_columns,
            vec!["isbn", "title", "publisher_id"]
        );
    }

    #[test]
    fn test_unrelated_child_fails() {
        let node = Node::new("book").with_child(Node::new("orphan"));
        assert!(matches!(
            NodePlan::build(&node, &schema()),
            Err(SyncError::RelationshipNotFound { .. })
        ));
    }

    #[test]
    fn test_rename_collision_fails() {
        let node = Node::new("book")
            .with_columns(&["isbn", "title"])
            .with_rename("isbn", "title");
        assert!(matches!(
            NodePlan::build(&node, &schema()),
            Err(SyncError::InvalidNode { .. })
        ));
    }

    #[test]
    fn test_unknown_table() {
        assert!(matches!(
            NodePlan::build(&Node::new("magazine"), &schema()),
            Err(SyncError::UnknownTable { .. })
        ));
    }
}
