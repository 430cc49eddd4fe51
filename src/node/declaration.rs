// ABOUTME: Node declaration parsing - the user-facing description of a document
// ABOUTME: Rejects unknown attributes and missing tables before any row is read

use serde_json::{Map, Value};
use std::collections::BTreeMap;

use crate::error::{SyncError, SyncResult};

/// Attributes a node may carry. Anything else is a structural error.
pub const NODE_ATTRIBUTES: &[&str] = &["table", "columns", "children", "transform", "label"];

/// Transform rules recognised under `transform`.
pub const TRANSFORM_RULES: &[&str] = &["rename"];

/// Field-level rewrites applied after projection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Transform {
    /// Source column name -> output field name.
    pub rename: BTreeMap<String, String>,
}

impl Transform {
    pub fn is_empty(&self) -> bool {
        self.rename.is_empty()
    }

    /// Output name for `column`.
    pub fn field_name<'a>(&'a self, column: &'a str) -> &'a str {
        self.rename.get(column).map(|s| s.as_str()).unwrap_or(column)
    }
}

/// One level of a node tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub table: String,
    /// Requested columns; empty means every column of the table.
    pub columns: Vec<String>,
    pub children: Vec<Node>,
    pub transform: Transform,
    /// Informational only.
    pub label: Option<String>,
}

impl Node {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            columns: Vec::new(),
            children: Vec::new(),
            transform: Transform::default(),
            label: None,
        }
    }

    pub fn with_columns(mut self, columns: &[&str]) -> Self {
        self.columns = columns.iter().map(|c| c.to_string()).collect();
        self
    }

    pub fn with_child(mut self, child: Node) -> Self {
        self.children.push(child);
        self
    }

    pub fn with_rename(mut self, from: &str, to: &str) -> Self {
        self.transform.rename.insert(from.to_string(), to.to_string());
        self
    }

    /// Parse a raw JSON declaration.
    pub fn from_value(value: &Value) -> SyncResult<Self> {
        parse_node(value, "root")
    }

    pub fn from_json_str(raw: &str) -> SyncResult<Self> {
        let value: Value = serde_json::from_str(raw)
            .map_err(|e| SyncError::invalid_node("root", format!("malformed JSON: {}", e)))?;
        Self::from_value(&value)
    }

    /// Every table referenced by this node and its descendants, root first.
    pub fn tables(&self) -> Vec<String> {
        let mut out = Vec::new();
        self.collect_tables(&mut out);
        out
    }

    fn collect_tables(&self, out: &mut Vec<String>) {
        if !out.contains(&self.table) {
            out.push(self.table.clone());
        }
        for child in &self.children {
            child.collect_tables(out);
        }
    }
}

impl TryFrom<Value> for Node {
    type Error = SyncError;

    fn try_from(value: Value) -> SyncResult<Self> {
        Node::from_value(&value)
    }
}

fn parse_node(value: &Value, path: &str) -> SyncResult<Node> {
    let object = value
        .as_object()
        .ok_or_else(|| SyncError::invalid_node(path, "a node must be an object"))?;

    // Attribute check comes first so a typo is reported even when `table`
    // is also missing.
    for key in object.keys() {
        if !NODE_ATTRIBUTES.contains(&key.as_str()) {
            return Err(SyncError::UnknownAttribute {
                path: path.to_string(),
                attribute: key.clone(),
            });
        }
    }

    let table = match object.get("table") {
        None | Some(Value::Null) => {
            return Err(SyncError::MissingTable {
                path: path.to_string(),
            })
        }
        Some(Value::String(table)) if !table.is_empty() => table.clone(),
        Some(_) => {
            return Err(SyncError::invalid_node(
                path,
                "\"table\" must be a non-empty string",
            ))
        }
    };
    let path = format!("{}({})", path, table);

    let columns = parse_columns(object, &path)?;
    let transform = parse_transform(object, &path)?;

    let label = match object.get("label") {
        None | Some(Value::Null) => None,
        Some(Value::String(label)) => Some(label.clone()),
        Some(_) => return Err(SyncError::invalid_node(&path, "\"label\" must be a string")),
    };

    let children = match object.get("children") {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(items)) => items
            .iter()
            .enumerate()
            .map(|(idx, child)| parse_node(child, &format!("{}.children[{}]", path, idx)))
            .collect::<SyncResult<Vec<_>>>()?,
        Some(_) => {
            return Err(SyncError::invalid_node(
                &path,
                "\"children\" must be an array of nodes",
            ))
        }
    };

    Ok(Node {
        table,
        columns,
        children,
        transform,
        label,
    })
}

fn parse_columns(object: &Map<String, Value>, path: &str) -> SyncResult<Vec<String>> {
    match object.get("columns") {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| {
                item.as_str().map(str::to_string).ok_or_else(|| {
                    SyncError::invalid_node(path, "\"columns\" entries must be strings")
                })
            })
            .collect(),
        Some(_) => Err(SyncError::invalid_node(
            path,
            "\"columns\" must be an array of strings",
        )),
    }
}

fn parse_transform(object: &Map<String, Value>, path: &str) -> SyncResult<Transform> {
    let rules = match object.get("transform") {
        None | Some(Value::Null) => return Ok(Transform::default()),
        Some(Value::Object(rules)) => rules,
        Some(_) => {
            return Err(SyncError::invalid_node(
                path,
                "\"transform\" must be an object",
            ))
        }
    };

    let mut transform = Transform::default();
    for (rule, body) in rules {
        if !TRANSFORM_RULES.contains(&rule.as_str()) {
            return Err(SyncError::invalid_node(
                path,
                format!("unknown transform rule \"{}\"", rule),
            ));
        }
        let renames = body.as_object().ok_or_else(|| {
            SyncError::invalid_node(path, "\"transform.rename\" must map column names to strings")
        })?;
        for (from, to) in renames {
            let to = to.as_str().filter(|s| !s.is_empty()).ok_or_else(|| {
                SyncError::invalid_node(
                    path,
                    format!("rename target for \"{}\" must be a non-empty string", from),
                )
            })?;
            transform.rename.insert(from.clone(), to.to_string());
        }
    }
    Ok(transform)
}
