// ABOUTME: Row fetching for node plans - loads root rows and batch-joins child rows
// ABOUTME: Produces row trees that the compiler folds into documents

use anyhow::{Context, Result};
use futures::future::BoxFuture;
use serde_json::Value;
use std::collections::{HashMap, HashSet};

use crate::node::NodePlan;
use crate::session::{compare_tuples, transaction, tuple_of, Filter, Row, Select, Session};

/// Upper bound on key tuples sent in a single child query.
const CHILD_KEY_CHUNK: usize = 500;

/// A fetched row and its joined child rows.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RowTree {
    pub row: Row,
    /// One entry per child of the plan node, in plan order.
    pub children: Vec<Vec<RowTree>>,
}

impl RowTree {
    pub fn new(row: Row, child_slots: usize) -> Self {
        Self {
            row,
            children: vec![Vec::new(); child_slots],
        }
    }
}

/// Fetch every root row matching `filter` together with its subtree.
///
/// All queries run inside one transaction scope so parents and children
/// come from the same snapshot.
pub async fn fetch_roots<S>(session: &S, plan: &NodePlan, filter: Filter) -> Result<Vec<RowTree>>
where
    S: Session + ?Sized,
{
    if filter.is_empty() {
        return Ok(Vec::new());
    }
    let root = plan.root();
    let select = Select::from(root.table.clone())
        .columns(&root.fetch_columns)
        .filter(filter)
        .order_by(&root.primary_key);
    fetch_tree(session, plan, select).await
}

/// Paged scan over every root row, ordered by primary key.
///
/// Each scan keeps its own cursor; start a new one to restart from the
/// beginning.
#[derive(Debug, Clone)]
pub struct RootScan {
    batch_size: usize,
    cursor: Option<Vec<Value>>,
    exhausted: bool,
}

impl RootScan {
    pub fn new(batch_size: usize) -> Self {
        Self {
            batch_size: batch_size.max(1),
            cursor: None,
            exhausted: false,
        }
    }

    /// Next page of row trees, or `None` once the table is exhausted.
    pub async fn next_page<S>(
        &mut self,
        session: &S,
        plan: &NodePlan,
    ) -> Result<Option<Vec<RowTree>>>
    where
        S: Session + ?Sized,
    {
        if self.exhausted {
            return Ok(None);
        }

        let root = plan.root();
        let select = Select::from(root.table.clone())
            .columns(&root.fetch_columns)
            .order_by(&root.primary_key)
            .after(self.cursor.clone())
            .limit(self.batch_size);
        let page = fetch_tree(session, plan, select).await?;

        if page.len() < self.batch_size {
            self.exhausted = true;
        }
        match page.last() {
            Some(last) => self.cursor = Some(tuple_of(&last.row, &root.primary_key)),
            None => return Ok(None),
        }
        Ok(Some(page))
    }
}

async fn fetch_tree<S>(session: &S, plan: &NodePlan, select: Select) -> Result<Vec<RowTree>>
where
    S: Session + ?Sized,
{
    let table = select.table.clone();
    transaction(session, |s| {
        Box::pin(async move {
            let rows = s
                .execute(select.into())
                .await
                .with_context(|| format!("Failed to read rows from {}", table))?;
            let slots = plan.root().children.len();
            let mut trees: Vec<RowTree> = rows.into_iter().map(|r| RowTree::new(r, slots)).collect();
            attach_children(s, plan, 0, &mut trees).await?;
            Ok::<_, anyhow::Error>(trees)
        })
    })
    .await
}

fn attach_children<'a, S>(
    session: &'a S,
    plan: &'a NodePlan,
    idx: usize,
    trees: &'a mut [RowTree],
) -> BoxFuture<'a, Result<()>>
where
    S: Session + ?Sized,
{
    Box::pin(async move {
        if trees.is_empty() {
            return Ok(());
        }

        for (slot, &child_idx) in plan.node(idx).children.iter().enumerate() {
            let child = plan.node(child_idx);
            let join = match &child.join {
                Some(join) => join,
                None => continue,
            };

            let mut keys: Vec<Vec<Value>> = Vec::new();
            let mut seen: HashSet<String> = HashSet::new();
            for tree in trees.iter() {
                let key = tuple_of(&tree.row, &join.parent_columns);
                if key.iter().any(Value::is_null) {
                    continue;
                }
                if seen.insert(key_string(&key)) {
                    keys.push(key);
                }
            }

            let mut child_trees: Vec<RowTree> = Vec::new();
            for chunk in keys.chunks(CHILD_KEY_CHUNK) {
                let select = Select::from(child.table.clone())
                    .columns(&child.fetch_columns)
                    .filter(Filter::In {
                        columns: join.child_columns.clone(),
                        tuples: chunk.to_vec(),
                    })
                    .order_by(&child.primary_key);
                let rows = session
                    .execute(select.into())
                    .await
                    .with_context(|| format!("Failed to read rows from {}", child.table))?;
                let slots = child.children.len();
                child_trees.extend(rows.into_iter().map(|r| RowTree::new(r, slots)));
            }
            // Different key chunks may interleave primary keys.
            child_trees.sort_by(|a, b| {
                compare_tuples(
                    &tuple_of(&a.row, &child.primary_key),
                    &tuple_of(&b.row, &child.primary_key),
                )
            });

            attach_children(session, plan, child_idx, &mut child_trees).await?;

            let mut grouped: HashMap<String, Vec<RowTree>> = HashMap::new();
            for tree in child_trees {
                let key = key_string(&tuple_of(&tree.row, &join.child_columns));
                grouped.entry(key).or_default().push(tree);
            }

            for tree in trees.iter_mut() {
                let key = key_string(&tuple_of(&tree.row, &join.parent_columns));
                tree.children[slot] = grouped.get(&key).cloned().unwrap_or_default();
            }
        }
        Ok(())
    })
}

fn key_string(tuple: &[Value]) -> String {
    Value::Array(tuple.to_vec()).to_string()
}
