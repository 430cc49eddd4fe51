// ABOUTME: Relational session abstraction - structured queries, txids and scoped transactions
// ABOUTME: Implemented by the PostgreSQL adapter and the in-memory database

use anyhow::Result;
use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::Value;
use std::cmp::Ordering;

use crate::sync::change::Txid;

/// A row keyed by column name. Column order follows the query projection.
pub type Row = serde_json::Map<String, Value>;

/// Row predicate for [`Select`].
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    All,
    /// Rows whose `columns` tuple equals one of `tuples`.
    In {
        columns: Vec<String>,
        tuples: Vec<Vec<Value>>,
    },
}

impl Filter {
    pub fn eq(columns: &[String], values: Vec<Value>) -> Self {
        Filter::In {
            columns: columns.to_vec(),
            tuples: vec![values],
        }
    }

    pub fn matches(&self, row: &Row) -> bool {
        match self {
            Filter::All => true,
            Filter::In { columns, tuples } => tuples.iter().any(|tuple| {
                columns.iter().zip(tuple).all(|(column, expected)| {
                    let actual = row.get(column).unwrap_or(&Value::Null);
                    values_match(actual, expected)
                })
            }),
        }
    }

    /// True when the filter can never match.
    pub fn is_empty(&self) -> bool {
        matches!(self, Filter::In { tuples, .. } if tuples.is_empty())
    }
}

/// A projection over one table.
#[derive(Debug, Clone, PartialEq)]
pub struct Select {
    pub table: String,
    pub columns: Vec<String>,
    pub filter: Filter,
    pub order_by: Vec<String>,
    /// Keyset cursor: only rows whose `order_by` tuple sorts after this one.
    pub after: Option<Vec<Value>>,
    pub limit: Option<usize>,
}

impl Select {
    pub fn from(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            columns: Vec::new(),
            filter: Filter::All,
            order_by: Vec::new(),
            after: None,
            limit: None,
        }
    }

    pub fn columns(mut self, columns: &[String]) -> Self {
        self.columns = columns.to_vec();
        self
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filter = filter;
        self
    }

    pub fn order_by(mut self, columns: &[String]) -> Self {
        self.order_by = columns.to_vec();
        self
    }

    pub fn after(mut self, cursor: Option<Vec<Value>>) -> Self {
        self.after = cursor;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// Statements a [`Session`] executes.
#[derive(Debug, Clone, PartialEq)]
pub enum Query {
    Select(Select),
    Insert {
        table: String,
        row: Row,
    },
    /// Update the row identified by `key` (primary-key columns).
    Update {
        table: String,
        key: Row,
        values: Row,
    },
    Delete {
        table: String,
        key: Row,
    },
}

impl From<Select> for Query {
    fn from(select: Select) -> Self {
        Query::Select(select)
    }
}

/// A connection to the relational source.
///
/// Sessions track their own transaction depth: `begin` opens a transaction
/// at depth zero and a savepoint above it. Use [`transaction`] rather than
/// calling `begin`/`commit`/`rollback` by hand.
#[async_trait]
pub trait Session: Send + Sync {
    /// Execute a statement. Selects return matching rows; writes return the
    /// affected rows as they look after the statement.
    async fn execute(&self, query: Query) -> Result<Vec<Row>>;

    /// Highest transaction id whose effects are final.
    async fn current_transaction_id(&self) -> Result<Txid>;

    async fn begin(&self) -> Result<()>;

    async fn commit(&self) -> Result<()>;

    async fn rollback(&self) -> Result<()>;

    /// A scope was dropped without finishing. The innermost open scope must
    /// be rolled back before the next statement runs.
    fn abandon(&self);
}

/// Run `body` inside a transaction scope.
///
/// Commits when `body` returns `Ok`, rolls back when it returns `Err`. If
/// the returned future is dropped mid-scope the session is told to abandon
/// the scope. Nested calls become savepoints.
pub async fn transaction<'s, S, T, F>(session: &'s S, body: F) -> Result<T>
where
    S: Session + ?Sized,
    F: FnOnce(&'s S) -> BoxFuture<'s, Result<T>>,
{
    session.begin().await?;
    let mut guard = ScopeGuard {
        session,
        armed: true,
    };

    let result = body(session).await;
    let finished = match result {
        Ok(value) => session.commit().await.map(|_| value),
        Err(e) => {
            if let Err(rollback_err) = session.rollback().await {
                tracing::warn!("Rollback failed after error: {:#}", rollback_err);
            }
            Err(e)
        }
    };
    guard.armed = false;
    finished
}

struct ScopeGuard<'a, S: Session + ?Sized> {
    session: &'a S,
    armed: bool,
}

impl<S: Session + ?Sized> Drop for ScopeGuard<'_, S> {
    fn drop(&mut self) {
        if self.armed {
            self.session.abandon();
        }
    }
}

/// Total order over JSON scalars used for keyset paging and `_meta` sorting.
///
/// Null sorts first, then booleans, numbers, strings, arrays and objects.
pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    fn rank(v: &Value) -> u8 {
        match v {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Number(_) => 2,
            Value::String(_) => 3,
            Value::Array(_) => 4,
            Value::Object(_) => 5,
        }
    }

    match (a, b) {
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Number(x), Value::Number(y)) => match (x.as_i64(), y.as_i64()) {
            (Some(x), Some(y)) => x.cmp(&y),
            _ => {
                let x = x.as_f64().unwrap_or(f64::NAN);
                let y = y.as_f64().unwrap_or(f64::NAN);
                x.partial_cmp(&y).unwrap_or(Ordering::Equal)
            }
        },
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Array(_), Value::Array(_)) | (Value::Object(_), Value::Object(_)) => {
            a.to_string().cmp(&b.to_string())
        }
        _ => rank(a).cmp(&rank(b)),
    }
}

/// Equality as an untyped SQL literal sees it: a string matches a scalar
/// whose text form is the same. Null never matches.
pub fn values_match(actual: &Value, expected: &Value) -> bool {
    if actual.is_null() || expected.is_null() {
        return false;
    }
    match (actual, expected) {
        (Value::String(text), other @ (Value::Number(_) | Value::Bool(_)))
        | (other @ (Value::Number(_) | Value::Bool(_)), Value::String(text)) => {
            other.to_string() == *text
        }
        _ => compare_values(actual, expected) == Ordering::Equal,
    }
}

/// Lexicographic [`compare_values`] over tuples.
pub fn compare_tuples(a: &[Value], b: &[Value]) -> Ordering {
    for (x, y) in a.iter().zip(b) {
        match compare_values(x, y) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    a.len().cmp(&b.len())
}

/// Values of `columns` in `row`, missing columns as null.
pub fn tuple_of(row: &Row, columns: &[String]) -> Vec<Value> {
    columns
        .iter()
        .map(|c| row.get(c).cloned().unwrap_or(Value::Null))
        .collect()
}
