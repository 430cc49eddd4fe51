// ABOUTME: PostgreSQL session - renders structured queries to SQL and decodes rows to JSON
// ABOUTME: Tracks transaction depth so nested scopes become savepoints

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::{Number, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio_postgres::types::Type;
use tokio_postgres::Client;

use crate::session::{Filter, Query, Row, Select, Session};
use crate::sync::change::Txid;
use crate::utils::{quote_ident, quote_literal};

/// A [`Session`] over one PostgreSQL connection.
pub struct PgSession {
    client: Client,
    schema: String,
    depth: AtomicUsize,
    /// Scopes dropped mid-flight, rolled back before the next statement.
    abandoned: AtomicUsize,
}

impl PgSession {
    pub fn new(client: Client, schema: impl Into<String>) -> Self {
        Self {
            client,
            schema: schema.into(),
            depth: AtomicUsize::new(0),
            abandoned: AtomicUsize::new(0),
        }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    async fn settle_abandoned(&self) -> Result<()> {
        while self.abandoned.load(Ordering::SeqCst) > 0 {
            self.abandoned.fetch_sub(1, Ordering::SeqCst);
            tracing::debug!("Rolling back abandoned transaction scope");
            self.rollback().await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Session for PgSession {
    async fn execute(&self, query: Query) -> Result<Vec<Row>> {
        self.settle_abandoned().await?;
        let sql = render_query(&self.schema, &query);
        tracing::trace!(sql = %sql, "executing");
        let rows = self
            .client
            .query(sql.as_str(), &[])
            .await
            .with_context(|| format!("Query failed: {}", sql))?;
        rows.iter().map(row_to_json).collect()
    }

    async fn current_transaction_id(&self) -> Result<Txid> {
        self.settle_abandoned().await?;
        // Every transaction below the snapshot xmin has finished, so the
        // window never covers one that could still commit.
        let row = self
            .client
            .query_one(
                "SELECT txid_snapshot_xmin(txid_current_snapshot())::text::bigint",
                &[],
            )
            .await
            .context("Failed to read transaction snapshot")?;
        let xmin: i64 = row.get(0);
        Ok(Txid((xmin as u64).saturating_sub(1)))
    }

    async fn begin(&self) -> Result<()> {
        self.settle_abandoned().await?;
        let depth = self.depth.load(Ordering::SeqCst);
        let sql = if depth == 0 {
            "BEGIN ISOLATION LEVEL REPEATABLE READ".to_string()
        } else {
            format!("SAVEPOINT {}", savepoint_name(depth))
        };
        self.client
            .batch_execute(&sql)
            .await
            .with_context(|| format!("Failed to open transaction scope ({})", sql))?;
        self.depth.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn commit(&self) -> Result<()> {
        let depth = self.depth.load(Ordering::SeqCst);
        if depth == 0 {
            anyhow::bail!("commit without an open transaction");
        }
        let sql = if depth == 1 {
            "COMMIT".to_string()
        } else {
            format!("RELEASE SAVEPOINT {}", savepoint_name(depth - 1))
        };
        self.depth.fetch_sub(1, Ordering::SeqCst);
        self.client
            .batch_execute(&sql)
            .await
            .with_context(|| format!("Failed to commit transaction scope ({})", sql))
    }

    async fn rollback(&self) -> Result<()> {
        let depth = self.depth.load(Ordering::SeqCst);
        if depth == 0 {
            anyhow::bail!("rollback without an open transaction");
        }
        let sql = if depth == 1 {
            "ROLLBACK".to_string()
        } else {
            let name = savepoint_name(depth - 1);
            format!("ROLLBACK TO SAVEPOINT {0}; RELEASE SAVEPOINT {0}", name)
        };
        self.depth.fetch_sub(1, Ordering::SeqCst);
        self.client
            .batch_execute(&sql)
            .await
            .with_context(|| format!("Failed to roll back transaction scope ({})", sql))
    }

    fn abandon(&self) {
        self.abandoned.fetch_add(1, Ordering::SeqCst);
    }
}

fn savepoint_name(depth: usize) -> String {
    format!("replicator_sp_{}", depth)
}

fn qualified(schema: &str, table: &str) -> String {
    format!("{}.{}", quote_ident(schema), quote_ident(table))
}

/// Render a JSON value as an untyped SQL literal; the server infers the
/// column type from context.
pub fn render_literal(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::String(s) => quote_literal(s),
        other => quote_literal(&other.to_string()),
    }
}

fn render_tuple(columns: &[String]) -> String {
    let quoted: Vec<String> = columns.iter().map(|c| quote_ident(c)).collect();
    if quoted.len() == 1 {
        quoted.join("")
    } else {
        format!("({})", quoted.join(", "))
    }
}

fn render_values(values: &[Value]) -> String {
    let rendered: Vec<String> = values.iter().map(render_literal).collect();
    if rendered.len() == 1 {
        rendered.join("")
    } else {
        format!("({})", rendered.join(", "))
    }
}

fn render_projection(columns: &[String]) -> String {
    if columns.is_empty() {
        return "*".to_string();
    }
    columns
        .iter()
        .map(|c| {
            if c == "xmin" {
                "xmin::text::bigint AS \"xmin\"".to_string()
            } else {
                quote_ident(c)
            }
        })
        .collect::<Vec<_>>()
        .join(", ")
}

/// `WHERE` clause for a key equality; an empty key matches nothing.
fn render_key(key: &Row) -> String {
    if key.is_empty() {
        return "FALSE".to_string();
    }
    key.iter()
        .map(|(column, value)| format!("{} = {}", quote_ident(column), render_literal(value)))
        .collect::<Vec<_>>()
        .join(" AND ")
}

pub fn render_select(schema: &str, select: &Select) -> String {
    let mut sql = format!(
        "SELECT {} FROM {}",
        render_projection(&select.columns),
        qualified(schema, &select.table)
    );

    let mut conditions = Vec::new();
    if let Filter::In { columns, tuples } = &select.filter {
        if tuples.is_empty() {
            conditions.push("FALSE".to_string());
        } else {
            let values: Vec<String> = tuples.iter().map(|t| render_values(t)).collect();
            conditions.push(format!("{} IN ({})", render_tuple(columns), values.join(", ")));
        }
    }
    if let Some(after) = &select.after {
        conditions.push(format!(
            "({}) > ({})",
            select
                .order_by
                .iter()
                .map(|c| quote_ident(c))
                .collect::<Vec<_>>()
                .join(", "),
            after.iter().map(render_literal).collect::<Vec<_>>().join(", ")
        ));
    }
    if !conditions.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&conditions.join(" AND "));
    }

    if !select.order_by.is_empty() {
        let order: Vec<String> = select.order_by.iter().map(|c| quote_ident(c)).collect();
        sql.push_str(" ORDER BY ");
        sql.push_str(&order.join(", "));
    }
    if let Some(limit) = select.limit {
        sql.push_str(&format!(" LIMIT {}", limit));
    }
    sql
}

pub fn render_query(schema: &str, query: &Query) -> String {
    match query {
        Query::Select(select) => render_select(schema, select),
        Query::Insert { table, row } => {
            let columns: Vec<String> = row.keys().map(|c| quote_ident(c)).collect();
            let values: Vec<String> = row.values().map(render_literal).collect();
            format!(
                "INSERT INTO {} ({}) VALUES ({}) RETURNING *",
                qualified(schema, table),
                columns.join(", "),
                values.join(", ")
            )
        }
        Query::Update { table, key, values } => {
            let assignments: Vec<String> = values
                .iter()
                .map(|(column, value)| format!("{} = {}", quote_ident(column), render_literal(value)))
                .collect();
            format!(
                "UPDATE {} SET {} WHERE {} RETURNING *",
                qualified(schema, table),
                assignments.join(", "),
                render_key(key)
            )
        }
        Query::Delete { table, key } => format!(
            "DELETE FROM {} WHERE {} RETURNING *",
            qualified(schema, table),
            render_key(key)
        ),
    }
}

/// Decode a result row into JSON, keeping column order.
///
/// Integers, floats, booleans and JSON map to their JSON counterparts;
/// numerics become strings so no precision is lost; temporal types use ISO
/// 8601. Anything else is read as text when the server can provide it.
pub fn row_to_json(row: &tokio_postgres::Row) -> Result<Row> {
    let mut out = Row::new();
    for (idx, column) in row.columns().iter().enumerate() {
        let value = column_value(row, idx, column.type_())
            .with_context(|| format!("Failed to decode column {}", column.name()))?;
        out.insert(column.name().to_string(), value);
    }
    Ok(out)
}

fn column_value(row: &tokio_postgres::Row, idx: usize, ty: &Type) -> Result<Value> {
    let value = match *ty {
        Type::INT2 => row.try_get::<_, Option<i16>>(idx)?.map(Value::from),
        Type::INT4 => row.try_get::<_, Option<i32>>(idx)?.map(Value::from),
        Type::INT8 => row.try_get::<_, Option<i64>>(idx)?.map(Value::from),
        Type::FLOAT4 => row
            .try_get::<_, Option<f32>>(idx)?
            .and_then(|f| Number::from_f64(f as f64))
            .map(Value::Number),
        Type::FLOAT8 => row
            .try_get::<_, Option<f64>>(idx)?
            .and_then(Number::from_f64)
            .map(Value::Number),
        Type::BOOL => row.try_get::<_, Option<bool>>(idx)?.map(Value::Bool),
        Type::JSON | Type::JSONB => row.try_get::<_, Option<Value>>(idx)?,
        Type::NUMERIC => row
            .try_get::<_, Option<rust_decimal::Decimal>>(idx)?
            .map(|d| Value::String(d.to_string())),
        Type::UUID => row
            .try_get::<_, Option<uuid::Uuid>>(idx)?
            .map(|u| Value::String(u.to_string())),
        Type::TIMESTAMP => row
            .try_get::<_, Option<chrono::NaiveDateTime>>(idx)?
            .map(|t| Value::String(t.format("%Y-%m-%dT%H:%M:%S%.f").to_string())),
        Type::TIMESTAMPTZ => row
            .try_get::<_, Option<chrono::DateTime<chrono::Utc>>>(idx)?
            .map(|t| Value::String(t.to_rfc3339())),
        Type::DATE => row
            .try_get::<_, Option<chrono::NaiveDate>>(idx)?
            .map(|d| Value::String(d.to_string())),
        _ => row
            .try_get::<_, Option<String>>(idx)
            .ok()
            .flatten()
            .map(Value::String),
    };
    Ok(value.unwrap_or(Value::Null))
}
