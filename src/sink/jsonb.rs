// ABOUTME: PostgreSQL JSONB sink - one table per index holding documents as JSONB
// ABOUTME: Handles table creation, upserts, deletes and _meta containment lookups

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::HashSet;
use tokio::sync::Mutex;
use tokio_postgres::error::SqlState;
use tokio_postgres::Client;

use super::{Sink, SinkError};
use crate::document::Document;
use crate::node::META_FIELD;

/// Validate an index name for use as a table name.
///
/// Index names are interpolated into DDL, so only lower-case letters,
/// digits, `_` and `-` are accepted, starting with a letter or `_`.
pub fn validate_index_name(name: &str) -> anyhow::Result<()> {
    if name.is_empty() || name.len() > 63 {
        anyhow::bail!("Index name '{}' must be 1-63 characters", name);
    }
    let mut chars = name.chars();
    let first_ok = chars
        .next()
        .map(|c| c.is_ascii_lowercase() || c == '_')
        .unwrap_or(false);
    if !first_ok || !chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-') {
        anyhow::bail!(
            "Index name '{}' may only contain lower-case letters, digits, '_' and '-'",
            name
        );
    }
    Ok(())
}

/// Documents stored in PostgreSQL, one JSONB table per index:
///
/// - id: TEXT PRIMARY KEY (document identity)
/// - data: JSONB NOT NULL (document source, including `_meta`)
/// - _synced_at: TIMESTAMP NOT NULL DEFAULT NOW()
///
/// Tables are created on first write together with a GIN index on `data`
/// so `_meta` containment lookups stay cheap.
pub struct JsonbSink {
    client: Client,
    ensured: Mutex<HashSet<String>>,
}

impl JsonbSink {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            ensured: Mutex::new(HashSet::new()),
        }
    }

    async fn ensure_table(&self, index: &str) -> Result<(), SinkError> {
        let mut ensured = self.ensured.lock().await;
        if ensured.contains(index) {
            return Ok(());
        }
        validate_index_name(index)?;

        tracing::info!("Creating JSONB table '{}' for index documents", index);
        let create_table_sql = format!(
            r#"
            CREATE TABLE IF NOT EXISTS "{}" (
                id TEXT PRIMARY KEY,
                data JSONB NOT NULL,
                _synced_at TIMESTAMP NOT NULL DEFAULT NOW()
            )
            "#,
            index
        );
        self.client
            .execute(&create_table_sql, &[])
            .await
            .map_err(|e| classify(e, index))?;

        let create_gin_index_sql = format!(
            r#"CREATE INDEX IF NOT EXISTS "idx_{}_data" ON "{}" USING GIN (data jsonb_path_ops)"#,
            index, index
        );
        self.client
            .execute(&create_gin_index_sql, &[])
            .await
            .map_err(|e| classify(e, index))?;

        ensured.insert(index.to_string());
        Ok(())
    }
}

/// Connection-level failures are worth retrying; anything the server
/// rejected for this statement is not.
fn classify(error: tokio_postgres::Error, identity: &str) -> SinkError {
    let transient = match error.code() {
        None => true,
        Some(code) => {
            code.code().starts_with("08")
                || *code == SqlState::T_R_SERIALIZATION_FAILURE
                || *code == SqlState::T_R_DEADLOCK_DETECTED
                || *code == SqlState::ADMIN_SHUTDOWN
                || *code == SqlState::CANNOT_CONNECT_NOW
        }
    };
    if transient || error.is_closed() {
        SinkError::Unavailable(error.to_string())
    } else {
        SinkError::Rejected {
            identity: identity.to_string(),
            reason: error.to_string(),
        }
    }
}

/// `{"_meta": {table: {column: [value]}}}` for a containment query.
fn meta_containment(table: &str, key: &[(String, Value)]) -> Value {
    let mut columns = Map::new();
    for (column, value) in key {
        columns.insert(column.clone(), Value::Array(vec![value.clone()]));
    }
    let mut tables = Map::new();
    tables.insert(table.to_string(), Value::Object(columns));
    let mut meta = Map::new();
    meta.insert(META_FIELD.to_string(), Value::Object(tables));
    Value::Object(meta)
}

#[async_trait]
impl Sink for JsonbSink {
    async fn upsert(&self, document: &Document) -> Result<(), SinkError> {
        self.ensure_table(&document.index).await?;
        let data = Value::Object(document.source.clone());
        let sql = format!(
            r#"INSERT INTO "{}" (id, data) VALUES ($1, $2) ON CONFLICT (id) DO UPDATE SET data = EXCLUDED.data, _synced_at = NOW()"#,
            document.index
        );
        self.client
            .execute(&sql, &[&document.identity, &data])
            .await
            .map_err(|e| classify(e, &document.identity))?;
        Ok(())
    }

    async fn delete(&self, index: &str, identity: &str) -> Result<(), SinkError> {
        self.ensure_table(index).await?;
        let sql = format!(r#"DELETE FROM "{}" WHERE id = $1"#, index);
        self.client
            .execute(&sql, &[&identity])
            .await
            .map_err(|e| classify(e, identity))?;
        Ok(())
    }

    async fn refresh(&self, _index: &str) -> Result<(), SinkError> {
        // Committed rows are immediately visible
        Ok(())
    }

    async fn find_by_meta(
        &self,
        index: &str,
        table: &str,
        key: &[(String, Value)],
    ) -> Result<Option<Vec<String>>, SinkError> {
        self.ensure_table(index).await?;
        let sql = format!(r#"SELECT id FROM "{}" WHERE data @> $1 ORDER BY id"#, index);
        let pattern = meta_containment(table, key);
        let rows = self
            .client
            .query(&sql, &[&pattern])
            .await
            .map_err(|e| classify(e, index))?;
        Ok(Some(rows.iter().map(|row| row.get(0)).collect()))
    }

    async fn identities(&self, index: &str) -> Result<Option<Vec<String>>, SinkError> {
        self.ensure_table(index).await?;
        let sql = format!(r#"SELECT id FROM "{}" ORDER BY id"#, index);
        let rows = self
            .client
            .query(&sql, &[])
            .await
            .map_err(|e| classify(e, index))?;
        Ok(Some(rows.iter().map(|row| row.get(0)).collect()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_validate_index_name() {
        assert!(validate_index_name("books").is_ok());
        assert!(validate_index_name("books_v2-live").is_ok());
        assert!(validate_index_name("Books").is_err());
        assert!(validate_index_name("2books").is_err());
        assert!(validate_index_name("books\"; DROP TABLE x; --").is_err());
        assert!(validate_index_name("").is_err());
    }

    #[test]
    fn test_meta_containment_shape() {
        let pattern = meta_containment("review", &[("id".into(), json!(7))]);
        assert_eq!(pattern, json!({"_meta": {"review": {"id": [7]}}}));
    }
}
