// ABOUTME: PostgreSQL schema catalog - columns, primary keys and foreign keys per table
// ABOUTME: Reads information_schema and pg_catalog for one schema

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tokio_postgres::Client;

use crate::schema::{ColumnSchema, ForeignKey, SchemaCatalog, TableSchema};

/// Describes tables in one PostgreSQL schema.
pub struct PgCatalog {
    client: Arc<Client>,
    schema: String,
}

impl PgCatalog {
    pub fn new(client: Arc<Client>, schema: impl Into<String>) -> Self {
        Self {
            client,
            schema: schema.into(),
        }
    }

    async fn columns(&self, table: &str) -> Result<Vec<ColumnSchema>> {
        let rows = self
            .client
            .query(
                "SELECT column_name, data_type
                 FROM information_schema.columns
                 WHERE table_schema = $1 AND table_name = $2
                 ORDER BY ordinal_position",
                &[&self.schema, &table],
            )
            .await
            .with_context(|| format!("Failed to get columns for {}.{}", self.schema, table))?;

        Ok(rows
            .iter()
            .map(|row| ColumnSchema::new(row.get::<_, String>(0), row.get::<_, String>(1)))
            .collect())
    }

    async fn primary_key(&self, table: &str) -> Result<Vec<String>> {
        let rows = self
            .client
            .query(
                "SELECT a.attname
                 FROM pg_index i
                 JOIN pg_attribute a ON a.attrelid = i.indrelid AND a.attnum = ANY(i.indkey)
                 JOIN pg_class c ON c.oid = i.indrelid
                 JOIN pg_namespace n ON n.oid = c.relnamespace
                 WHERE i.indisprimary
                   AND n.nspname = $1
                   AND c.relname = $2
                 ORDER BY array_position(i.indkey, a.attnum)",
                &[&self.schema, &table],
            )
            .await
            .with_context(|| format!("Failed to get primary key for {}.{}", self.schema, table))?;

        Ok(rows.iter().map(|row| row.get(0)).collect())
    }

    async fn foreign_keys(&self, table: &str) -> Result<Vec<ForeignKey>> {
        let rows = self
            .client
            .query(
                "SELECT con.conname::text, att.attname::text, ref_class.relname::text, ref_att.attname::text
                 FROM pg_constraint con
                 JOIN pg_class cls ON cls.oid = con.conrelid
                 JOIN pg_namespace ns ON ns.oid = cls.relnamespace
                 JOIN pg_class ref_class ON ref_class.oid = con.confrelid
                 CROSS JOIN LATERAL unnest(con.conkey, con.confkey)
                     WITH ORDINALITY AS k(attnum, ref_attnum, ord)
                 JOIN pg_attribute att ON att.attrelid = con.conrelid AND att.attnum = k.attnum
                 JOIN pg_attribute ref_att ON ref_att.attrelid = con.confrelid AND ref_att.attnum = k.ref_attnum
                 WHERE con.contype = 'f'
                   AND ns.nspname = $1
                   AND cls.relname = $2
                 ORDER BY con.conname, k.ord",
                &[&self.schema, &table],
            )
            .await
            .with_context(|| format!("Failed to get foreign keys for {}.{}", self.schema, table))?;

        let mut keys: Vec<(String, ForeignKey)> = Vec::new();
        for row in &rows {
            let name: String = row.get(0);
            let column: String = row.get(1);
            let referenced_table: String = row.get(2);
            let referenced_column: String = row.get(3);
            match keys.last_mut() {
                Some((last, fk)) if *last == name => {
                    fk.columns.push(column);
                    fk.referenced_columns.push(referenced_column);
                }
                _ => keys.push((
                    name,
                    ForeignKey {
                        columns: vec![column],
                        referenced_table,
                        referenced_columns: vec![referenced_column],
                    },
                )),
            }
        }
        Ok(keys.into_iter().map(|(_, fk)| fk).collect())
    }
}

#[async_trait]
impl SchemaCatalog for PgCatalog {
    async fn describe_table(&self, table: &str) -> Result<Option<TableSchema>> {
        let columns = self.columns(table).await?;
        if columns.is_empty() {
            return Ok(None);
        }
        let mut described = TableSchema::new(table);
        described.columns = columns;
        described.primary_key = self.primary_key(table).await?;
        described.foreign_keys = self.foreign_keys(table).await?;
        tracing::debug!(
            "Described {}.{}: {} columns, primary key {:?}, {} foreign keys",
            self.schema,
            table,
            described.columns.len(),
            described.primary_key,
            described.foreign_keys.len()
        );
        Ok(Some(described))
    }
}
