// ABOUTME: Schema catalog - table columns, primary keys and foreign keys
// ABOUTME: Loaded from the relational source and cached process-wide with invalidation

use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// System columns that may be requested explicitly but are never part of
/// the "all columns" default.
pub const SYSTEM_COLUMNS: &[&str] = &["xmin"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnSchema {
    pub name: String,
    pub data_type: String,
}

impl ColumnSchema {
    pub fn new(name: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
        }
    }
}

/// A foreign key from this table's `columns` to `referenced_columns` on
/// `referenced_table`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForeignKey {
    pub columns: Vec<String>,
    pub referenced_table: String,
    pub referenced_columns: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSchema {
    pub name: String,
    /// Columns in ordinal position order.
    pub columns: Vec<ColumnSchema>,
    pub primary_key: Vec<String>,
    pub foreign_keys: Vec<ForeignKey>,
}

impl TableSchema {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            columns: Vec::new(),
            primary_key: Vec::new(),
            foreign_keys: Vec::new(),
        }
    }

    pub fn column(mut self, name: &str, data_type: &str) -> Self {
        self.columns.push(ColumnSchema::new(name, data_type));
        self
    }

    pub fn primary_key(mut self, columns: &[&str]) -> Self {
        self.primary_key = columns.iter().map(|c| c.to_string()).collect();
        self
    }

    pub fn foreign_key(mut self, columns: &[&str], table: &str, referenced: &[&str]) -> Self {
        self.foreign_keys.push(ForeignKey {
            columns: columns.iter().map(|c| c.to_string()).collect(),
            referenced_table: table.to_string(),
            referenced_columns: referenced.iter().map(|c| c.to_string()).collect(),
        });
        self
    }

    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.columns.iter().any(|c| c.name == name)
    }

    /// True for regular columns and selectable system columns.
    pub fn is_selectable(&self, name: &str) -> bool {
        self.has_column(name) || SYSTEM_COLUMNS.contains(&name)
    }

    /// Ordinal position used to order requested columns; system columns
    /// sort after every regular column.
    pub fn position(&self, name: &str) -> usize {
        self.columns
            .iter()
            .position(|c| c.name == name)
            .unwrap_or_else(|| {
                self.columns.len()
                    + SYSTEM_COLUMNS
                        .iter()
                        .position(|c| *c == name)
                        .unwrap_or(SYSTEM_COLUMNS.len())
            })
    }

    /// Foreign keys on this table that point at `table`.
    pub fn foreign_keys_to<'a>(&'a self, table: &'a str) -> impl Iterator<Item = &'a ForeignKey> {
        self.foreign_keys
            .iter()
            .filter(move |fk| fk.referenced_table == table)
    }
}

/// An immutable snapshot of the tables a node tree needs.
#[derive(Debug, Clone, Default)]
pub struct Schema {
    tables: HashMap<String, Arc<TableSchema>>,
}

impl Schema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_table(mut self, table: TableSchema) -> Self {
        self.insert(table);
        self
    }

    pub fn insert(&mut self, table: TableSchema) {
        self.tables.insert(table.name.clone(), Arc::new(table));
    }

    pub fn table(&self, name: &str) -> Option<&TableSchema> {
        self.tables.get(name).map(|t| t.as_ref())
    }

    pub fn table_names(&self) -> Vec<&str> {
        self.tables.keys().map(|s| s.as_str()).collect()
    }
}

/// Source of table metadata.
#[async_trait]
pub trait SchemaCatalog: Send + Sync {
    /// Describe a table, or `None` if it does not exist.
    async fn describe_table(&self, table: &str) -> Result<Option<TableSchema>>;

    /// Load a snapshot containing every table in `tables` that exists.
    async fn load(&self, tables: &[String]) -> Result<Schema> {
        let mut schema = Schema::new();
        for table in tables {
            if let Some(described) = self.describe_table(table).await? {
                schema.insert(described);
            }
        }
        Ok(schema)
    }
}

/// Read-through cache over another catalog.
///
/// Lookups are read-only, so one cache can be shared by every job in the
/// process. Call [`CachedCatalog::invalidate`] after a schema change.
pub struct CachedCatalog<C> {
    inner: C,
    cache: RwLock<HashMap<String, Option<Arc<TableSchema>>>>,
}

impl<C: SchemaCatalog> CachedCatalog<C> {
    pub fn new(inner: C) -> Self {
        Self {
            inner,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Drop cached metadata for `table`, or for every table when `None`.
    pub fn invalidate(&self, table: Option<&str>) {
        let mut cache = match self.cache.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        match table {
            Some(name) => {
                cache.remove(name);
            }
            None => cache.clear(),
        }
        tracing::debug!(table = ?table, "schema cache invalidated");
    }

    fn cached(&self, table: &str) -> Option<Option<Arc<TableSchema>>> {
        let cache = match self.cache.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        cache.get(table).cloned()
    }
}

#[async_trait]
impl<C: SchemaCatalog> SchemaCatalog for CachedCatalog<C> {
    async fn describe_table(&self, table: &str) -> Result<Option<TableSchema>> {
        if let Some(hit) = self.cached(table) {
            return Ok(hit.map(|t| t.as_ref().clone()));
        }
        let described = self.inner.describe_table(table).await?;
        let mut cache = match self.cache.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        cache.insert(table.to_string(), described.clone().map(Arc::new));
        Ok(described)
    }
}

#[async_trait]
impl SchemaCatalog for Schema {
    async fn describe_table(&self, table: &str) -> Result<Option<TableSchema>> {
        Ok(self.table(table).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn book() -> TableSchema {
        TableSchema::new("book")
            .column("isbn", "character varying")
            .column("title", "character varying")
            .column("publisher_id", "integer")
            .primary_key(&["isbn"])
            .foreign_key(&["publisher_id"], "publisher", &["id"])
    }

    struct CountingCatalog {
        schema: Schema,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl SchemaCatalog for CountingCatalog {
        async fn describe_table(&self, table: &str) -> Result<Option<TableSchema>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.schema.describe_table(table).await
        }
    }

    #[test]
    fn test_position_orders_system_columns_last() {
        let table = book();
        assert_eq!(table.position("isbn"), 0);
        assert_eq!(table.position("publisher_id"), 2);
        assert_eq!(table.position("xmin"), 3);
        assert!(table.is_selectable("xmin"));
        assert!(!table.has_column("xmin"));
    }

    #[test]
    fn test_foreign_keys_to() {
        let table = book();
        assert_eq!(table.foreign_keys_to("publisher").count(), 1);
        assert_eq!(table.foreign_keys_to("author").count(), 0);
    }

    #[tokio::test]
    async fn test_cached_catalog_hits_inner_once_until_invalidated() {
        let catalog = CachedCatalog::new(CountingCatalog {
            schema: Schema::new().with_table(book()),
            calls: AtomicUsize::new(0),
        });

        assert!(catalog.describe_table("book").await.unwrap().is_some());
        assert!(catalog.describe_table("book").await.unwrap().is_some());
        assert_eq!(catalog.inner.calls.load(Ordering::SeqCst), 1);

        catalog.invalidate(Some("book"));
        catalog.describe_table("book").await.unwrap();
        assert_eq!(catalog.inner.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_load_skips_missing_tables() {
        let schema = Schema::new().with_table(book());
        let loaded = schema
            .load(&["book".to_string(), "missing".to_string()])
            .await
            .unwrap();
        assert!(loaded.table("book").is_some());
        assert!(loaded.table("missing").is_none());
    }
}
