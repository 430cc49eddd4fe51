// ABOUTME: Logical replication source over a test_decoding slot
// ABOUTME: Peeks changes inside a txid window and advances the slot to reclaim log

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tokio_postgres::Client;

use super::decoder::{parse_line, DecodedChange, DecodedLine};
use crate::schema::{SchemaCatalog, TableSchema};
use crate::session::Row;
use crate::sync::change::{ChangeKind, ChangeRecord, TxWindow, Txid};
use crate::sync::replication::{ChangePage, ReplicationSource, SlotHandle};

const OUTPUT_PLUGIN: &str = "test_decoding";

/// Change records from a logical replication slot.
///
/// Primary-key columns come from the catalog; wrap it in a
/// [`crate::schema::CachedCatalog`] to avoid a lookup per record.
pub struct PgReplicationSource {
    client: Client,
    schema: String,
    catalog: Arc<dyn SchemaCatalog>,
}

impl PgReplicationSource {
    pub fn new(client: Client, schema: impl Into<String>, catalog: Arc<dyn SchemaCatalog>) -> Self {
        Self {
            client,
            schema: schema.into(),
            catalog,
        }
    }

    /// Current 64-bit txid used to widen 32-bit xids from the slot.
    async fn reference_txid(&self) -> Result<Txid> {
        let row = self
            .client
            .query_one(
                "SELECT txid_snapshot_xmax(txid_current_snapshot())::text::bigint",
                &[],
            )
            .await
            .context("Failed to read transaction snapshot")?;
        let xmax: i64 = row.get(0);
        Ok(Txid(xmax as u64))
    }

    async fn to_record(&self, change: DecodedChange, txid: Txid, position: u64) -> Result<Option<ChangeRecord>> {
        let described = self.catalog.describe_table(&change.table).await?;
        Ok(record_from_change(change, described.as_ref(), txid, position))
    }
}

/// Map a decoded change to a record keyed by the table's primary key.
///
/// Changes on tables the catalog no longer knows, or without a primary key,
/// are skipped so they cannot stall the window.
pub fn record_from_change(
    change: DecodedChange,
    described: Option<&TableSchema>,
    txid: Txid,
    position: u64,
) -> Option<ChangeRecord> {
    let Some(described) = described else {
        tracing::warn!("Ignoring change on {}: table not found in catalog", change.table);
        return None;
    };
    if described.primary_key.is_empty() {
        tracing::warn!("Ignoring change on {} without a primary key", change.table);
        return None;
    }

    let key_of = |tuple: &Row| -> Row {
        described
            .primary_key
            .iter()
            .map(|c| (c.clone(), tuple.get(c).cloned().unwrap_or(serde_json::Value::Null)))
            .collect()
    };
    let primary_key_values = key_of(&change.tuple);
    let old_primary_key_values = change
        .old_key
        .as_ref()
        .map(key_of)
        .filter(|old| *old != primary_key_values);

    let mut record = ChangeRecord::new(change.table.clone(), change.kind, primary_key_values);
    record.old_primary_key_values = old_primary_key_values;
    if change.kind != ChangeKind::Delete && !change.partial {
        record.values = Some(change.tuple);
    }
    record.transaction_id = txid;
    record.position = position;
    Some(record)
}

/// SQL predicate on a 32-bit `xid` column selecting `window`.
///
/// A window that crosses an epoch boundary wraps around.
pub fn xid_predicate(column: &str, window: TxWindow) -> String {
    let lo = window.txmin.0 & 0xFFFF_FFFF;
    let hi = window.txmax.0 & 0xFFFF_FFFF;
    let expr = format!("{}::text::bigint", column);
    if window.txmax.0 - window.txmin.0 >= 1 << 32 {
        "TRUE".to_string()
    } else if window.txmin.0 >> 32 == window.txmax.0 >> 32 {
        format!("({0} > {1} AND {0} <= {2})", expr, lo, hi)
    } else {
        format!("({0} > {1} OR {0} <= {2})", expr, lo, hi)
    }
}

#[async_trait]
impl ReplicationSource for PgReplicationSource {
    async fn open_slot(&self, name: &str) -> Result<SlotHandle> {
        let exists = self
            .client
            .query_opt("SELECT 1 FROM pg_replication_slots WHERE slot_name = $1", &[&name])
            .await
            .context("Failed to look up replication slot")?
            .is_some();
        if !exists {
            tracing::info!("Creating logical replication slot {} ({})", name, OUTPUT_PLUGIN);
            self.client
                .query_one(
                    "SELECT pg_create_logical_replication_slot($1, $2)::text",
                    &[&name, &OUTPUT_PLUGIN],
                )
                .await
                .with_context(|| format!("Failed to create replication slot {}", name))?;
        }
        Ok(SlotHandle {
            name: name.to_string(),
        })
    }

    async fn pull_changes(
        &self,
        slot: &SlotHandle,
        window: TxWindow,
        max_count: usize,
        offset: usize,
    ) -> Result<ChangePage> {
        if window.is_empty() {
            return Ok(ChangePage::default());
        }
        let reference = self.reference_txid().await?;
        let sql = format!(
            "SELECT xid::text::bigint, data
             FROM pg_logical_slot_peek_changes($1, NULL, NULL)
             WHERE data LIKE 'table %' AND {}
             OFFSET {} LIMIT {}",
            xid_predicate("xid", window),
            offset,
            max_count
        );
        let rows = self
            .client
            .query(sql.as_str(), &[&slot.name])
            .await
            .with_context(|| format!("Failed to peek changes from slot {}", slot.name))?;

        let mut page = ChangePage {
            records: Vec::with_capacity(rows.len()),
            consumed: rows.len(),
        };
        for (i, row) in rows.iter().enumerate() {
            let xid: i64 = row.get(0);
            let data: String = row.get(1);
            let txid = Txid::widen(xid as u32, reference);
            if !window.contains(txid) {
                continue;
            }
            let change = match parse_line(&data)? {
                DecodedLine::Change(change) if change.schema == self.schema => change,
                _ => continue,
            };
            if let Some(record) = self.to_record(change, txid, (offset + i) as u64).await? {
                page.records.push(record);
            }
        }
        Ok(page)
    }

    async fn reclaim(&self, slot: &SlotHandle, up_to: Txid) -> Result<()> {
        let reference = self.reference_txid().await?;
        let rows = self
            .client
            .query(
                "SELECT lsn::text, xid::text::bigint, data
                 FROM pg_logical_slot_peek_changes($1, NULL, NULL)
                 WHERE data LIKE 'COMMIT%'",
                &[&slot.name],
            )
            .await
            .with_context(|| format!("Failed to peek commits from slot {}", slot.name))?;

        // Commit order; stop at the first transaction past the checkpoint
        let mut target: Option<String> = None;
        for row in &rows {
            let xid: i64 = row.get(1);
            if Txid::widen(xid as u32, reference) > up_to {
                break;
            }
            target = Some(row.get(0));
        }

        if let Some(lsn) = target {
            self.client
                .query_one(
                    "SELECT end_lsn::text FROM pg_replication_slot_advance($1, $2::text::pg_lsn)",
                    &[&slot.name, &lsn],
                )
                .await
                .with_context(|| format!("Failed to advance slot {} to {}", slot.name, lsn))?;
            tracing::debug!("Advanced slot {} to {} (txid {})", slot.name, lsn, up_to);
        }
        Ok(())
    }
}
