use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use rusqlite::{params, Connection};

use crate::entry::{BufferEntry, ChangeOperation, NewEntry};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS entries (
    entry_id      INTEGER PRIMARY KEY AUTOINCREMENT,
    channel       TEXT NOT NULL,
    table_name    TEXT NOT NULL,
    op            TEXT NOT NULL,
    id            TEXT NOT NULL,
    payload       BLOB,
    txid          INTEGER,
    created_at    TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
    acked         INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS entries_pending
    ON entries(channel, acked, entry_id);
"#;

/// Durable FIFO of change notifications, partitioned by channel.
///
/// One channel is used per sync job so several jobs can share a queue file.
pub struct BufferQueue {
    path: Option<PathBuf>,
    conn: Connection,
}

impl BufferQueue {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).with_context(|| {
                    format!("failed to create buffer directory {}", parent.display())
                })?;
                #[cfg(unix)]
                set_owner_perms(parent)?;
            }
        }
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open buffer database {}", path.display()))?;
        conn.pragma_update(None, "journal_mode", "wal")
            .context("failed to enable WAL for change buffer")?;
        conn.pragma_update(None, "synchronous", "normal").ok();
        Self::init(conn, Some(path.to_path_buf()))
    }

    /// Opens a queue that lives only as long as this value.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("failed to open in-memory buffer")?;
        Self::init(conn, None)
    }

    fn init(conn: Connection, path: Option<PathBuf>) -> Result<Self> {
        conn.execute_batch(SCHEMA)
            .context("failed to initialize buffer schema")?;
        Ok(Self { path, conn })
    }

    pub fn push(&self, channel: &str, entry: &NewEntry) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO entries(channel, table_name, op, id, payload, txid) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                channel,
                entry.table_name,
                entry.operation.as_str(),
                entry.primary_key,
                entry.payload,
                entry.txid,
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn fetch_batch(&self, channel: &str, limit: usize) -> Result<Vec<BufferEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT entry_id, table_name, op, id, payload, txid
             FROM entries
             WHERE channel = ?1 AND acked = 0
             ORDER BY entry_id ASC
             LIMIT ?2",
        )?;
        let mut rows = stmt.query(params![channel, limit as i64])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let op_str: String = row.get(2)?;
            out.push(BufferEntry {
                entry_id: row.get(0)?,
                table_name: row.get(1)?,
                operation: op_str.parse::<ChangeOperation>()?,
                primary_key: row.get(3)?,
                payload: row.get(4)?,
                txid: row.get(5)?,
            });
        }
        Ok(out)
    }

    pub fn ack_up_to(&self, channel: &str, entry_id: i64) -> Result<u64> {
        let updated = self.conn.execute(
            "UPDATE entries SET acked = 1 WHERE channel = ?1 AND entry_id <= ?2 AND acked = 0",
            params![channel, entry_id],
        )?;
        Ok(updated as u64)
    }

    pub fn pending_count(&self, channel: &str) -> Result<u64> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM entries WHERE channel = ?1 AND acked = 0",
            [channel],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    pub fn vacuum_acknowledged(&self) -> Result<u64> {
        let deleted = self.conn.execute("DELETE FROM entries WHERE acked = 1", [])?;
        if deleted > 0 {
            tracing::debug!(deleted, "vacuumed acknowledged buffer entries");
        }
        Ok(deleted as u64)
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

#[cfg(unix)]
fn set_owner_perms(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let metadata = fs::metadata(path)?;
    let mut perms = metadata.permissions();
    perms.set_mode(0o700);
    fs::set_permissions(path, perms)?;
    Ok(())
}

#[cfg(not(unix))]
fn set_owner_perms(_path: &Path) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(pk: &str) -> NewEntry {
        NewEntry {
            table_name: "book".into(),
            operation: ChangeOperation::Insert,
            primary_key: pk.into(),
            payload: None,
            txid: Some(7),
        }
    }

    #[test]
    fn channels_are_isolated() {
        let queue = BufferQueue::open_in_memory().unwrap();
        queue.push("books", &entry("abc")).unwrap();
        queue.push("authors", &entry("def")).unwrap();

        let books = queue.fetch_batch("books", 10).unwrap();
        assert_eq!(books.len(), 1);
        assert_eq!(books[0].primary_key, "abc");
        assert_eq!(books[0].txid, Some(7));
        assert_eq!(queue.pending_count("authors").unwrap(), 1);
    }

    #[test]
    fn ack_only_touches_own_channel() {
        let queue = BufferQueue::open_in_memory().unwrap();
        let first = queue.push("books", &entry("abc")).unwrap();
        queue.push("authors", &entry("def")).unwrap();

        assert_eq!(queue.ack_up_to("books", first + 10).unwrap(), 1);
        assert_eq!(queue.pending_count("books").unwrap(), 0);
        assert_eq!(queue.pending_count("authors").unwrap(), 1);
        assert!(queue.path().is_none());
    }
}
