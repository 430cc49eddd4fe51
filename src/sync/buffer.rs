// ABOUTME: Change buffers - queued "something changed" notifications drained each cycle
// ABOUTME: In-memory buffer for tests and a durable SQLite-backed buffer via change-buffer

use anyhow::{Context, Result};
use async_trait::async_trait;
use change_buffer::{BufferQueue, NewEntry};
use std::collections::VecDeque;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

use super::change::ChangeRecord;
use crate::document::identity_of;

/// A queue of change notifications fed by triggers or listeners.
///
/// `drain` returns every pending record without removing it; `ack` removes
/// what the last `drain` returned. A cycle that fails between the two sees
/// the same records again.
#[async_trait]
pub trait Buffer: Send + Sync {
    async fn push(&self, record: ChangeRecord) -> Result<()>;

    async fn drain(&self) -> Result<Vec<ChangeRecord>>;

    /// Wait at most `timeout` for pending records. Returns `true` if any
    /// are pending.
    async fn wait(&self, timeout: Duration) -> Result<bool>;

    async fn ack(&self) -> Result<()>;
}

#[derive(Default)]
struct MemoryState {
    pending: VecDeque<ChangeRecord>,
    drained: usize,
}

/// Process-local buffer.
#[derive(Default)]
pub struct MemoryBuffer {
    state: Mutex<MemoryState>,
    notify: Notify,
}

impl MemoryBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Synchronous push for producers outside an async context.
    pub fn enqueue(&self, record: ChangeRecord) {
        self.lock().pending.push_back(record);
        self.notify.notify_one();
    }

    pub fn pending(&self) -> usize {
        self.lock().pending.len()
    }
}

#[async_trait]
impl Buffer for MemoryBuffer {
    async fn push(&self, record: ChangeRecord) -> Result<()> {
        self.enqueue(record);
        Ok(())
    }

    async fn drain(&self) -> Result<Vec<ChangeRecord>> {
        let mut state = self.lock();
        state.drained = state.pending.len();
        Ok(state.pending.iter().cloned().collect())
    }

    async fn wait(&self, timeout: Duration) -> Result<bool> {
        if self.pending() > 0 {
            return Ok(true);
        }
        let _ = tokio::time::timeout(timeout, self.notify.notified()).await;
        Ok(self.pending() > 0)
    }

    async fn ack(&self) -> Result<()> {
        let mut state = self.lock();
        let drained = state.drained.min(state.pending.len());
        state.pending.drain(..drained);
        state.drained = 0;
        Ok(())
    }
}

/// Durable buffer on a SQLite queue file, one channel per job.
///
/// SQLite calls run on the blocking pool. Producers in other processes are
/// noticed by polling `pending_count`.
pub struct QueueBuffer {
    queue: Arc<Mutex<BufferQueue>>,
    channel: String,
    batch_limit: usize,
    poll_interval: Duration,
    last_drained: Mutex<Option<i64>>,
    notify: Notify,
}

impl QueueBuffer {
    pub fn open(path: &Path, channel: &str, batch_limit: usize) -> Result<Self> {
        let queue = BufferQueue::open(path)?;
        Ok(Self::with_queue(queue, channel, batch_limit))
    }

    pub fn with_queue(queue: BufferQueue, channel: &str, batch_limit: usize) -> Self {
        Self {
            queue: Arc::new(Mutex::new(queue)),
            channel: channel.to_string(),
            batch_limit: batch_limit.max(1),
            poll_interval: Duration::from_millis(250),
            last_drained: Mutex::new(None),
            notify: Notify::new(),
        }
    }

    async fn with_blocking<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&BufferQueue, &str) -> Result<T> + Send + 'static,
    {
        let queue = Arc::clone(&self.queue);
        let channel = self.channel.clone();
        tokio::task::spawn_blocking(move || {
            let guard = match queue.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            op(&guard, &channel)
        })
        .await
        .context("change buffer task panicked")?
    }

    async fn pending_count(&self) -> Result<u64> {
        self.with_blocking(|queue, channel| queue.pending_count(channel))
            .await
    }
}

#[async_trait]
impl Buffer for QueueBuffer {
    async fn push(&self, record: ChangeRecord) -> Result<()> {
        let key: Vec<_> = record.primary_key_values.values().cloned().collect();
        let entry = NewEntry::with_json_payload(
            record.table.clone(),
            record.kind.into(),
            identity_of(&key),
            &record,
            Some(record.transaction_id.0 as i64),
        )
        .context("Failed to encode change record")?;
        self.with_blocking(move |queue, channel| queue.push(channel, &entry))
            .await?;
        self.notify.notify_one();
        Ok(())
    }

    async fn drain(&self) -> Result<Vec<ChangeRecord>> {
        let limit = self.batch_limit;
        let entries = self
            .with_blocking(move |queue, channel| queue.fetch_batch(channel, limit))
            .await?;

        let mut records = Vec::with_capacity(entries.len());
        for entry in &entries {
            match entry.json_payload::<ChangeRecord>() {
                Ok(Some(record)) => records.push(record),
                Err(e) => tracing::warn!(
                    "Dropping undecodable buffer entry {} for {}: {}",
                    entry.entry_id,
                    entry.table_name,
                    e
                ),
                Ok(None) => tracing::warn!(
                    "Dropping buffer entry {} for {} without payload",
                    entry.entry_id,
                    entry.table_name
                ),
            }
        }

        let mut last = match self.last_drained.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *last = entries.last().map(|e| e.entry_id);
        Ok(records)
    }

    async fn wait(&self, timeout: Duration) -> Result<bool> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.pending_count().await? > 0 {
                return Ok(true);
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            let nap = self.poll_interval.min(deadline - now);
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep(nap) => {}
            }
        }
    }

    async fn ack(&self) -> Result<()> {
        let last = {
            let mut guard = match self.last_drained.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            guard.take()
        };
        if let Some(entry_id) = last {
            self.with_blocking(move |queue, channel| {
                queue.ack_up_to(channel, entry_id)?;
                queue.vacuum_acknowledged()
            })
            .await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Row;
    use crate::sync::change::{ChangeKind, Txid};
    use serde_json::json;

    fn record(id: i64) -> ChangeRecord {
        let mut key = Row::new();
        key.insert("id".into(), json!(id));
        let mut record = ChangeRecord::new("book", ChangeKind::Insert, key);
        record.transaction_id = Txid(id as u64);
        record
    }

    #[tokio::test]
    async fn test_memory_buffer_drain_is_repeatable_until_ack() {
        let buffer = MemoryBuffer::new();
        buffer.push(record(1)).await.unwrap();
        buffer.push(record(2)).await.unwrap();

        assert_eq!(buffer.drain().await.unwrap().len(), 2);
        assert_eq!(buffer.drain().await.unwrap().len(), 2);

        // Arrives after the drain; survives the ack
        buffer.push(record(3)).await.unwrap();
        buffer.ack().await.unwrap();
        let left = buffer.drain().await.unwrap();
        assert_eq!(left, vec![record(3)]);
    }

    #[tokio::test]
    async fn test_memory_buffer_wait() {
        let buffer = MemoryBuffer::new();
        assert!(!buffer.wait(Duration::from_millis(5)).await.unwrap());
        buffer.enqueue(record(1));
        assert!(buffer.wait(Duration::from_millis(5)).await.unwrap());
    }

    #[tokio::test]
    async fn test_queue_buffer_round_trip() {
        let buffer = QueueBuffer::with_queue(BufferQueue::open_in_memory().unwrap(), "books", 10);
        assert!(!buffer.wait(Duration::from_millis(5)).await.unwrap());

        buffer.push(record(1)).await.unwrap();
        buffer.push(record(2)).await.unwrap();
        assert!(buffer.wait(Duration::from_millis(5)).await.unwrap());

        let drained = buffer.drain().await.unwrap();
        assert_eq!(drained, vec![record(1), record(2)]);

        buffer.ack().await.unwrap();
        assert!(buffer.drain().await.unwrap().is_empty());
    }
}
