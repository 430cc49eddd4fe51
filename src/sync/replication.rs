// ABOUTME: Replication source abstraction - slots, windowed pulls and log reclamation
// ABOUTME: Sources are pull-only and never persist orchestrator state

use anyhow::Result;
use async_trait::async_trait;

use super::change::{ChangeRecord, Txid, TxWindow};

/// An open replication slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotHandle {
    pub name: String,
}

/// One page read from a slot.
///
/// `consumed` counts the raw log entries the page covered, including those
/// the source filtered out; the next page starts that many entries later.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChangePage {
    pub records: Vec<ChangeRecord>,
    pub consumed: usize,
}

impl ChangePage {
    /// A page where every entry read became a record.
    pub fn unfiltered(records: Vec<ChangeRecord>) -> Self {
        let consumed = records.len();
        Self { records, consumed }
    }
}

#[async_trait]
pub trait ReplicationSource: Send + Sync {
    /// Open the slot `name`, creating it if absent.
    async fn open_slot(&self, name: &str) -> Result<SlotHandle>;

    /// Change records committed inside `window`, in commit order, skipping
    /// the first `offset` log entries and reading at most `max_count`.
    async fn pull_changes(
        &self,
        slot: &SlotHandle,
        window: TxWindow,
        max_count: usize,
        offset: usize,
    ) -> Result<ChangePage>;

    /// Release log for transactions up to and including `up_to`.
    async fn reclaim(&self, slot: &SlotHandle, up_to: Txid) -> Result<()>;
}
