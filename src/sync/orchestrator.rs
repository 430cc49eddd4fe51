// ABOUTME: Sync orchestrator - full resync and windowed receive cycles for one index
// ABOUTME: Drives slot, buffer, session and writer through the checkpoint state machine

use anyhow::Context;
use serde_json::Value;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::buffer::Buffer;
use super::change::{ChangeRecord, Txid, TxWindow};
use super::checkpoint::CheckpointStore;
use super::replication::{ReplicationSource, SlotHandle};
use super::resolver::{coalesce, resolve, RootOp};
use crate::document::{compile, fetch_roots, Document, RootScan, RowTree};
use crate::error::{SyncError, SyncResult};
use crate::node::{Node, NodePlan};
use crate::schema::Schema;
use crate::session::{tuple_of, values_match, Filter, Session};
use crate::sink::{DocumentWriter, Sink, WriteOutcome};
use crate::utils::RetryPolicy;

/// Where a job is in its cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    SlotReady,
    WindowOpen,
    Applying,
    Reclaiming,
    Terminated,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Idle => "idle",
            Phase::SlotReady => "slot-ready",
            Phase::WindowOpen => "window-open",
            Phase::Applying => "applying",
            Phase::Reclaiming => "reclaiming",
            Phase::Terminated => "terminated",
        };
        f.write_str(name)
    }
}

/// Per-job knobs.
#[derive(Debug, Clone)]
pub struct SyncOptions {
    /// Target index in the sink; also keys the checkpoint.
    pub index: String,
    pub slot_name: String,
    /// Root rows per page during scans and per fetch during receive.
    pub batch_size: usize,
    /// Upper bound on change records per slot pull.
    pub max_changes: usize,
    /// Longest idle wait between cycles.
    pub poll_interval: Duration,
    pub retry: RetryPolicy,
}

impl SyncOptions {
    pub fn new(index: impl Into<String>) -> Self {
        let index = index.into();
        Self {
            slot_name: crate::utils::slot_name("replicator", &index),
            index,
            batch_size: 1_000,
            max_changes: 10_000,
            poll_interval: Duration::from_secs(1),
            retry: RetryPolicy::default(),
        }
    }
}

/// Collaborators a job drives. The session belongs to the job alone.
pub struct JobContext {
    pub session: Box<dyn Session>,
    pub source: Arc<dyn ReplicationSource>,
    pub buffer: Arc<dyn Buffer>,
    pub sink: Arc<dyn Sink>,
    pub checkpoints: Arc<dyn CheckpointStore>,
}

/// Statistics from one cycle.
#[derive(Debug, Clone, Default)]
pub struct CycleStats {
    pub upserted: u64,
    pub unchanged: u64,
    pub deleted: u64,
    /// Records skipped because they failed to compile or the sink refused them.
    pub rejected: u64,
    /// Change records pulled from the slot and the buffer.
    pub changes: usize,
    pub errors: Vec<String>,
    pub duration_ms: u64,
    /// Window applied; `None` for full resyncs.
    pub window: Option<TxWindow>,
}

impl CycleStats {
    /// True when no record was skipped.
    pub fn is_success(&self) -> bool {
        self.errors.is_empty()
    }

    /// Writes that reached the sink.
    pub fn mutations(&self) -> u64 {
        self.upserted + self.deleted
    }

    fn record(&mut self, outcome: WriteOutcome) {
        match outcome {
            WriteOutcome::Upserted => self.upserted += 1,
            WriteOutcome::Unchanged => self.unchanged += 1,
            WriteOutcome::Deleted => self.deleted += 1,
            WriteOutcome::Rejected(reason) => {
                self.rejected += 1;
                self.errors.push(reason);
            }
        }
    }

    fn skip(&mut self, error: SyncError) {
        tracing::warn!("Skipping record: {}", error);
        self.rejected += 1;
        self.errors.push(error.to_string());
    }
}

/// One node tree synced into one index.
pub struct SyncJob {
    plan: NodePlan,
    options: SyncOptions,
    ctx: JobContext,
    writer: DocumentWriter,
    slot: Option<SlotHandle>,
    phase: Phase,
}

impl SyncJob {
    /// Validate `node` against `schema` and set up the job. Structural
    /// errors surface here, before any row is read.
    pub fn new(node: &Node, schema: &Schema, options: SyncOptions, ctx: JobContext) -> SyncResult<Self> {
        let plan = NodePlan::build(node, schema)?;
        Ok(Self::from_plan(plan, options, ctx))
    }

    pub fn from_plan(plan: NodePlan, options: SyncOptions, ctx: JobContext) -> Self {
        let writer = DocumentWriter::new(Arc::clone(&ctx.sink), options.index.clone(), options.retry);
        Self {
            plan,
            options,
            ctx,
            writer,
            slot: None,
            phase: Phase::Idle,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn plan(&self) -> &NodePlan {
        &self.plan
    }

    pub fn options(&self) -> &SyncOptions {
        &self.options
    }

    pub fn index(&self) -> &str {
        &self.options.index
    }

    fn enter(&mut self, phase: Phase) {
        if self.phase != phase {
            tracing::debug!(index = %self.options.index, "{} -> {}", self.phase, phase);
            self.phase = phase;
        }
    }

    /// Open the job's replication slot, creating it if absent.
    pub async fn open_slot(&mut self) -> SyncResult<SlotHandle> {
        if let Some(slot) = &self.slot {
            return Ok(slot.clone());
        }
        let slot = self
            .ctx
            .source
            .open_slot(&self.options.slot_name)
            .await
            .with_context(|| format!("Failed to open replication slot {}", self.options.slot_name))
            .map_err(SyncError::Fatal)?;
        tracing::info!("Replication slot {} ready for {}", slot.name, self.options.index);
        self.slot = Some(slot.clone());
        self.enter(Phase::SlotReady);
        Ok(slot)
    }

    /// Persisted low-water mark, if the job has completed a cycle before.
    pub async fn checkpoint(&self) -> SyncResult<Option<Txid>> {
        let checkpoint = self
            .ctx
            .checkpoints
            .load(&self.options.index)
            .await
            .map_err(SyncError::Fatal)?;
        Ok(checkpoint.map(|c| c.txmin))
    }

    async fn current_txmax(&self) -> SyncResult<Txid> {
        self.ctx
            .session
            .current_transaction_id()
            .await
            .context("Failed to read current transaction id")
            .map_err(SyncError::Transport)
    }

    /// Re-derive every root document and delete documents whose roots are
    /// gone, then move the checkpoint to the transaction id read before the
    /// scan.
    pub async fn full_resync(&mut self) -> SyncResult<CycleStats> {
        let start = Instant::now();
        let mut stats = CycleStats::default();
        let slot = self.open_slot().await?;

        // Anything queued so far is covered by the scan
        let buffered = self.ctx.buffer.drain().await.map_err(SyncError::Transport)?;
        let txmax = self.current_txmax().await?;
        self.enter(Phase::Applying);
        tracing::info!(
            "Starting full resync of {} at txid {} ({} buffered changes folded in)",
            self.options.index,
            txmax,
            buffered.len()
        );

        let mut seen = HashSet::new();
        self.scan_all(&mut stats, Some(&mut seen)).await?;
        stats.deleted += self.writer.reconcile(&seen).await?;
        self.writer.refresh().await?;

        self.enter(Phase::Reclaiming);
        self.persist(&slot, txmax).await?;
        self.ctx.buffer.ack().await.map_err(SyncError::Transport)?;
        self.enter(Phase::Idle);

        stats.duration_ms = start.elapsed().as_millis() as u64;
        tracing::info!(
            "Full resync of {} completed: {} upserted, {} unchanged, {} deleted, {} rejected in {}ms",
            self.options.index,
            stats.upserted,
            stats.unchanged,
            stats.deleted,
            stats.rejected,
            stats.duration_ms
        );
        Ok(stats)
    }

    /// One receive cycle over `(checkpoint, current txid]` plus whatever the
    /// buffer holds.
    ///
    /// A transport error aborts the cycle before the checkpoint moves; the
    /// next cycle sees the same window again.
    pub async fn receive_once(&mut self) -> SyncResult<CycleStats> {
        let start = Instant::now();
        let mut stats = CycleStats::default();
        let slot = self.open_slot().await?;

        let txmin = self.checkpoint().await?.unwrap_or(Txid::ZERO);
        let txmax = self.current_txmax().await?;
        let window = TxWindow::new(txmin, txmax.max(txmin));
        stats.window = Some(window);
        self.enter(Phase::WindowOpen);

        let buffered = self.ctx.buffer.drain().await.map_err(SyncError::Transport)?;
        if window.is_empty() && buffered.is_empty() {
            tracing::debug!("Window {} is empty for {}", window, self.options.index);
            self.enter(Phase::Idle);
            stats.duration_ms = start.elapsed().as_millis() as u64;
            return Ok(stats);
        }

        self.enter(Phase::Applying);
        let mut records = if window.is_empty() {
            Vec::new()
        } else {
            self.pull_window(&slot, window).await?
        };
        records.extend(buffered);
        stats.changes = records.len();

        let records = coalesce(&self.plan, records);
        let resolution = resolve(&self.plan, self.ctx.session.as_ref(), &self.writer, &records).await?;
        tracing::debug!(
            "{} changes in {} resolved to {} root documents",
            stats.changes,
            window,
            resolution.ops.len()
        );

        self.apply_ops(&resolution.ops, &mut stats).await?;
        if resolution.rederive_all {
            tracing::info!("Sink cannot resolve child changes for {}; re-deriving every root", self.options.index);
            self.scan_all(&mut stats, None).await?;
        }
        if stats.mutations() > 0 {
            self.writer.refresh().await?;
        }

        self.enter(Phase::Reclaiming);
        if !window.is_empty() {
            self.persist(&slot, txmax).await?;
        }
        self.ctx.buffer.ack().await.map_err(SyncError::Transport)?;
        self.enter(Phase::Idle);

        stats.duration_ms = start.elapsed().as_millis() as u64;
        Ok(stats)
    }

    /// Wait up to `wait` for buffered activity, then run one receive cycle.
    pub async fn step(&mut self, wait: Duration) -> SyncResult<CycleStats> {
        self.ctx.buffer.wait(wait).await.map_err(SyncError::Transport)?;
        self.receive_once().await
    }

    /// Run receive cycles until `shutdown` fires.
    ///
    /// Without a checkpoint the job starts with a full resync. Transient
    /// failures are retried with backoff; a cycle that still fails is
    /// abandoned and the next one starts from the same checkpoint.
    /// Structural and fatal errors stop the job.
    pub async fn run(&mut self, mut shutdown: tokio::sync::broadcast::Receiver<()>) -> SyncResult<()> {
        let mut cycles = 0u64;
        let buffer = Arc::clone(&self.ctx.buffer);

        tracing::info!(
            "Starting sync job for {} (poll_interval={:?}, batch_size={}, max_changes={})",
            self.options.index,
            self.options.poll_interval,
            self.options.batch_size,
            self.options.max_changes
        );

        let mut needs_resync = match self.prepare().await {
            Ok(needs_resync) => needs_resync,
            Err(e) => return Err(self.terminate(e)),
        };

        loop {
            if !needs_resync {
                tokio::select! {
                    biased;
                    _ = shutdown.recv() => {
                        tracing::info!("Shutdown signal received, stopping sync job for {}", self.options.index);
                        break;
                    }
                    activity = buffer.wait(self.options.poll_interval) => {
                        if let Err(e) = activity {
                            tracing::warn!("Buffer wait failed for {}: {}", self.options.index, e);
                        }
                    }
                }
            }

            cycles += 1;
            let mut delay = self.options.retry.initial_delay;
            let mut attempt = 0u32;
            loop {
                let result = if needs_resync {
                    self.full_resync().await
                } else {
                    self.receive_once().await
                };
                match result {
                    Ok(stats) => {
                        needs_resync = false;
                        log_cycle(&self.options.index, cycles, &stats);
                        break;
                    }
                    Err(e) if e.is_transient() && attempt < self.options.retry.max_retries => {
                        attempt += 1;
                        tracing::warn!(
                            "Cycle {} for {} failed (attempt {}/{}), retrying in {:?}: {}",
                            cycles,
                            self.options.index,
                            attempt,
                            self.options.retry.max_retries + 1,
                            delay,
                            e
                        );
                        self.enter(Phase::Idle);
                        tokio::select! {
                            biased;
                            _ = shutdown.recv() => {
                                tracing::info!("Shutdown signal received, stopping sync job for {}", self.options.index);
                                self.enter(Phase::Terminated);
                                return Ok(());
                            }
                            _ = tokio::time::sleep(delay) => {}
                        }
                        delay *= 2;
                    }
                    Err(e) if e.is_transient() => {
                        tracing::error!("Cycle {} for {} failed: {}", cycles, self.options.index, e);
                        self.enter(Phase::Idle);
                        break;
                    }
                    Err(e) => return Err(self.terminate(e)),
                }
            }
        }

        self.enter(Phase::Terminated);
        Ok(())
    }

    /// Open the slot and report whether the job has never completed a cycle.
    async fn prepare(&mut self) -> SyncResult<bool> {
        self.open_slot().await?;
        Ok(self.checkpoint().await?.is_none())
    }

    fn terminate(&mut self, error: SyncError) -> SyncError {
        tracing::error!("Sync job for {} stopped: {}", self.options.index, error);
        self.enter(Phase::Terminated);
        error
    }

    async fn pull_window(&self, slot: &SlotHandle, window: TxWindow) -> SyncResult<Vec<ChangeRecord>> {
        let max_count = self.options.max_changes.max(1);
        let mut records = Vec::new();
        let mut offset = 0;
        loop {
            let page = self
                .ctx
                .source
                .pull_changes(slot, window, max_count, offset)
                .await
                .with_context(|| format!("Failed to pull changes in {} from {}", window, slot.name))
                .map_err(SyncError::Transport)?;
            // Filtered entries still count toward the page
            offset += page.consumed;
            records.extend(page.records);
            if page.consumed < max_count {
                break;
            }
        }
        Ok(records)
    }

    /// Checkpoint first, then release the log behind it.
    async fn persist(&self, slot: &SlotHandle, txmax: Txid) -> SyncResult<()> {
        self.ctx
            .checkpoints
            .save(&self.options.index, txmax)
            .await
            .context("Failed to persist checkpoint")
            .map_err(SyncError::Fatal)?;
        self.ctx
            .source
            .reclaim(slot, txmax)
            .await
            .with_context(|| format!("Failed to reclaim slot {} up to {}", slot.name, txmax))
            .map_err(SyncError::Transport)
    }

    /// Upsert every root document, page by page. Identities written go into
    /// `seen` when given.
    async fn scan_all(&mut self, stats: &mut CycleStats, mut seen: Option<&mut HashSet<String>>) -> SyncResult<()> {
        let mut scan = RootScan::new(self.options.batch_size);
        let session = self.ctx.session.as_ref();
        while let Some(page) = scan
            .next_page(session, &self.plan)
            .await
            .map_err(SyncError::Transport)?
        {
            for tree in &page {
                let document = match compile(&self.plan, &self.options.index, tree) {
                    Ok(document) => document,
                    Err(e) => {
                        stats.skip(e);
                        continue;
                    }
                };
                if let Some(seen) = seen.as_deref_mut() {
                    seen.insert(document.identity.clone());
                }
                stats.record(self.writer.upsert(&document).await?);
            }
        }
        Ok(())
    }

    /// Re-derive the given roots in order: upsert those whose row exists,
    /// delete the rest.
    async fn apply_ops(&mut self, ops: &[RootOp], stats: &mut CycleStats) -> SyncResult<()> {
        let root_pk = self.plan.root().primary_key.clone();
        let ops: Vec<&RootOp> = ops
            .iter()
            .filter(|op| !op.key.iter().any(Value::is_null))
            .collect();

        for chunk in ops.chunks(self.options.batch_size.max(1)) {
            let filter = Filter::In {
                columns: root_pk.clone(),
                tuples: chunk.iter().map(|op| op.key.clone()).collect(),
            };
            let trees: Vec<RowTree> = fetch_roots(self.ctx.session.as_ref(), &self.plan, filter)
                .await
                .map_err(SyncError::Transport)?;

            let mut fetched: Vec<(Vec<Value>, Document)> = Vec::with_capacity(trees.len());
            for tree in &trees {
                match compile(&self.plan, &self.options.index, tree) {
                    Ok(document) => fetched.push((tuple_of(&tree.row, &root_pk), document)),
                    Err(e) => stats.skip(e),
                }
            }

            let mut matched: Vec<Option<Document>> = chunk
                .iter()
                .map(|op| take_matching(&mut fetched, &op.key))
                .collect();

            // Rows the source matched by its own casts but whose key renders
            // differently from the change record
            if !fetched.is_empty() {
                for (op, slot) in chunk.iter().zip(matched.iter_mut()) {
                    if slot.is_none() {
                        *slot = self.fetch_one(op, stats).await?;
                    }
                }
            }

            for (op, document) in chunk.iter().zip(matched) {
                let outcome = match document {
                    Some(document) => self.writer.upsert(&document).await?,
                    None => self.writer.delete(&op.identity).await?,
                };
                stats.record(outcome);
            }
        }
        Ok(())
    }

    /// Fetch and compile the single root `op` names, if its row exists.
    async fn fetch_one(&self, op: &RootOp, stats: &mut CycleStats) -> SyncResult<Option<Document>> {
        let filter = Filter::eq(&self.plan.root().primary_key, op.key.clone());
        let trees = fetch_roots(self.ctx.session.as_ref(), &self.plan, filter)
            .await
            .map_err(SyncError::Transport)?;
        let Some(tree) = trees.first() else {
            return Ok(None);
        };
        match compile(&self.plan, &self.options.index, tree) {
            Ok(document) => Ok(Some(document)),
            Err(e) => {
                stats.skip(e);
                Ok(None)
            }
        }
    }
}

/// Remove and return the document whose root key matches `key`.
fn take_matching(fetched: &mut Vec<(Vec<Value>, Document)>, key: &[Value]) -> Option<Document> {
    let position = fetched.iter().position(|(tuple, _)| {
        tuple.len() == key.len() && tuple.iter().zip(key).all(|(actual, expected)| values_match(actual, expected))
    })?;
    Some(fetched.swap_remove(position).1)
}

fn log_cycle(index: &str, cycle: u64, stats: &CycleStats) {
    let window = stats
        .window
        .map(|w| w.to_string())
        .unwrap_or_else(|| "full".to_string());
    if stats.mutations() > 0 || stats.rejected > 0 {
        tracing::info!(
            "Cycle {} for {} {}: {} changes, {} upserted, {} deleted, {} unchanged in {}ms",
            cycle,
            index,
            window,
            stats.changes,
            stats.upserted,
            stats.deleted,
            stats.unchanged,
            stats.duration_ms
        );
    } else {
        tracing::debug!("Cycle {} for {} {}: nothing to apply", cycle, index, window);
    }
    if !stats.errors.is_empty() {
        tracing::warn!("Cycle {} for {} skipped {} records", cycle, index, stats.errors.len());
    }
}
