// ABOUTME: Change capture and sync - change records, checkpoints, buffers and orchestration
// ABOUTME: Resolves relational changes to root documents and applies them per index

pub mod buffer;
pub mod change;
pub mod checkpoint;
pub mod daemon;
pub mod orchestrator;
pub mod replication;
pub mod resolver;

pub use buffer::{Buffer, MemoryBuffer, QueueBuffer};
pub use change::{ChangeKind, ChangeRecord, TxWindow, Txid};
pub use checkpoint::{Checkpoint, CheckpointFile, CheckpointStore, FileCheckpointStore, MemoryCheckpointStore};
pub use daemon::SyncDaemon;
pub use orchestrator::{CycleStats, JobContext, Phase, SyncJob, SyncOptions};
pub use replication::{ChangePage, ReplicationSource, SlotHandle};
pub use resolver::{coalesce, resolve, Resolution, RootOp};
