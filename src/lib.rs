// ABOUTME: Library root for document-replicator
// ABOUTME: Node trees, document compilation, change resolution, sinks and the sync orchestrator

pub mod config;
pub mod document;
pub mod error;
pub mod memory;
pub mod node;
pub mod postgres;
pub mod schema;
pub mod session;
pub mod sink;
pub mod sync;
pub mod utils;

pub use error::{SyncError, SyncResult};
