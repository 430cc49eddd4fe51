// ABOUTME: Checkpoint store - persists the txmin low-water mark per index
// ABOUTME: JSON file written atomically, plus an in-memory store for tests

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::Mutex;

use super::change::Txid;

/// Persisted progress for a single index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Every transaction up to and including this id has been applied.
    pub txmin: Txid,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

impl Checkpoint {
    pub fn new(txmin: Txid) -> Self {
        Self {
            txmin,
            updated_at: chrono::Utc::now(),
        }
    }
}

/// All checkpoints in one file, keyed by index name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointFile {
    /// Version of the file format for future migrations
    pub version: u32,
    /// Source database URL (sanitized - no password)
    pub source_url: String,
    pub indices: HashMap<String, Checkpoint>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

impl CheckpointFile {
    pub fn new(source_url: &str) -> Self {
        let now = chrono::Utc::now();
        Self {
            version: 1,
            source_url: crate::utils::sanitize_url(source_url),
            indices: HashMap::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Advance `index` to `txmin`. Returns the stored checkpoint, which keeps
    /// the previous value if `txmin` would move it backwards.
    pub fn advance(&mut self, index: &str, txmin: Txid) -> Checkpoint {
        let entry = self
            .indices
            .entry(index.to_string())
            .or_insert_with(|| Checkpoint::new(Txid::ZERO));
        if txmin >= entry.txmin {
            *entry = Checkpoint::new(txmin);
            self.updated_at = entry.updated_at;
        } else {
            tracing::warn!(
                "Refusing to move checkpoint for {} backwards ({} -> {})",
                index,
                entry.txmin,
                txmin
            );
        }
        entry.clone()
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read checkpoints from {:?}", path))?;
        let file: CheckpointFile = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse checkpoints from {:?}", path))?;
        Ok(file)
    }

    /// Write to a sibling temp file, then rename over `path`.
    pub async fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .await
                    .with_context(|| format!("Failed to create directory {:?}", parent))?;
            }
        }

        let contents =
            serde_json::to_string_pretty(self).context("Failed to serialize checkpoints")?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, contents)
            .await
            .with_context(|| format!("Failed to write checkpoints to {:?}", tmp))?;
        fs::rename(&tmp, path)
            .await
            .with_context(|| format!("Failed to move checkpoints into place at {:?}", path))?;
        Ok(())
    }

    pub fn default_path() -> PathBuf {
        PathBuf::from(".document-replicator/checkpoints.json")
    }
}

/// Where the orchestrator keeps its low-water marks.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn load(&self, index: &str) -> Result<Option<Checkpoint>>;

    /// Persist `txmin` for `index`; never moves a checkpoint backwards.
    async fn save(&self, index: &str, txmin: Txid) -> Result<Checkpoint>;
}

/// Checkpoints in a JSON file shared by every job of the process.
pub struct FileCheckpointStore {
    path: PathBuf,
    source_url: String,
    lock: Mutex<()>,
}

impl FileCheckpointStore {
    pub fn new(path: impl Into<PathBuf>, source_url: &str) -> Self {
        Self {
            path: path.into(),
            source_url: source_url.to_string(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the whole file. A missing file is empty; an unreadable one is
    /// an error.
    pub async fn read_all(&self) -> Result<CheckpointFile> {
        if fs::try_exists(&self.path).await.unwrap_or(false) {
            CheckpointFile::load(&self.path).await
        } else {
            Ok(CheckpointFile::new(&self.source_url))
        }
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn load(&self, index: &str) -> Result<Option<Checkpoint>> {
        let _guard = self.lock.lock().await;
        Ok(self.read_all().await?.indices.get(index).cloned())
    }

    async fn save(&self, index: &str, txmin: Txid) -> Result<Checkpoint> {
        let _guard = self.lock.lock().await;
        let mut file = self.read_all().await?;
        let checkpoint = file.advance(index, txmin);
        file.save(&self.path).await?;
        tracing::debug!("Checkpoint for {} saved at txmin {}", index, checkpoint.txmin);
        Ok(checkpoint)
    }
}

/// Process-local checkpoints.
#[derive(Default)]
pub struct MemoryCheckpointStore {
    checkpoints: Mutex<HashMap<String, Checkpoint>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn load(&self, index: &str) -> Result<Option<Checkpoint>> {
        Ok(self.checkpoints.lock().await.get(index).cloned())
    }

    async fn save(&self, index: &str, txmin: Txid) -> Result<Checkpoint> {
        let mut checkpoints = self.checkpoints.lock().await;
        let entry = checkpoints
            .entry(index.to_string())
            .or_insert_with(|| Checkpoint::new(Txid::ZERO));
        if txmin >= entry.txmin {
            *entry = Checkpoint::new(txmin);
        }
        Ok(entry.clone())
    }
}
