// ABOUTME: Settings file for the replicator binary
// ABOUTME: TOML describes the source, the sink, checkpoint and buffer paths, and jobs

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::node::Node;
use crate::sync::checkpoint::CheckpointFile;
use crate::sync::orchestrator::SyncOptions;
use crate::utils::{millis, RetryPolicy};

/// Where documents go.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum SinkSettings {
    Elasticsearch {
        url: String,
        #[serde(default)]
        api_key: Option<String>,
        #[serde(default = "default_sink_timeout_ms", rename = "timeout_ms", with = "millis")]
        timeout: Duration,
    },
    /// PostgreSQL JSONB tables, one per index.
    Jsonb { url: String },
}

/// A node declaration inline in the settings file or in a JSON file.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum NodeSource {
    File(PathBuf),
    Inline(serde_json::Value),
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct JobSettings {
    pub index: String,
    pub node: NodeSource,
    #[serde(default)]
    pub slot_name: Option<String>,
}

impl JobSettings {
    /// Parse the node declaration. Relative file paths resolve against
    /// `base_dir`.
    pub fn load_node(&self, base_dir: &Path) -> Result<Node> {
        match &self.node {
            NodeSource::Inline(value) => Ok(Node::from_value(value)?),
            NodeSource::File(path) => {
                let path = if path.is_relative() {
                    base_dir.join(path)
                } else {
                    path.clone()
                };
                let raw = std::fs::read_to_string(&path)
                    .with_context(|| format!("Failed to read node declaration {:?}", path))?;
                Ok(Node::from_json_str(&raw)?)
            }
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    #[serde(default)]
    pub source_url: Option<String>,
    #[serde(default = "default_schema")]
    pub schema: String,
    pub sink: SinkSettings,
    #[serde(default = "CheckpointFile::default_path")]
    pub checkpoint_path: PathBuf,
    /// Durable change buffer file; in-memory when absent.
    #[serde(default)]
    pub buffer_path: Option<PathBuf>,
    #[serde(default = "default_poll_interval", rename = "poll_interval_ms", with = "millis")]
    pub poll_interval: Duration,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_changes")]
    pub max_changes: usize,
    #[serde(default)]
    pub retry: RetryPolicy,
    /// LISTEN for trigger notifications and feed them to the buffers.
    #[serde(default = "default_listen")]
    pub listen: bool,
    #[serde(default)]
    pub jobs: Vec<JobSettings>,
}

fn default_schema() -> String {
    crate::postgres::DEFAULT_SCHEMA.to_string()
}

fn default_sink_timeout_ms() -> Duration {
    Duration::from_secs(30)
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_batch_size() -> usize {
    1_000
}

fn default_max_changes() -> usize {
    10_000
}

fn default_listen() -> bool {
    true
}

impl Settings {
    pub fn from_toml(raw: &str) -> Result<Self> {
        let settings: Settings = toml::from_str(raw).context("Failed to parse settings")?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read settings from {:?}", path))?;
        Self::from_toml(&raw).with_context(|| format!("Invalid settings in {:?}", path))
    }

    pub fn validate(&self) -> Result<()> {
        if self.jobs.is_empty() {
            bail!("At least one [[jobs]] entry is required");
        }
        if self.batch_size == 0 || self.max_changes == 0 {
            bail!("batch_size and max_changes must be positive");
        }
        let mut seen = HashSet::new();
        for job in &self.jobs {
            if !seen.insert(job.index.as_str()) {
                bail!("Index '{}' is configured by more than one job", job.index);
            }
        }
        Ok(())
    }

    /// Source URL from the CLI or environment, else from the file.
    pub fn resolve_source(&self, cli_source: Option<&str>) -> Result<String> {
        match cli_source.map(str::to_string).or_else(|| self.source_url.clone()) {
            Some(url) => Ok(url),
            None => bail!("No source database URL; set source_url or pass --source"),
        }
    }

    /// Database name from the source URL, used in slot names.
    pub fn database_name(source_url: &str) -> String {
        url::Url::parse(source_url)
            .ok()
            .and_then(|u| u.path_segments().and_then(|mut s| s.next().map(str::to_string)))
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| "postgres".to_string())
    }

    pub fn sync_options(&self, job: &JobSettings, database: &str) -> SyncOptions {
        let mut options = SyncOptions::new(job.index.clone());
        options.slot_name = job
            .slot_name
            .clone()
            .unwrap_or_else(|| crate::utils::slot_name(database, &job.index));
        options.batch_size = self.batch_size;
        options.max_changes = self.max_changes;
        options.poll_interval = self.poll_interval;
        options.retry = self.retry;
        options
    }

    /// Notification channel for a job's triggers.
    pub fn channel(job: &JobSettings) -> String {
        crate::utils::slot_name("replicator", &job.index)
    }
}
