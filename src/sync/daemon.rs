// ABOUTME: Multi-job daemon - runs one sync job per index as independent tokio tasks
// ABOUTME: Fans a single shutdown signal out to every job and collects their results

use anyhow::Result;
use tokio::sync::broadcast;
use tokio::task::JoinSet;

use super::orchestrator::SyncJob;

/// Runs a set of jobs concurrently. Jobs share nothing mutable; each owns
/// its session, writer and slot.
pub struct SyncDaemon {
    jobs: Vec<SyncJob>,
}

impl SyncDaemon {
    pub fn new(jobs: Vec<SyncJob>) -> Self {
        Self { jobs }
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Run every job until `shutdown` fires or all jobs stop.
    ///
    /// A job that stops with an error does not stop the others. Once every
    /// task has finished, `shutdown` is signalled so other subscribers (such
    /// as notification listeners) stop too. Returns an error naming the
    /// failed jobs.
    pub async fn run(self, shutdown: broadcast::Sender<()>) -> Result<()> {
        let mut tasks = JoinSet::new();
        for mut job in self.jobs {
            let receiver = shutdown.subscribe();
            tasks.spawn(async move {
                let index = job.index().to_string();
                let result = job.run(receiver).await;
                (index, result)
            });
        }

        let mut failed = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, Ok(()))) => tracing::info!("Sync job for {} stopped", index),
                Ok((index, Err(e))) => {
                    tracing::error!("Sync job for {} failed: {}", index, e);
                    failed.push(index);
                }
                Err(e) => {
                    tracing::error!("Sync job task panicked: {}", e);
                    failed.push("<panicked>".to_string());
                }
            }
        }

        let _ = shutdown.send(());

        if failed.is_empty() {
            Ok(())
        } else {
            anyhow::bail!("Sync jobs failed: {}", failed.join(", "))
        }
    }
}
