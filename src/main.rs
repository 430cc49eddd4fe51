// ABOUTME: CLI entry point for document-replicator
// ABOUTME: Parses commands, wires PostgreSQL, buffers and sinks into sync jobs

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use document_replicator::config::{JobSettings, Settings, SinkSettings};
use document_replicator::node::NodePlan;
use document_replicator::postgres::{self, NotifyListener, PgCatalog, PgReplicationSource, PgSession};
use document_replicator::schema::{CachedCatalog, SchemaCatalog};
use document_replicator::sink::{ElasticsearchSink, JsonbSink, Sink};
use document_replicator::sync::{
    Buffer, CheckpointStore, CycleStats, FileCheckpointStore, JobContext, MemoryBuffer,
    QueueBuffer, ReplicationSource, SyncDaemon, SyncJob,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast;

#[derive(Parser)]
#[command(name = "document-replicator")]
#[command(about = "Keep a document store convergent with a PostgreSQL schema", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to the settings file
    #[arg(long, short = 'c', global = true, env = "REPLICATOR_CONFIG", default_value = "replicator.toml")]
    config: PathBuf,
    /// Source database URL (overrides source_url in the settings file)
    #[arg(long, global = true, env = "REPLICATOR_SOURCE_URL")]
    source: Option<String>,
    /// Set the log level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    log: String,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create replication slots and notify triggers for every job
    Bootstrap {
        /// Only create slots; do not install notify triggers
        #[arg(long)]
        no_triggers: bool,
    },
    /// Derive documents and keep them convergent with the source
    Sync {
        /// Run one full resync and one receive cycle, then exit
        #[arg(long)]
        once: bool,
        /// Only run the job writing to this index
        #[arg(long)]
        index: Option<String>,
    },
    /// Show persisted checkpoints
    Checkpoint,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    // 1. RUST_LOG environment variable has highest precedence
    // 2. --log flag is used if RUST_LOG is not set
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(cli.log.clone()));

    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let settings = Settings::load(&cli.config)?;
    let source_url = settings.resolve_source(cli.source.as_deref())?;
    let base_dir = cli
        .config
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_default();

    match cli.command {
        Commands::Bootstrap { no_triggers } => {
            bootstrap(&settings, &source_url, &base_dir, no_triggers).await
        }
        Commands::Sync { once, index } => {
            sync(&settings, &source_url, &base_dir, once, index.as_deref()).await
        }
        Commands::Checkpoint => show_checkpoints(&settings, &source_url).await,
    }
}

fn selected_jobs<'a>(settings: &'a Settings, index: Option<&str>) -> Result<Vec<&'a JobSettings>> {
    let jobs: Vec<&JobSettings> = settings
        .jobs
        .iter()
        .filter(|job| index.map(|i| i == job.index).unwrap_or(true))
        .collect();
    if jobs.is_empty() {
        anyhow::bail!("No job writes to index '{}'", index.unwrap_or_default());
    }
    Ok(jobs)
}

async fn catalog(settings: &Settings, source_url: &str) -> Result<Arc<CachedCatalog<PgCatalog>>> {
    let client = postgres::connect_with_retry(source_url).await?;
    Ok(Arc::new(CachedCatalog::new(PgCatalog::new(
        Arc::new(client),
        settings.schema.clone(),
    ))))
}

async fn bootstrap(settings: &Settings, source_url: &str, base_dir: &Path, no_triggers: bool) -> Result<()> {
    let catalog = catalog(settings, source_url).await?;
    let source = PgReplicationSource::new(
        postgres::connect_with_retry(source_url).await?,
        settings.schema.clone(),
        catalog.clone(),
    );
    let admin = postgres::connect_with_retry(source_url).await?;
    let database = Settings::database_name(source_url);

    let mut plans = Vec::new();
    let mut tables: Vec<String> = Vec::new();
    for job in &settings.jobs {
        let node = job.load_node(base_dir)?;
        let schema = catalog.load(&node.tables()).await?;
        let plan = NodePlan::build(&node, &schema)
            .with_context(|| format!("Invalid node declaration for index {}", job.index))?;
        for table in plan.tables() {
            if !tables.contains(&table) {
                tables.push(table);
            }
        }
        plans.push((job, plan));
    }

    let readiness = postgres::check_source(&admin, &settings.schema, &tables).await?;
    let problems = readiness.problems(!no_triggers);
    if !problems.is_empty() {
        for problem in &problems {
            println!("✗ {}", problem);
        }
        anyhow::bail!("Source database is not ready for replication");
    }
    println!("✓ Source ready (wal_level = {})", readiness.wal_level);

    for (job, plan) in plans {
        let options = settings.sync_options(job, &database);

        source.open_slot(&options.slot_name).await?;
        println!("✓ Replication slot {} ready for {}", options.slot_name, job.index);

        if !no_triggers {
            let tables: Vec<(String, Vec<String>)> = plan
                .nodes()
                .iter()
                .map(|n| (n.table.clone(), n.primary_key.clone()))
                .collect();
            postgres::install_triggers(&admin, &settings.schema, &Settings::channel(job), &tables).await?;
            println!("✓ Notify triggers installed on {} tables", tables.len());
        }
    }
    Ok(())
}

/// Everything the jobs share plus the listener tasks feeding their buffers.
struct Wiring {
    jobs: Vec<SyncJob>,
    listeners: Vec<(NotifyListener, String)>,
}

async fn build_sink(settings: &Settings) -> Result<Arc<dyn Sink>> {
    let sink: Arc<dyn Sink> = match &settings.sink {
        SinkSettings::Elasticsearch { url, api_key, timeout } => {
            Arc::new(ElasticsearchSink::new(url, api_key.clone(), *timeout)?)
        }
        SinkSettings::Jsonb { url } => Arc::new(JsonbSink::new(postgres::connect_with_retry(url).await?)),
    };
    Ok(sink)
}

fn build_buffer(settings: &Settings, job: &JobSettings) -> Result<Arc<dyn Buffer>> {
    let buffer: Arc<dyn Buffer> = match &settings.buffer_path {
        Some(path) => Arc::new(QueueBuffer::open(path, &Settings::channel(job), settings.max_changes)?),
        None => Arc::new(MemoryBuffer::new()),
    };
    Ok(buffer)
}

async fn build_jobs(
    settings: &Settings,
    source_url: &str,
    base_dir: &Path,
    index: Option<&str>,
) -> Result<Wiring> {
    let catalog = catalog(settings, source_url).await?;
    let source: Arc<dyn ReplicationSource> = Arc::new(PgReplicationSource::new(
        postgres::connect_with_retry(source_url).await?,
        settings.schema.clone(),
        catalog.clone(),
    ));
    let sink = build_sink(settings).await?;
    let checkpoints: Arc<dyn CheckpointStore> =
        Arc::new(FileCheckpointStore::new(&settings.checkpoint_path, source_url));
    let database = Settings::database_name(source_url);

    let mut wiring = Wiring {
        jobs: Vec::new(),
        listeners: Vec::new(),
    };
    for job in selected_jobs(settings, index)? {
        let node = job.load_node(base_dir)?;
        let schema = catalog.load(&node.tables()).await?;
        let buffer = build_buffer(settings, job)?;
        if settings.listen {
            let channel = Settings::channel(job);
            wiring.listeners.push((
                NotifyListener::new(source_url, channel.clone(), buffer.clone()),
                channel,
            ));
        }

        let session = PgSession::new(postgres::connect_with_retry(source_url).await?, settings.schema.clone());
        let ctx = JobContext {
            session: Box::new(session),
            source: source.clone(),
            buffer,
            sink: sink.clone(),
            checkpoints: checkpoints.clone(),
        };
        let sync_job = SyncJob::new(&node, &schema, settings.sync_options(job, &database), ctx)
            .with_context(|| format!("Invalid node declaration for index {}", job.index))?;
        wiring.jobs.push(sync_job);
    }
    Ok(wiring)
}

fn print_stats(label: &str, index: &str, stats: &CycleStats) {
    println!("{} for {}:", label, index);
    println!("  Changes read: {}", stats.changes);
    println!("  Documents upserted: {}", stats.upserted);
    println!("  Documents unchanged: {}", stats.unchanged);
    println!("  Documents deleted: {}", stats.deleted);
    if stats.rejected > 0 {
        println!("  Documents rejected: {}", stats.rejected);
    }
    if !stats.errors.is_empty() {
        println!("  Errors: {}", stats.errors.len());
    }
    println!("  Duration: {}ms", stats.duration_ms);
}

async fn sync(
    settings: &Settings,
    source_url: &str,
    base_dir: &Path,
    once: bool,
    index: Option<&str>,
) -> Result<()> {
    let wiring = build_jobs(settings, source_url, base_dir, index).await?;

    // Create shutdown channel
    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let mut listener_tasks = Vec::new();
    for (listener, channel) in wiring.listeners {
        let shutdown_rx = shutdown_tx.subscribe();
        listener_tasks.push(tokio::spawn(async move {
            if let Err(e) = listener.run(shutdown_rx).await {
                tracing::error!("Notification listener on {} stopped: {:#}", channel, e);
            }
        }));
    }

    let result = if once {
        let mut result = Ok(());
        for mut job in wiring.jobs {
            let resync = job.full_resync().await?;
            print_stats("Full resync", job.index(), &resync);
            let cycle = job.receive_once().await?;
            print_stats("Receive cycle", job.index(), &cycle);
            if !resync.is_success() || !cycle.is_success() {
                result = Err(anyhow::anyhow!("Sync of {} finished with errors", job.index()));
            }
        }
        let _ = shutdown_tx.send(());
        result
    } else {
        tracing::info!("Starting {} sync jobs", wiring.jobs.len());
        tracing::info!("Press Ctrl+C to stop");

        // Set up Ctrl+C handler
        let shutdown_tx_clone = shutdown_tx.clone();
        tokio::spawn(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for Ctrl+C: {}", e);
                return;
            }
            tracing::info!("Received shutdown signal");
            let _ = shutdown_tx_clone.send(());
        });

        SyncDaemon::new(wiring.jobs).run(shutdown_tx.clone()).await
    };

    for task in listener_tasks {
        let _ = task.await;
    }
    result
}

async fn show_checkpoints(settings: &Settings, source_url: &str) -> Result<()> {
    let store = FileCheckpointStore::new(&settings.checkpoint_path, source_url);
    let file = store.read_all().await?;
    println!("Checkpoints in {:?}", store.path());
    println!("  Source: {}", document_replicator::utils::sanitize_url(&file.source_url));
    for job in &settings.jobs {
        match file.indices.get(&job.index) {
            Some(checkpoint) => println!(
                "  {}: txid {} (updated {})",
                job.index, checkpoint.txmin, checkpoint.updated_at
            ),
            None => println!("  {}: none (next sync runs a full resync)", job.index),
        }
    }
    Ok(())
}
