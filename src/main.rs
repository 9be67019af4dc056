//! NDC Reconciler - Cross-Cluster Workflow History Reconciliation
//!
//! Node binary: serves peers, applies replicated history, and drives
//! run migration between clusters.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use ndc_reconciler::api::{AdminService, AdminState};
use ndc_reconciler::cluster::ClusterMetadata;
use ndc_reconciler::config::{LoggingConfig, ReconcilerConfig, StorageBackend};
use ndc_reconciler::error::{Error, Result};
use ndc_reconciler::fetcher::{ClientBean, HistoryPaginatedFetcher};
use ndc_reconciler::id::RunKey;
use ndc_reconciler::lease::LeaseManager;
use ndc_reconciler::ndc::{HistoryReplicator, TransactionManagerImpl};
use ndc_reconciler::network::{NetworkClient, NetworkServer, PeerAdminClient};
use ndc_reconciler::persistence::{ExecutionStore, InMemoryStore, SqliteStore};
use ndc_reconciler::replication::{DeadLetterQueue, IngestSettings, TaskGenerator, TaskProcessor};

/// NDC Reconciler - Cross-Cluster Workflow History Reconciliation
#[derive(Parser)]
#[command(name = "ndc-reconciler")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "ndc-reconciler.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); overrides the config file
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the reconciler node
    Start,

    /// Initialize a new configuration file
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "ndc-reconciler.toml")]
        output: PathBuf,

        /// Name of the local cluster
        #[arg(long, default_value = "cluster-a")]
        cluster_name: String,
    },

    /// Validate configuration file
    Validate,

    /// Move a run to another cluster by replicating its last batch there
    Migrate {
        /// Node currently holding the run (host:port)
        #[arg(long)]
        from: String,

        /// Node that should pull the run (host:port)
        #[arg(long)]
        to: String,

        /// Namespace ID
        #[arg(long)]
        namespace: String,

        /// Workflow ID
        #[arg(long)]
        workflow_id: String,

        /// Run ID (defaults to the current run)
        #[arg(long, default_value = "")]
        run_id: String,
    },

    /// Query a node's status
    Status {
        /// Node address to query
        #[arg(short, long, default_value = "localhost:7700")]
        address: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Logging settings come from the config file when it is readable
    let logging = ReconcilerConfig::from_file(&cli.config)
        .map(|c| c.logging)
        .unwrap_or_default();
    init_logging(cli.log_level.as_deref().unwrap_or(&logging.level), &logging);

    match cli.command {
        Commands::Start => {
            run_start(cli.config).await
        }
        Commands::Init { output, cluster_name } => {
            run_init(output, cluster_name)
        }
        Commands::Validate => {
            run_validate(cli.config)
        }
        Commands::Migrate { from, to, namespace, workflow_id, run_id } => {
            run_migrate(from, to, RunKey::new(namespace, workflow_id, run_id)).await
        }
        Commands::Status { address } => {
            run_status(address).await
        }
    }
}

/// Initialize logging. `RUST_LOG` takes precedence over `level`.
fn init_logging(level: &str, logging: &LoggingConfig) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());

    let registry = tracing_subscriber::registry().with(env_filter);
    if logging.format == "compact" {
        registry.with(tracing_subscriber::fmt::layer().compact()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Client with the configured peer timeouts
fn network_client(config: Option<&ReconcilerConfig>) -> Arc<NetworkClient> {
    let (connect, request) = match config {
        Some(config) => (config.connect_timeout(), config.request_timeout()),
        None => (Duration::from_secs(3), Duration::from_secs(30)),
    };
    Arc::new(NetworkClient::new(connect, request))
}

/// Start the reconciler node
async fn run_start(config_path: PathBuf) -> Result<()> {
    tracing::info!("Starting reconciler node...");

    let config = match ReconcilerConfig::from_file(&config_path) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("Failed to load configuration from {:?}: {}", config_path, e);
            return Err(e);
        }
    };
    let metadata = Arc::new(ClusterMetadata::from_config(&config)?);
    tracing::info!(
        "Loaded configuration for cluster {} ({} peers)",
        metadata.current_cluster(),
        metadata.peers().len()
    );

    if let Err(e) = std::fs::create_dir_all(config.data_dir()) {
        tracing::error!("Failed to create data directory {:?}: {}", config.data_dir(), e);
        return Err(e.into());
    }

    let store: Arc<dyn ExecutionStore> = match config.storage.backend {
        StorageBackend::Memory => {
            tracing::warn!("Using the in-memory execution store; state is lost on exit");
            Arc::new(InMemoryStore::new())
        }
        StorageBackend::Sqlite => {
            let path = config.store_path();
            tracing::info!("Opening execution store at {:?}", path);
            Arc::new(SqliteStore::open(&path)?)
        }
    };

    let leases = LeaseManager::new();
    let transaction_manager = Arc::new(TransactionManagerImpl::new(store.clone(), leases.clone()));

    // Peer admin clients
    let network = network_client(Some(&config));
    let clients = ClientBean::new();
    for peer in metadata.peers() {
        tracing::info!("Registering peer cluster {} at {}", peer.name, peer.address);
        clients.register(
            peer.name.clone(),
            Arc::new(PeerAdminClient::new(peer.address.clone(), network.clone())),
        );
    }
    let fetcher = HistoryPaginatedFetcher::new(Arc::new(clients), config.replication.page_size);

    let replicator = Arc::new(HistoryReplicator::new(
        metadata.current_cluster(),
        transaction_manager.clone(),
        fetcher,
        metadata.clone(),
    ));

    let shutdown = CancellationToken::new();
    let dead_letters = Arc::new(DeadLetterQueue::new());
    let (task_tx, task_rx) = mpsc::channel(config.replication.queue_capacity);

    let processor = Arc::new(TaskProcessor::new(
        replicator,
        IngestSettings::from_config(&config),
        dead_letters.clone(),
    ));
    let processor_handle = {
        let processor = processor.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { processor.run(task_rx, shutdown).await })
    };

    let service = AdminService::new(AdminState {
        cluster_name: metadata.current_cluster().to_string(),
        store,
        leases,
        generator: TaskGenerator::new(metadata.current_cluster(), transaction_manager),
        tasks: task_tx,
        dead_letters: dead_letters.clone(),
        shutdown: shutdown.clone(),
    });
    let server = Arc::new(NetworkServer::new(
        config.node.bind_address.clone(),
        service.into_handler(),
    ));
    let server_handle = {
        let server = server.clone();
        tokio::spawn(async move {
            if let Err(e) = server.start().await {
                tracing::error!("Network server error: {}", e);
            }
        })
    };

    // Drop idle peer connections
    let cleanup_handle = {
        let network = network.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(60));
            loop {
                interval.tick().await;
                network.cleanup_stale(Duration::from_secs(300)).await;
            }
        })
    };

    tracing::info!("Reconciler node running on {}", config.node.bind_address);

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
    }
    tracing::info!("Received shutdown signal");

    shutdown.cancel();
    server.stop();
    cleanup_handle.abort();
    let _ = server_handle.await;
    let _ = processor_handle.await;
    network.close_all().await;

    write_dead_letters(&config, &dead_letters)?;

    tracing::info!("Reconciler shutdown complete");
    Ok(())
}

/// Persist dead letters for operators, one JSON object per line
fn write_dead_letters(config: &ReconcilerConfig, dead_letters: &DeadLetterQueue) -> Result<()> {
    use std::io::Write;

    let letters = dead_letters.drain();
    if letters.is_empty() {
        return Ok(());
    }

    let path = config.data_dir().join("dead_letters.jsonl");
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)?;
    for letter in &letters {
        let line = serde_json::to_string(letter)
            .map_err(|e| Error::Internal(format!("failed to encode dead letter: {}", e)))?;
        writeln!(file, "{}", line)?;
    }
    tracing::warn!("Wrote {} dead-lettered tasks to {:?}", letters.len(), path);
    Ok(())
}

/// Move a run between clusters
async fn run_migrate(from: String, to: String, run_key: RunKey) -> Result<()> {
    let network = network_client(None);
    let source = PeerAdminClient::new(from, network.clone());
    let target = PeerAdminClient::new(to, network);

    let (source_cluster, _, _) = source.status().await?;
    let (task, history_length) = match source.generate_replication_task(run_key.clone()).await {
        Ok(generated) => generated,
        Err(e) => {
            eprintln!("Failed to generate task for {}: {}", run_key, e);
            return Err(e);
        }
    };
    let migrated = task.run_key.clone();

    let accepted = target.replicate_tasks(&source_cluster, vec![task]).await?;
    if accepted == 0 {
        eprintln!("{} did not accept the task, its queue is full", target.address());
        return Err(Error::Unavailable(target.address().to_string()));
    }

    let summary = serde_json::json!({
        "run": migrated.to_string(),
        "from": source_cluster,
        "to": target.address(),
        "history_length": history_length,
    });
    println!(
        "{}",
        serde_json::to_string_pretty(&summary)
            .map_err(|e| Error::Internal(e.to_string()))?
    );
    Ok(())
}

/// Query a node's status
async fn run_status(address: String) -> Result<()> {
    let peer = PeerAdminClient::new(address, network_client(None));

    match peer.status().await {
        Ok((cluster_name, leases, dead_letters)) => {
            let status = serde_json::json!({
                "cluster": cluster_name,
                "leases": leases,
                "dead_letters": dead_letters,
            });
            println!(
                "{}",
                serde_json::to_string_pretty(&status)
                    .map_err(|e| Error::Internal(e.to_string()))?
            );
            Ok(())
        }
        Err(e) => {
            eprintln!("Failed to get status: {}", e);
            Err(e)
        }
    }
}

/// Initialize configuration file
fn run_init(output: PathBuf, cluster_name: String) -> Result<()> {
    let config_content = format!(r#"# NDC Reconciler Configuration
# Generated configuration file

# Versions v with v % increment == initial_failover_version were
# written by that cluster
failover_version_increment = 10

[node]
cluster_name = "{cluster_name}"
bind_address = "0.0.0.0:7700"
data_dir = "/var/lib/ndc-reconciler/{cluster_name}"

[[clusters]]
name = "cluster-a"
address = "10.0.0.1:7700"
initial_failover_version = 1

[[clusters]]
name = "cluster-b"
address = "10.0.0.2:7700"
initial_failover_version = 2

[replication]
workers = 8
queue_capacity = 1024
page_size = 100
max_attempts = 5
retry_backoff_ms = 200
max_retry_backoff_ms = 10000
reconcile_timeout_ms = 30000
connect_timeout_ms = 3000
request_timeout_ms = 10000

[storage]
backend = "sqlite"

[logging]
level = "info"
format = "pretty"
"#);

    std::fs::write(&output, config_content)?;
    println!("Configuration file created: {}", output.display());
    println!("\nEdit the [[clusters]] entries to match your deployment.");
    println!("Then start with: ndc-reconciler start --config {}", output.display());

    Ok(())
}

/// Validate configuration
fn run_validate(config_path: PathBuf) -> Result<()> {
    match ReconcilerConfig::from_file(&config_path).and_then(|config| {
        let metadata = ClusterMetadata::from_config(&config)?;
        Ok((config, metadata))
    }) {
        Ok((config, metadata)) => {
            println!("✓ Configuration is valid");
            println!("  Cluster:        {}", metadata.current_cluster());
            println!("  Bind Address:   {}", config.node.bind_address);
            println!("  Data Directory: {}", config.data_dir().display());
            println!("  Storage:        {:?}", config.storage.backend);
            println!("  Workers:        {}", config.replication.workers);
            for peer in metadata.peers() {
                println!(
                    "  Peer:           {} at {} (versions ≡ {} mod {})",
                    peer.name,
                    peer.address,
                    peer.initial_failover_version,
                    config.failover_version_increment
                );
            }
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration error: {}", e);
            Err(e)
        }
    }
}
