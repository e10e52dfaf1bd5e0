//! QuillSync - Document Database Replication Layer
//!
//! Node binary: loads configuration, opens the storage engine and
//! replication services, and serves the replication HTTP API.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use quillsync::api::HttpServer;
use quillsync::config::QuillSyncConfig;
use quillsync::error::Result;
use quillsync::node::ReplicationNode;

/// QuillSync - Document Database Replication Layer
#[derive(Parser)]
#[command(name = "quillsync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "quillsync.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the QuillSync node
    Start,

    /// Initialize a new configuration file
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "quillsync.toml")]
        output: PathBuf,

        /// Node ID
        #[arg(long, default_value = "quill-1")]
        node_id: String,
    },

    /// Validate configuration file
    Validate,

    /// Show node information
    Info,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(&cli.log_level);

    match cli.command {
        Commands::Start => run_start(cli.config).await,
        Commands::Init { output, node_id } => run_init(output, node_id),
        Commands::Validate => run_validate(cli.config),
        Commands::Info => run_info(cli.config),
    }
}

/// Initialize logging
fn init_logging(level: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Start the QuillSync node
async fn run_start(config_path: PathBuf) -> Result<()> {
    tracing::info!("Starting QuillSync node...");

    let config = match QuillSyncConfig::from_file(&config_path) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("Failed to load configuration from {:?}: {}", config_path, e);
            tracing::error!("Please check that the config file exists and is valid TOML");
            return Err(e);
        }
    };
    tracing::info!("Loaded configuration for node: {}", config.node.id);

    if let Err(e) = std::fs::create_dir_all(&config.node.data_dir) {
        tracing::error!(
            "Failed to create data directory {:?}: {}",
            config.node.data_dir,
            e
        );
        return Err(e.into());
    }
    if let Err(e) = std::fs::create_dir_all(config.archive_dir()) {
        tracing::error!(
            "Failed to create WAL archive directory {:?}: {}",
            config.archive_dir(),
            e
        );
        return Err(e.into());
    }

    let api_config = config.api.clone();
    let node = ReplicationNode::open(config)?;
    tracing::info!(
        "Engine opened, current tick: {}",
        node.engine().current_sequence()
    );

    let _sweeper = node.spawn_sweeper();
    let http_server = HttpServer::new(api_config, Arc::clone(&node));

    tokio::select! {
        result = http_server.start() => {
            if let Err(e) = result {
                tracing::error!("HTTP server error: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received shutdown signal");
        }
    }

    // flush any partial WAL batch group before exit
    if let Err(e) = node.flush() {
        tracing::error!("Failed to flush WAL on shutdown: {}", e);
    }
    tracing::info!("QuillSync shutdown complete");
    Ok(())
}

/// Initialize configuration file
fn run_init(output: PathBuf, node_id: String) -> Result<()> {
    let config_content = format!(
        r#"# QuillSync Configuration
# Generated configuration file

[node]
id = "{node_id}"
data_dir = "/var/lib/quillsync/{node_id}"
database_id = 1

[wal]
compression = true
segment_batches = 64
grace_window_secs = 60
archive_cap_mb = 1024
sweep_interval_ms = 1000

[replication]
context_ttl_secs = 300
chunk_bytes = 131072
max_chunk_bytes = 10485760
keys_per_chunk = 5000

[api]
enabled = true
bind_address = "0.0.0.0:8529"
cors_enabled = false

[logging]
level = "info"
format = "pretty"
"#
    );

    std::fs::write(&output, config_content)?;
    println!("Configuration file created: {}", output.display());
    println!("\nEdit the file to configure the node, then start with:");
    println!("  quillsync start --config {}", output.display());

    Ok(())
}

/// Validate configuration
fn run_validate(config_path: PathBuf) -> Result<()> {
    match QuillSyncConfig::from_file(&config_path) {
        Ok(config) => {
            println!("✓ Configuration is valid");
            println!("  Node ID: {}", config.node.id);
            println!("  Database ID: {}", config.node.database_id);
            println!("  Data Directory: {}", config.node.data_dir.display());
            println!("  API Bind Address: {}", config.api.bind_address);
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration error: {}", e);
            Err(e)
        }
    }
}

/// Show node information
fn run_info(config_path: PathBuf) -> Result<()> {
    let config = QuillSyncConfig::from_file(&config_path)?;

    println!("QuillSync Node Information");
    println!("==========================");
    println!();
    println!("Node ID:          {}", config.node.id);
    println!("Database ID:      {}", config.node.database_id);
    println!("Data Directory:   {}", config.node.data_dir.display());
    println!("Archive:          {}", config.archive_dir().display());
    println!();
    println!("WAL Configuration:");
    println!("  Compression:    {}", config.wal.compression);
    println!("  Segment Size:   {} batches", config.wal.segment_batches);
    println!("  Grace Window:   {}s", config.wal.grace_window_secs);
    println!("  Archive Cap:    {} MB", config.wal.archive_cap_mb);
    println!();
    println!("Replication Configuration:");
    println!("  Context TTL:    {}s", config.replication.context_ttl_secs);
    println!("  Chunk Bytes:    {}", config.replication.chunk_bytes);
    println!("  Keys Per Chunk: {}", config.replication.keys_per_chunk);
    println!();
    println!("API: {} on {}",
        if config.api.enabled { "enabled" } else { "disabled" },
        config.api.bind_address);

    Ok(())
}
