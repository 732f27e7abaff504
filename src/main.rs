//! agora-node: peer-to-peer replicated community board node
//!
//! Runs the sync daemon: discovers peers, exchanges full/delta syncs,
//! floods new records across the mesh, and keeps the local SQLite store
//! converging with everyone else's. `export`/`import` move the dataset
//! out-of-band through the same validation pipeline the live protocol uses.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::sync::Mutex;
use tracing::info;

use agora_node::archive;
use agora_node::config::Config;
use agora_node::content::identity::Keystore;
use agora_node::events::EventBus;
use agora_node::store::ContentStore;
use agora_node::sync::engine::SyncEngine;
use agora_node::Node;

#[derive(Parser)]
#[command(name = "agora-node")]
#[command(about = "Peer-to-peer replicated community board node")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "agora-node.toml")]
    config: String,

    /// Data directory
    #[arg(short, long, env = "AGORA_DATA_DIR")]
    data_dir: Option<String>,

    /// Display name attached to locally-authored records
    #[arg(long, env = "AGORA_DISPLAY_NAME")]
    display_name: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Write the full local dataset to a JSON file
    Export {
        /// Output path
        #[arg(short, long)]
        out: PathBuf,
    },
    /// Merge a JSON export file into the local store
    Import {
        /// Input path
        file: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("agora_node=info".parse()?),
        )
        .init();

    let cli = Cli::parse();

    // Load or create default config
    let mut config = if std::path::Path::new(&cli.config).exists() {
        let content = std::fs::read_to_string(&cli.config)?;
        toml::from_str(&content)?
    } else {
        info!("Config file not found, using defaults");
        Config::default()
    };

    // Apply CLI overrides
    if let Some(data_dir) = cli.data_dir {
        config.node.data_dir = PathBuf::from(data_dir);
    }
    if let Some(display_name) = cli.display_name {
        config.node.display_name = Some(display_name);
    }

    info!("Data dir: {}", config.node.data_dir.display());

    // Export/import work directly against the store, no transport needed
    if let Some(command) = cli.command {
        let store = Arc::new(Mutex::new(ContentStore::open(&config.node.data_dir)?));
        match command {
            Command::Export { out } => {
                let records = archive::export_to_path(&store, &out).await?;
                println!("Exported {} records to {}", records, out.display());
            }
            Command::Import { file } => {
                let engine = SyncEngine::new(
                    store,
                    EventBus::default(),
                    Duration::from_millis(config.sync.dedup_ttl_ms),
                );
                let stats = archive::import_from_path(&engine, &file).await?;
                println!("Imported {} new records", stats.merged());
            }
        }
        return Ok(());
    }

    // Key management is external; the daemon itself authors nothing, so it
    // runs with the anonymous (non-signing) capability.
    let node = Node::start(config, Keystore::anonymous()).await?;
    info!(peer_id = %node.peer_id(), "Node running, ctrl-c to stop");

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    node.shutdown().await;

    Ok(())
}
