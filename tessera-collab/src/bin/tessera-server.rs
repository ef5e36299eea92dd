//! Tessera sync server binary.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use log::info;
use uuid::Uuid;

use tessera_collab::{
    BroadcastBus, DocumentStore, InProcessBus, MemoryStore, RelayBus, RelayHub, RocksStore, ServerConfig,
    StaticIdentity, StoreConfig, SyncServer,
};

/// Server command line arguments.
#[derive(Parser, Debug)]
#[command(name = "tessera-server")]
#[command(about = "Real-time document sync server")]
struct Args {
    /// TOML config file
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Listen address, overrides the config file
    #[arg(short, long, value_name = "ADDR")]
    bind: Option<String>,

    /// RocksDB directory, overrides the config file
    #[arg(short, long, value_name = "PATH")]
    storage: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => ServerConfig::load(path)?,
        None => ServerConfig::default(),
    };
    if let Some(bind) = args.bind {
        config.bind_addr = bind;
    }
    if let Some(storage) = args.storage {
        config.storage_path = Some(storage);
    }
    config.validate()?;

    let store: Arc<dyn DocumentStore> = match &config.storage_path {
        Some(path) => Arc::new(RocksStore::open(StoreConfig {
            path: path.clone(),
            ..StoreConfig::default()
        })?),
        None => {
            info!("No storage path configured, documents are kept in memory");
            Arc::new(MemoryStore::new())
        }
    };

    let instance_id = Uuid::new_v4();
    // Keeps an in-process hub alive for the lifetime of the server.
    let mut _hub = None;
    let bus: Arc<dyn BroadcastBus> = match (&config.relay.hub_bind, &config.relay.hub_url) {
        (Some(addr), _) => {
            let hub = RelayHub::bind(addr).await?;
            let bus = RelayBus::connect(&hub.url(), instance_id).await?;
            _hub = Some(hub);
            Arc::new(bus)
        }
        (None, Some(url)) => Arc::new(RelayBus::connect(url, instance_id).await?),
        (None, None) => Arc::new(InProcessBus::standalone()),
    };

    let identity = Arc::new(StaticIdentity::new(config.users.clone()));
    if config.users.is_empty() {
        log::warn!("No [[users]] configured; every connection will be rejected");
    }

    let server = SyncServer::new(config, store, identity, bus);
    tokio::select! {
        result = server.run() => result?,
        _ = tokio::signal::ctrl_c() => info!("Shutting down"),
    }
    server.shutdown().await;
    Ok(())
}
