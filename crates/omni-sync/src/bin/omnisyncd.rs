//! # omnisyncd
//!
//! Standalone sync daemon. Loads configuration, opens the database, registers
//! channel adapters, and runs the engine until Ctrl-C.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use omni_store::{Database, DbConfig};
use omni_sync::channels::memory::InMemoryChannel;
use omni_sync::{ChannelRegistry, EngineConfig, SyncEngine, TracingSink};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    if let Err(e) = run().await {
        error!(error = %e, "omnisyncd exited with error");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = EngineConfig::load(config_path)?;

    let db = Arc::new(
        Database::new(
            DbConfig::new(&config.database.path).max_connections(config.database.max_connections),
        )
        .await?,
    );

    // Simulator channel for local runs; real adapters register here.
    let mut registry = ChannelRegistry::new();
    registry.register(Arc::new(InMemoryChannel::new("shopmart")));
    info!(channels = ?registry.codes(), "Channel adapters registered");

    let engine = SyncEngine::new(db, config, Arc::new(registry), Arc::new(TracingSink));
    engine.start();

    tokio::signal::ctrl_c().await?;
    info!("Received shutdown signal");
    engine.shutdown().await;
    engine.db().close().await;

    Ok(())
}
