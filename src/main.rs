//! Collaboration gateway server binary.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;

use praxis_collab::coordinator::Registry;
use praxis_collab::gateway::{self, GatewayConfig};
use praxis_collab::storage::{SnapshotStore, StoreConfig};

#[derive(Debug, Parser)]
#[command(name = "praxis-collab-server", about = "Collaborative notebook sync gateway")]
struct Args {
    /// Address to bind the gateway to.
    #[arg(long, default_value = "127.0.0.1:8787")]
    bind: String,

    /// Snapshot database path; omit for in-memory (state lost on exit).
    #[arg(long)]
    data: Option<PathBuf>,

    /// Shared auth token; when set, clients must pass ?token=...
    #[arg(long, env = "COLLAB_AUTH_TOKEN")]
    auth_token: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args = Args::parse();

    let store_config = match &args.data {
        Some(path) => StoreConfig::at(path),
        None => {
            log::warn!("no --data path given; snapshots are in-memory only");
            StoreConfig::in_memory()
        }
    };
    let store = Arc::new(SnapshotStore::open(store_config)?);
    let registry = Arc::new(Registry::new(store));

    let config = GatewayConfig {
        bind_addr: args.bind,
        auth_token: args.auth_token,
    };
    let (_addr, server) = gateway::serve(config, registry).await?;
    server.await?;
    Ok(())
}
