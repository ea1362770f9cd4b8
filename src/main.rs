//! Blockade node
//!
//! Runs the blocker and syncer loops against a local enforcement daemon.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use blockade::{
    config::Config,
    daemon::{EnforcementDaemon, HttpDaemon},
    peer::{HttpPeerClient, PeerClient, DEFAULT_PEER_TIMEOUT},
    store::{MemoryStore, PersistentStore, SledStore},
    Service,
};

fn parse_args(mut config: Config) -> Config {
    let args: Vec<String> = std::env::args().collect();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--data-dir" | "-d" => {
                i += 1;
                if i < args.len() {
                    config.data_dir = PathBuf::from(&args[i]);
                }
            }
            "--daemon" => {
                i += 1;
                if i < args.len() {
                    config.daemon.url.clone_from(&args[i]);
                }
            }
            "--peer" | "-p" => {
                i += 1;
                if i < args.len() {
                    config.syncer.peers.push(args[i].clone());
                }
            }
            "--in-memory" => config.in_memory = true,
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            other => warn!("Ignoring unknown argument: {}", other),
        }
        i += 1;
    }

    config
}

fn print_help() {
    println!("Blockade Node");
    println!();
    println!("USAGE:");
    println!("    blockade-node [OPTIONS]");
    println!();
    println!("OPTIONS:");
    println!("    -d, --data-dir <DIR>        Database directory");
    println!("    --daemon <URL>              Enforcement daemon URL (default: http://127.0.0.1:9980)");
    println!("    -p, --peer <URL>            Peer to sync blocklists from (repeatable)");
    println!("    --in-memory                 Keep records in memory only");
    println!("    -h, --help                  Print help");
    println!();
    println!("ENVIRONMENT:");
    println!("    BLOCKADE_*                  See Config::from_env; flags take precedence");
    println!("    RUST_LOG                    Log filter (default: info)");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    info!("Blockade node v{}", blockade::VERSION);

    let config = parse_args(Config::from_env()?);
    config.validate()?;

    let store: Arc<dyn PersistentStore> = if config.in_memory {
        info!("Using in-memory store");
        Arc::new(MemoryStore::new())
    } else {
        Arc::new(SledStore::open(&config.data_dir)?)
    };

    let daemon = Arc::new(HttpDaemon::new(config.daemon.clone())?);
    if daemon.is_up().await {
        info!(url = %config.daemon.url, "Enforcement daemon is ready");
    } else {
        warn!(url = %config.daemon.url, "Enforcement daemon is not ready yet, loops will keep retrying");
    }

    let mut peers: Vec<Arc<dyn PeerClient>> = Vec::with_capacity(config.syncer.peers.len());
    for url in &config.syncer.peers {
        peers.push(Arc::new(HttpPeerClient::new(url.as_str(), DEFAULT_PEER_TIMEOUT)?));
    }

    let mut service = Service::new(&config, store, daemon, peers);
    service.start()?;

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");
    service.stop().await;

    Ok(())
}
