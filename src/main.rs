//! Stream Relay CLI Application
//!
//! Runs a relay node, or generates an identity.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use stream_relay::crypto::KeyPair;
use stream_relay::engine::{Config, SeedPeer};
use stream_relay::network::Node;
use stream_relay::storage::{PersistedState, Storage, StorageConfig};

#[derive(Parser)]
#[command(name = "relay")]
#[command(author = "Darshan")]
#[command(version = "0.1.0")]
#[command(about = "A UDP gossip relay with NAT traversal", long_about = None)]
struct Cli {
    /// Data directory for relay state
    #[arg(short, long, default_value = ".relay_data")]
    data_dir: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a relay node
    Start {
        /// JSON configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Main UDP port
        #[arg(short, long)]
        port: Option<u16>,

        /// Reflection test port
        #[arg(long)]
        test_port: Option<u16>,

        /// Run as a static introducer
        #[arg(long)]
        introducer: bool,

        /// Cluster to join
        #[arg(long)]
        cluster_id: Option<String>,

        /// Known public address
        #[arg(short, long)]
        address: Option<String>,

        /// Bootstrap peers as peer_id@address:port (comma-separated)
        #[arg(long)]
        seeds: Option<String>,
    },

    /// Generate a new identity
    Keygen,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logger
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Keygen => {
            let keys = KeyPair::generate();
            println!("Peer ID:     {}", keys.peer_id());
            println!("Public key:  {}", keys.public_key_hex());
            println!("Private key: {}", keys.private_key_hex());
        }

        Commands::Start {
            config,
            port,
            test_port,
            introducer,
            cluster_id,
            address,
            seeds,
        } => {
            let storage = Storage::new(StorageConfig {
                data_dir: cli.data_dir.clone(),
                ..Default::default()
            })?;

            let mut state = if storage.exists() {
                log::info!("Loading relay state from {}", cli.data_dir.display());
                storage.load_or_recover()?
            } else {
                PersistedState::default()
            };

            if let Some(path) = config {
                // identity survives a config file without keys
                let file = Config::load(&path)?;
                let keys = state.config.keys.take();
                let peer_id = state.config.peer_id.take();
                state.config = Config {
                    keys: file.keys.clone().or(keys),
                    peer_id: file.peer_id.clone().or(peer_id),
                    ..file
                };
            }

            let overrides = &mut state.config;
            if let Some(port) = port {
                overrides.port = port;
            }
            if let Some(test_port) = test_port {
                overrides.test_port = test_port;
            }
            if introducer {
                overrides.introducer = true;
            }
            if cluster_id.is_some() {
                overrides.cluster_id = cluster_id;
            }
            if address.is_some() {
                overrides.address = address;
            }
            if let Some(seeds) = seeds {
                overrides.seeds = parse_seeds(&seeds)?;
            }

            run_node(state, &storage)?;
        }
    }

    Ok(())
}

fn run_node(state: PersistedState, storage: &Storage) -> Result<(), Box<dyn std::error::Error>> {
    let rt = tokio::runtime::Runtime::new()?;

    rt.block_on(async {
        let (node, handle) = Node::restore(state).await?;
        println!("Relay {} listening on {}", node.peer().peer_id(), node.local_addr()?);

        let running = tokio::spawn(node.run());

        tokio::signal::ctrl_c().await?;
        log::info!("Shutting down...");
        handle.close().await?;

        let peer = running.await??;
        storage.save(&peer.state())?;
        log::info!("Saved {} cached packets", peer.cache().len());

        Ok::<(), Box<dyn std::error::Error>>(())
    })
}

/// Parse `peer_id@address:port` entries
fn parse_seeds(list: &str) -> Result<Vec<SeedPeer>, String> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|entry| {
            let (peer_id, endpoint) = entry
                .split_once('@')
                .ok_or_else(|| format!("Invalid seed (expected id@address:port): {}", entry))?;
            let (address, port) = endpoint
                .rsplit_once(':')
                .ok_or_else(|| format!("Invalid seed endpoint: {}", endpoint))?;
            let port = port
                .parse::<u16>()
                .map_err(|_| format!("Invalid seed port: {}", port))?;
            Ok(SeedPeer {
                address: address.to_string(),
                port,
                peer_id: peer_id.to_string(),
            })
        })
        .collect()
}
