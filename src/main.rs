//! sec-node: run a peer-to-peer node
//!
//! Starts discovery and the RLPx transport from a JSON config file and
//! command line overrides, then exchanges SEC status with every peer.

use clap::{Parser, Subcommand};
use sec_p2p::config::NodeConfig;
use sec_p2p::discovery::Discovery;
use sec_p2p::rlpx::{Peer, Rlpx, RlpxEvent};
use sec_p2p::sec::{SecEvent, Status, STATUS_TIMEOUT};
use sec_p2p::KeyPair;
use std::path::PathBuf;
use tokio::sync::broadcast::error::RecvError;

#[derive(Parser)]
#[command(name = "sec-node")]
#[command(version)]
#[command(about = "Peer discovery, RLPx transport and the SEC sub-protocol", long_about = None)]
struct Cli {
    /// JSON config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a node
    Start {
        /// Discovery (UDP) port
        #[arg(long)]
        udp_port: Option<u16>,

        /// RLPx (TCP) port
        #[arg(long)]
        tcp_port: Option<u16>,

        /// Do not accept inbound connections
        #[arg(long)]
        no_listen: bool,

        /// Comma-separated discovery seeds (ip:port)
        #[arg(short, long)]
        bootnodes: Option<String>,

        /// Maximum number of peers
        #[arg(short, long)]
        max_peers: Option<usize>,
    },

    /// Generate a new node identity
    Keygen,

    /// Write a default config file
    InitConfig {
        /// Output path
        #[arg(short, long, default_value = "node.json")]
        output: PathBuf,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logger
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let mut config = match &cli.config {
        Some(path) => NodeConfig::load(path)?,
        None => NodeConfig::default(),
    };

    match cli.command {
        Commands::Keygen => {
            let key = KeyPair::generate();
            println!("Private key: {}", key.private_key_hex());
            println!("Node id:     {}", key.node_id().to_hex());
        }

        Commands::InitConfig { output } => {
            let config = NodeConfig {
                private_key: Some(KeyPair::generate().private_key_hex()),
                ..config
            };
            config.save(&output)?;
            println!("Config written to {}", output.display());
        }

        Commands::Start {
            udp_port,
            tcp_port,
            no_listen,
            bootnodes,
            max_peers,
        } => {
            if let Some(port) = udp_port {
                config.udp_port = port;
            }
            if let Some(port) = tcp_port {
                config.tcp_port = Some(port);
            }
            if no_listen {
                config.tcp_port = None;
            }
            if let Some(nodes) = bootnodes {
                config.bootnodes = nodes.split(',').map(|s| s.trim().to_string()).collect();
            }
            if let Some(max) = max_peers {
                config.max_peers = max;
            }

            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(run_node(config))
                .map_err(|e| -> Box<dyn std::error::Error> { e })?;
        }
    }

    Ok(())
}

async fn run_node(config: NodeConfig) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let key = config.key_pair()?;
    let status = config.status()?;
    let seeds = config.bootnode_endpoints()?;

    println!("🌐 Starting node {}", key.node_id());

    let discovery = Discovery::new(key.clone(), config.discovery_config());
    discovery.bind().await?;

    let rlpx = Rlpx::new(key, config.rlpx_config(), Some(discovery.clone()));
    if let Some(addr) = config.listen_addr() {
        rlpx.listen(addr).await?;
    } else {
        log::info!("No TCP port configured, running outbound-only");
    }

    for seed in seeds {
        let discovery = discovery.clone();
        tokio::spawn(async move {
            if let Err(e) = discovery.bootstrap(seed).await {
                log::warn!("Bootstrap via {} failed: {}", seed, e);
            }
        });
    }

    let mut events = rlpx.subscribe();
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(RlpxEvent::PeerAdded(peer)) => greet(peer, status.clone()),
                Ok(RlpxEvent::PeerRemoved { peer, reason, .. }) => {
                    log::debug!("{} left: {}", peer.id(), reason);
                }
                Ok(RlpxEvent::PeerError { peer, error }) => {
                    log::debug!("{} failed: {}", peer.id(), error);
                }
                Ok(_) => {}
                Err(RecvError::Lagged(missed)) => log::warn!("Missed {} transport events", missed),
                Err(RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c() => {
                println!("\n📴 Shutting down node...");
                break;
            }
        }
    }

    rlpx.destroy().await;
    discovery.destroy().await;
    Ok(())
}

/// Send our status and log the peer's once the exchange completes
fn greet(peer: Peer, status: Status) {
    let Some(sec) = peer.sec().cloned() else {
        return;
    };
    let id = peer.id();
    let mut events = sec.subscribe();
    tokio::spawn(async move {
        if let Err(e) = sec.send_status(status) {
            log::debug!("Status to {} failed: {}", id, e);
            return;
        }
        drop(sec);

        let exchange = async {
            loop {
                match events.recv().await {
                    Ok(SecEvent::Status(remote)) => return Some(remote),
                    Ok(_) | Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => return None,
                }
            }
        };
        match tokio::time::timeout(STATUS_TIMEOUT * 2, exchange).await {
            Ok(Some(remote)) => log::info!(
                "{} on network {} (chain {})",
                id,
                remote.network_id,
                remote.chain_id
            ),
            _ => log::debug!("No status exchanged with {}", id),
        }
    });
}
