//! ShadowVault command-line interface
//!
//! Subcommands: `daemon` runs the agent with its background services,
//! `snapshot` builds and persists one snapshot, `restore` reassembles a
//! snapshot into a file, `peerctl` manages the peer table.
//!
//! Exit codes: 0 success, 1 generic failure, 2 configuration failure.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use shadowvault::agent::Agent;
use shadowvault::config::{Config, ConfigError};
use shadowvault::crypto::Identity;
use shadowvault::network::gossip::{GossipNode, GossipNodeConfig};

#[derive(Parser)]
#[command(name = "shadowvault", about = "Decentralized encrypted backup agent")]
struct Cli {
    /// Path to the config file
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Passphrase for encryption
    #[arg(short, long, env = "SHADOWVAULT_PASS")]
    pass: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the backup agent daemon
    Daemon,
    /// Take a snapshot of a directory
    Snapshot { path: PathBuf },
    /// Restore a snapshot into a target directory
    Restore { id: String, target: PathBuf },
    /// Manage peers
    Peerctl {
        #[command(subcommand)]
        action: PeerCommand,
    },
}

#[derive(Subcommand)]
enum PeerCommand {
    /// Add and announce a peer by multiaddr
    Add { multiaddr: String },
    /// Remove a peer by id
    Remove { peer_id: String },
    /// List known peers
    List,
}

const EXIT_FAILURE: u8 = 1;
const EXIT_CONFIG: u8 = 2;

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.monitoring.log_level.clone()));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if config.monitoring.log_format == "json" {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn load_config(cli: &Cli) -> Result<Config, ConfigError> {
    if cli.config.exists() {
        Config::load(&cli.config)
    } else {
        Config::from_env()
    }
}

/// Build the agent over the libp2p transport, sharing the root token
/// between the swarm task and the agent's background tasks.
fn build_agent(
    config: Config,
    passphrase: &str,
    cancel: CancellationToken,
) -> Result<Arc<Agent>, Box<dyn std::error::Error>> {
    let identity = Identity::load_or_create(&config.repository_path)?;
    let gossip = GossipNode::spawn(
        &identity,
        GossipNodeConfig {
            listen_port: config.listen_port,
            bootstrap_peers: config.bootstrap_peers.clone(),
        },
        cancel.child_token(),
    )?;
    let peer_id = gossip.local_peer_id().to_string();
    let agent = Agent::new(config, passphrase, Arc::new(gossip), peer_id, cancel)?;
    Ok(Arc::new(agent))
}

async fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("config error: {err}");
            std::process::exit(i32::from(EXIT_CONFIG));
        }
    };
    init_tracing(&config);

    let Some(passphrase) = cli.pass.clone() else {
        eprintln!("config error: passphrase is required (--pass or SHADOWVAULT_PASS)");
        std::process::exit(i32::from(EXIT_CONFIG));
    };

    let cancel = CancellationToken::new();
    let agent = build_agent(config, &passphrase, cancel.clone())?;

    match cli.command {
        Command::Daemon => {
            agent.start_background_tasks().await?;
            info!("daemon running, press Ctrl-C to stop");
            tokio::signal::ctrl_c().await?;
            agent.shutdown().await?;
        }
        Command::Snapshot { path } => {
            let snapshot = agent.create_snapshot(&path).await?;
            println!("{}", snapshot.id);
            agent.shutdown().await?;
        }
        Command::Restore { id, target } => {
            let output = agent.restore_snapshot(&id, &target)?;
            println!("restored snapshot {} to {}", id, output.display());
            agent.shutdown().await?;
        }
        Command::Peerctl { action } => {
            match action {
                PeerCommand::Add { multiaddr } => {
                    let peer_id = peer_id_from_multiaddr(&multiaddr)
                        .ok_or("multiaddr must end with a /p2p/<peer-id> component")?;
                    agent.add_peer(&multiaddr, &peer_id).await?;
                    println!("added peer {peer_id}");
                }
                PeerCommand::Remove { peer_id } => {
                    agent.remove_peer(&peer_id).await?;
                    println!("removed peer {peer_id}");
                }
                PeerCommand::List => {
                    for peer in agent.list_peers()? {
                        if peer.addr.is_empty() {
                            println!("{}", peer.peer_id);
                        } else {
                            println!("{}\t{}", peer.peer_id, peer.addr);
                        }
                    }
                }
            }
            agent.shutdown().await?;
        }
    }
    Ok(())
}

fn peer_id_from_multiaddr(multiaddr: &str) -> Option<String> {
    let (_, peer_id) = multiaddr.rsplit_once("/p2p/")?;
    if peer_id.is_empty() {
        None
    } else {
        Some(peer_id.to_string())
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(%err, "command failed");
            eprintln!("error: {err}");
            ExitCode::from(EXIT_FAILURE)
        }
    }
}
