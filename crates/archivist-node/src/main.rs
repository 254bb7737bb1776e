//! Archivist Node -- peer-to-peer file archive.
//!
//! Usage:
//!   archivist-node                          # Run with default config
//!   archivist-node --config path.toml run   # Run with custom config
//!   archivist-node identity                 # Show node identity
//!   archivist-node scan                     # List peers on the LAN
//!   archivist-node push notes.txt           # Upload a file to a node

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use archivist_node::client::{PeerClient, PushOutcome};
use archivist_node::config::NodeConfig;
use archivist_node::discovery::{SelfProbes, UdpPeerDirectory};
use archivist_node::expand_tilde;
use archivist_node::identity::resolve_node_id;
use archivist_node::node::Node;
use archivist_protocol::{Checksum, FileId, FileRecord, NodeId, PeerRole};
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "archivist-node", about = "Archivist peer-to-peer file archive node")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "~/.archivist/config.toml")]
    config: String,

    /// Log output format: "text" or "json". Overrides the config file.
    #[arg(long)]
    log_format: Option<String>,

    /// Node to talk to for push, pull, delete and list
    #[arg(long, default_value = "127.0.0.1:12333", global = true)]
    node: SocketAddr,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the node (default)
    Run,
    /// Show this node's identity
    Identity,
    /// List nodes answering discovery
    Scan,
    /// Upload a file
    Push {
        path: PathBuf,
        /// Name stored with the file. Defaults to the file name.
        #[arg(long)]
        name: Option<String>,
        #[arg(long, default_value = "")]
        description: String,
    },
    /// Download a file by id
    Pull { id: FileId, out: PathBuf },
    /// Delete a file by id, everywhere
    Delete { id: FileId },
    /// Print the node's metadata document
    List,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config_path = expand_tilde(&cli.config);
    let cfg = match NodeConfig::load_or_default(&config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("cannot load config {}: {e:#}", config_path.display());
            std::process::exit(2);
        }
    };

    init_tracing(cli.log_format.as_deref().unwrap_or(&cfg.node.log_format));

    let node_id = resolve_node_id(cfg.node.id.as_deref())?;

    match cli.command {
        Some(Commands::Run) | None => run_node(cfg, node_id).await?,
        Some(Commands::Identity) => {
            println!("Node ID: {node_id}");
            match &cfg.node.id {
                Some(_) => println!("Source: config"),
                None => println!("Source: derived"),
            }
        }
        Some(Commands::Scan) => scan(&cfg, node_id).await,
        Some(Commands::Push {
            path,
            name,
            description,
        }) => push(&cfg, cli.node, node_id, &path, name, description).await?,
        Some(Commands::Pull { id, out }) => {
            let mut client = connect(&cfg, cli.node).await?;
            match client.pull_file(&id).await? {
                Some(data) => {
                    std::fs::write(&out, &data)?;
                    println!("{} bytes written to {}", data.len(), out.display());
                }
                None => {
                    eprintln!("{id}: not found on {}", cli.node);
                    std::process::exit(1);
                }
            }
            client.close().await?;
        }
        Some(Commands::Delete { id }) => {
            let mut client = connect(&cfg, cli.node).await?;
            if client.delete_file(&id).await? {
                println!("{id}: deleted");
            } else {
                println!("{id}: not found");
            }
            client.close().await?;
        }
        Some(Commands::List) => {
            let mut client = connect(&cfg, cli.node).await?;
            let records = client.download_meta().await?;
            client.close().await?;
            println!("{}", serde_json::to_string_pretty(&records)?);
        }
    }

    Ok(())
}

fn init_tracing(format: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "archivist_node=info,archivist_storage=info".into());
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if format == "json" {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn run_node(cfg: NodeConfig, node_id: NodeId) -> anyhow::Result<()> {
    let node = match Node::start(&cfg, node_id, None).await {
        Ok(node) => node,
        Err(e) => {
            tracing::error!("{e}");
            std::process::exit(e.exit_code());
        }
    };

    tracing::info!("all tasks spawned, press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down...");
    node.shutdown().await;
    Ok(())
}

async fn connect(cfg: &NodeConfig, addr: SocketAddr) -> anyhow::Result<PeerClient> {
    Ok(PeerClient::connect(addr, PeerRole::Client, cfg.connect_timeout())
        .await?
        .with_io_timeout(cfg.idle_timeout()))
}

async fn scan(cfg: &NodeConfig, node_id: NodeId) {
    let directory = UdpPeerDirectory::new(
        node_id,
        cfg.discovery_targets().unwrap_or_default(),
        cfg.discovery.port,
        cfg.network.peer_data_port,
        Duration::from_secs(cfg.discovery.timeout_secs),
        SelfProbes::new(),
    );
    let peers = directory
        .census(Duration::from_secs(cfg.discovery.timeout_secs))
        .await;
    if peers.is_empty() {
        println!("No peers found");
        return;
    }
    println!("{:<38} {:<22} {:>14} {:>6}", "NODE", "ADDRESS", "FREE", "CONNS");
    for c in peers {
        println!(
            "{:<38} {:<22} {:>14} {:>6}",
            c.peer.id,
            c.addr.to_string(),
            c.peer.free_space,
            c.peer.active_connections
        );
    }
}

async fn push(
    cfg: &NodeConfig,
    addr: SocketAddr,
    sender: NodeId,
    path: &Path,
    name: Option<String>,
    description: String,
) -> anyhow::Result<()> {
    let data = std::fs::read(path)?;
    let name = match name {
        Some(n) => n,
        None => path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| anyhow::anyhow!("{} has no file name", path.display()))?,
    };
    let record = FileRecord::new(
        uuid::Uuid::new_v4(),
        name,
        description,
        sender,
        Checksum::of(&data),
    );

    let mut client = connect(cfg, addr).await?;
    let outcome = client.push_file(&record, &data).await?;
    client.close().await?;
    match outcome {
        PushOutcome::Transferred => println!("{}: uploaded ({} bytes)", record.id, data.len()),
        PushOutcome::Duplicate => println!("{}: already stored", record.id),
        PushOutcome::NoFreeSpace => {
            eprintln!("{} has no free space", addr);
            std::process::exit(1);
        }
    }
    Ok(())
}
