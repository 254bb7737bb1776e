//! Composition root: open the archive, bind both ports, spawn the tasks.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use archivist_protocol::NodeId;
use archivist_replication::{ReplicationEngine, ReplicationQueue};
use archivist_storage::{Archive, StorageError};
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::config::NodeConfig;
use crate::context::NodeContext;
use crate::discovery::{self, PeerDirectory, SelfProbes, UdpPeerDirectory};
use crate::transport::{self, ConnectionLimiter};
use crate::{expand_tilde, replication_task};

/// Fatal startup failures. Each maps to its own process exit code.
#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error("cannot open archive at {path}: {source}")]
    Storage {
        path: PathBuf,
        #[source]
        source: StorageError,
    },
    #[error("cannot bind data port {addr}: {source}")]
    DataPort {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot bind discovery port {addr}: {source}")]
    DiscoveryPort {
        addr: String,
        #[source]
        source: std::io::Error,
    },
}

impl StartupError {
    pub fn exit_code(&self) -> i32 {
        match self {
            StartupError::DataPort { .. } => 3,
            StartupError::DiscoveryPort { .. } => 4,
            StartupError::Storage { .. } => 5,
        }
    }
}

/// A running node.
pub struct Node {
    ctx: NodeContext,
    data_addr: SocketAddr,
    discovery_addr: SocketAddr,
    shutdown_tx: broadcast::Sender<()>,
    tasks: Vec<JoinHandle<()>>,
}

impl Node {
    /// Start a node. `directory` replaces UDP discovery as the peer source
    /// for the replicator and cascades when given.
    pub async fn start(
        cfg: &NodeConfig,
        node_id: NodeId,
        directory: Option<Arc<dyn PeerDirectory>>,
    ) -> Result<Node, StartupError> {
        let archive_dir = expand_tilde(&cfg.node.archive_dir);
        let archive = Archive::open(&archive_dir, cfg.node.capacity_bytes).map_err(|source| {
            StartupError::Storage {
                path: archive_dir.clone(),
                source,
            }
        })?;

        let listener = TcpListener::bind(&cfg.network.listen_addr)
            .await
            .map_err(|source| StartupError::DataPort {
                addr: cfg.network.listen_addr.clone(),
                source,
            })?;
        let data_addr = listener.local_addr().map_err(|source| StartupError::DataPort {
            addr: cfg.network.listen_addr.clone(),
            source,
        })?;

        let discovery_bind = format!("{}:{}", cfg.discovery.bind_addr, cfg.discovery.port);
        let udp = bind_discovery(&cfg.discovery.bind_addr, cfg.discovery.port)
            .await
            .map_err(|source| StartupError::DiscoveryPort {
                addr: discovery_bind.clone(),
                source,
            })?;
        let discovery_addr = udp.local_addr().map_err(|source| StartupError::DiscoveryPort {
            addr: discovery_bind,
            source,
        })?;

        let probes = SelfProbes::new();
        let udp_directory = Arc::new(UdpPeerDirectory::new(
            node_id,
            cfg.discovery_targets().unwrap_or_default(),
            cfg.discovery.port,
            cfg.network.peer_data_port,
            Duration::from_secs(cfg.discovery.timeout_secs),
            probes.clone(),
        ));
        let peers: Arc<dyn PeerDirectory> = match directory {
            Some(d) => d,
            None => udp_directory.clone(),
        };

        let ctx = NodeContext {
            node_id,
            archive: Arc::new(archive),
            queue: Arc::new(ReplicationQueue::new()),
            wake: Arc::new(Notify::new()),
            limiter: ConnectionLimiter::new(cfg.network.max_connections),
            peers,
            connect_timeout: cfg.connect_timeout(),
            idle_timeout: cfg.idle_timeout(),
        };

        tracing::info!(
            node = %node_id,
            version = env!("CARGO_PKG_VERSION"),
            data = %data_addr,
            discovery = %discovery_addr,
            archive = %archive_dir.display(),
            free_space = ctx.archive.free_space(),
            "starting archivist-node"
        );

        let (shutdown_tx, _) = broadcast::channel::<()>(1);
        let mut tasks = Vec::new();

        tasks.push(tokio::spawn(
            transport::serve(listener, ctx.clone(), shutdown_tx.subscribe())
                .instrument(tracing::info_span!("transport", node = %node_id)),
        ));

        tasks.push(tokio::spawn(
            discovery::run_discovery_responder(udp, ctx.clone(), probes, shutdown_tx.subscribe())
                .instrument(tracing::info_span!("discovery", node = %node_id)),
        ));

        let engine = ReplicationEngine::new(cfg.replication_config(), node_id);
        tasks.push(tokio::spawn(
            replication_task::run_replication_loop(ctx.clone(), engine, shutdown_tx.subscribe())
                .instrument(tracing::info_span!("replication", node = %node_id)),
        ));

        // Startup census, for the log only.
        let quick = Duration::from_secs(cfg.discovery.quick_timeout_secs);
        let mut census_shutdown = shutdown_tx.subscribe();
        tasks.push(tokio::spawn(
            async move {
                tokio::select! {
                    peers = udp_directory.census(quick) => {
                        tracing::info!(peers = peers.len(), "discovery: startup census");
                    }
                    _ = census_shutdown.recv() => {}
                }
            }
            .instrument(tracing::info_span!("census", node = %node_id)),
        ));

        Ok(Node {
            ctx,
            data_addr,
            discovery_addr,
            shutdown_tx,
            tasks,
        })
    }

    pub fn context(&self) -> &NodeContext {
        &self.ctx
    }

    pub fn node_id(&self) -> NodeId {
        self.ctx.node_id
    }

    pub fn data_addr(&self) -> SocketAddr {
        self.data_addr
    }

    pub fn discovery_addr(&self) -> SocketAddr {
        self.discovery_addr
    }

    /// Stop accepting, stop the background tasks and wait for them.
    /// Connections already being served run to completion on their own.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
        for task in self.tasks {
            let _ = task.await;
        }
        tracing::info!(node = %self.ctx.node_id, "shutdown complete");
    }
}

async fn bind_discovery(bind_addr: &str, port: u16) -> std::io::Result<UdpSocket> {
    let ip: IpAddr = bind_addr
        .parse()
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
    let socket = UdpSocket::bind(SocketAddr::new(ip, port)).await?;
    socket.set_broadcast(true)?;
    Ok(socket)
}
