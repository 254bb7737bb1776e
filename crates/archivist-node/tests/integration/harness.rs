//! Test harness for in-process archivist-node integration tests.
//!
//! Provides TestNode (single node), TestNodeBuilder (config) and PeerRegistry
//! (an in-memory peer directory shared by the nodes of one test). Every node
//! listens on loopback with OS-assigned ports.

use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use archivist_node::client::PeerClient;
use archivist_node::config::NodeConfig;
use archivist_node::context::NodeContext;
use archivist_node::discovery::{PeerDirectory, Peers};
use archivist_node::node::Node;
use archivist_protocol::{FileId, FileRecord, NodeId, PeerRole};
use archivist_replication::Candidate;
use archivist_storage::Archive;

/// Nodes of one test, reachable by each other without UDP.
#[derive(Clone, Default)]
pub struct PeerRegistry {
    nodes: Arc<RwLock<Vec<(SocketAddr, NodeContext)>>>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn join(&self, addr: SocketAddr, ctx: NodeContext) {
        if let Ok(mut nodes) = self.nodes.write() {
            nodes.push((addr, ctx));
        }
    }

    fn leave(&self, id: NodeId) {
        if let Ok(mut nodes) = self.nodes.write() {
            nodes.retain(|(_, ctx)| ctx.node_id != id);
        }
    }

    /// The directory as seen from node `me`.
    fn view(&self, me: NodeId) -> Arc<dyn PeerDirectory> {
        Arc::new(RegistryView {
            me,
            registry: self.clone(),
        })
    }
}

struct RegistryView {
    me: NodeId,
    registry: PeerRegistry,
}

impl PeerDirectory for RegistryView {
    fn discover(&self) -> Pin<Box<dyn Future<Output = Peers> + Send + '_>> {
        Box::pin(async move {
            let nodes = match self.registry.nodes.read() {
                Ok(nodes) => nodes.clone(),
                Err(_) => return Vec::new(),
            };
            nodes
                .into_iter()
                .filter(|(_, ctx)| ctx.node_id != self.me)
                .map(|(addr, ctx)| Candidate::new(addr, ctx.advertisement()))
                .collect()
        })
    }
}

/// A running in-process node with its own archive directory.
pub struct TestNode {
    pub node: Node,
    registry: Option<PeerRegistry>,
    _tempdir: tempfile::TempDir,
}

#[allow(dead_code)]
impl TestNode {
    pub fn id(&self) -> NodeId {
        self.node.node_id()
    }

    pub fn addr(&self) -> SocketAddr {
        self.node.data_addr()
    }

    pub fn archive(&self) -> &Archive {
        &self.node.context().archive
    }

    pub async fn client(&self) -> anyhow::Result<PeerClient> {
        self.connect(PeerRole::Client).await
    }

    pub async fn connect(&self, role: PeerRole) -> anyhow::Result<PeerClient> {
        Ok(PeerClient::connect(self.addr(), role, Duration::from_secs(5))
            .await?
            .with_io_timeout(Duration::from_secs(10)))
    }

    pub async fn shutdown(self) {
        if let Some(registry) = &self.registry {
            registry.leave(self.id());
        }
        self.node.shutdown().await;
    }

    /// Poll the local archive until `id` has a record matching `check`.
    pub async fn wait_record(
        &self,
        id: &FileId,
        timeout: Duration,
        check: impl Fn(&FileRecord) -> bool,
    ) -> anyhow::Result<FileRecord> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let current = self.archive().lookup(id)?;
            if let Some(record) = &current {
                if check(record) {
                    return Ok(record.clone());
                }
            }
            if tokio::time::Instant::now() > deadline {
                anyhow::bail!("timeout waiting for record {id} on {} (have {current:?})", self.id());
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    /// Poll until `id` has neither record nor blob.
    pub async fn wait_gone(&self, id: &FileId, timeout: Duration) -> anyhow::Result<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.archive().lookup(id)?.is_none() && !self.archive().blob_exists(id) {
                return Ok(());
            }
            if tokio::time::Instant::now() > deadline {
                anyhow::bail!("timeout waiting for {id} to disappear from {}", self.id());
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
}

/// Builder for a loopback test node with short intervals.
pub struct TestNodeBuilder {
    cfg: NodeConfig,
    node_id: NodeId,
    registry: Option<PeerRegistry>,
}

#[allow(dead_code)]
impl TestNodeBuilder {
    pub fn new() -> Self {
        let mut cfg = NodeConfig::default();
        cfg.network.listen_addr = "127.0.0.1:0".into();
        cfg.network.connect_timeout_secs = 2;
        cfg.network.idle_timeout_secs = 30;
        cfg.discovery.bind_addr = "127.0.0.1".into();
        cfg.discovery.port = 0;
        cfg.discovery.timeout_secs = 1;
        cfg.discovery.quick_timeout_secs = 0;
        cfg.replication.idle_interval_secs = 1;
        cfg.replication.no_peers_interval_secs = 1;
        Self {
            cfg,
            node_id: uuid::Uuid::new_v4(),
            registry: None,
        }
    }

    pub fn capacity(mut self, bytes: u64) -> Self {
        self.cfg.node.capacity_bytes = bytes;
        self
    }

    pub fn max_connections(mut self, n: usize) -> Self {
        self.cfg.network.max_connections = n;
        self
    }

    pub fn idle_timeout_secs(mut self, secs: u64) -> Self {
        self.cfg.network.idle_timeout_secs = secs;
        self
    }

    pub fn target_copies(mut self, n: usize) -> Self {
        self.cfg.replication.target_copies = n;
        self
    }

    /// Use `registry` as the peer directory and join it once started.
    pub fn registry(mut self, registry: &PeerRegistry) -> Self {
        self.registry = Some(registry.clone());
        self
    }

    pub fn config(&self) -> &NodeConfig {
        &self.cfg
    }

    pub async fn build(mut self) -> anyhow::Result<TestNode> {
        let tempdir = tempfile::tempdir()?;
        self.cfg.node.archive_dir = tempdir.path().join("archive").display().to_string();

        let directory = self.registry.as_ref().map(|r| r.view(self.node_id));
        let node = Node::start(&self.cfg, self.node_id, directory).await?;
        if let Some(registry) = &self.registry {
            registry.join(node.data_addr(), node.context().clone());
        }
        Ok(TestNode {
            node,
            registry: self.registry,
            _tempdir: tempdir,
        })
    }
}

/// A record as a plain client would build it before uploading.
pub fn client_record(name: &str, data: &[u8]) -> FileRecord {
    FileRecord::new(
        uuid::Uuid::new_v4(),
        name,
        "",
        uuid::Uuid::new_v4(),
        archivist_protocol::Checksum::of(data),
    )
}
