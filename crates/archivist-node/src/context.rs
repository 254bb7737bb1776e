//! Per-node shared state handed to every task.

use std::sync::Arc;
use std::time::Duration;

use archivist_protocol::{NodeId, PeerNode};
use archivist_replication::ReplicationQueue;
use archivist_storage::Archive;
use tokio::sync::Notify;

use crate::discovery::PeerDirectory;
use crate::transport::ConnectionLimiter;

/// Everything a connection handler, the replicator or the discovery
/// responder needs to know about this node.
#[derive(Clone)]
pub struct NodeContext {
    pub node_id: NodeId,
    pub archive: Arc<Archive>,
    pub queue: Arc<ReplicationQueue>,
    /// Wakes the replicator out of its idle wait.
    pub wake: Arc<Notify>,
    pub limiter: ConnectionLimiter,
    pub peers: Arc<dyn PeerDirectory>,
    pub connect_timeout: Duration,
    pub idle_timeout: Duration,
}

impl NodeContext {
    /// Queue `id` for replication and wake the replicator.
    ///
    /// `Notify` keeps one permit, so a wake sent while the replicator is
    /// busy is seen on its next wait.
    pub fn schedule_replication(&self, id: archivist_protocol::FileId) {
        self.queue.enqueue(id);
        self.wake.notify_one();
    }

    /// What the discovery responder advertises for this node right now.
    pub fn advertisement(&self) -> PeerNode {
        PeerNode {
            id: self.node_id,
            free_space: i64::try_from(self.archive.free_space()).unwrap_or(i64::MAX),
            active_connections: i32::try_from(self.limiter.active()).unwrap_or(i32::MAX),
        }
    }
}
