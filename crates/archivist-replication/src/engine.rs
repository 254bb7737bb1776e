//! Replication engine -- decides where the next copy of a file goes.

use archivist_protocol::{FileRecord, NodeId, PeerNode};

use crate::ReplicationConfig;

/// A discovered peer paired with however the caller reaches it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate<A> {
    pub addr: A,
    pub peer: PeerNode,
}

impl<A> Candidate<A> {
    pub fn new(addr: A, peer: PeerNode) -> Self {
        Self { addr, peer }
    }
}

pub struct ReplicationEngine {
    config: ReplicationConfig,
    node_id: NodeId,
}

impl ReplicationEngine {
    pub fn new(config: ReplicationConfig, node_id: NodeId) -> Self {
        Self { config, node_id }
    }

    pub fn config(&self) -> &ReplicationConfig {
        &self.config
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// Whether `record` already has as many locations as we aim for.
    pub fn is_satisfied(&self, record: &FileRecord) -> bool {
        record.server_locations.len() >= self.config.target_copies
    }

    /// Index of the candidate that should receive `record`.
    ///
    /// Greatest advertised free space wins; on a tie the first one seen is
    /// kept. Peers with no free space, peers already listed as a location
    /// and this node itself are never chosen.
    pub fn select_target<A>(&self, record: &FileRecord, candidates: &[Candidate<A>]) -> Option<usize> {
        let mut best: Option<usize> = None;
        let mut best_free = 0i64;
        for (i, c) in candidates.iter().enumerate() {
            if c.peer.id == self.node_id || record.is_located_at(&c.peer.id) {
                continue;
            }
            if c.peer.free_space > best_free {
                best_free = c.peer.free_space;
                best = Some(i);
            }
        }
        if best.is_none() {
            tracing::debug!(file = %record.id, peers = candidates.len(), "replication: no eligible target");
        }
        best
    }

    /// Account for a push within the current round, so the next file in the
    /// batch sees the target's reduced space.
    pub fn charge<A>(candidate: &mut Candidate<A>, bytes: u64) {
        let bytes = i64::try_from(bytes).unwrap_or(i64::MAX);
        candidate.peer.free_space = candidate.peer.free_space.saturating_sub(bytes).max(0);
    }
}
