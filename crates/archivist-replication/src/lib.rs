//! Archivist Replication -- queue, push decisions, target selection.
//!
//! Pure logic only. The node crate owns the sockets and the background task;
//! this crate decides what they do:
//!   - whether an inbound push is accepted, a duplicate, or refused for space
//!   - what a pushed record looks like once this node holds the blob
//!   - how an incoming meta-update combines with the local record
//!   - which discovered peer receives the next copy of a file

pub mod engine;
pub mod queue;

pub use engine::{Candidate, ReplicationEngine};
pub use queue::ReplicationQueue;

use archivist_protocol::{Checksum, FileRecord, NodeId, DEFAULTS};
use serde::{Deserialize, Serialize};

/// Replicator tuning. Node-local.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationConfig {
    pub batch_size: usize,
    pub idle_interval_secs: u64,
    pub no_peers_interval_secs: u64,
    pub target_copies: usize,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULTS.replication_batch_size,
            idle_interval_secs: DEFAULTS.replication_idle_secs,
            no_peers_interval_secs: DEFAULTS.replication_no_peers_secs,
            target_copies: DEFAULTS.target_copies,
        }
    }
}

/// Server-side answer to the metadata stage of a file-push.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushDecision {
    /// Stored blob already hashes to the announced checksum.
    Duplicate,
    /// No room left on this node.
    NoFreeSpace,
    /// Ask the client for the bytes.
    Accept,
}

/// Decide how to answer a push announcing `incoming`.
pub fn decide_push(existing: Option<Checksum>, incoming: &Checksum, free_space: u64) -> PushDecision {
    if existing.as_ref() == Some(incoming) {
        PushDecision::Duplicate
    } else if free_space == 0 {
        PushDecision::NoFreeSpace
    } else {
        PushDecision::Accept
    }
}

/// What to do with a pushed record once its blob is stored locally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceiveOutcome {
    /// Save the record. This node already counted as a location.
    Stored(FileRecord),
    /// Save the record and queue the file for further replication.
    StoredAndQueued(FileRecord),
}

impl ReceiveOutcome {
    pub fn record(&self) -> &FileRecord {
        match self {
            ReceiveOutcome::Stored(r) | ReceiveOutcome::StoredAndQueued(r) => r,
        }
    }
}

/// Work out the record to persist after accepting a push from `peer_ip`.
///
/// A client upload (empty sender address) gets the uploader's address, this
/// node as its sender, and this node as its first location. A replication push that does not list
/// this node yet gains it. Either way the file is queued so it spreads further.
pub fn on_push_received(record: &FileRecord, local: NodeId, peer_ip: &str) -> ReceiveOutcome {
    if record.is_client_upload() {
        let mut stamped = record.with_sender_ip(peer_ip).with_location(local);
        stamped.sender = local;
        return ReceiveOutcome::StoredAndQueued(stamped);
    }
    if record.is_located_at(&local) {
        ReceiveOutcome::Stored(record.clone())
    } else {
        ReceiveOutcome::StoredAndQueued(record.with_location(local))
    }
}

/// Record to save for an incoming meta-update.
///
/// Locations only ever grow while the content stays the same, so a stale
/// update racing a replication push must not shrink the replica set.
pub fn merge_meta_update(incoming: &FileRecord, existing: Option<&FileRecord>) -> FileRecord {
    match existing {
        Some(local) if local.checksum == incoming.checksum => {
            let mut merged = incoming.clone();
            merged
                .server_locations
                .extend(local.server_locations.iter().copied());
            merged
        }
        _ => incoming.clone(),
    }
}

/// Check received bytes against the announced checksum.
pub fn validate_blob(record: &FileRecord, data: &[u8]) -> bool {
    Checksum::of(data) == record.checksum
}
