//! Protocol defaults -- the parameter set every node starts from.
//!
//! Ports, limits and timings that peers on one network are expected to share.
//! Node configuration may override the node-local values (capacity, intervals),
//! but the ports and chunk size must match across the network.

/// A named set of network-wide parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolDefaults {
    // -- Ports --
    /// TCP port for file and metadata transfer.
    pub data_port: u16,
    /// UDP port for the discovery responder.
    pub discovery_port: u16,

    // -- Data port --
    /// Concurrently handled connections before `RES_BUSY`.
    pub max_connections: usize,
    /// Size of each file chunk written to the socket.
    pub chunk_size: usize,
    /// Seconds allowed for an outbound TCP connect + handshake.
    pub connect_timeout_secs: u64,
    /// Seconds an accepted connection may sit idle between requests.
    pub idle_timeout_secs: u64,

    // -- Discovery --
    /// Seconds a discovery round collects responses.
    pub discovery_timeout_secs: u64,
    /// Seconds for the quick census at startup.
    pub quick_discovery_timeout_secs: u64,

    // -- Storage --
    /// Bytes of blob storage a node offers.
    pub capacity_bytes: u64,

    // -- Replication --
    /// Identifiers drained from the queue per replication round.
    pub replication_batch_size: usize,
    /// Seconds the replicator idles on an empty queue.
    pub replication_idle_secs: u64,
    /// Seconds the replicator waits after finding no peers.
    pub replication_no_peers_secs: u64,
    /// Replica count a file is pushed toward.
    pub target_copies: usize,
}

pub const DEFAULTS: ProtocolDefaults = ProtocolDefaults {
    // Ports
    data_port: 12333,
    discovery_port: 8888,

    // Data port
    max_connections: 10,
    chunk_size: 16_000,
    connect_timeout_secs: 10,
    idle_timeout_secs: 300,

    // Discovery
    discovery_timeout_secs: 15,
    quick_discovery_timeout_secs: 5,

    // Storage
    capacity_bytes: 512 * 1024 * 1024, // 512 MiB

    // Replication
    replication_batch_size: 4,
    replication_idle_secs: 300,
    replication_no_peers_secs: 300,
    target_copies: 2,
};
