//! LAN discovery over UDP.
//!
//! Requester: broadcast (or unicast to configured targets) a request string,
//! collect 51-byte `PeerNode` replies until the timeout.
//! Responder: answer every well-formed request with this node's id, free
//! space and active connection count.

use std::collections::HashSet;
use std::future::Future;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use archivist_protocol::peer_node::{is_discovery_request, DISCOVERY_REQUEST};
use archivist_protocol::{NodeId, PeerNode};
use archivist_replication::Candidate;
use tokio::net::UdpSocket;
use tokio::sync::broadcast;

use crate::context::NodeContext;

/// Peers found in one discovery round, in arrival order.
pub type Peers = Vec<Candidate<SocketAddr>>;

/// Where the replicator and cascades get their peer list from.
pub trait PeerDirectory: Send + Sync {
    fn discover(&self) -> Pin<Box<dyn Future<Output = Peers> + Send + '_>>;
}

/// Source ports of this node's in-flight discovery requests.
///
/// Lets the responder skip requests the node sent itself.
#[derive(Debug, Clone)]
pub struct SelfProbes {
    ports: Arc<Mutex<HashSet<u16>>>,
    local_ips: Arc<HashSet<IpAddr>>,
}

impl SelfProbes {
    pub fn new() -> Self {
        let mut local_ips: HashSet<IpAddr> = match if_addrs::get_if_addrs() {
            Ok(ifaces) => ifaces.into_iter().map(|i| i.ip()).collect(),
            Err(e) => {
                tracing::debug!("discovery: cannot list interfaces: {e}");
                HashSet::new()
            }
        };
        local_ips.insert(IpAddr::V4(Ipv4Addr::LOCALHOST));
        Self {
            ports: Arc::default(),
            local_ips: Arc::new(local_ips),
        }
    }

    fn register(&self, port: u16) -> ProbeGuard {
        self.with(|ports| ports.insert(port));
        ProbeGuard {
            probes: self.clone(),
            port,
        }
    }

    /// Whether `from` is one of this node's own requesters.
    pub fn is_own(&self, from: SocketAddr) -> bool {
        self.local_ips.contains(&from.ip()) && self.with(|ports| ports.contains(&from.port()))
    }

    fn with<R>(&self, f: impl FnOnce(&mut HashSet<u16>) -> R) -> R {
        let mut guard = match self.ports.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard)
    }
}

impl Default for SelfProbes {
    fn default() -> Self {
        Self::new()
    }
}

struct ProbeGuard {
    probes: SelfProbes,
    port: u16,
}

impl Drop for ProbeGuard {
    fn drop(&mut self) {
        self.probes.with(|ports| ports.remove(&self.port));
    }
}

/// Broadcast address of every non-loopback IPv4 interface, or the limited
/// broadcast address when there is none.
pub fn broadcast_targets(port: u16) -> Vec<SocketAddr> {
    let mut targets: Vec<SocketAddr> = match if_addrs::get_if_addrs() {
        Ok(ifaces) => ifaces
            .into_iter()
            .filter(|i| !i.is_loopback())
            .filter_map(|i| match i.addr {
                if_addrs::IfAddr::V4(v4) => v4.broadcast,
                _ => None,
            })
            .map(|b| SocketAddr::new(IpAddr::V4(b), port))
            .collect(),
        Err(e) => {
            tracing::warn!("discovery: cannot list interfaces: {e}");
            Vec::new()
        }
    };
    targets.dedup();
    if targets.is_empty() {
        targets.push(SocketAddr::new(IpAddr::V4(Ipv4Addr::BROADCAST), port));
    }
    targets
}

/// One discovery round.
///
/// Replies are keyed by node id, first reply wins. The requester's own id is
/// never returned. A reply's source IP plus `data_port` is the peer's data
/// address.
pub async fn discover_peers(
    node_id: NodeId,
    targets: &[SocketAddr],
    data_port: u16,
    timeout: Duration,
    probes: &SelfProbes,
) -> std::io::Result<Peers> {
    let socket = UdpSocket::bind(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0)).await?;
    socket.set_broadcast(true)?;
    let _guard = probes.register(socket.local_addr()?.port());

    let mut sent = 0usize;
    for target in targets {
        match socket.send_to(DISCOVERY_REQUEST, target).await {
            Ok(_) => sent += 1,
            Err(e) => tracing::debug!(%target, "discovery: send failed: {e}"),
        }
    }
    if sent == 0 {
        return Ok(Vec::new());
    }

    let deadline = tokio::time::Instant::now() + timeout;
    let mut found: Peers = Vec::new();
    let mut buf = [0u8; 512];
    loop {
        let (n, from) = match tokio::time::timeout_at(deadline, socket.recv_from(&mut buf)).await {
            Err(_) => break,
            Ok(Ok(received)) => received,
            // ICMP port unreachable from an earlier unicast probe
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::ConnectionReset => continue,
            Ok(Err(e)) => return Err(e),
        };
        let peer = match PeerNode::decode(&buf[..n]) {
            Ok(peer) => peer,
            Err(e) => {
                tracing::trace!(%from, "discovery: discarded reply: {e}");
                continue;
            }
        };
        if peer.id == node_id || found.iter().any(|c| c.peer.id == peer.id) {
            continue;
        }
        found.push(Candidate::new(SocketAddr::new(from.ip(), data_port), peer));
    }

    tracing::debug!(sent, found = found.len(), "discovery: round complete");
    Ok(found)
}

/// The production [`PeerDirectory`].
#[derive(Debug, Clone)]
pub struct UdpPeerDirectory {
    node_id: NodeId,
    /// Unicast targets. Empty means interface broadcast.
    targets: Vec<SocketAddr>,
    discovery_port: u16,
    data_port: u16,
    timeout: Duration,
    probes: SelfProbes,
}

impl UdpPeerDirectory {
    pub fn new(
        node_id: NodeId,
        targets: Vec<SocketAddr>,
        discovery_port: u16,
        data_port: u16,
        timeout: Duration,
        probes: SelfProbes,
    ) -> Self {
        Self {
            node_id,
            targets,
            discovery_port,
            data_port,
            timeout,
            probes,
        }
    }

    /// Run a round with an explicit timeout. Errors degrade to no peers.
    pub async fn census(&self, timeout: Duration) -> Peers {
        let targets = if self.targets.is_empty() {
            broadcast_targets(self.discovery_port)
        } else {
            self.targets.clone()
        };
        match discover_peers(self.node_id, &targets, self.data_port, timeout, &self.probes).await {
            Ok(peers) => peers,
            Err(e) => {
                tracing::warn!("discovery: round failed: {e}");
                Vec::new()
            }
        }
    }
}

impl PeerDirectory for UdpPeerDirectory {
    fn discover(&self) -> Pin<Box<dyn Future<Output = Peers> + Send + '_>> {
        Box::pin(self.census(self.timeout))
    }
}

/// Answer discovery requests on `socket` until shutdown.
pub async fn run_discovery_responder(
    socket: UdpSocket,
    ctx: NodeContext,
    probes: SelfProbes,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut buf = [0u8; 512];
    loop {
        tokio::select! {
            received = socket.recv_from(&mut buf) => {
                let (n, from) = match received {
                    Ok(r) => r,
                    Err(e) => {
                        tracing::debug!("discovery: recv error: {e}");
                        continue;
                    }
                };
                if !is_discovery_request(&buf[..n]) {
                    tracing::trace!(%from, bytes = n, "discovery: ignored datagram");
                    continue;
                }
                if probes.is_own(from) {
                    continue;
                }
                let reply = ctx.advertisement();
                if let Err(e) = socket.send_to(&reply.encode(), from).await {
                    tracing::debug!(%from, "discovery: reply failed: {e}");
                } else {
                    tracing::trace!(%from, free_space = reply.free_space, "discovery: answered");
                }
            }
            _ = shutdown.recv() => {
                tracing::info!("discovery: responder stopped");
                break;
            }
        }
    }
}
