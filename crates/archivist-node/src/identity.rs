//! Node identity.
//!
//! Configured id if any; otherwise a name-based (MD5, version 3) UUID of the
//! first non-loopback IPv4 address, so a node keeps its id across restarts
//! on the same address; otherwise random.

use std::net::Ipv4Addr;

use archivist_protocol::{Checksum, NodeId};

pub fn resolve_node_id(configured: Option<&str>) -> Result<NodeId, uuid::Error> {
    if let Some(id) = configured {
        return uuid::Uuid::parse_str(id);
    }
    match first_ipv4() {
        Some(ip) => {
            let id = id_from_ipv4(ip);
            tracing::debug!(%ip, %id, "identity: derived from address");
            Ok(id)
        }
        None => {
            tracing::warn!("identity: no IPv4 address found, using a random id");
            Ok(uuid::Uuid::new_v4())
        }
    }
}

/// Version 3 UUID over the four address octets.
pub fn id_from_ipv4(ip: Ipv4Addr) -> NodeId {
    let digest = Checksum::of(&ip.octets());
    uuid::Builder::from_md5_bytes(digest.0).into_uuid()
}

fn first_ipv4() -> Option<Ipv4Addr> {
    let ifaces = if_addrs::get_if_addrs().ok()?;
    ifaces
        .into_iter()
        .filter(|i| !i.is_loopback())
        .find_map(|i| match i.addr {
            if_addrs::IfAddr::V4(v4) => Some(v4.ip),
            _ => None,
        })
}
