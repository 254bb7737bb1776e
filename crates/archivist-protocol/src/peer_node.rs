//! Discovery datagrams.
//!
//! Request: the ASCII string [`DISCOVERY_REQUEST`].
//! Response: 51 bytes -- 3-byte magic `EFI`, 36-byte textual node id,
//! 8-byte big-endian free space, 4-byte big-endian active connection count.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::{NodeId, ProtocolError, ID_LEN};

/// Payload of a discovery request.
pub const DISCOVERY_REQUEST: &[u8] = b"MARLE_SRV_NODE_REQUEST";

/// Validation prefix of a discovery response.
pub const PEER_MAGIC: [u8; 3] = [69, 70, 73];

/// Total length of an encoded [`PeerNode`].
pub const PEER_RECORD_LEN: usize = PEER_MAGIC.len() + ID_LEN + 8 + 4;

/// A node as advertised in one discovery round. Never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerNode {
    pub id: NodeId,
    pub free_space: i64,
    pub active_connections: i32,
}

impl PeerNode {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(PEER_RECORD_LEN);
        buf.put_slice(&PEER_MAGIC);
        buf.put_slice(&crate::wire_id(&self.id));
        buf.put_i64(self.free_space);
        buf.put_i32(self.active_connections);
        buf.freeze()
    }

    pub fn decode(datagram: &[u8]) -> Result<Self, ProtocolError> {
        if datagram.len() != PEER_RECORD_LEN {
            return Err(ProtocolError::InvalidPeerRecord(format!(
                "length {} (expected {PEER_RECORD_LEN})",
                datagram.len()
            )));
        }
        if datagram[..PEER_MAGIC.len()] != PEER_MAGIC {
            return Err(ProtocolError::InvalidPeerRecord("bad magic".into()));
        }

        let mut buf = &datagram[PEER_MAGIC.len()..];
        let id = crate::parse_wire_id(&buf[..ID_LEN])?;
        buf.advance(ID_LEN);
        let free_space = buf.get_i64();
        let active_connections = buf.get_i32();

        Ok(Self {
            id,
            free_space,
            active_connections,
        })
    }
}

/// Whether a received datagram is a discovery request. Trailing NUL or
/// whitespace padding is tolerated.
pub fn is_discovery_request(datagram: &[u8]) -> bool {
    let end = datagram
        .iter()
        .rposition(|b| *b != 0 && !b.is_ascii_whitespace())
        .map_or(0, |i| i + 1);
    &datagram[..end] == DISCOVERY_REQUEST
}
