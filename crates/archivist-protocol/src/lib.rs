//! Archivist Protocol -- wire constants, file records, framing, discovery datagrams.
//!
//! TCP between nodes. One connection per logical interaction, many sequential
//! requests per connection. 8-byte ASCII request tags, single-byte status
//! replies, 8-byte big-endian length prefix + serde JSON for records.

pub mod codec;
pub mod defaults;
pub mod peer_node;
pub mod record;

pub use codec::JsonFrameCodec;
pub use defaults::{ProtocolDefaults, DEFAULTS};
pub use peer_node::PeerNode;
pub use record::{Checksum, FileRecord};

/// Node identifier.
pub type NodeId = uuid::Uuid;

/// File identifier. Also the blob store key.
pub type FileId = uuid::Uuid;

/// Sent by the server on connect when a handler slot is free.
pub const ACCEPT_TOKEN: [u8; 8] = *b"RES_ACCE";

/// Sent by the server on connect when every handler slot is taken.
pub const BUSY_TOKEN: [u8; 8] = *b"RES_BUSY";

/// Length of every handshake token and request tag.
pub const TAG_LEN: usize = 8;

/// Length of the textual (hyphenated) form of an identifier.
pub const ID_LEN: usize = 36;

/// File bytes are written in chunks of this size.
pub const CHUNK_SIZE: usize = DEFAULTS.chunk_size;

/// Largest metadata or file payload accepted on the wire.
pub const MAX_PAYLOAD_BYTES: u64 = i32::MAX as u64;

// ============================================================================
// Response bytes
// ============================================================================

/// file-pull: blob follows. Also prefixes a meta-download reply.
pub const STATUS_SENDING: u8 = 1;
/// file-pull: no such blob.
pub const STATUS_MISSING: u8 = 2;
/// file-push: send the bytes.
pub const STATUS_ACCEPT: u8 = 1;
/// file-push: identical content already stored.
pub const STATUS_DUPLICATE: u8 = 2;
/// file-push: receiver has no room.
pub const STATUS_NO_FREE_SPACE: u8 = 3;
/// file-delete: removed.
pub const STATUS_DELETED: u8 = 1;
/// file-delete: unknown identifier.
pub const STATUS_DELETE_MISSING: u8 = 2;
/// Generic error, valid for every request type.
pub const STATUS_ERROR: u8 = 200;

/// Role byte written by the client after the accept token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerRole {
    /// A plain client. Mutations it sends are cascaded to other peers.
    Client,
    /// Another node acting as a server. Never cascaded.
    Server,
}

impl PeerRole {
    pub fn from_byte(b: u8) -> Self {
        if b == 1 {
            PeerRole::Server
        } else {
            PeerRole::Client
        }
    }

    pub fn as_byte(self) -> u8 {
        match self {
            PeerRole::Client => 0,
            PeerRole::Server => 1,
        }
    }
}

/// The five request types understood by the data port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestTag {
    FilePull,
    FilePush,
    FileDelete,
    MetaDownload,
    MetaUpdate,
}

impl RequestTag {
    pub const ALL: [RequestTag; 5] = [
        RequestTag::FilePull,
        RequestTag::FilePush,
        RequestTag::FileDelete,
        RequestTag::MetaDownload,
        RequestTag::MetaUpdate,
    ];

    pub const fn wire(self) -> [u8; TAG_LEN] {
        match self {
            RequestTag::FilePull => *b"FILE_PUL",
            RequestTag::FilePush => *b"FILE_PSH",
            RequestTag::FileDelete => *b"FILE_DEL",
            RequestTag::MetaDownload => *b"META_GET",
            RequestTag::MetaUpdate => *b"META_UPD",
        }
    }

    /// Parse a received tag. Space and NUL padding is ignored.
    pub fn parse(raw: &[u8]) -> Option<Self> {
        let trimmed = trim_padding(raw);
        Self::ALL
            .into_iter()
            .find(|tag| trim_padding(&tag.wire()) == trimmed)
    }
}

impl std::fmt::Display for RequestTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let wire = self.wire();
        f.write_str(std::str::from_utf8(&wire).unwrap_or("?"))
    }
}

fn trim_padding(raw: &[u8]) -> &[u8] {
    let pad = |b: &u8| *b == b' ' || *b == 0;
    let start = raw.iter().position(|b| !pad(b)).unwrap_or(raw.len());
    let end = raw.iter().rposition(|b| !pad(b)).map_or(start, |i| i + 1);
    &raw[start..end]
}

/// Parse a 36-byte textual identifier as read off the wire.
pub fn parse_wire_id(raw: &[u8]) -> Result<uuid::Uuid, ProtocolError> {
    let text = std::str::from_utf8(raw).map_err(|_| ProtocolError::InvalidId)?;
    uuid::Uuid::parse_str(text.trim()).map_err(|_| ProtocolError::InvalidId)
}

/// Textual identifier as sent on the wire.
pub fn wire_id(id: &uuid::Uuid) -> [u8; ID_LEN] {
    let mut out = [0u8; ID_LEN];
    id.as_hyphenated().encode_lower(&mut out);
    out
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("payload too large: {size} bytes (max {max})")]
    PayloadTooLarge { size: u64, max: u64 },
    #[error("invalid identifier")]
    InvalidId,
    #[error("invalid discovery record: {0}")]
    InvalidPeerRecord(String),
    #[error("invalid checksum: {0}")]
    InvalidChecksum(String),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
