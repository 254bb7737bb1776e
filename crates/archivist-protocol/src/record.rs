//! File records -- the metadata unit shared between nodes.
//!
//! A record is serialized with short keys (`v`, `id`, `name`, `desc`, `sender`,
//! `senderip`, `date`, `checksum`, `loc`, `srvrlocs`). Missing or malformed
//! fields fail deserialization; the schema version `v` is written but not
//! checked on read.

use std::collections::BTreeSet;
use std::fmt;
use std::io::Read;
use std::str::FromStr;

use chrono::{DateTime, FixedOffset, SubsecRound};
use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};

use crate::{FileId, NodeId, ProtocolError};

/// Schema version written into every record.
pub const RECORD_VERSION: u16 = 1;

/// MD5 digest of a blob. Serialized as 32 lowercase hex characters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Checksum(pub [u8; 16]);

impl Checksum {
    pub fn of(data: &[u8]) -> Self {
        Self::from_digest(Md5::digest(data).as_slice())
    }

    /// Hash everything `reader` yields.
    pub fn from_reader<R: Read>(mut reader: R) -> std::io::Result<Self> {
        let mut hasher = Md5::new();
        let mut buf = [0u8; 16 * 1024];
        loop {
            let n = reader.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        Ok(Self::from_digest(hasher.finalize().as_slice()))
    }

    fn from_digest(digest: &[u8]) -> Self {
        let mut out = [0u8; 16];
        out.copy_from_slice(digest);
        Checksum(out)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, ProtocolError> {
        let bytes = <[u8; 16]>::try_from(
            hex::decode(s)
                .map_err(|e| ProtocolError::InvalidChecksum(e.to_string()))?
                .as_slice(),
        )
        .map_err(|_| ProtocolError::InvalidChecksum(format!("expected 16 bytes in {s:?}")))?;
        Ok(Checksum(bytes))
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl FromStr for Checksum {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl Serialize for Checksum {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Checksum {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Checksum::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

// ============================================================================
// FileRecord
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    #[serde(rename = "v", default = "record_version")]
    pub version: u16,
    pub id: FileId,
    pub name: String,
    #[serde(rename = "desc")]
    pub description: String,
    /// Node the file was first ingested on.
    pub sender: NodeId,
    /// Empty for a client upload that has not been accepted by a node yet.
    #[serde(rename = "senderip")]
    pub sender_ip: String,
    #[serde(with = "record_date")]
    pub date: DateTime<FixedOffset>,
    pub checksum: Checksum,
    #[serde(rename = "loc")]
    pub location: String,
    /// Nodes known to hold the blob.
    #[serde(rename = "srvrlocs")]
    pub server_locations: BTreeSet<NodeId>,
}

fn record_version() -> u16 {
    RECORD_VERSION
}

impl FileRecord {
    /// A fresh record for content about to be uploaded. `sender_ip` is left
    /// empty so the receiving node treats it as a client upload.
    pub fn new(
        id: FileId,
        name: impl Into<String>,
        description: impl Into<String>,
        sender: NodeId,
        checksum: Checksum,
    ) -> Self {
        Self {
            version: RECORD_VERSION,
            id,
            name: name.into(),
            description: description.into(),
            sender,
            sender_ip: String::new(),
            date: chrono::Local::now().fixed_offset().trunc_subsecs(3),
            checksum,
            location: String::new(),
            server_locations: BTreeSet::new(),
        }
    }

    pub fn is_client_upload(&self) -> bool {
        self.sender_ip.is_empty()
    }

    pub fn is_located_at(&self, node: &NodeId) -> bool {
        self.server_locations.contains(node)
    }

    /// Copy of this record with `node` added to the replica set.
    pub fn with_location(&self, node: NodeId) -> Self {
        let mut next = self.clone();
        next.server_locations.insert(node);
        next
    }

    /// Copy of this record with the sender address filled in.
    pub fn with_sender_ip(&self, ip: impl Into<String>) -> Self {
        Self {
            sender_ip: ip.into(),
            ..self.clone()
        }
    }

    pub fn to_json(&self) -> Result<Vec<u8>, ProtocolError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// `yyyy-MM-dd'T'HH:mm:ss.SSSXXX`: millisecond precision, `Z` for UTC,
/// otherwise a `+hh:mm` offset.
mod record_date {
    use chrono::{DateTime, FixedOffset, SecondsFormat};
    use serde::{self, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(date: &DateTime<FixedOffset>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&date.to_rfc3339_opts(SecondsFormat::Millis, true))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<FixedOffset>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        DateTime::parse_from_rfc3339(&s).map_err(serde::de::Error::custom)
    }
}
