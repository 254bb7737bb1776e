//! Archivist Node -- library crate for the peer-to-peer file archive.
//!
//! Re-exports all internal modules so integration tests and the binary can
//! reach the transport, handlers, client, discovery and replication task.

pub mod client;
pub mod config;
pub mod context;
pub mod discovery;
pub mod handlers;
pub mod identity;
pub mod node;
pub mod replication_task;
pub mod transport;
pub mod wire;

use std::path::PathBuf;

pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = dirs_or_home() {
            return home.join(stripped);
        }
    }
    PathBuf::from(path)
}

pub fn dirs_or_home() -> Option<PathBuf> {
    std::env::var_os("HOME").map(PathBuf::from)
}
