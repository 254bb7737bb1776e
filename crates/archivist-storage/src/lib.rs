//! Archivist Storage -- blob store + whole-document metadata archive.
//!
//! Blobs live one file per identifier under `<archive>/blobs/`. Metadata for
//! every known file lives in a single JSON array at `<archive>/content.json`,
//! loaded and rewritten in its entirety on every mutation.

pub mod archive;
pub mod blob;

pub use archive::Archive;
pub use blob::{BlobStore, FsBlobStore};

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// The metadata document exists but cannot be parsed. Nothing is written
    /// until it is repaired.
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("lock poisoned")]
    LockPoisoned,
}

pub type Result<T> = std::result::Result<T, StorageError>;
