//! The archive: one node's metadata document plus its blob store.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use archivist_protocol::{Checksum, FileId, FileRecord};

use crate::blob::{BlobStore, FsBlobStore};
use crate::{Result, StorageError};

const DOCUMENT_NAME: &str = "content.json";
const BLOB_DIR: &str = "blobs";

/// Metadata document + blob store for one node.
///
/// Mutations within one process are serialized; the document is always
/// replaced by rename, so a reader never sees a partial write.
pub struct Archive {
    document: PathBuf,
    blobs: Box<dyn BlobStore>,
    capacity_bytes: u64,
    write_lock: Mutex<()>,
}

impl Archive {
    /// Open (or create) the archive rooted at `dir`.
    pub fn open(dir: &Path, capacity_bytes: u64) -> Result<Self> {
        fs::create_dir_all(dir)?;
        let blobs = FsBlobStore::open(&dir.join(BLOB_DIR))?;
        tracing::info!(path = %dir.display(), capacity_bytes, "storage: archive opened");
        Ok(Self::with_blob_store(
            dir.join(DOCUMENT_NAME),
            Box::new(blobs),
            capacity_bytes,
        ))
    }

    pub fn with_blob_store(
        document: PathBuf,
        blobs: Box<dyn BlobStore>,
        capacity_bytes: u64,
    ) -> Self {
        Self {
            document,
            blobs,
            capacity_bytes,
            write_lock: Mutex::new(()),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, ()>> {
        self.write_lock.lock().map_err(|_| StorageError::LockPoisoned)
    }

    fn load(&self) -> Result<Vec<FileRecord>> {
        let bytes = match fs::read(&self.document) {
            Ok(b) => b,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(Vec::new());
        }
        serde_json::from_slice(&bytes).map_err(|e| {
            tracing::error!(
                path = %self.document.display(),
                error = %e,
                "storage: metadata document is malformed"
            );
            StorageError::Unavailable(e.to_string())
        })
    }

    fn store(&self, records: &[FileRecord]) -> Result<()> {
        let payload = serde_json::to_vec(records)?;
        let mut tmp = self.document.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        fs::write(&tmp, &payload)?;
        fs::rename(&tmp, &self.document)?;
        Ok(())
    }

    /// Replace any record with the same id, or add it.
    pub fn upsert(&self, record: &FileRecord) -> Result<()> {
        let _guard = self.lock()?;
        let mut records = self.load()?;
        records.retain(|r| r.id != record.id);
        records.push(record.clone());
        self.store(&records)?;
        tracing::debug!(file = %record.id, records = records.len(), "storage: record saved");
        Ok(())
    }

    /// Read-modify-write of one record under the write lock. `f` sees the
    /// current record (if any) and returns the one to save.
    pub fn update<F>(&self, id: &FileId, f: F) -> Result<FileRecord>
    where
        F: FnOnce(Option<FileRecord>) -> FileRecord,
    {
        let _guard = self.lock()?;
        let mut records = self.load()?;
        let current = records
            .iter()
            .position(|r| r.id == *id)
            .map(|i| records.swap_remove(i));
        let next = f(current);
        records.retain(|r| r.id != next.id);
        records.push(next.clone());
        self.store(&records)?;
        tracing::debug!(file = %next.id, records = records.len(), "storage: record updated");
        Ok(next)
    }

    /// Returns whether a record was removed. Absent ids leave the document untouched.
    pub fn remove(&self, id: &FileId) -> Result<bool> {
        let _guard = self.lock()?;
        let mut records = self.load()?;
        let before = records.len();
        records.retain(|r| r.id != *id);
        if records.len() == before {
            return Ok(false);
        }
        self.store(&records)?;
        tracing::debug!(file = %id, "storage: record removed");
        Ok(true)
    }

    pub fn lookup(&self, id: &FileId) -> Result<Option<FileRecord>> {
        Ok(self.load()?.into_iter().find(|r| r.id == *id))
    }

    pub fn list_all(&self) -> Result<Vec<FileRecord>> {
        self.load()
    }

    // ========================================================================
    // Blob pass-through
    // ========================================================================

    pub fn store_blob(&self, id: &FileId, data: &[u8]) -> Result<()> {
        self.blobs.put(id, data)
    }

    pub fn read_blob(&self, id: &FileId) -> Result<Option<Vec<u8>>> {
        self.blobs.get(id)
    }

    pub fn blob_exists(&self, id: &FileId) -> bool {
        self.blobs.exists(id)
    }

    pub fn blob_size(&self, id: &FileId) -> Result<Option<u64>> {
        self.blobs.size(id)
    }

    pub fn delete_blob(&self, id: &FileId) -> Result<bool> {
        self.blobs.delete(id)
    }

    pub fn blob_checksum(&self, id: &FileId) -> Result<Option<Checksum>> {
        self.blobs.checksum(id)
    }

    // ========================================================================
    // Space accounting
    // ========================================================================

    pub fn capacity_bytes(&self) -> u64 {
        self.capacity_bytes
    }

    pub fn total_used_bytes(&self) -> Result<u64> {
        self.blobs.total_bytes()
    }

    /// Capacity minus used bytes. Zero when usage cannot be computed.
    pub fn free_space(&self) -> u64 {
        match self.total_used_bytes() {
            Ok(used) => self.capacity_bytes.saturating_sub(used),
            Err(e) => {
                tracing::warn!(error = %e, "storage: cannot compute used bytes, reporting no free space");
                0
            }
        }
    }
}
