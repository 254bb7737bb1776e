//! Byte storage keyed by file identifier.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use archivist_protocol::{Checksum, FileId};
use tempfile::NamedTempFile;
use walkdir::WalkDir;

use crate::Result;

/// Storage for raw file content.
pub trait BlobStore: Send + Sync {
    /// Store `data` under `id`, fully replacing any previous content.
    fn put(&self, id: &FileId, data: &[u8]) -> Result<()>;
    fn get(&self, id: &FileId) -> Result<Option<Vec<u8>>>;
    fn exists(&self, id: &FileId) -> bool;
    fn size(&self, id: &FileId) -> Result<Option<u64>>;
    /// Returns whether a blob was removed.
    fn delete(&self, id: &FileId) -> Result<bool>;
    /// Sum of every stored blob. Walks the store on each call.
    fn total_bytes(&self) -> Result<u64>;
    /// MD5 of the stored content, `None` if absent.
    fn checksum(&self, id: &FileId) -> Result<Option<Checksum>>;
}

/// One regular file per blob, named by the textual identifier.
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn open(root: &Path) -> Result<Self> {
        fs::create_dir_all(root)?;
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_of(&self, id: &FileId) -> PathBuf {
        self.root.join(id.as_hyphenated().to_string())
    }
}

fn not_found_to_none<T>(r: io::Result<T>) -> Result<Option<T>> {
    match r {
        Ok(v) => Ok(Some(v)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Bytes in every regular file below `dir`. Symlinks are not followed.
fn dir_size(dir: &Path) -> io::Result<u64> {
    let mut total = 0;
    for entry in WalkDir::new(dir).follow_links(false) {
        let entry = entry?;
        if entry.file_type().is_file() {
            total += entry.metadata()?.len();
        }
    }
    Ok(total)
}

impl BlobStore for FsBlobStore {
    /// Written to a sibling temp file and renamed into place, so readers see
    /// either the old blob or the new one.
    fn put(&self, id: &FileId, data: &[u8]) -> Result<()> {
        let mut tmp = NamedTempFile::new_in(&self.root)?;
        tmp.write_all(data)?;
        tmp.as_file().sync_all()?;
        tmp.persist(self.path_of(id)).map_err(|e| e.error)?;
        Ok(())
    }

    fn get(&self, id: &FileId) -> Result<Option<Vec<u8>>> {
        not_found_to_none(fs::read(self.path_of(id)))
    }

    fn exists(&self, id: &FileId) -> bool {
        self.path_of(id).is_file()
    }

    fn size(&self, id: &FileId) -> Result<Option<u64>> {
        Ok(not_found_to_none(fs::metadata(self.path_of(id)))?.map(|m| m.len()))
    }

    fn delete(&self, id: &FileId) -> Result<bool> {
        match fs::remove_file(self.path_of(id)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn total_bytes(&self) -> Result<u64> {
        Ok(dir_size(&self.root)?)
    }

    fn checksum(&self, id: &FileId) -> Result<Option<Checksum>> {
        match not_found_to_none(fs::File::open(self.path_of(id)))? {
            Some(file) => Ok(Some(Checksum::from_reader(io::BufReader::new(file))?)),
            None => Ok(None),
        }
    }
}
