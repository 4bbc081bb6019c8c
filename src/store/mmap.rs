//! Read-only memory-mapped files.
//!
//! Snapshot and vector index files are opened through `memmap2` and decoded
//! straight from the mapping. Files are only ever replaced by rename, so a
//! mapping stays valid for as long as it is held.

use std::fs::File;
use std::ops::Deref;
use std::path::{Path, PathBuf};

use memmap2::Mmap;

use crate::error::StoreError;
use crate::store::StoreResult;

/// A file mapped read-only into memory.
pub struct MappedFile {
    path: PathBuf,
    mmap: Option<Mmap>,
}

impl MappedFile {
    /// Map the file at `path`. Returns `Ok(None)` if it does not exist.
    pub fn open(path: &Path) -> StoreResult<Option<Self>> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StoreError::Io { source: e }),
        };
        let len = file
            .metadata()
            .map_err(|e| StoreError::Io { source: e })?
            .len();

        // Zero-length files cannot be mapped on every platform.
        if len == 0 {
            return Ok(Some(Self {
                path: path.to_path_buf(),
                mmap: None,
            }));
        }

        // Safety: files in the data directory are owned by this process (LOCK)
        // and are replaced by rename, never modified in place.
        let mmap = unsafe {
            Mmap::map(&file).map_err(|e| StoreError::Mmap {
                message: format!("failed to map {}: {e}", path.display()),
            })?
        };
        Ok(Some(Self {
            path: path.to_path_buf(),
            mmap: Some(mmap),
        }))
    }

    /// Path to the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Deref for MappedFile {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match &self.mmap {
            Some(m) => m,
            None => &[],
        }
    }
}

impl std::fmt::Debug for MappedFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MappedFile")
            .field("path", &self.path)
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn missing_file_is_none() {
        let dir = TempDir::new().unwrap();
        assert!(MappedFile::open(&dir.path().join("absent")).unwrap().is_none());
    }

    #[test]
    fn maps_file_contents() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data");
        std::fs::write(&path, [1u8, 2, 3, 4]).unwrap();
        let mapped = MappedFile::open(&path).unwrap().unwrap();
        assert_eq!(&mapped[..], &[1, 2, 3, 4]);
    }

    #[test]
    fn empty_file_maps_to_empty_slice() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("empty");
        std::fs::write(&path, []).unwrap();
        let mapped = MappedFile::open(&path).unwrap().unwrap();
        assert!(mapped.is_empty());
    }
}
