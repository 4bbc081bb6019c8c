//! On-disk storage primitives shared by the engine's components.
//!
//! - [`MappedFile`]: read-only memory maps (memmap2) for snapshot and index files
//! - [`DurableStore`]: small ACID metadata tables (redb) for partition state
//! - [`write_atomic`]: temp-file + fsync + rename replacement, so readers
//!   never observe a torn file

pub mod durable;
pub mod mmap;

use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use crate::error::StoreError;

pub use durable::DurableStore;
pub use mmap::MappedFile;

/// Result type for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Replace `path` with `bytes` atomically.
///
/// The data is written to a sibling temp file, fsynced, renamed over the
/// target and the directory entry is fsynced. A crash at any point leaves
/// either the old or the new file in place.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let tmp = temp_path(path);
    {
        let mut f = File::create(&tmp)?;
        f.write_all(bytes)?;
        f.sync_all()?;
    }
    if let Err(e) = std::fs::rename(&tmp, path) {
        let _ = std::fs::remove_file(&tmp);
        return Err(e);
    }
    sync_parent_dir(path)
}

/// fsync the directory containing `path` so a rename or create is durable.
pub fn sync_parent_dir(path: &Path) -> io::Result<()> {
    #[cfg(unix)]
    {
        let parent = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        File::open(parent)?.sync_all()
    }
    #[cfg(not(unix))]
    {
        let _ = path;
        Ok(())
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn write_atomic_replaces_content() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("graph.dat");
        write_atomic(&path, b"first").unwrap();
        write_atomic(&path, b"second").unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"second");
        assert!(!dir.path().join("graph.dat.tmp").exists());
    }

    #[test]
    fn temp_path_is_a_sibling() {
        let p = temp_path(Path::new("/data/vectors.idx"));
        assert_eq!(p, PathBuf::from("/data/vectors.idx.tmp"));
    }
}
