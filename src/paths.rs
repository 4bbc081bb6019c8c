//! File layout of a data directory.

use std::path::{Path, PathBuf};

use crate::error::EngineError;

pub const GRAPH_FILE: &str = "graph.dat";
pub const WAL_FILE: &str = "wal.log";
pub const VECTOR_FILE: &str = "vectors.idx";
pub const PARTITION_META_FILE: &str = "partition.redb";
pub const COORDINATOR_META_FILE: &str = "coordinator.redb";
pub const CONFIG_FILE: &str = "mnemos.toml";

/// Resolved paths of every file the engine keeps in its data directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataPaths {
    pub root: PathBuf,
    /// Graph snapshot.
    pub graph: PathBuf,
    pub wal: PathBuf,
    pub vectors: PathBuf,
    /// Accepted generation of a partition.
    pub partition_meta: PathBuf,
    /// Commit decision log of a coordinator.
    pub coordinator_meta: PathBuf,
    pub config: PathBuf,
}

impl DataPaths {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            graph: root.join(GRAPH_FILE),
            wal: root.join(WAL_FILE),
            vectors: root.join(VECTOR_FILE),
            partition_meta: root.join(PARTITION_META_FILE),
            coordinator_meta: root.join(COORDINATOR_META_FILE),
            config: root.join(CONFIG_FILE),
        }
    }

    /// Create the root directory if needed.
    pub fn ensure_dirs(&self) -> Result<(), EngineError> {
        std::fs::create_dir_all(&self.root).map_err(|e| EngineError::DataDir {
            path: self.root.display().to_string(),
            source: e,
        })
    }

    /// Whether the directory already holds engine data.
    pub fn exists(&self) -> bool {
        self.wal.exists() || self.graph.exists()
    }
}
