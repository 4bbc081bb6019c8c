//! Vector Index: persistent approximate nearest-neighbor search over concept
//! embeddings.
//!
//! - [`hnsw`]: the navigable small-world graph, cosine distance via `anndists`
//! - [`file`]: the single-file on-disk layout, loaded through `memmap2`
//!
//! [`VectorIndex`] is the synchronized handle the engine uses. Searches take
//! a read lock, so readers never observe a partially inserted node.

pub mod file;
pub(crate) mod hnsw;

use std::path::Path;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};

use crate::concept::ConceptId;
use crate::error::VectorError;
use crate::graph::GraphStore;
use crate::store::{MappedFile, write_atomic};

use hnsw::Hnsw;

/// Result type for vector index operations.
pub type VectorResult<T> = std::result::Result<T, VectorError>;

/// HNSW construction and search parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    /// Links per node on upper layers; layer 0 keeps `2 * m`.
    pub m: usize,
    /// Beam width while inserting.
    pub ef_construction: usize,
    /// Beam width while searching (raised to `k` when smaller).
    pub ef_search: usize,
    /// Seed for level assignment.
    pub seed: u64,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            m: 16,
            ef_construction: 200,
            ef_search: 64,
            seed: 0x6d6e_656d_6f73,
        }
    }
}

/// One search result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub concept_id: ConceptId,
    /// Cosine distance, `0.0` for identical direction.
    pub distance: f32,
}

/// How [`VectorIndex::load_or_build`] obtained its index.
#[derive(Debug, Clone, PartialEq)]
pub enum IndexSource {
    Loaded,
    Rebuilt {
        reason: String,
        /// Graph embeddings the fresh index could not take.
        skipped: usize,
    },
}

/// Check a vector against the configured dimension.
///
/// Mismatched lengths are never truncated or padded.
pub fn validate_vector(dimension: usize, vector: &[f32]) -> VectorResult<()> {
    if vector.len() != dimension {
        return Err(VectorError::DimensionMismatch {
            expected: dimension,
            actual: vector.len(),
        });
    }
    if let Some(pos) = vector.iter().position(|v| !v.is_finite()) {
        return Err(VectorError::InvalidVector {
            message: format!("component {pos} is not finite"),
        });
    }
    if vector.iter().all(|v| *v == 0.0) {
        return Err(VectorError::InvalidVector {
            message: "zero vector has no direction".into(),
        });
    }
    Ok(())
}

/// Thread-safe HNSW index with a fixed dimension.
pub struct VectorIndex {
    dimension: usize,
    inner: RwLock<Hnsw>,
}

impl VectorIndex {
    /// Create an empty index.
    pub fn new(dimension: usize, config: IndexConfig) -> Self {
        Self {
            dimension,
            inner: RwLock::new(Hnsw::new(dimension, config)),
        }
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Insert or replace the vector for `id`.
    pub fn insert(&self, id: ConceptId, vector: &[f32]) -> VectorResult<()> {
        validate_vector(self.dimension, vector)?;
        let mut h = self.inner.write().expect("vector index lock poisoned");
        h.insert(id, vector);
        Ok(())
    }

    /// Remove `id`. Returns whether it was present.
    ///
    /// Compacts the index once tombstones exceed 20% of its slots.
    pub fn remove(&self, id: &ConceptId) -> bool {
        let mut h = self.inner.write().expect("vector index lock poisoned");
        let removed = h.remove(id);
        if removed && h.needs_compaction() {
            let before = h.nodes.len();
            *h = h.compacted();
            tracing::debug!(before, after = h.nodes.len(), "compacted vector index");
        }
        removed
    }

    /// Approximate `k` nearest neighbors, closest first.
    pub fn search(&self, query: &[f32], k: usize) -> VectorResult<Vec<SearchHit>> {
        validate_vector(self.dimension, query)?;
        let h = self.inner.read().expect("vector index lock poisoned");
        let ef = h.config.ef_search;
        Ok(hits(&h, h.search(query, k, ef)))
    }

    /// Exact `k` nearest neighbors by brute force.
    pub fn search_exact(&self, query: &[f32], k: usize) -> VectorResult<Vec<SearchHit>> {
        validate_vector(self.dimension, query)?;
        let h = self.inner.read().expect("vector index lock poisoned");
        Ok(hits(&h, h.search_exact(query, k)))
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.inner.read().expect("vector index lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, id: &ConceptId) -> bool {
        self.inner
            .read()
            .expect("vector index lock poisoned")
            .contains(id)
    }

    /// Replace the contents with a fresh build from `graph`'s embeddings.
    ///
    /// Returns the number of embeddings that could not be indexed.
    pub fn rebuild_from(&self, graph: &GraphStore) -> usize {
        let config = self
            .inner
            .read()
            .expect("vector index lock poisoned")
            .config
            .clone();
        let fresh = Self::new(self.dimension, config);
        let skipped = fresh.insert_all(graph);
        let rebuilt = fresh.inner.into_inner().expect("vector index lock poisoned");
        let mut h = self.inner.write().expect("vector index lock poisoned");
        *h = rebuilt;
        tracing::info!(vectors = h.len(), skipped, "vector index rebuilt from graph");
        skipped
    }

    /// Insert every embedding of `graph` in id order. Returns the number
    /// that could not be indexed.
    fn insert_all(&self, graph: &GraphStore) -> usize {
        let mut skipped = 0usize;
        for (id, vector) in graph.embeddings() {
            if let Err(e) = self.insert(id.clone(), &vector) {
                skipped += 1;
                tracing::warn!(%id, error = %e, "embedding not indexed during rebuild");
            }
        }
        skipped
    }

    /// Serialize the index, recording the graph sequence it reflects.
    pub fn to_bytes(&self, applied_seq: u64) -> Vec<u8> {
        let h = self.inner.read().expect("vector index lock poisoned");
        file::encode(&h, applied_seq)
    }

    /// Write the index to `path` atomically.
    pub fn save(&self, path: &Path, applied_seq: u64) -> VectorResult<()> {
        write_atomic(path, &self.to_bytes(applied_seq)).map_err(|e| VectorError::Io { source: e })
    }

    /// Load the index at `path`, or rebuild it from `graph`.
    ///
    /// The file is used only if it is intact, has the configured dimension
    /// and HNSW parameters, and reflects exactly `graph.last_applied()`.
    /// Otherwise every embedding in the graph is inserted in id order.
    pub fn load_or_build(
        path: &Path,
        dimension: usize,
        config: IndexConfig,
        graph: &GraphStore,
    ) -> VectorResult<(Self, IndexSource)> {
        let expected_seq = graph.last_applied();
        let reason = match MappedFile::open(path) {
            Ok(None) => "index file missing".to_string(),
            Err(e) => format!("index file unreadable: {e}"),
            Ok(Some(mapped)) => match file::decode(&mapped) {
                Err(e) => format!("index file invalid: {e}"),
                Ok((header, _)) if header.dimension != dimension => format!(
                    "index dimension {} differs from configured {dimension}",
                    header.dimension
                ),
                Ok((header, _))
                    if header.config.m != config.m
                        || header.config.ef_construction != config.ef_construction
                        || header.config.seed != config.seed =>
                {
                    "index parameters changed".to_string()
                }
                Ok((header, _)) if header.applied_seq != expected_seq => format!(
                    "index reflects sequence {}, graph is at {expected_seq}",
                    header.applied_seq
                ),
                Ok((_, mut hnsw)) => {
                    hnsw.config.ef_search = config.ef_search;
                    tracing::info!(
                        path = %path.display(),
                        vectors = hnsw.len(),
                        "loaded vector index"
                    );
                    return Ok((
                        Self {
                            dimension,
                            inner: RwLock::new(hnsw),
                        },
                        IndexSource::Loaded,
                    ));
                }
            },
        };

        tracing::info!(path = %path.display(), %reason, "rebuilding vector index from graph");
        let index = Self::new(dimension, config);
        let skipped = index.insert_all(graph);
        tracing::info!(vectors = index.len(), skipped, "vector index rebuilt");
        Ok((index, IndexSource::Rebuilt { reason, skipped }))
    }
}

fn hits(h: &Hnsw, found: Vec<hnsw::Candidate>) -> Vec<SearchHit> {
    found
        .into_iter()
        .map(|c| SearchHit {
            concept_id: h.nodes[c.slot as usize].id.clone(),
            distance: c.dist,
        })
        .collect()
}

impl std::fmt::Debug for VectorIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VectorIndex")
            .field("dimension", &self.dimension)
            .field("len", &self.len())
            .finish()
    }
}
