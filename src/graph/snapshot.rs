//! Graph snapshot file format.
//!
//! ```text
//! offset  size  field
//!      0     8  magic "MNEMGRPH"
//!      8     4  format version (u32)
//!     12     4  vector dimension (u32, 0 = not recorded)
//!     16     8  last applied sequence (u64)
//!     24     8  concept count (u64)
//!     32     8  body length (u64)
//!     40     4  body crc32
//!     44     4  header crc32 (bytes 0..44)
//!     48    16  reserved, zero
//!     64     -  bincode body
//! ```
//!
//! Only the concept, association and pending-transaction maps are stored; the
//! token index and adjacency lists are rebuilt when the snapshot is loaded.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::concept::{Association, Concept};
use crate::error::StoreError;
use crate::store::{MappedFile, StoreResult};

use super::PendingTxn;
use super::index::{GraphState, GraphStore};

pub const SNAPSHOT_MAGIC: &[u8; 8] = b"MNEMGRPH";
pub const SNAPSHOT_VERSION: u32 = 1;
pub const HEADER_LEN: usize = 64;

#[derive(Serialize)]
struct BodyRef<'a> {
    concepts: Vec<&'a Concept>,
    associations: Vec<&'a Association>,
    pending: Vec<&'a PendingTxn>,
}

#[derive(Deserialize)]
struct Body {
    concepts: Vec<Concept>,
    associations: Vec<Association>,
    pending: Vec<PendingTxn>,
}

pub(crate) fn encode(state: &GraphState, dimension: u32) -> StoreResult<Vec<u8>> {
    let mut concepts: Vec<&Concept> = state.concepts.values().collect();
    concepts.sort_by(|a, b| a.id.cmp(&b.id));
    let body = BodyRef {
        concepts,
        associations: state.associations.values().collect(),
        pending: state.pending.values().collect(),
    };
    let body = bincode::serialize(&body).map_err(|e| StoreError::Serialization {
        message: format!("failed to encode graph snapshot: {e}"),
    })?;

    let mut out = Vec::with_capacity(HEADER_LEN + body.len());
    out.extend_from_slice(SNAPSHOT_MAGIC);
    out.extend_from_slice(&SNAPSHOT_VERSION.to_le_bytes());
    out.extend_from_slice(&dimension.to_le_bytes());
    out.extend_from_slice(&state.last_applied.to_le_bytes());
    out.extend_from_slice(&(state.concepts.len() as u64).to_le_bytes());
    out.extend_from_slice(&(body.len() as u64).to_le_bytes());
    out.extend_from_slice(&crc32fast::hash(&body).to_le_bytes());
    let header_crc = crc32fast::hash(&out[..44]);
    out.extend_from_slice(&header_crc.to_le_bytes());
    out.resize(HEADER_LEN, 0);
    out.extend_from_slice(&body);
    Ok(out)
}

/// Header fields of a snapshot, readable without decoding the body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotHeader {
    pub version: u32,
    /// Embedding dimension of the engine that wrote the snapshot.
    pub dimension: u32,
    pub last_seq: u64,
    pub concept_count: u64,
    pub body_len: u64,
    pub body_crc: u32,
}

/// Validate and parse the fixed header.
pub fn read_header(bytes: &[u8]) -> Result<SnapshotHeader, String> {
    if bytes.len() < HEADER_LEN {
        return Err(format!("file is {} bytes, shorter than the header", bytes.len()));
    }
    if &bytes[0..8] != SNAPSHOT_MAGIC {
        return Err("bad magic".into());
    }
    let u32_at = |o: usize| u32::from_le_bytes([bytes[o], bytes[o + 1], bytes[o + 2], bytes[o + 3]]);
    let u64_at = |o: usize| {
        let mut b = [0u8; 8];
        b.copy_from_slice(&bytes[o..o + 8]);
        u64::from_le_bytes(b)
    };

    let stored_header_crc = u32_at(44);
    let computed = crc32fast::hash(&bytes[..44]);
    if stored_header_crc != computed {
        return Err(format!(
            "header checksum mismatch: stored {stored_header_crc:#010x}, computed {computed:#010x}"
        ));
    }
    let version = u32_at(8);
    if version != SNAPSHOT_VERSION {
        return Err(format!("unsupported snapshot version {version}"));
    }
    Ok(SnapshotHeader {
        version,
        dimension: u32_at(12),
        last_seq: u64_at(16),
        concept_count: u64_at(24),
        body_len: u64_at(32),
        body_crc: u32_at(40),
    })
}

/// Decode snapshot bytes into a graph with rebuilt indexes.
pub fn decode(bytes: &[u8]) -> Result<(SnapshotHeader, GraphStore), String> {
    let header = read_header(bytes)?;
    let body = &bytes[HEADER_LEN..];
    if body.len() as u64 != header.body_len {
        return Err(format!(
            "body is {} bytes, header says {}",
            body.len(),
            header.body_len
        ));
    }
    let crc = crc32fast::hash(body);
    if crc != header.body_crc {
        return Err(format!(
            "body checksum mismatch: stored {:#010x}, computed {crc:#010x}",
            header.body_crc
        ));
    }
    let body: Body = bincode::deserialize(body).map_err(|e| format!("undecodable body: {e}"))?;
    if body.concepts.len() as u64 != header.concept_count {
        return Err(format!(
            "header promises {} concepts, body holds {}",
            header.concept_count,
            body.concepts.len()
        ));
    }
    let graph = GraphStore::from_state(GraphState::from_parts(
        body.concepts,
        body.associations,
        body.pending,
        header.last_seq,
    ));
    Ok((header, graph))
}

/// Load the snapshot at `path` through a memory map.
///
/// Returns `Ok(None)` when no snapshot exists yet.
pub fn load(path: &Path) -> StoreResult<Option<(SnapshotHeader, GraphStore)>> {
    let Some(mapped) = MappedFile::open(path)? else {
        return Ok(None);
    };
    let (header, graph) = decode(&mapped).map_err(|message| StoreError::InvalidSnapshot {
        path: path.display().to_string(),
        message,
    })?;
    tracing::info!(
        path = %path.display(),
        concepts = graph.concept_count(),
        associations = graph.association_count(),
        last_seq = graph.last_applied(),
        dimension = header.dimension,
        "loaded graph snapshot"
    );
    Ok(Some((header, graph)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::concept::{ConceptId, NewAssociation, NewConcept, RelationType};
    use crate::partition::{Generation, TxnId};
    use crate::wal::{Operation, WalEntry};
    use tempfile::TempDir;

    fn populated() -> GraphStore {
        let g = GraphStore::new();
        let a = ConceptId::new("a").unwrap();
        let b = ConceptId::new("b").unwrap();
        let ops = vec![
            Operation::LearnConcept {
                concept: NewConcept::from_content("alpha one", vec![1.0, 0.0]).with_id(a.clone()),
                associations: vec![],
            },
            Operation::LearnConcept {
                concept: NewConcept::from_content("beta two", vec![]).with_id(b.clone()),
                associations: vec![NewAssociation::new(b.clone(), a.clone(), RelationType::Temporal)],
            },
            Operation::Prepare {
                txn: TxnId::new(Generation(3), 9),
                generation: Generation(3),
                ops: vec![Operation::DeleteConcept { concept_id: a }],
            },
        ];
        for (i, op) in ops.into_iter().enumerate() {
            g.apply(&WalEntry {
                seq: i as u64 + 1,
                timestamp: 42,
                op,
            });
        }
        g
    }

    #[test]
    fn decode_restores_maps_and_indexes() {
        let g = populated();
        let bytes = g.snapshot(2).unwrap();
        let (header, restored) = decode(&bytes).unwrap();

        assert_eq!(header.dimension, 2);
        assert_eq!(restored.last_applied(), 3);
        assert_eq!(restored.concept_count(), 2);
        assert_eq!(restored.association_count(), 1);
        assert_eq!(restored.pending_transactions(), g.pending_transactions());
        let a = ConceptId::new("a").unwrap();
        assert_eq!(restored.concept(&a), g.concept(&a));
        assert_eq!(restored.concepts_with_token("alpha"), vec![a.clone()]);
        assert_eq!(restored.incoming(&a).len(), 1);
    }

    #[test]
    fn snapshot_bytes_are_deterministic() {
        let g = populated();
        assert_eq!(g.snapshot(2).unwrap(), g.snapshot(2).unwrap());
    }

    #[test]
    fn corrupted_body_rejected() {
        let mut bytes = populated().snapshot(2).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0x01;
        let err = decode(&bytes).unwrap_err();
        assert!(err.contains("checksum"), "{err}");
    }

    #[test]
    fn truncated_file_rejected() {
        let bytes = populated().snapshot(2).unwrap();
        assert!(decode(&bytes[..HEADER_LEN + 3]).is_err());
        assert!(decode(&bytes[..10]).is_err());
    }

    #[test]
    fn load_reads_through_mmap() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("graph.dat");
        assert!(load(&path).unwrap().is_none());

        crate::store::write_atomic(&path, &populated().snapshot(2).unwrap()).unwrap();
        let (header, g) = load(&path).unwrap().unwrap();
        assert_eq!(header.dimension, 2);
        assert_eq!(g.concept_count(), 2);

        std::fs::write(&path, b"MNEMGRPH garbage").unwrap();
        assert!(matches!(
            load(&path),
            Err(StoreError::InvalidSnapshot { .. })
        ));
    }
}
