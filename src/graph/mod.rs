//! Graph Store: concepts and associations held in memory, persisted as a
//! memory-mapped snapshot.
//!
//! - **In-memory layer** ([`GraphStore`]): id map, token inverted index and
//!   outgoing/incoming adjacency behind one `RwLock`
//! - **Persistent layer** ([`snapshot`]): checksummed bincode image of the
//!   maps, read back through `memmap2`
//!
//! The store is only mutated by applying WAL entries, so replaying the log
//! after a snapshot reproduces exactly the state that was acknowledged.

pub mod index;
pub mod snapshot;

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use unicode_normalization::UnicodeNormalization;

use crate::concept::ConceptId;
use crate::partition::{Generation, TxnId};
use crate::wal::{Operation, SequenceNumber};

pub use index::GraphStore;

/// Change the vector index must mirror after a graph mutation.
#[derive(Debug, Clone, PartialEq)]
pub enum VectorEffect {
    Upsert { id: ConceptId, vector: Vec<f32> },
    Remove { id: ConceptId },
}

/// Ops staged by a prepared cross-partition transaction.
///
/// Invisible to readers until the matching `Commit` entry is applied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingTxn {
    pub txn: TxnId,
    pub generation: Generation,
    pub ops: Vec<Operation>,
    /// Sequence of the `Prepare` entry.
    pub prepared_seq: SequenceNumber,
    /// Microseconds since the UNIX epoch.
    pub prepared_at: u64,
}

impl PendingTxn {
    /// Whether any staged op writes one of `ids`.
    pub fn touches_any(&self, ids: &[&ConceptId]) -> bool {
        self.ops
            .iter()
            .flat_map(|op| op.touched_concepts())
            .any(|c| ids.contains(&c))
    }
}

/// Split text into normalized search tokens.
///
/// NFKC-normalizes, lowercases and splits on anything that is not
/// alphanumeric.
pub fn tokenize(text: &str) -> BTreeSet<String> {
    let normalized: String = text.nfkc().collect::<String>().to_lowercase();
    normalized
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_owned)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokenize_normalizes_and_splits() {
        let tokens = tokenize("Water boils at 100°C; WATER freezes!");
        let expected: BTreeSet<String> = ["water", "boils", "at", "100", "c", "freezes"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(tokens, expected);
    }

    #[test]
    fn tokenize_applies_nfkc() {
        // Fullwidth letters fold to ASCII under NFKC.
        let tokens = tokenize("ＡＢＣ");
        assert!(tokens.contains("abc"));
    }

    #[test]
    fn tokenize_empty_text() {
        assert!(tokenize("  -- ").is_empty());
    }
}
