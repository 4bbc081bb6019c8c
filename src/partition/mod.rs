//! Cross-partition writes with two-phase commit.
//!
//! A sharded deployment runs one [`Engine`](crate::engine::Engine) per
//! partition. A write that spans partitions goes through a [`Coordinator`],
//! which prepares the per-partition ops everywhere, durably records its
//! decision and then broadcasts commit or abort. Every message carries the
//! coordinator's [`Generation`]; partitions reject older generations, which
//! fences a coordinator that has been replaced.
//!
//! - [`local`]: [`LocalPartition`], the participant side over an engine
//! - [`coordinator`]: [`Coordinator`], the decision side with its redb log

pub mod coordinator;
pub mod local;

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::concept::{ConceptId, fnv1a64};
use crate::error::PartitionError;
use crate::wal::Operation;

pub use coordinator::{Coordinator, CoordinatorConfig, ResolveReport, TxnState};
pub use local::LocalPartition;

/// Index of a partition, `0..partition_count`.
pub type PartitionId = u32;

/// Result type for partition operations.
pub type PartitionResult<T> = std::result::Result<T, PartitionError>;

/// Coordinator epoch. Strictly increases each time a coordinator starts.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Generation(pub u64);

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a cross-partition transaction, unique across generations.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct TxnId {
    pub generation: u64,
    pub counter: u64,
}

impl TxnId {
    pub fn new(generation: Generation, counter: u64) -> Self {
        Self {
            generation: generation.0,
            counter,
        }
    }

    /// Big-endian key bytes; sorts like the id itself.
    pub fn to_key(self) -> [u8; 16] {
        let mut key = [0u8; 16];
        key[..8].copy_from_slice(&self.generation.to_be_bytes());
        key[8..].copy_from_slice(&self.counter.to_be_bytes());
        key
    }

    pub fn from_key(key: &[u8]) -> Option<Self> {
        let generation = u64::from_be_bytes(key.get(..8)?.try_into().ok()?);
        let counter = u64::from_be_bytes(key.get(8..16)?.try_into().ok()?);
        Some(Self {
            generation,
            counter,
        })
    }
}

impl fmt::Display for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.generation, self.counter)
    }
}

/// A participant's answer to prepare.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Vote {
    /// The ops are durably staged.
    Commit,
    Abort { reason: String },
}

/// Transport seam between a coordinator and one partition.
///
/// An `Err` means the message may not have been delivered and is retried;
/// a [`Vote::Abort`] is a definitive answer.
pub trait PartitionClient: Send + Sync {
    fn id(&self) -> PartitionId;

    fn prepare(
        &self,
        txn: TxnId,
        generation: Generation,
        ops: Vec<Operation>,
    ) -> PartitionResult<Vote>;

    fn commit(&self, txn: TxnId, generation: Generation) -> PartitionResult<()>;

    fn abort(&self, txn: TxnId, generation: Generation) -> PartitionResult<()>;

    /// Prepared transactions still waiting for a decision.
    fn in_doubt(&self) -> PartitionResult<Vec<TxnId>>;
}

/// Partition that owns `id`.
pub fn partition_for(id: &ConceptId, partition_count: u32) -> PartitionId {
    (fnv1a64(id.as_str().as_bytes()) % u64::from(partition_count.max(1))) as PartitionId
}

/// Split a write into per-partition op lists.
///
/// Concept ops go to the concept's partition. An association is stored with
/// its source, so associations learned alongside a concept whose source lives
/// elsewhere become separate `LearnAssociation` ops on that partition.
pub fn route(
    ops: Vec<Operation>,
    partition_count: u32,
) -> PartitionResult<BTreeMap<PartitionId, Vec<Operation>>> {
    let mut routed: BTreeMap<PartitionId, Vec<Operation>> = BTreeMap::new();
    for op in ops {
        match op {
            Operation::LearnConcept {
                concept,
                associations,
            } => {
                let home = partition_for(&concept.id, partition_count);
                let (local, remote): (Vec<_>, Vec<_>) = associations
                    .into_iter()
                    .partition(|a| partition_for(&a.source, partition_count) == home);
                for a in remote {
                    routed
                        .entry(partition_for(&a.source, partition_count))
                        .or_default()
                        .push(Operation::LearnAssociation(a));
                }
                routed.entry(home).or_default().push(Operation::LearnConcept {
                    concept,
                    associations: local,
                });
            }
            Operation::LearnAssociation(a) => {
                routed
                    .entry(partition_for(&a.source, partition_count))
                    .or_default()
                    .push(Operation::LearnAssociation(a));
            }
            Operation::UpdateStrength { ref concept_id, .. }
            | Operation::DeleteConcept { ref concept_id } => {
                let pid = partition_for(concept_id, partition_count);
                routed.entry(pid).or_default().push(op);
            }
            Operation::Checkpoint { .. }
            | Operation::Prepare { .. }
            | Operation::Commit { .. }
            | Operation::Abort { .. } => {
                return Err(PartitionError::Aborted {
                    txn: "-".into(),
                    reason: format!("{} cannot be part of a transaction", op.tag()),
                });
            }
        }
    }
    Ok(routed)
}
