//! Write-ahead log: the durability point of every mutation.
//!
//! Every mutating operation is encoded as a [`WalEntry`], appended to the log
//! and fsynced before it becomes visible anywhere else. On restart the log is
//! replayed (after the latest graph snapshot) to reconstruct unflushed state.
//!
//! - [`frame`]: the binary frame codec with CRC32 tail checks
//! - [`log`]: [`WriteAheadLog`]: append, replay, checkpoint

pub mod frame;
pub mod log;

use serde::{Deserialize, Serialize};

use crate::concept::{ConceptId, NewAssociation, NewConcept};
use crate::error::WalError;
use crate::partition::{Generation, TxnId};

pub use log::{ReplayReport, WalReplay, WriteAheadLog};

/// Result type for WAL operations.
pub type WalResult<T> = std::result::Result<T, WalError>;

/// Position of an entry in the log. Strictly increasing, never reused.
pub type SequenceNumber = u64;

/// Operation tag stored in each frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OpTag {
    LearnConcept = 1,
    LearnAssociation = 2,
    UpdateStrength = 3,
    Checkpoint = 4,
    DeleteConcept = 5,
    Prepare = 6,
    Commit = 7,
    Abort = 8,
}

impl OpTag {
    pub fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            1 => Some(OpTag::LearnConcept),
            2 => Some(OpTag::LearnAssociation),
            3 => Some(OpTag::UpdateStrength),
            4 => Some(OpTag::Checkpoint),
            5 => Some(OpTag::DeleteConcept),
            6 => Some(OpTag::Prepare),
            7 => Some(OpTag::Commit),
            8 => Some(OpTag::Abort),
            _ => None,
        }
    }
}

impl std::fmt::Display for OpTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            OpTag::LearnConcept => "LearnConcept",
            OpTag::LearnAssociation => "LearnAssociation",
            OpTag::UpdateStrength => "UpdateStrength",
            OpTag::Checkpoint => "Checkpoint",
            OpTag::DeleteConcept => "DeleteConcept",
            OpTag::Prepare => "Prepare",
            OpTag::Commit => "Commit",
            OpTag::Abort => "Abort",
        };
        f.write_str(name)
    }
}

/// A logged mutation. This is the WAL payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Operation {
    /// A concept together with the associations learned alongside it.
    LearnConcept {
        concept: NewConcept,
        associations: Vec<NewAssociation>,
    },
    LearnAssociation(NewAssociation),
    UpdateStrength { concept_id: ConceptId, delta: f32 },
    DeleteConcept { concept_id: ConceptId },
    /// Everything up to and including `up_to` lives in the graph snapshot.
    Checkpoint { up_to: SequenceNumber },
    /// Ops staged by a partition for a cross-partition transaction.
    Prepare {
        txn: TxnId,
        generation: Generation,
        ops: Vec<Operation>,
    },
    Commit { txn: TxnId },
    Abort { txn: TxnId },
}

impl Operation {
    pub fn tag(&self) -> OpTag {
        match self {
            Operation::LearnConcept { .. } => OpTag::LearnConcept,
            Operation::LearnAssociation(_) => OpTag::LearnAssociation,
            Operation::UpdateStrength { .. } => OpTag::UpdateStrength,
            Operation::DeleteConcept { .. } => OpTag::DeleteConcept,
            Operation::Checkpoint { .. } => OpTag::Checkpoint,
            Operation::Prepare { .. } => OpTag::Prepare,
            Operation::Commit { .. } => OpTag::Commit,
            Operation::Abort { .. } => OpTag::Abort,
        }
    }

    /// Concepts whose state this operation writes.
    pub fn touched_concepts(&self) -> Vec<&ConceptId> {
        match self {
            Operation::LearnConcept {
                concept,
                associations,
            } => std::iter::once(&concept.id)
                .chain(associations.iter().map(|a| &a.source))
                .collect(),
            Operation::LearnAssociation(a) => vec![&a.source],
            Operation::UpdateStrength { concept_id, .. }
            | Operation::DeleteConcept { concept_id } => vec![concept_id],
            Operation::Prepare { ops, .. } => {
                ops.iter().flat_map(|op| op.touched_concepts()).collect()
            }
            Operation::Checkpoint { .. } | Operation::Commit { .. } | Operation::Abort { .. } => {
                Vec::new()
            }
        }
    }

    pub(crate) fn encode(&self) -> WalResult<Vec<u8>> {
        bincode::serialize(self).map_err(|e| WalError::Serialization {
            message: format!("failed to encode {} payload: {e}", self.tag()),
        })
    }

    pub(crate) fn decode(bytes: &[u8]) -> WalResult<Self> {
        bincode::deserialize(bytes).map_err(|e| WalError::Serialization {
            message: format!("failed to decode payload: {e}"),
        })
    }
}

/// One immutable record of the log.
#[derive(Debug, Clone, PartialEq)]
pub struct WalEntry {
    pub seq: SequenceNumber,
    /// Microseconds since the UNIX epoch, assigned at append time.
    pub timestamp: u64,
    pub op: Operation,
}

impl WalEntry {
    pub fn tag(&self) -> OpTag {
        self.op.tag()
    }
}
