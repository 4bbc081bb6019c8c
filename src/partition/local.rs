//! Participant side of two-phase commit, backed by a local engine.

use std::sync::{Arc, Mutex};

use crate::engine::Engine;
use crate::error::{MnemosError, PartitionError};
use crate::learn::validate_shape;
use crate::store::DurableStore;
use crate::wal::Operation;

use super::{Generation, PartitionClient, PartitionId, PartitionResult, TxnId, Vote};

const ACCEPTED_GENERATION_KEY: &[u8] = b"accepted_generation";

/// One partition: an engine plus the generation fence in `partition.redb`.
pub struct LocalPartition {
    id: PartitionId,
    engine: Arc<Engine>,
    meta: DurableStore,
    accepted: Mutex<Generation>,
}

impl LocalPartition {
    /// Wrap `engine` as partition `id`, reading its accepted generation.
    pub fn open(id: PartitionId, engine: Arc<Engine>) -> PartitionResult<Self> {
        let meta = DurableStore::open(&engine.paths().partition_meta).map_err(storage)?;
        let accepted = Generation(
            meta.get_u64(ACCEPTED_GENERATION_KEY)
                .map_err(storage)?
                .unwrap_or(0),
        );
        let in_doubt = engine.graph().pending_transactions().len();
        tracing::info!(partition = id, %accepted, in_doubt, "partition opened");
        Ok(Self {
            id,
            engine,
            meta,
            accepted: Mutex::new(accepted),
        })
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    pub fn accepted_generation(&self) -> Generation {
        *self.accepted.lock().expect("generation lock poisoned")
    }

    /// Reject older generations; persist a newer one before acting on it.
    fn check_generation(&self, received: Generation) -> PartitionResult<()> {
        let mut accepted = self.accepted.lock().expect("generation lock poisoned");
        if received < *accepted {
            tracing::warn!(
                partition = self.id,
                %received,
                accepted = %*accepted,
                "rejecting message from stale coordinator"
            );
            return Err(PartitionError::StaleGeneration {
                partition: self.id,
                received: received.0,
                accepted: accepted.0,
            });
        }
        if received > *accepted {
            self.meta
                .put_u64(ACCEPTED_GENERATION_KEY, received.0)
                .map_err(storage)?;
            tracing::info!(partition = self.id, %received, "accepted new coordinator generation");
            *accepted = received;
        }
        Ok(())
    }
}

impl PartitionClient for LocalPartition {
    fn id(&self) -> PartitionId {
        self.id
    }

    fn prepare(
        &self,
        txn: TxnId,
        generation: Generation,
        ops: Vec<Operation>,
    ) -> PartitionResult<Vote> {
        self.check_generation(generation)?;

        let dimension = self.engine.config().vector_dimension;
        let result = self.engine.write_if(|graph| {
            if graph.is_pending(txn) {
                // Retried prepare: the stash is already durable.
                return Ok(None);
            }
            for op in &ops {
                validate_shape(op, dimension)?;
            }
            let touched: Vec<_> = ops.iter().flat_map(|op| op.touched_concepts()).collect();
            if let Some(other) = graph.conflicting_transaction(&touched, txn) {
                return Err(PartitionError::Aborted {
                    txn: txn.to_string(),
                    reason: format!("conflicts with pending transaction {other}"),
                }
                .into());
            }
            Ok(Some(Operation::Prepare {
                txn,
                generation,
                ops,
            }))
        });

        match result {
            Ok(Some(entry)) => {
                tracing::debug!(partition = self.id, %txn, seq = entry.seq, "prepared");
                Ok(Vote::Commit)
            }
            Ok(None) => {
                tracing::debug!(partition = self.id, %txn, "already prepared");
                Ok(Vote::Commit)
            }
            Err(MnemosError::Partition(PartitionError::Aborted { reason, .. })) => {
                tracing::debug!(partition = self.id, %txn, %reason, "voting abort");
                Ok(Vote::Abort { reason })
            }
            Err(e @ (MnemosError::Graph(_) | MnemosError::Vector(_))) => {
                tracing::debug!(partition = self.id, %txn, error = %e, "voting abort");
                Ok(Vote::Abort {
                    reason: e.to_string(),
                })
            }
            Err(e) => Err(storage(e)),
        }
    }

    fn commit(&self, txn: TxnId, generation: Generation) -> PartitionResult<()> {
        self.check_generation(generation)?;
        let written = self
            .engine
            .write_if(|graph| Ok(graph.is_pending(txn).then_some(Operation::Commit { txn })))
            .map_err(storage)?;
        match written {
            Some(entry) => {
                tracing::debug!(partition = self.id, %txn, seq = entry.seq, "committed");
            }
            None => {
                tracing::debug!(partition = self.id, %txn, "commit for unknown or finished transaction");
            }
        }
        Ok(())
    }

    fn abort(&self, txn: TxnId, generation: Generation) -> PartitionResult<()> {
        self.check_generation(generation)?;
        let written = self
            .engine
            .write_if(|graph| Ok(graph.is_pending(txn).then_some(Operation::Abort { txn })))
            .map_err(storage)?;
        if let Some(entry) = written {
            tracing::debug!(partition = self.id, %txn, seq = entry.seq, "aborted");
        }
        Ok(())
    }

    fn in_doubt(&self) -> PartitionResult<Vec<TxnId>> {
        Ok(self
            .engine
            .graph()
            .pending_transactions()
            .into_iter()
            .map(|p| p.txn)
            .collect())
    }
}

impl std::fmt::Debug for LocalPartition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalPartition")
            .field("id", &self.id)
            .field("accepted", &self.accepted_generation())
            .finish()
    }
}

fn storage(e: impl std::fmt::Display) -> PartitionError {
    PartitionError::Storage {
        message: e.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::concept::{ConceptId, NewConcept};
    use crate::config::EngineConfig;
    use tempfile::TempDir;

    fn partition(dir: &TempDir) -> LocalPartition {
        let mut c = EngineConfig::with_storage_path(dir.path());
        c.vector_dimension = 2;
        let engine = Arc::new(Engine::open(c).unwrap());
        LocalPartition::open(0, engine).unwrap()
    }

    fn learn(content: &str) -> Operation {
        Operation::LearnConcept {
            concept: NewConcept::from_content(content, vec![1.0, 0.5]),
            associations: vec![],
        }
    }

    #[test]
    fn prepare_is_invisible_until_commit() {
        let dir = TempDir::new().unwrap();
        let p = partition(&dir);
        let txn = TxnId::new(Generation(1), 1);
        assert_eq!(p.prepare(txn, Generation(1), vec![learn("x")]).unwrap(), Vote::Commit);
        let id = ConceptId::for_content("x");
        assert!(!p.engine().graph().contains(&id));
        assert_eq!(p.in_doubt().unwrap(), vec![txn]);

        p.commit(txn, Generation(1)).unwrap();
        assert!(p.engine().graph().contains(&id));
        assert!(p.engine().vectors().contains(&id));
        assert!(p.in_doubt().unwrap().is_empty());
        // A repeated commit is a no-op.
        p.commit(txn, Generation(1)).unwrap();
        assert_eq!(p.engine().wal().last_sequence(), 2);
    }

    #[test]
    fn retried_prepare_logs_once() {
        let dir = TempDir::new().unwrap();
        let p = Arc::new(partition(&dir));
        let txn = TxnId::new(Generation(1), 1);
        let votes: Vec<Vote> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..4)
                .map(|_| {
                    let p = Arc::clone(&p);
                    s.spawn(move || p.prepare(txn, Generation(1), vec![learn("x")]).unwrap())
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        assert!(votes.iter().all(|v| *v == Vote::Commit));
        assert_eq!(p.engine().wal().last_sequence(), 1);
        assert_eq!(p.in_doubt().unwrap(), vec![txn]);
    }

    #[test]
    fn abort_drops_stash() {
        let dir = TempDir::new().unwrap();
        let p = partition(&dir);
        let txn = TxnId::new(Generation(1), 1);
        p.prepare(txn, Generation(1), vec![learn("x")]).unwrap();
        p.abort(txn, Generation(1)).unwrap();
        p.commit(txn, Generation(1)).unwrap();
        assert_eq!(p.engine().graph().concept_count(), 0);
    }

    #[test]
    fn invalid_ops_vote_abort() {
        let dir = TempDir::new().unwrap();
        let p = partition(&dir);
        let bad = Operation::LearnConcept {
            concept: NewConcept::from_content("x", vec![1.0, 2.0, 3.0]),
            associations: vec![],
        };
        let vote = p.prepare(TxnId::new(Generation(1), 1), Generation(1), vec![bad]).unwrap();
        assert!(matches!(vote, Vote::Abort { .. }));
        assert_eq!(p.engine().wal().last_sequence(), 0);
    }

    #[test]
    fn conflicting_prepare_votes_abort() {
        let dir = TempDir::new().unwrap();
        let p = partition(&dir);
        p.prepare(TxnId::new(Generation(1), 1), Generation(1), vec![learn("x")])
            .unwrap();
        let vote = p
            .prepare(TxnId::new(Generation(1), 2), Generation(1), vec![learn("x")])
            .unwrap();
        assert!(matches!(vote, Vote::Abort { reason } if reason.contains("1.1")));
    }

    #[test]
    fn stale_generation_rejected_and_newer_persisted() {
        let dir = TempDir::new().unwrap();
        {
            let p = partition(&dir);
            p.prepare(TxnId::new(Generation(3), 1), Generation(3), vec![learn("x")])
                .unwrap();
            let err = p
                .prepare(TxnId::new(Generation(2), 1), Generation(2), vec![learn("y")])
                .unwrap_err();
            assert!(matches!(
                err,
                PartitionError::StaleGeneration { received: 2, accepted: 3, .. }
            ));
        }
        let p = partition(&dir);
        assert_eq!(p.accepted_generation(), Generation(3));
        assert_eq!(p.in_doubt().unwrap(), vec![TxnId::new(Generation(3), 1)]);
    }
}
