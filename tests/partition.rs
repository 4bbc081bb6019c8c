//! Two-phase commit over real engines.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use mnemos::concept::{ConceptId, NewConcept};
use mnemos::config::EngineConfig;
use mnemos::engine::Engine;
use mnemos::error::PartitionError;
use mnemos::partition::{
    Coordinator, CoordinatorConfig, Generation, LocalPartition, PartitionClient, PartitionId,
    PartitionResult, TxnId, Vote, partition_for,
};
use mnemos::wal::Operation;
use tempfile::TempDir;

const DIM: usize = 4;

struct Cluster {
    dir: TempDir,
    partitions: Vec<Arc<LocalPartition>>,
}

impl Cluster {
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let partitions = open_partitions(dir.path());
        Self { dir, partitions }
    }

    fn clients(&self) -> Vec<Arc<dyn PartitionClient>> {
        self.partitions
            .iter()
            .map(|p| Arc::clone(p) as Arc<dyn PartitionClient>)
            .collect()
    }

    fn coordinator(&self, name: &str) -> Coordinator {
        Coordinator::open(&self.dir.path().join(name), self.clients(), config()).unwrap()
    }

    fn engine(&self, pid: PartitionId) -> &Arc<Engine> {
        self.partitions[pid as usize].engine()
    }

    fn holder(&self, id: &ConceptId) -> &Arc<Engine> {
        self.engine(partition_for(id, 2))
    }
}

fn open_partitions(root: &Path) -> Vec<Arc<LocalPartition>> {
    (0..2)
        .map(|pid| {
            let mut config = EngineConfig::with_storage_path(root.join(format!("p{pid}")));
            config.vector_dimension = DIM;
            let engine = Arc::new(Engine::open(config).unwrap());
            Arc::new(LocalPartition::open(pid, engine).unwrap())
        })
        .collect()
}

fn config() -> CoordinatorConfig {
    CoordinatorConfig {
        prepare_timeout: Duration::from_secs(2),
        retry_backoff: Duration::from_millis(1),
        ..CoordinatorConfig::default()
    }
}

/// One concept per partition, with contents prefixed by `tag`.
fn spanning(tag: &str) -> Vec<NewConcept> {
    let mut seen = BTreeSet::new();
    (0..)
        .map(|i| NewConcept::from_content(format!("{tag} {i}"), vec![1.0, i as f32, 0.5, 0.25]))
        .filter(|c| seen.insert(partition_for(&c.id, 2)))
        .take(2)
        .collect()
}

fn learn_ops(concepts: &[NewConcept]) -> Vec<Operation> {
    concepts
        .iter()
        .cloned()
        .map(|concept| Operation::LearnConcept {
            concept,
            associations: vec![],
        })
        .collect()
}

#[test]
fn commit_applies_on_every_partition() {
    let cluster = Cluster::new();
    let c = cluster.coordinator("coordinator.redb");
    let concepts = spanning("shared");

    let txn = c.execute(learn_ops(&concepts)).unwrap();
    // Every partition acknowledged, so the coordinator keeps nothing.
    assert_eq!(c.state(txn), None);
    assert!(c.committed_decisions().unwrap().is_empty());
    for concept in &concepts {
        let engine = cluster.holder(&concept.id);
        assert!(engine.graph().contains(&concept.id));
        let hits = engine.search(&concept.embedding, 1).unwrap();
        assert_eq!(hits[0].concept_id, concept.id);
    }
    for p in &cluster.partitions {
        assert!(p.in_doubt().unwrap().is_empty());
        assert_eq!(p.accepted_generation(), c.generation());
    }
}

#[test]
fn one_invalid_share_changes_nothing() {
    let cluster = Cluster::new();
    let c = cluster.coordinator("coordinator.redb");
    let mut concepts = spanning("mixed");
    concepts[1].embedding = vec![1.0, 2.0];

    let err = c.execute(learn_ops(&concepts)).unwrap_err();
    assert!(matches!(err, PartitionError::Aborted { .. }));
    for pid in 0..2 {
        let engine = cluster.engine(pid);
        assert_eq!(engine.graph().concept_count(), 0);
        assert_eq!(engine.vectors().len(), 0);
        assert!(engine.graph().pending_transactions().is_empty());
    }
    assert!(c.committed_decisions().unwrap().is_empty());
}

#[test]
fn pending_transaction_blocks_conflicting_prepare() {
    let cluster = Cluster::new();
    let c = cluster.coordinator("coordinator.redb");
    let concepts = spanning("contended");

    // Someone else already holds the first concept in a prepared transaction.
    let holder = partition_for(&concepts[0].id, 2);
    let other = TxnId::new(c.generation(), 999);
    let vote = cluster.partitions[holder as usize]
        .prepare(other, c.generation(), learn_ops(&concepts[..1]))
        .unwrap();
    assert_eq!(vote, Vote::Commit);

    let err = c.execute(learn_ops(&concepts)).unwrap_err();
    assert!(matches!(err, PartitionError::Aborted { reason, .. } if reason.contains("conflicts")));
    assert!(!cluster.holder(&concepts[1].id).graph().contains(&concepts[1].id));
}

#[test]
fn older_coordinator_is_fenced_off() {
    let cluster = Cluster::new();
    let old = cluster.coordinator("old.redb");
    // Open the second log twice so its generation is ahead of the first.
    drop(cluster.coordinator("new.redb"));
    let new = cluster.coordinator("new.redb");
    assert!(new.generation() > old.generation());

    new.execute(learn_ops(&spanning("fresh"))).unwrap();
    let err = old.execute(learn_ops(&spanning("stale"))).unwrap_err();
    assert!(matches!(err, PartitionError::StaleGeneration { .. }));
    for pid in 0..2 {
        assert_eq!(cluster.engine(pid).graph().concept_count(), 1);
    }
}

/// Forwards to a real partition but can lose commit messages.
struct Lossy {
    inner: Arc<LocalPartition>,
    drop_commits: AtomicBool,
}

impl PartitionClient for Lossy {
    fn id(&self) -> PartitionId {
        self.inner.id()
    }

    fn prepare(&self, txn: TxnId, generation: Generation, ops: Vec<Operation>) -> PartitionResult<Vote> {
        self.inner.prepare(txn, generation, ops)
    }

    fn commit(&self, txn: TxnId, generation: Generation) -> PartitionResult<()> {
        if self.drop_commits.load(Ordering::Relaxed) {
            return Err(PartitionError::Transport {
                message: "connection reset".into(),
            });
        }
        self.inner.commit(txn, generation)
    }

    fn abort(&self, txn: TxnId, generation: Generation) -> PartitionResult<()> {
        self.inner.abort(txn, generation)
    }

    fn in_doubt(&self) -> PartitionResult<Vec<TxnId>> {
        self.inner.in_doubt()
    }
}

#[test]
fn in_doubt_transactions_are_resolved_after_restart() {
    let dir = TempDir::new().unwrap();
    let log = dir.path().join("coordinator.redb");
    let decided = spanning("decided");
    let undecided = spanning("undecided");

    let (committed_txn, orphan_txn) = {
        let partitions = open_partitions(dir.path());
        let lossy: Vec<Arc<dyn PartitionClient>> = partitions
            .iter()
            .map(|p| {
                Arc::new(Lossy {
                    inner: Arc::clone(p),
                    drop_commits: AtomicBool::new(true),
                }) as Arc<dyn PartitionClient>
            })
            .collect();
        let c = Coordinator::open(&log, lossy, config()).unwrap();

        // Decision recorded, but no partition heard about it.
        let committed_txn = c.execute(learn_ops(&decided)).unwrap();
        assert!(c.is_committed(committed_txn).unwrap());

        // Prepared on one partition, then the coordinator "crashed".
        let orphan_txn = TxnId::new(c.generation(), 500);
        let home = partition_for(&undecided[0].id, 2);
        partitions[home as usize]
            .prepare(orphan_txn, c.generation(), learn_ops(&undecided[..1]))
            .unwrap();
        (committed_txn, orphan_txn)
    };

    let partitions = open_partitions(dir.path());
    for concept in &decided {
        let engine = partitions[partition_for(&concept.id, 2) as usize].engine();
        assert!(!engine.graph().contains(&concept.id));
        assert!(engine.recovery().in_doubt >= 1);
    }

    let clients: Vec<Arc<dyn PartitionClient>> = partitions
        .iter()
        .map(|p| Arc::clone(p) as Arc<dyn PartitionClient>)
        .collect();
    let c = Coordinator::open(&log, clients, config()).unwrap();
    let report = c.resolve_in_doubt().unwrap();
    assert_eq!(report.committed.len(), 2);
    assert!(report.committed.iter().all(|(_, t)| *t == committed_txn));
    assert_eq!(report.aborted.len(), 1);
    assert_eq!(report.aborted[0].1, orphan_txn);

    for concept in &decided {
        let engine = partitions[partition_for(&concept.id, 2) as usize].engine();
        assert!(engine.graph().contains(&concept.id));
        assert!(engine.vectors().contains(&concept.id));
    }
    let home = partition_for(&undecided[0].id, 2);
    assert!(!partitions[home as usize].engine().graph().contains(&undecided[0].id));
    for p in &partitions {
        assert!(p.in_doubt().unwrap().is_empty());
    }
    assert!(c.committed_decisions().unwrap().is_empty());
}
