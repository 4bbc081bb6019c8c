//! Engine facade: the owner of one data directory.
//!
//! The `Engine` owns the WAL, the graph store and the vector index, and
//! provides recovery, the serialized write path, flushing and the read API.
//! There is no global instance: open one per data directory and share it
//! behind an `Arc`.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::concept::{Concept, ConceptId};
use crate::config::EngineConfig;
use crate::error::{EngineError, MnemosResult, StoreError, VectorError};
use crate::graph::{GraphStore, VectorEffect, snapshot};
use crate::lock::DirLock;
use crate::paths::DataPaths;
use crate::reconcile::FlushSignal;
use crate::store::write_atomic;
use crate::vector::{IndexSource, SearchHit, VectorIndex};
use crate::wal::{Operation, SequenceNumber, WalEntry, WriteAheadLog};

/// What recovery found when the engine was opened.
#[derive(Debug, Clone, PartialEq)]
pub struct RecoveryReport {
    /// Sequence covered by the loaded snapshot (0 without one).
    pub snapshot_seq: SequenceNumber,
    /// WAL entries applied on top of the snapshot.
    pub replayed: u64,
    /// Byte offset and reason of a discarded WAL tail.
    pub corrupt_tail: Option<(u64, String)>,
    pub index: IndexSource,
    /// Embeddings that could not be indexed by the rebuild or the replay.
    pub vector_failures: u64,
    /// Prepared transactions waiting for a coordinator decision.
    pub in_doubt: usize,
    pub duration: Duration,
}

/// Counters and sizes reported by `GetStats`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineStats {
    pub concept_count: usize,
    pub association_count: usize,
    pub vector_count: usize,
    /// Writes acknowledged since open.
    pub writes: u64,
    /// Writes rejected because the WAL append failed.
    pub dropped: u64,
    /// Acknowledged writes not yet in a snapshot.
    pub pending: u64,
    pub uptime_secs: u64,
    pub last_sequence: SequenceNumber,
    pub wal_bytes: u64,
    pub pending_transactions: usize,
    pub flushes: u64,
    pub flush_failures: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Health {
    pub status: HealthStatus,
    pub reasons: Vec<String>,
}

/// Result of one successful flush.
#[derive(Debug, Clone, PartialEq)]
pub struct FlushReport {
    /// Sequence now covered by the snapshot.
    pub seq: SequenceNumber,
    pub graph_bytes: usize,
    pub index_bytes: usize,
    pub wal_bytes: u64,
}

#[derive(Debug, Default)]
struct Counters {
    writes: AtomicU64,
    dropped: AtomicU64,
    unflushed: AtomicU64,
    flushes: AtomicU64,
    flush_failures: AtomicU64,
    /// Failures since the last successful flush.
    failing_flushes: AtomicU64,
}

/// The mnemos storage engine for one data directory.
pub struct Engine {
    config: EngineConfig,
    paths: DataPaths,
    wal: WriteAheadLog,
    graph: GraphStore,
    vectors: VectorIndex,
    /// Serializes WAL append + apply.
    write_lock: Mutex<()>,
    /// Serializes flushes.
    flush_lock: Mutex<()>,
    counters: Counters,
    last_flush: Mutex<Instant>,
    /// Set when a vector effect could not be applied; cleared by a rebuild.
    index_stale: AtomicBool,
    signal: FlushSignal,
    started: Instant,
    recovery: RecoveryReport,
    // Dropped last so the directory stays owned until everything is closed.
    _lock: DirLock,
}

impl Engine {
    /// Open the data directory named by `config`, recovering its state.
    ///
    /// Loads the graph snapshot, loads or rebuilds the vector index, then
    /// replays every WAL entry newer than the snapshot.
    pub fn open(config: EngineConfig) -> MnemosResult<Self> {
        config.validate()?;
        let started = Instant::now();
        let paths = DataPaths::new(&config.storage_path);
        paths.ensure_dirs()?;
        let lock = DirLock::acquire(&paths.root)?;

        tracing::info!(
            path = %paths.root.display(),
            dim = config.vector_dimension,
            "opening mnemos engine"
        );

        let graph = match snapshot::load(&paths.graph)? {
            Some((header, graph)) => {
                let recorded = header.dimension as usize;
                if recorded != 0 && recorded != config.vector_dimension {
                    return Err(EngineError::InvalidConfig {
                        message: format!(
                            "data directory was written with vector_dimension {recorded}, configured {}",
                            config.vector_dimension
                        ),
                    }
                    .into());
                }
                graph
            }
            None => GraphStore::default(),
        };
        check_embedding_dimension(&graph, config.vector_dimension, "snapshot")?;
        let snapshot_seq = graph.last_applied();
        let (vectors, index_source) = VectorIndex::load_or_build(
            &paths.vectors,
            config.vector_dimension,
            config.index.clone(),
            &graph,
        )?;
        let mut vector_failures = match &index_source {
            IndexSource::Rebuilt { skipped, .. } => *skipped as u64,
            IndexSource::Loaded => 0,
        };

        let wal = WriteAheadLog::open(&paths.wal)?;
        wal.ensure_sequence_floor(snapshot_seq)?;

        let mut replay = wal.replay(snapshot_seq + 1)?;
        let mut replayed = 0u64;
        for entry in replay.by_ref() {
            let entry = entry?;
            let effects = graph.apply(&entry);
            vector_failures += apply_effects(&vectors, effects);
            replayed += 1;
        }
        // The log carries no dimension of its own; unflushed learns are
        // checked here.
        check_embedding_dimension(&graph, config.vector_dimension, "write-ahead log")?;
        let corrupt_tail = wal
            .discarded_tail()
            .cloned()
            .or_else(|| replay.report().corrupt_tail.clone());

        let in_doubt = graph.pending_transactions().len();
        let recovery = RecoveryReport {
            snapshot_seq,
            replayed,
            corrupt_tail,
            index: index_source,
            vector_failures,
            in_doubt,
            duration: started.elapsed(),
        };
        tracing::info!(
            snapshot_seq,
            replayed,
            concepts = graph.concept_count(),
            vectors = vectors.len(),
            in_doubt,
            elapsed_ms = recovery.duration.as_millis() as u64,
            "recovery complete"
        );
        if vector_failures > 0 {
            tracing::error!(vector_failures, "vector index is missing graph embeddings");
        }

        let counters = Counters::default();
        // Replayed entries are not in the snapshot yet.
        counters.unflushed.store(replayed, Ordering::Relaxed);

        Ok(Self {
            config,
            paths,
            wal,
            graph,
            vectors,
            write_lock: Mutex::new(()),
            flush_lock: Mutex::new(()),
            counters,
            last_flush: Mutex::new(Instant::now()),
            index_stale: AtomicBool::new(vector_failures > 0),
            signal: FlushSignal::new(),
            started,
            recovery,
            _lock: lock,
        })
    }

    /// Append one operation built under the writer lock, then apply it.
    ///
    /// `build` sees the graph as of the moment the lock was taken, so
    /// validation and append cannot interleave with another writer. Nothing
    /// is applied unless the WAL append succeeded.
    pub(crate) fn write<F>(&self, build: F) -> MnemosResult<WalEntry>
    where
        F: FnOnce(&GraphStore) -> MnemosResult<Operation>,
    {
        let _writer = self.write_lock.lock().expect("writer lock poisoned");
        let op = build(&self.graph)?;
        self.append_and_apply(op)
    }

    /// Like [`Engine::write`], but `build` may decide under the lock that
    /// there is nothing to log.
    pub(crate) fn write_if<F>(&self, build: F) -> MnemosResult<Option<WalEntry>>
    where
        F: FnOnce(&GraphStore) -> MnemosResult<Option<Operation>>,
    {
        let _writer = self.write_lock.lock().expect("writer lock poisoned");
        match build(&self.graph)? {
            Some(op) => self.append_and_apply(op).map(Some),
            None => Ok(None),
        }
    }

    /// Caller holds the writer lock.
    fn append_and_apply(&self, op: Operation) -> MnemosResult<WalEntry> {
        let tag = op.tag();

        let entry = match self.wal.append_entry(op) {
            Ok(entry) => entry,
            Err(e) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(%tag, error = %e, "WAL append failed; write dropped");
                return Err(e.into());
            }
        };

        let effects = self.graph.apply(&entry);
        if apply_effects(&self.vectors, effects) > 0 {
            self.index_stale.store(true, Ordering::Relaxed);
            tracing::error!(seq = entry.seq, "vector index out of sync; will rebuild on next flush");
        }

        self.counters.writes.fetch_add(1, Ordering::Relaxed);
        let pending = self.counters.unflushed.fetch_add(1, Ordering::Relaxed) + 1;
        if pending >= self.config.flush_threshold {
            self.signal.notify(false);
        }
        tracing::debug!(seq = entry.seq, %tag, "write applied");
        Ok(entry)
    }

    /// Snapshot the graph and index, then drop the WAL prefix they cover.
    ///
    /// Any failure leaves the WAL untouched, so nothing acknowledged is lost.
    pub fn flush(&self) -> MnemosResult<FlushReport> {
        let _flushing = self.flush_lock.lock().expect("flush lock poisoned");
        let result = self.flush_inner();
        match &result {
            Ok(report) => {
                self.counters.flushes.fetch_add(1, Ordering::Relaxed);
                self.counters.failing_flushes.store(0, Ordering::Relaxed);
                tracing::info!(
                    seq = report.seq,
                    graph_bytes = report.graph_bytes,
                    index_bytes = report.index_bytes,
                    wal_bytes = report.wal_bytes,
                    "flush complete"
                );
            }
            Err(e) => {
                self.counters.flush_failures.fetch_add(1, Ordering::Relaxed);
                self.counters.failing_flushes.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(error = %e, "flush failed; WAL retained");
            }
        }
        result
    }

    fn flush_inner(&self) -> MnemosResult<FlushReport> {
        let (seq, graph_bytes, index_bytes, captured) = {
            let _writer = self.write_lock.lock().expect("writer lock poisoned");
            if self.index_stale.swap(false, Ordering::Relaxed)
                && self.vectors.rebuild_from(&self.graph) > 0
            {
                self.index_stale.store(true, Ordering::Relaxed);
                tracing::error!("rebuilt vector index still misses graph embeddings");
            }
            let seq = self.graph.last_applied();
            let graph_bytes = self.graph.snapshot(self.config.vector_dimension)?;
            let index_bytes = self.vectors.to_bytes(seq);
            (
                seq,
                graph_bytes,
                index_bytes,
                self.counters.unflushed.load(Ordering::Relaxed),
            )
        };

        write_atomic(&self.paths.graph, &graph_bytes).map_err(|e| StoreError::Io { source: e })?;
        write_atomic(&self.paths.vectors, &index_bytes).map_err(|e| VectorError::Io { source: e })?;
        if seq > 0 {
            self.wal.checkpoint(seq)?;
        }

        self.counters.unflushed.fetch_sub(captured, Ordering::Relaxed);
        *self.last_flush.lock().expect("flush clock poisoned") = Instant::now();
        Ok(FlushReport {
            seq,
            graph_bytes: graph_bytes.len(),
            index_bytes: index_bytes.len(),
            wal_bytes: self.wal.size_bytes(),
        })
    }

    /// Approximate nearest concepts to `embedding`.
    pub fn search(&self, embedding: &[f32], k: usize) -> MnemosResult<Vec<SearchHit>> {
        Ok(self.vectors.search(embedding, k)?)
    }

    pub fn get_concept(&self, id: &ConceptId) -> Option<Concept> {
        self.graph.concept(id)
    }

    pub fn graph(&self) -> &GraphStore {
        &self.graph
    }

    pub fn vectors(&self) -> &VectorIndex {
        &self.vectors
    }

    pub fn wal(&self) -> &WriteAheadLog {
        &self.wal
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn paths(&self) -> &DataPaths {
        &self.paths
    }

    pub fn recovery(&self) -> &RecoveryReport {
        &self.recovery
    }

    /// Acknowledged writes not yet covered by a snapshot.
    pub fn unflushed(&self) -> u64 {
        self.counters.unflushed.load(Ordering::Relaxed)
    }

    /// Time since the last successful flush (or since open).
    pub fn since_last_flush(&self) -> Duration {
        self.last_flush
            .lock()
            .expect("flush clock poisoned")
            .elapsed()
    }

    pub(crate) fn signal(&self) -> &FlushSignal {
        &self.signal
    }

    /// Ask the reconciler to flush now.
    pub fn request_flush(&self) {
        self.signal.notify(true);
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            concept_count: self.graph.concept_count(),
            association_count: self.graph.association_count(),
            vector_count: self.vectors.len(),
            writes: self.counters.writes.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            pending: self.unflushed(),
            uptime_secs: self.started.elapsed().as_secs(),
            last_sequence: self.wal.last_sequence(),
            wal_bytes: self.wal.size_bytes(),
            pending_transactions: self.graph.pending_transactions().len(),
            flushes: self.counters.flushes.load(Ordering::Relaxed),
            flush_failures: self.counters.flush_failures.load(Ordering::Relaxed),
        }
    }

    pub fn health(&self) -> Health {
        let mut reasons = Vec::new();
        if self.wal.is_poisoned() {
            reasons.push("write-ahead log is poisoned; restart required".to_string());
        }
        if self.index_stale.load(Ordering::Relaxed) {
            reasons.push("vector index is out of sync with the graph".to_string());
        }
        let failing = self.counters.failing_flushes.load(Ordering::Relaxed);
        if failing > 0 {
            reasons.push(format!("last {failing} flush attempt(s) failed"));
        }
        let pending = self.unflushed();
        if pending >= self.config.flush_threshold.saturating_mul(2) {
            reasons.push(format!("{pending} unflushed writes, flushing is falling behind"));
        }
        Health {
            status: if reasons.is_empty() {
                HealthStatus::Healthy
            } else {
                HealthStatus::Degraded
            },
            reasons,
        }
    }
}

/// Refuse a graph holding embeddings of another dimension.
fn check_embedding_dimension(graph: &GraphStore, dimension: usize, origin: &str) -> MnemosResult<()> {
    match graph.embedding_dimension_mismatch(dimension) {
        Some((id, len)) => Err(EngineError::InvalidConfig {
            message: format!(
                "concept {id} in the {origin} has a {len}-dimensional embedding, configured vector_dimension is {dimension}"
            ),
        }
        .into()),
        None => Ok(()),
    }
}

/// Mirror graph effects into the index. Returns the number of failures.
fn apply_effects(vectors: &VectorIndex, effects: Vec<VectorEffect>) -> u64 {
    let mut failures = 0;
    for effect in effects {
        match effect {
            VectorEffect::Upsert { id, vector } => {
                if let Err(e) = vectors.insert(id.clone(), &vector) {
                    failures += 1;
                    tracing::error!(%id, error = %e, "failed to index embedding");
                }
            }
            VectorEffect::Remove { id } => {
                vectors.remove(&id);
            }
        }
    }
    failures
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("path", &self.paths.root)
            .field("concepts", &self.graph.concept_count())
            .field("vectors", &self.vectors.len())
            .field("last_sequence", &self.wal.last_sequence())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::concept::NewConcept;
    use crate::error::{MnemosError, WalError};
    use tempfile::TempDir;

    fn config(dir: &TempDir) -> EngineConfig {
        let mut c = EngineConfig::with_storage_path(dir.path());
        c.vector_dimension = 3;
        c
    }

    fn learn_op(content: &str, v: Vec<f32>) -> Operation {
        Operation::LearnConcept {
            concept: NewConcept::from_content(content, v),
            associations: vec![],
        }
    }

    #[test]
    fn write_applies_to_graph_and_index() {
        let dir = TempDir::new().unwrap();
        let engine = Engine::open(config(&dir)).unwrap();
        let entry = engine.write(|_| Ok(learn_op("x", vec![1.0, 0.0, 0.0]))).unwrap();
        assert_eq!(entry.seq, 1);
        assert_eq!(engine.graph().concept_count(), 1);
        assert_eq!(engine.vectors().len(), 1);
        assert_eq!(engine.stats().writes, 1);
        assert_eq!(engine.unflushed(), 1);
    }

    #[test]
    fn rejected_build_writes_nothing() {
        let dir = TempDir::new().unwrap();
        let engine = Engine::open(config(&dir)).unwrap();
        let err = engine
            .write(|_| {
                Err(EngineError::InvalidConfig {
                    message: "nope".into(),
                }
                .into())
            })
            .unwrap_err();
        assert!(matches!(err, MnemosError::Engine(_)));
        assert_eq!(engine.wal().last_sequence(), 0);
        assert_eq!(engine.stats().dropped, 0);
    }

    #[test]
    fn flush_checkpoints_and_resets_pending() {
        let dir = TempDir::new().unwrap();
        let engine = Engine::open(config(&dir)).unwrap();
        for i in 0..20 {
            engine
                .write(|_| Ok(learn_op(&format!("c{i}"), vec![1.0, i as f32, 0.5])))
                .unwrap();
        }
        let before = engine.wal().size_bytes();
        let report = engine.flush().unwrap();
        assert_eq!(report.seq, 20);
        assert!(report.wal_bytes < before);
        assert_eq!(engine.unflushed(), 0);
        assert!(engine.paths().graph.exists());
        assert!(engine.paths().vectors.exists());
        assert_eq!(engine.health().status, HealthStatus::Healthy);
    }

    #[test]
    fn failed_wal_append_applies_nothing() {
        let dir = TempDir::new().unwrap();
        let engine = Engine::open(config(&dir)).unwrap();
        engine.write(|_| Ok(learn_op("kept", vec![1.0, 0.0, 0.0]))).unwrap();
        // Writes through a read-only handle fail with EBADF.
        let read_only = std::fs::File::open(&engine.paths().wal).unwrap();
        engine.wal().swap_handle(read_only);

        let err = engine
            .write(|_| Ok(learn_op("lost", vec![0.0, 1.0, 0.0])))
            .unwrap_err();
        assert!(matches!(err, MnemosError::Wal(WalError::Io { .. })));
        let stats = engine.stats();
        assert_eq!(stats.dropped, 1);
        assert_eq!(stats.writes, 1);
        assert_eq!(stats.concept_count, 1);
        assert_eq!(stats.vector_count, 1);
        assert_eq!(stats.last_sequence, 1);
        assert_eq!(engine.unflushed(), 1);

        drop(engine);
        let engine = Engine::open(config(&dir)).unwrap();
        assert_eq!(engine.graph().concept_count(), 1);
        assert_eq!(engine.recovery().replayed, 1);
    }

    #[test]
    fn second_open_of_same_directory_is_locked() {
        let dir = TempDir::new().unwrap();
        let _engine = Engine::open(config(&dir)).unwrap();
        let err = Engine::open(config(&dir)).unwrap_err();
        assert!(matches!(err, MnemosError::Engine(EngineError::Locked { .. })));
    }

    #[test]
    fn invalid_config_rejected_before_touching_disk() {
        let dir = TempDir::new().unwrap();
        let mut c = config(&dir);
        c.vector_dimension = 0;
        assert!(Engine::open(c).is_err());
        assert!(!dir.path().join("wal.log").exists());
    }
}
