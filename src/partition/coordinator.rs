//! Decision side of two-phase commit.
//!
//! The coordinator prepares every involved partition in parallel and waits
//! at most `prepare_timeout` for all votes. Only a unanimous commit vote
//! leads to a commit, and the decision is written to `coordinator.redb`
//! before any partition hears about it. Anything else aborts. After a crash,
//! [`Coordinator::resolve_in_doubt`] commits what the log says was decided
//! and aborts everything else.
//!
//! A decision record and the in-memory state of a transaction are dropped
//! once every involved partition has acknowledged the outcome.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::error::PartitionError;
use crate::store::DurableStore;
use crate::wal::Operation;

use super::{Generation, PartitionClient, PartitionId, PartitionResult, TxnId, Vote, route};

const GENERATION_KEY: &[u8] = b"generation";
const DECISION_PREFIX: &[u8] = b"decision/";

/// Timeouts and retry limits of the protocol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// How long to wait for all prepare votes.
    pub prepare_timeout: Duration,
    /// Extra prepare attempts per partition after a transport error.
    pub prepare_retries: u32,
    /// Extra commit/abort attempts per partition.
    pub commit_retries: u32,
    /// Delay before the first retry; grows linearly per attempt.
    pub retry_backoff: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            prepare_timeout: Duration::from_secs(5),
            prepare_retries: 2,
            commit_retries: 3,
            retry_backoff: Duration::from_millis(50),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnState {
    Proposed,
    Prepared,
    Committed,
    Aborted,
}

/// Outcome of [`Coordinator::resolve_in_doubt`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolveReport {
    pub committed: Vec<(PartitionId, TxnId)>,
    pub aborted: Vec<(PartitionId, TxnId)>,
    /// Transactions of this coordinator still in flight.
    pub skipped: usize,
}

/// Coordinates atomic writes across a fixed set of partitions.
pub struct Coordinator {
    generation: Generation,
    /// Indexed by partition id.
    partitions: Vec<Arc<dyn PartitionClient>>,
    config: CoordinatorConfig,
    log: DurableStore,
    next_counter: AtomicU64,
    states: DashMap<TxnId, TxnState>,
}

impl Coordinator {
    /// Open the decision log at `path` and start a new generation.
    ///
    /// `partitions[i]` must report id `i`.
    pub fn open(
        path: &Path,
        partitions: Vec<Arc<dyn PartitionClient>>,
        config: CoordinatorConfig,
    ) -> PartitionResult<Self> {
        if partitions.is_empty() {
            return Err(PartitionError::UnknownPartition { partition: 0 });
        }
        for (i, p) in partitions.iter().enumerate() {
            if p.id() as usize != i {
                return Err(PartitionError::UnknownPartition { partition: p.id() });
            }
        }

        let log = DurableStore::open(path).map_err(storage)?;
        let previous = log.get_u64(GENERATION_KEY).map_err(storage)?.unwrap_or(0);
        let generation = Generation(previous + 1);
        log.put_u64(GENERATION_KEY, generation.0).map_err(storage)?;
        tracing::info!(
            %generation,
            partitions = partitions.len(),
            path = %path.display(),
            "coordinator started"
        );

        Ok(Self {
            generation,
            partitions,
            config,
            log,
            next_counter: AtomicU64::new(0),
            states: DashMap::new(),
        })
    }

    pub fn generation(&self) -> Generation {
        self.generation
    }

    pub fn partition_count(&self) -> u32 {
        self.partitions.len() as u32
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// State of a transaction that is in flight or whose outcome has not
    /// reached every partition yet. Settled transactions are forgotten.
    pub fn state(&self, txn: TxnId) -> Option<TxnState> {
        self.states.get(&txn).map(|s| *s)
    }

    /// Atomically apply `ops` across the partitions that own them.
    ///
    /// Either every involved partition applies its share or none does.
    pub fn execute(&self, ops: Vec<Operation>) -> PartitionResult<TxnId> {
        let txn = TxnId::new(
            self.generation,
            self.next_counter.fetch_add(1, Ordering::Relaxed) + 1,
        );
        let routed = route(ops, self.partition_count()).map_err(|e| match e {
            PartitionError::Aborted { reason, .. } => PartitionError::Aborted {
                txn: txn.to_string(),
                reason,
            },
            other => other,
        })?;
        if routed.is_empty() {
            return Err(PartitionError::Aborted {
                txn: txn.to_string(),
                reason: "transaction has no operations".into(),
            });
        }

        let involved: Vec<PartitionId> = routed.keys().copied().collect();
        self.states.insert(txn, TxnState::Proposed);
        tracing::debug!(%txn, ?involved, "transaction proposed");

        let prepared = self
            .prepare_all(txn, routed)
            .and_then(|()| {
                self.states.insert(txn, TxnState::Prepared);
                self.record_commit(txn)
            });

        if let Err(e) = prepared {
            tracing::info!(%txn, error = %e, "aborting transaction");
            self.states.insert(txn, TxnState::Aborted);
            if self.broadcast(txn, &involved, Decision::Abort) {
                self.states.remove(&txn);
            }
            return Err(e);
        }

        self.states.insert(txn, TxnState::Committed);
        if self.broadcast(txn, &involved, Decision::Commit) {
            self.forget_commit(txn);
        }
        tracing::debug!(%txn, "transaction committed");
        Ok(txn)
    }

    fn prepare_all(
        &self,
        txn: TxnId,
        routed: BTreeMap<PartitionId, Vec<Operation>>,
    ) -> PartitionResult<()> {
        let mut waiting: BTreeSet<PartitionId> = routed.keys().copied().collect();
        let (tx, rx) = mpsc::channel();
        for (pid, ops) in routed {
            let client = self.client(pid)?;
            let tx = tx.clone();
            let generation = self.generation;
            let attempts = self.config.prepare_retries + 1;
            let backoff = self.config.retry_backoff;
            // Workers are detached: one that outlives the timeout leaves a
            // stash that in-doubt resolution aborts.
            std::thread::Builder::new()
                .name(format!("mnemos-prepare-{pid}"))
                .spawn(move || {
                    let vote = with_retries(attempts, backoff, || {
                        client.prepare(txn, generation, ops.clone())
                    });
                    let _ = tx.send((pid, vote));
                })
                .map_err(|e| PartitionError::Transport {
                    message: format!("failed to spawn prepare worker: {e}"),
                })?;
        }
        drop(tx);

        let deadline = Instant::now() + self.config.prepare_timeout;
        while let Some(&first) = waiting.iter().next() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match rx.recv_timeout(remaining) {
                Ok((pid, Ok(Vote::Commit))) => {
                    tracing::debug!(%txn, partition = pid, "vote commit");
                    waiting.remove(&pid);
                }
                Ok((pid, Ok(Vote::Abort { reason }))) => {
                    return Err(PartitionError::Aborted {
                        txn: txn.to_string(),
                        reason: format!("partition {pid} voted abort: {reason}"),
                    });
                }
                Ok((_, Err(e @ PartitionError::StaleGeneration { .. }))) => return Err(e),
                Ok((pid, Err(e))) => {
                    return Err(PartitionError::Aborted {
                        txn: txn.to_string(),
                        reason: format!("partition {pid} unreachable: {e}"),
                    });
                }
                Err(RecvTimeoutError::Timeout) => {
                    return Err(PartitionError::PrepareTimeout {
                        txn: txn.to_string(),
                        partition: first,
                        timeout_ms: self.config.prepare_timeout.as_millis() as u64,
                    });
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(PartitionError::Transport {
                        message: "prepare workers exited without voting".into(),
                    });
                }
            }
        }
        Ok(())
    }

    fn record_commit(&self, txn: TxnId) -> PartitionResult<()> {
        self.log
            .put(&decision_key(txn), &[1])
            .map_err(storage)
    }

    /// Drop the decision record and state of a commit every partition has
    /// applied. A record that cannot be removed is pruned by the next
    /// coordinator's in-doubt resolution.
    fn forget_commit(&self, txn: TxnId) {
        if let Err(e) = self.log.remove(&decision_key(txn)) {
            tracing::warn!(%txn, error = %e, "failed to remove settled commit decision");
        }
        self.states.remove(&txn);
    }

    /// Whether a commit decision for `txn` is in the log.
    pub fn is_committed(&self, txn: TxnId) -> PartitionResult<bool> {
        Ok(self.log.get(&decision_key(txn)).map_err(storage)?.is_some())
    }

    /// Every transaction with a recorded commit decision, in id order.
    pub fn committed_decisions(&self) -> PartitionResult<Vec<TxnId>> {
        Ok(self
            .log
            .scan_prefix(DECISION_PREFIX)
            .map_err(storage)?
            .into_iter()
            .filter_map(|(k, _)| TxnId::from_key(&k[DECISION_PREFIX.len()..]))
            .collect())
    }

    /// Send the decision to every involved partition, in parallel.
    /// Returns whether every partition acknowledged it.
    ///
    /// Undelivered decisions are logged; the partition keeps the
    /// transaction in doubt until it is resolved.
    fn broadcast(&self, txn: TxnId, involved: &[PartitionId], decision: Decision) -> bool {
        let attempts = self.config.commit_retries + 1;
        let backoff = self.config.retry_backoff;
        let generation = self.generation;
        std::thread::scope(|s| {
            let workers: Vec<_> = involved
                .iter()
                .map(|&pid| {
                    let client = self.client(pid);
                    s.spawn(move || {
                        let result = client.and_then(|client| {
                            with_retries(attempts, backoff, || match decision {
                                Decision::Commit => client.commit(txn, generation),
                                Decision::Abort => client.abort(txn, generation),
                            })
                        });
                        if let Err(e) = &result {
                            tracing::warn!(
                                %txn,
                                partition = pid,
                                ?decision,
                                error = %e,
                                "decision not delivered; partition keeps the transaction in doubt"
                            );
                        }
                        result.is_ok()
                    })
                })
                .collect();
            workers
                .into_iter()
                .map(|w| w.join().unwrap_or(false))
                .fold(true, |all, ok| all && ok)
        })
    }

    /// Settle every transaction the partitions still hold in doubt.
    ///
    /// Transactions with a recorded commit decision are committed; all
    /// others are aborted. Once every partition is settled, decision records
    /// nobody needs any more are removed.
    pub fn resolve_in_doubt(&self) -> PartitionResult<ResolveReport> {
        let mut report = ResolveReport::default();
        for client in &self.partitions {
            let pid = client.id();
            for txn in client.in_doubt()? {
                if matches!(
                    self.state(txn),
                    Some(TxnState::Proposed | TxnState::Prepared)
                ) {
                    report.skipped += 1;
                    continue;
                }
                let attempts = self.config.commit_retries + 1;
                let backoff = self.config.retry_backoff;
                if self.is_committed(txn)? {
                    with_retries(attempts, backoff, || client.commit(txn, self.generation))?;
                    report.committed.push((pid, txn));
                } else {
                    with_retries(attempts, backoff, || client.abort(txn, self.generation))?;
                    report.aborted.push((pid, txn));
                }
            }
        }

        // Every partition has applied what it held. Commits settled here
        // and decisions of earlier generations have no reader left.
        let settled: BTreeSet<TxnId> = report
            .committed
            .iter()
            .chain(&report.aborted)
            .map(|&(_, txn)| txn)
            .collect();
        for txn in self.committed_decisions()? {
            if settled.contains(&txn) || txn.generation < self.generation.0 {
                self.log.remove(&decision_key(txn)).map_err(storage)?;
            }
        }
        for txn in &settled {
            self.states.remove(txn);
        }

        tracing::info!(
            committed = report.committed.len(),
            aborted = report.aborted.len(),
            skipped = report.skipped,
            "in-doubt transactions resolved"
        );
        Ok(report)
    }

    fn client(&self, pid: PartitionId) -> PartitionResult<Arc<dyn PartitionClient>> {
        self.partitions
            .get(pid as usize)
            .cloned()
            .ok_or(PartitionError::UnknownPartition { partition: pid })
    }
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("generation", &self.generation)
            .field("partitions", &self.partitions.len())
            .field("tracked", &self.states.len())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Decision {
    Commit,
    Abort,
}

fn decision_key(txn: TxnId) -> Vec<u8> {
    let mut key = DECISION_PREFIX.to_vec();
    key.extend_from_slice(&txn.to_key());
    key
}

/// Call `f` up to `attempts` times, backing off between tries.
/// Generation rejections are final and never retried.
fn with_retries<T>(
    attempts: u32,
    backoff: Duration,
    mut f: impl FnMut() -> PartitionResult<T>,
) -> PartitionResult<T> {
    let mut attempt = 1;
    loop {
        match f() {
            Ok(v) => return Ok(v),
            Err(e @ PartitionError::StaleGeneration { .. }) => return Err(e),
            Err(e) if attempt >= attempts => return Err(e),
            Err(e) => {
                tracing::debug!(attempt, error = %e, "partition call failed; retrying");
                std::thread::sleep(backoff * attempt);
                attempt += 1;
            }
        }
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
    use crate::concept::NewConcept;
    use crate::partition::partition_for;
    use std::sync::Mutex;
    use tempfile::TempDir;

    #[derive(Default)]
    struct Script {
        vote_abort: bool,
        prepare_delay: Duration,
        transport_failures: u32,
        commit_refusals: u32,
    }

    /// In-memory participant that records what it was told.
    struct ScriptedPartition {
        id: PartitionId,
        script: Script,
        failures_left: Mutex<u32>,
        refusals_left: Mutex<u32>,
        prepared: Mutex<Vec<TxnId>>,
        committed: Mutex<Vec<TxnId>>,
        aborted: Mutex<Vec<TxnId>>,
    }

    impl ScriptedPartition {
        fn new(id: PartitionId, script: Script) -> Arc<Self> {
            Arc::new(Self {
                id,
                failures_left: Mutex::new(script.transport_failures),
                refusals_left: Mutex::new(script.commit_refusals),
                script,
                prepared: Mutex::default(),
                committed: Mutex::default(),
                aborted: Mutex::default(),
            })
        }
    }

    impl PartitionClient for ScriptedPartition {
        fn id(&self) -> PartitionId {
            self.id
        }

        fn prepare(&self, txn: TxnId, _g: Generation, _ops: Vec<Operation>) -> PartitionResult<Vote> {
            std::thread::sleep(self.script.prepare_delay);
            let mut left = self.failures_left.lock().unwrap();
            if *left > 0 {
                *left -= 1;
                return Err(PartitionError::Transport {
                    message: "connection reset".into(),
                });
            }
            if self.script.vote_abort {
                return Ok(Vote::Abort {
                    reason: "validation failed".into(),
                });
            }
            self.prepared.lock().unwrap().push(txn);
            Ok(Vote::Commit)
        }

        fn commit(&self, txn: TxnId, _g: Generation) -> PartitionResult<()> {
            let mut left = self.refusals_left.lock().unwrap();
            if *left > 0 {
                *left -= 1;
                return Err(PartitionError::Transport {
                    message: "connection refused".into(),
                });
            }
            self.prepared.lock().unwrap().retain(|t| *t != txn);
            self.committed.lock().unwrap().push(txn);
            Ok(())
        }

        fn abort(&self, txn: TxnId, _g: Generation) -> PartitionResult<()> {
            self.prepared.lock().unwrap().retain(|t| *t != txn);
            self.aborted.lock().unwrap().push(txn);
            Ok(())
        }

        fn in_doubt(&self) -> PartitionResult<Vec<TxnId>> {
            Ok(self.prepared.lock().unwrap().clone())
        }
    }

    fn fast_config() -> CoordinatorConfig {
        CoordinatorConfig {
            prepare_timeout: Duration::from_millis(200),
            retry_backoff: Duration::from_millis(1),
            ..CoordinatorConfig::default()
        }
    }

    fn two_partitions(
        dir: &TempDir,
        a: Script,
        b: Script,
    ) -> (Coordinator, Arc<ScriptedPartition>, Arc<ScriptedPartition>) {
        let p0 = ScriptedPartition::new(0, a);
        let p1 = ScriptedPartition::new(1, b);
        let clients: Vec<Arc<dyn PartitionClient>> = vec![p0.clone(), p1.clone()];
        let c = Coordinator::open(&dir.path().join("coordinator.redb"), clients, fast_config())
            .unwrap();
        (c, p0, p1)
    }

    /// One learn op per partition.
    fn spanning_ops() -> Vec<Operation> {
        let mut seen = BTreeSet::new();
        (0..)
            .map(|i| NewConcept::from_content(format!("fact {i}"), vec![]))
            .filter(|c| seen.insert(partition_for(&c.id, 2)))
            .take(2)
            .map(|concept| Operation::LearnConcept {
                concept,
                associations: vec![],
            })
            .collect()
    }

    #[test]
    fn unanimous_commit() {
        let dir = TempDir::new().unwrap();
        let (c, p0, p1) = two_partitions(&dir, Script::default(), Script::default());
        let txn = c.execute(spanning_ops()).unwrap();
        assert_eq!(*p0.committed.lock().unwrap(), vec![txn]);
        assert_eq!(*p1.committed.lock().unwrap(), vec![txn]);
        // Delivered everywhere, so nothing is kept about it.
        assert_eq!(c.state(txn), None);
        assert!(!c.is_committed(txn).unwrap());
        assert!(c.committed_decisions().unwrap().is_empty());
    }

    #[test]
    fn undelivered_commit_is_kept_until_resolved() {
        let dir = TempDir::new().unwrap();
        // Outlasts every broadcast retry.
        let deaf = Script {
            commit_refusals: fast_config().commit_retries + 1,
            ..Script::default()
        };
        let (c, p0, p1) = two_partitions(&dir, Script::default(), deaf);
        let txn = c.execute(spanning_ops()).unwrap();
        assert_eq!(*p0.committed.lock().unwrap(), vec![txn]);
        assert_eq!(p1.in_doubt().unwrap(), vec![txn]);
        assert_eq!(c.state(txn), Some(TxnState::Committed));
        assert_eq!(c.committed_decisions().unwrap(), vec![txn]);

        let report = c.resolve_in_doubt().unwrap();
        assert_eq!(report.committed, vec![(1, txn)]);
        assert_eq!(*p1.committed.lock().unwrap(), vec![txn]);
        assert_eq!(c.state(txn), None);
        assert!(c.committed_decisions().unwrap().is_empty());
    }

    #[test]
    fn single_abort_vote_aborts_everywhere() {
        let dir = TempDir::new().unwrap();
        let abort = Script {
            vote_abort: true,
            ..Script::default()
        };
        let (c, p0, p1) = two_partitions(&dir, Script::default(), abort);
        let err = c.execute(spanning_ops()).unwrap_err();
        assert!(matches!(err, PartitionError::Aborted { .. }));
        assert!(p0.committed.lock().unwrap().is_empty());
        assert!(p1.committed.lock().unwrap().is_empty());
        assert_eq!(p0.aborted.lock().unwrap().len(), 1);
        assert!(c.committed_decisions().unwrap().is_empty());
    }

    #[test]
    fn slow_partition_times_out() {
        let dir = TempDir::new().unwrap();
        let slow = Script {
            prepare_delay: Duration::from_secs(2),
            ..Script::default()
        };
        let (c, p0, _p1) = two_partitions(&dir, Script::default(), slow);
        let err = c.execute(spanning_ops()).unwrap_err();
        assert!(matches!(err, PartitionError::PrepareTimeout { partition: 1, .. }));
        assert_eq!(p0.aborted.lock().unwrap().len(), 1);
    }

    #[test]
    fn transient_transport_errors_are_retried() {
        let dir = TempDir::new().unwrap();
        let flaky = Script {
            transport_failures: 2,
            ..Script::default()
        };
        let (c, _p0, p1) = two_partitions(&dir, Script::default(), flaky);
        let txn = c.execute(spanning_ops()).unwrap();
        assert_eq!(*p1.committed.lock().unwrap(), vec![txn]);
    }

    #[test]
    fn exhausted_retries_abort() {
        let dir = TempDir::new().unwrap();
        let down = Script {
            transport_failures: 10,
            ..Script::default()
        };
        let (c, _p0, _p1) = two_partitions(&dir, Script::default(), down);
        let err = c.execute(spanning_ops()).unwrap_err();
        assert!(matches!(err, PartitionError::Aborted { reason, .. } if reason.contains("unreachable")));
    }

    #[test]
    fn generation_increases_per_open() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("coordinator.redb");
        let open = || {
            let clients: Vec<Arc<dyn PartitionClient>> =
                vec![ScriptedPartition::new(0, Script::default())];
            Coordinator::open(&path, clients, fast_config()).unwrap()
        };
        assert_eq!(open().generation(), Generation(1));
        assert_eq!(open().generation(), Generation(2));
    }

    #[test]
    fn partition_ids_must_match_positions() {
        let dir = TempDir::new().unwrap();
        let clients: Vec<Arc<dyn PartitionClient>> =
            vec![ScriptedPartition::new(1, Script::default())];
        let err = Coordinator::open(&dir.path().join("c.redb"), clients, fast_config()).unwrap_err();
        assert!(matches!(err, PartitionError::UnknownPartition { partition: 1 }));
    }

    #[test]
    fn in_doubt_follows_decision_log() {
        let dir = TempDir::new().unwrap();
        let (c, p0, _p1) = two_partitions(&dir, Script::default(), Script::default());
        let decided = TxnId::new(Generation(0), 1);
        let undecided = TxnId::new(Generation(0), 2);
        p0.prepared.lock().unwrap().extend([decided, undecided]);
        c.record_commit(decided).unwrap();

        let report = c.resolve_in_doubt().unwrap();
        assert_eq!(report.committed, vec![(0, decided)]);
        assert_eq!(report.aborted, vec![(0, undecided)]);
        assert!(p0.prepared.lock().unwrap().is_empty());
        assert!(c.committed_decisions().unwrap().is_empty());
    }

    #[test]
    fn empty_transaction_rejected() {
        let dir = TempDir::new().unwrap();
        let (c, _p0, _p1) = two_partitions(&dir, Script::default(), Script::default());
        assert!(c.execute(Vec::new()).is_err());
        let control = Operation::Commit {
            txn: TxnId::new(Generation(1), 1),
        };
        assert!(c.execute(vec![control]).is_err());
    }
}
