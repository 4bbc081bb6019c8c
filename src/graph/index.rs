//! In-memory concept graph with token and adjacency indexes.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::RwLock;

use crate::concept::{
    Association, AssociationKey, Concept, ConceptId, NewAssociation, NewConcept, STRENGTH_DEFAULT,
    STRENGTH_MAX,
};
use crate::partition::TxnId;
use crate::wal::{Operation, SequenceNumber, WalEntry};

use super::{PendingTxn, VectorEffect, tokenize};

#[derive(Debug, Default)]
pub(crate) struct GraphState {
    pub(crate) concepts: HashMap<ConceptId, Concept>,
    pub(crate) associations: BTreeMap<AssociationKey, Association>,
    /// Token → concepts whose content contains it.
    tokens: HashMap<String, BTreeSet<ConceptId>>,
    outgoing: HashMap<ConceptId, BTreeSet<AssociationKey>>,
    incoming: HashMap<ConceptId, BTreeSet<AssociationKey>>,
    pub(crate) pending: BTreeMap<TxnId, PendingTxn>,
    pub(crate) last_applied: SequenceNumber,
}

impl GraphState {
    /// Build a state from persisted maps, rebuilding every index.
    pub(crate) fn from_parts(
        concepts: Vec<Concept>,
        associations: Vec<Association>,
        pending: Vec<PendingTxn>,
        last_applied: SequenceNumber,
    ) -> Self {
        let mut state = GraphState {
            last_applied,
            ..Default::default()
        };
        for concept in concepts {
            state.index_tokens(&concept.id, &concept.content);
            state.concepts.insert(concept.id.clone(), concept);
        }
        for assoc in associations {
            state.link(assoc);
        }
        for p in pending {
            state.pending.insert(p.txn, p);
        }
        state
    }

    fn apply_op(
        &mut self,
        op: &Operation,
        seq: SequenceNumber,
        ts: u64,
        effects: &mut Vec<VectorEffect>,
    ) {
        match op {
            Operation::LearnConcept {
                concept,
                associations,
            } => {
                self.upsert_concept(concept, ts, effects);
                for a in associations {
                    self.upsert_association(a, ts);
                }
            }
            Operation::LearnAssociation(a) => self.upsert_association(a, ts),
            Operation::UpdateStrength { concept_id, delta } => {
                match self.concepts.get_mut(concept_id) {
                    Some(c) => {
                        c.strength = (c.strength + delta).clamp(0.0, STRENGTH_MAX);
                        c.access_count += 1;
                        c.last_accessed = ts;
                    }
                    None => tracing::debug!(id = %concept_id, seq, "strength update for absent concept"),
                }
            }
            Operation::DeleteConcept { concept_id } => self.delete_concept(concept_id, effects),
            Operation::Checkpoint { .. } => {}
            Operation::Prepare {
                txn,
                generation,
                ops,
            } => {
                self.pending.insert(
                    *txn,
                    PendingTxn {
                        txn: *txn,
                        generation: *generation,
                        ops: ops.clone(),
                        prepared_seq: seq,
                        prepared_at: ts,
                    },
                );
            }
            Operation::Commit { txn } => match self.pending.remove(txn) {
                Some(p) => {
                    for staged in &p.ops {
                        self.apply_op(staged, seq, ts, effects);
                    }
                }
                None => tracing::debug!(%txn, seq, "commit for unknown transaction ignored"),
            },
            Operation::Abort { txn } => {
                self.pending.remove(txn);
            }
        }
    }

    fn upsert_concept(&mut self, new: &NewConcept, ts: u64, effects: &mut Vec<VectorEffect>) {
        let previous = self.concepts.remove(&new.id);
        if let Some(old) = &previous {
            self.unindex_tokens(&old.id, &old.content);
        }

        let had_vector = previous.as_ref().is_some_and(|c| !c.embedding.is_empty());
        let concept = match previous {
            Some(old) => Concept {
                content: new.content.clone(),
                embedding: new.embedding.clone(),
                metadata: new.metadata.clone(),
                confidence: new.confidence,
                ..old
            },
            None => Concept {
                id: new.id.clone(),
                content: new.content.clone(),
                embedding: new.embedding.clone(),
                strength: STRENGTH_DEFAULT,
                confidence: new.confidence,
                metadata: new.metadata.clone(),
                created_at: ts,
                last_accessed: ts,
                access_count: 0,
            },
        };

        if !concept.embedding.is_empty() {
            effects.push(VectorEffect::Upsert {
                id: concept.id.clone(),
                vector: concept.embedding.clone(),
            });
        } else if had_vector {
            effects.push(VectorEffect::Remove {
                id: concept.id.clone(),
            });
        }

        self.index_tokens(&concept.id, &concept.content);
        self.concepts.insert(concept.id.clone(), concept);
    }

    fn upsert_association(&mut self, new: &NewAssociation, ts: u64) {
        let key = new.key();
        if let Some(existing) = self.associations.get_mut(&key) {
            existing.confidence = new.confidence;
            return;
        }
        self.link(Association {
            source: new.source.clone(),
            target: new.target.clone(),
            relation: new.relation,
            confidence: new.confidence,
            strength: STRENGTH_DEFAULT,
            created_at: ts,
        });
    }

    fn link(&mut self, assoc: Association) {
        let key = assoc.key();
        self.outgoing
            .entry(assoc.source.clone())
            .or_default()
            .insert(key.clone());
        self.incoming
            .entry(assoc.target.clone())
            .or_default()
            .insert(key.clone());
        self.associations.insert(key, assoc);
    }

    fn unlink(&mut self, key: &AssociationKey) {
        self.associations.remove(key);
        remove_from(&mut self.outgoing, &key.source, key);
        remove_from(&mut self.incoming, &key.target, key);
    }

    fn delete_concept(&mut self, id: &ConceptId, effects: &mut Vec<VectorEffect>) {
        let Some(concept) = self.concepts.remove(id) else {
            tracing::debug!(%id, "delete of absent concept ignored");
            return;
        };
        self.unindex_tokens(id, &concept.content);

        let mut keys: Vec<AssociationKey> = Vec::new();
        if let Some(out) = self.outgoing.get(id) {
            keys.extend(out.iter().cloned());
        }
        if let Some(inc) = self.incoming.get(id) {
            keys.extend(inc.iter().cloned());
        }
        for key in &keys {
            self.unlink(key);
        }

        if !concept.embedding.is_empty() {
            effects.push(VectorEffect::Remove { id: id.clone() });
        }
    }

    fn index_tokens(&mut self, id: &ConceptId, content: &str) {
        for token in tokenize(content) {
            self.tokens.entry(token).or_default().insert(id.clone());
        }
    }

    fn unindex_tokens(&mut self, id: &ConceptId, content: &str) {
        for token in tokenize(content) {
            if let Some(set) = self.tokens.get_mut(&token) {
                set.remove(id);
                if set.is_empty() {
                    self.tokens.remove(&token);
                }
            }
        }
    }
}

fn remove_from(
    map: &mut HashMap<ConceptId, BTreeSet<AssociationKey>>,
    id: &ConceptId,
    key: &AssociationKey,
) {
    if let Some(set) = map.get_mut(id) {
        set.remove(key);
        if set.is_empty() {
            map.remove(id);
        }
    }
}

/// The in-memory knowledge graph of one engine.
///
/// All mutation goes through [`GraphStore::apply`] with an entry that is
/// already durable in the WAL. Readers take the read lock per call.
pub struct GraphStore {
    state: RwLock<GraphState>,
}

impl GraphStore {
    /// Create an empty graph.
    pub fn new() -> Self {
        Self {
            state: RwLock::new(GraphState::default()),
        }
    }

    pub(crate) fn from_state(state: GraphState) -> Self {
        Self {
            state: RwLock::new(state),
        }
    }

    /// Apply a logged entry and return the vector changes it implies.
    ///
    /// Entries at or below the last applied sequence are skipped, so
    /// replaying overlapping log ranges is harmless.
    pub fn apply(&self, entry: &WalEntry) -> Vec<VectorEffect> {
        let mut state = self.state.write().expect("graph lock poisoned");
        if entry.seq <= state.last_applied {
            return Vec::new();
        }
        let mut effects = Vec::new();
        state.apply_op(&entry.op, entry.seq, entry.timestamp, &mut effects);
        state.last_applied = entry.seq;
        effects
    }

    /// Encode the current state as snapshot bytes, stamped with the
    /// embedding dimension it was written under.
    pub fn snapshot(&self, dimension: usize) -> crate::store::StoreResult<Vec<u8>> {
        let dimension = u32::try_from(dimension).map_err(|_| crate::error::StoreError::Serialization {
            message: format!("vector dimension {dimension} does not fit the snapshot header"),
        })?;
        let state = self.state.read().expect("graph lock poisoned");
        super::snapshot::encode(&state, dimension)
    }

    /// Sequence of the last applied entry (0 for an empty graph).
    pub fn last_applied(&self) -> SequenceNumber {
        self.state.read().expect("graph lock poisoned").last_applied
    }

    /// Look up a concept by id.
    pub fn concept(&self, id: &ConceptId) -> Option<Concept> {
        let state = self.state.read().expect("graph lock poisoned");
        state.concepts.get(id).cloned()
    }

    pub fn contains(&self, id: &ConceptId) -> bool {
        let state = self.state.read().expect("graph lock poisoned");
        state.concepts.contains_key(id)
    }

    /// Concepts whose content contains `token` (normalized like content).
    pub fn concepts_with_token(&self, token: &str) -> Vec<ConceptId> {
        let state = self.state.read().expect("graph lock poisoned");
        let mut out = BTreeSet::new();
        for t in tokenize(token) {
            if let Some(set) = state.tokens.get(&t) {
                out.extend(set.iter().cloned());
            }
        }
        out.into_iter().collect()
    }

    /// Concepts whose content contains every token of `query`.
    pub fn search_text(&self, query: &str) -> Vec<ConceptId> {
        let tokens = tokenize(query);
        if tokens.is_empty() {
            return Vec::new();
        }
        let state = self.state.read().expect("graph lock poisoned");
        let mut sets = Vec::with_capacity(tokens.len());
        for t in &tokens {
            match state.tokens.get(t) {
                Some(set) => sets.push(set),
                None => return Vec::new(),
            }
        }
        sets.sort_by_key(|s| s.len());
        let Some((first, rest)) = sets.split_first() else {
            return Vec::new();
        };
        first
            .iter()
            .filter(|id| rest.iter().all(|s| s.contains(*id)))
            .cloned()
            .collect()
    }

    /// Associations leaving `id`, in key order.
    pub fn outgoing(&self, id: &ConceptId) -> Vec<Association> {
        let state = self.state.read().expect("graph lock poisoned");
        state
            .outgoing
            .get(id)
            .map(|keys| {
                keys.iter()
                    .filter_map(|k| state.associations.get(k).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Associations arriving at `id`, in key order.
    pub fn incoming(&self, id: &ConceptId) -> Vec<Association> {
        let state = self.state.read().expect("graph lock poisoned");
        state
            .incoming
            .get(id)
            .map(|keys| {
                keys.iter()
                    .filter_map(|k| state.associations.get(k).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn association(&self, key: &AssociationKey) -> Option<Association> {
        let state = self.state.read().expect("graph lock poisoned");
        state.associations.get(key).cloned()
    }

    pub fn concept_count(&self) -> usize {
        self.state.read().expect("graph lock poisoned").concepts.len()
    }

    pub fn association_count(&self) -> usize {
        self.state
            .read()
            .expect("graph lock poisoned")
            .associations
            .len()
    }

    /// Prepared transactions awaiting a decision, in id order.
    pub fn pending_transactions(&self) -> Vec<PendingTxn> {
        let state = self.state.read().expect("graph lock poisoned");
        state.pending.values().cloned().collect()
    }

    pub fn is_pending(&self, txn: TxnId) -> bool {
        let state = self.state.read().expect("graph lock poisoned");
        state.pending.contains_key(&txn)
    }

    /// The pending transaction (other than `except`) that stages a write to
    /// any of `ids`, if one exists.
    pub fn conflicting_transaction(&self, ids: &[&ConceptId], except: TxnId) -> Option<TxnId> {
        let state = self.state.read().expect("graph lock poisoned");
        state
            .pending
            .values()
            .find(|p| p.txn != except && p.touches_any(ids))
            .map(|p| p.txn)
    }

    /// First concept whose embedding length differs from `dimension`.
    pub fn embedding_dimension_mismatch(&self, dimension: usize) -> Option<(ConceptId, usize)> {
        let state = self.state.read().expect("graph lock poisoned");
        state
            .concepts
            .values()
            .find(|c| !c.embedding.is_empty() && c.embedding.len() != dimension)
            .map(|c| (c.id.clone(), c.embedding.len()))
    }

    /// Every concept that carries an embedding, sorted by id.
    pub fn embeddings(&self) -> Vec<(ConceptId, Vec<f32>)> {
        let state = self.state.read().expect("graph lock poisoned");
        let mut out: Vec<(ConceptId, Vec<f32>)> = state
            .concepts
            .values()
            .filter(|c| !c.embedding.is_empty())
            .map(|c| (c.id.clone(), c.embedding.clone()))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }
}

impl Default for GraphStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for GraphStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphStore")
            .field("concepts", &self.concept_count())
            .field("associations", &self.association_count())
            .field("last_applied", &self.last_applied())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::concept::RelationType;
    use crate::partition::Generation;

    fn id(s: &str) -> ConceptId {
        ConceptId::new(s).unwrap()
    }

    fn entry(seq: u64, op: Operation) -> WalEntry {
        WalEntry {
            seq,
            timestamp: 1_000 + seq,
            op,
        }
    }

    fn learn(seq: u64, name: &str, content: &str, embedding: Vec<f32>) -> WalEntry {
        entry(
            seq,
            Operation::LearnConcept {
                concept: NewConcept::from_content(content, embedding).with_id(id(name)),
                associations: vec![],
            },
        )
    }

    #[test]
    fn learn_concept_indexes_tokens() {
        let g = GraphStore::new();
        let effects = g.apply(&learn(1, "a", "Water boils", vec![1.0, 0.0]));
        assert_eq!(
            effects,
            vec![VectorEffect::Upsert {
                id: id("a"),
                vector: vec![1.0, 0.0]
            }]
        );
        assert_eq!(g.concepts_with_token("WATER"), vec![id("a")]);
        assert_eq!(g.concept(&id("a")).unwrap().created_at, 1_001);
        assert_eq!(g.last_applied(), 1);
    }

    #[test]
    fn replayed_entries_are_skipped() {
        let g = GraphStore::new();
        g.apply(&learn(1, "a", "x", vec![]));
        g.apply(&entry(
            2,
            Operation::UpdateStrength {
                concept_id: id("a"),
                delta: 1.0,
            },
        ));
        // Same entries again: no double application.
        g.apply(&learn(1, "a", "x", vec![]));
        g.apply(&entry(
            2,
            Operation::UpdateStrength {
                concept_id: id("a"),
                delta: 1.0,
            },
        ));
        let c = g.concept(&id("a")).unwrap();
        assert_eq!(c.strength, 2.0);
        assert_eq!(c.access_count, 1);
    }

    #[test]
    fn strength_is_clamped() {
        let g = GraphStore::new();
        g.apply(&learn(1, "a", "x", vec![]));
        g.apply(&entry(
            2,
            Operation::UpdateStrength {
                concept_id: id("a"),
                delta: 50.0,
            },
        ));
        assert_eq!(g.concept(&id("a")).unwrap().strength, STRENGTH_MAX);
        g.apply(&entry(
            3,
            Operation::UpdateStrength {
                concept_id: id("a"),
                delta: -100.0,
            },
        ));
        let c = g.concept(&id("a")).unwrap();
        assert_eq!(c.strength, 0.0);
        assert_eq!(c.last_accessed, 1_003);
    }

    #[test]
    fn relearn_replaces_content_and_reindexes() {
        let g = GraphStore::new();
        g.apply(&learn(1, "a", "old words", vec![1.0]));
        let effects = g.apply(&learn(2, "a", "new words", vec![]));
        assert_eq!(effects, vec![VectorEffect::Remove { id: id("a") }]);
        assert!(g.concepts_with_token("old").is_empty());
        assert_eq!(g.search_text("new words"), vec![id("a")]);
        assert_eq!(g.concept(&id("a")).unwrap().created_at, 1_001);
        assert_eq!(g.concept_count(), 1);
    }

    #[test]
    fn associations_maintain_adjacency() {
        let g = GraphStore::new();
        g.apply(&learn(1, "a", "alpha", vec![]));
        g.apply(&learn(2, "b", "beta", vec![]));
        g.apply(&entry(
            3,
            Operation::LearnAssociation(NewAssociation::new(id("a"), id("b"), RelationType::Causal)),
        ));
        g.apply(&entry(
            4,
            Operation::LearnAssociation(NewAssociation::new(id("b"), id("a"), RelationType::Causal)),
        ));
        assert_eq!(g.association_count(), 2);
        assert_eq!(g.outgoing(&id("a")).len(), 1);
        assert_eq!(g.incoming(&id("a")).len(), 1);
        assert_eq!(g.outgoing(&id("a"))[0].target, id("b"));

        // Re-learning the same key replaces its confidence only.
        g.apply(&entry(
            5,
            Operation::LearnAssociation(
                NewAssociation::new(id("a"), id("b"), RelationType::Causal).with_confidence(0.3),
            ),
        ));
        assert_eq!(g.association_count(), 2);
        let key = AssociationKey {
            source: id("a"),
            target: id("b"),
            relation: RelationType::Causal,
        };
        assert_eq!(g.association(&key).unwrap().confidence, 0.3);
    }

    #[test]
    fn delete_removes_edges_and_vector() {
        let g = GraphStore::new();
        g.apply(&learn(1, "a", "alpha", vec![1.0]));
        g.apply(&learn(2, "b", "beta", vec![]));
        g.apply(&entry(
            3,
            Operation::LearnAssociation(NewAssociation::new(id("a"), id("b"), RelationType::Semantic)),
        ));
        let effects = g.apply(&entry(4, Operation::DeleteConcept { concept_id: id("a") }));
        assert_eq!(effects, vec![VectorEffect::Remove { id: id("a") }]);
        assert!(!g.contains(&id("a")));
        assert_eq!(g.association_count(), 0);
        assert!(g.incoming(&id("b")).is_empty());
        assert!(g.concepts_with_token("alpha").is_empty());
    }

    #[test]
    fn prepared_ops_stay_invisible_until_commit() {
        let g = GraphStore::new();
        let txn = TxnId::new(Generation(1), 1);
        let staged = Operation::LearnConcept {
            concept: NewConcept::from_content("staged", vec![0.5]).with_id(id("s")),
            associations: vec![],
        };
        let effects = g.apply(&entry(
            1,
            Operation::Prepare {
                txn,
                generation: Generation(1),
                ops: vec![staged],
            },
        ));
        assert!(effects.is_empty());
        assert!(!g.contains(&id("s")));
        assert_eq!(g.pending_transactions().len(), 1);
        assert_eq!(
            g.conflicting_transaction(&[&id("s")], TxnId::new(Generation(1), 2)),
            Some(txn)
        );

        let effects = g.apply(&entry(2, Operation::Commit { txn }));
        assert_eq!(effects.len(), 1);
        assert!(g.contains(&id("s")));
        assert!(g.pending_transactions().is_empty());
    }

    #[test]
    fn abort_drops_stash() {
        let g = GraphStore::new();
        let txn = TxnId::new(Generation(1), 1);
        g.apply(&entry(
            1,
            Operation::Prepare {
                txn,
                generation: Generation(1),
                ops: vec![Operation::DeleteConcept { concept_id: id("x") }],
            },
        ));
        g.apply(&entry(2, Operation::Abort { txn }));
        assert!(g.pending_transactions().is_empty());
        // A late commit for the aborted transaction is a no-op.
        assert!(g.apply(&entry(3, Operation::Commit { txn })).is_empty());
    }

    #[test]
    fn search_text_intersects_tokens() {
        let g = GraphStore::new();
        g.apply(&learn(1, "a", "red apple", vec![]));
        g.apply(&learn(2, "b", "green apple", vec![]));
        assert_eq!(g.search_text("apple").len(), 2);
        assert_eq!(g.search_text("Apple RED"), vec![id("a")]);
        assert!(g.search_text("blue apple").is_empty());
        assert!(g.search_text("").is_empty());
    }
}
