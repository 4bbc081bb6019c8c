//! Hierarchical navigable small-world graph over cosine distance.
//!
//! Slots are assigned in insertion order and never reused until compaction.
//! Removed or replaced entries become tombstones: they stay linked and keep
//! routing searches, but are never returned.

use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap, HashSet};

use anndists::dist::{DistCosine, Distance};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;

use crate::concept::{ConceptId, fnv1a64};

use super::IndexConfig;

/// Highest layer a node may be assigned to.
const MAX_LEVEL: usize = 16;

/// Candidate ordered by distance, ties broken by slot.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Candidate {
    pub(crate) dist: f32,
    pub(crate) slot: u32,
}

impl PartialEq for Candidate {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Candidate {}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> Ordering {
        self.dist
            .total_cmp(&other.dist)
            .then(self.slot.cmp(&other.slot))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Node {
    pub(crate) id: ConceptId,
    pub(crate) level: u8,
    pub(crate) deleted: bool,
    /// Neighbor slots per layer, `0..=level`.
    pub(crate) neighbors: Vec<Vec<u32>>,
}

/// The HNSW graph. Not synchronized; [`super::VectorIndex`] wraps it.
#[derive(Debug, Clone)]
pub(crate) struct Hnsw {
    pub(crate) dimension: usize,
    pub(crate) config: IndexConfig,
    pub(crate) nodes: Vec<Node>,
    /// Row-major vector storage, `dimension` floats per slot.
    pub(crate) vectors: Vec<f32>,
    /// Live id → slot.
    pub(crate) slots: HashMap<ConceptId, u32>,
    pub(crate) entry: Option<u32>,
    pub(crate) max_level: usize,
    pub(crate) tombstones: usize,
}

impl Hnsw {
    pub(crate) fn new(dimension: usize, config: IndexConfig) -> Self {
        Self {
            dimension,
            config,
            nodes: Vec::new(),
            vectors: Vec::new(),
            slots: HashMap::new(),
            entry: None,
            max_level: 0,
            tombstones: 0,
        }
    }

    /// Rebuild derived state after the node table was read from disk.
    pub(crate) fn restore(
        dimension: usize,
        config: IndexConfig,
        nodes: Vec<Node>,
        vectors: Vec<f32>,
        entry: Option<u32>,
        max_level: usize,
    ) -> Self {
        let mut slots = HashMap::new();
        let mut tombstones = 0;
        for (slot, node) in nodes.iter().enumerate() {
            if node.deleted {
                tombstones += 1;
            } else {
                slots.insert(node.id.clone(), slot as u32);
            }
        }
        Self {
            dimension,
            config,
            nodes,
            vectors,
            slots,
            entry,
            max_level,
            tombstones,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }

    pub(crate) fn contains(&self, id: &ConceptId) -> bool {
        self.slots.contains_key(id)
    }

    pub(crate) fn vector(&self, slot: u32) -> &[f32] {
        let start = slot as usize * self.dimension;
        &self.vectors[start..start + self.dimension]
    }

    fn distance(&self, slot: u32, query: &[f32]) -> f32 {
        DistCosine {}.eval(self.vector(slot), query)
    }

    fn max_connections(&self, level: usize) -> usize {
        if level == 0 {
            self.config.m * 2
        } else {
            self.config.m
        }
    }

    /// Layer for `id`, reproducible from the id and the configured seed.
    fn draw_level(&self, id: &ConceptId) -> usize {
        let mut rng = StdRng::seed_from_u64(self.config.seed ^ fnv1a64(id.as_str().as_bytes()));
        let ml = 1.0 / (self.config.m.max(2) as f64).ln();
        let r: f64 = rng.gen_range(f64::EPSILON..1.0);
        ((-r.ln() * ml).floor() as usize).min(MAX_LEVEL)
    }

    /// Insert or replace `id`. The vector must already be validated.
    pub(crate) fn insert(&mut self, id: ConceptId, vector: &[f32]) {
        if let Some(old) = self.slots.remove(&id) {
            self.nodes[old as usize].deleted = true;
            self.tombstones += 1;
        }

        let slot = self.nodes.len() as u32;
        let level = self.draw_level(&id);
        self.vectors.extend_from_slice(vector);
        self.nodes.push(Node {
            id: id.clone(),
            level: level as u8,
            deleted: false,
            neighbors: vec![Vec::new(); level + 1],
        });
        self.slots.insert(id, slot);

        let Some(entry) = self.entry else {
            self.entry = Some(slot);
            self.max_level = level;
            return;
        };

        let mut eps = vec![entry];
        for l in (level + 1..=self.max_level).rev() {
            let nearest = self.search_layer(vector, &eps, 1, l);
            if let Some(best) = nearest.first() {
                eps = vec![best.slot];
            }
        }

        for l in (0..=level.min(self.max_level)).rev() {
            let found = self.search_layer(vector, &eps, self.config.ef_construction, l);
            let chosen: Vec<u32> = found
                .iter()
                .filter(|c| c.slot != slot)
                .take(self.max_connections(l))
                .map(|c| c.slot)
                .collect();

            for &nb in &chosen {
                self.connect(nb, slot, l);
            }
            self.nodes[slot as usize].neighbors[l] = chosen;
            eps = found.iter().map(|c| c.slot).collect();
        }

        if level > self.max_level {
            self.entry = Some(slot);
            self.max_level = level;
        }
    }

    /// Add `slot` to `node`'s layer-`level` neighbors, pruning to the
    /// closest if the list overflows.
    fn connect(&mut self, node: u32, slot: u32, level: usize) {
        let cap = self.max_connections(level);
        let mut list = std::mem::take(&mut self.nodes[node as usize].neighbors[level]);
        if !list.contains(&slot) {
            list.push(slot);
        }
        if list.len() > cap {
            let base = self.vector(node).to_vec();
            let mut scored: Vec<Candidate> = list
                .iter()
                .map(|&s| Candidate {
                    dist: self.distance(s, &base),
                    slot: s,
                })
                .collect();
            scored.sort();
            scored.truncate(cap);
            list = scored.into_iter().map(|c| c.slot).collect();
        }
        self.nodes[node as usize].neighbors[level] = list;
    }

    /// Best-first search of one layer, returning up to `ef` candidates
    /// sorted closest first. Tombstones are included.
    fn search_layer(
        &self,
        query: &[f32],
        entry_points: &[u32],
        ef: usize,
        level: usize,
    ) -> Vec<Candidate> {
        let ef = ef.max(1);
        let mut visited: HashSet<u32> = HashSet::new();
        let mut frontier: BinaryHeap<Reverse<Candidate>> = BinaryHeap::new();
        let mut best: BinaryHeap<Candidate> = BinaryHeap::new();

        for &ep in entry_points {
            if visited.insert(ep) {
                let c = Candidate {
                    dist: self.distance(ep, query),
                    slot: ep,
                };
                frontier.push(Reverse(c));
                best.push(c);
                if best.len() > ef {
                    best.pop();
                }
            }
        }

        while let Some(Reverse(current)) = frontier.pop() {
            if let Some(worst) = best.peek() {
                if best.len() >= ef && current > *worst {
                    break;
                }
            }
            let node = &self.nodes[current.slot as usize];
            let Some(neighbors) = node.neighbors.get(level) else {
                continue;
            };
            for &nb in neighbors {
                if !visited.insert(nb) {
                    continue;
                }
                let c = Candidate {
                    dist: self.distance(nb, query),
                    slot: nb,
                };
                let admit = best.len() < ef || best.peek().is_some_and(|w| c < *w);
                if admit {
                    frontier.push(Reverse(c));
                    best.push(c);
                    if best.len() > ef {
                        best.pop();
                    }
                }
            }
        }

        best.into_sorted_vec()
    }

    /// Approximate k nearest live entries.
    pub(crate) fn search(&self, query: &[f32], k: usize, ef_search: usize) -> Vec<Candidate> {
        let Some(entry) = self.entry else {
            return Vec::new();
        };
        if k == 0 {
            return Vec::new();
        }
        let mut eps = vec![entry];
        for l in (1..=self.max_level).rev() {
            let nearest = self.search_layer(query, &eps, 1, l);
            if let Some(best) = nearest.first() {
                eps = vec![best.slot];
            }
        }
        // No search can return more than every slot.
        let k = k.min(self.nodes.len());
        // Widen the beam by the tombstone count so removed slots don't
        // crowd out live results.
        let base = ef_search.max(k);
        let ef = base
            .saturating_add(self.tombstones.min(base))
            .min(self.nodes.len());
        self.search_layer(query, &eps, ef, 0)
            .into_iter()
            .filter(|c| !self.nodes[c.slot as usize].deleted)
            .take(k)
            .collect()
    }

    /// Exact k nearest live entries by brute force.
    pub(crate) fn search_exact(&self, query: &[f32], k: usize) -> Vec<Candidate> {
        let mut all: Vec<Candidate> = (0..self.nodes.len() as u32)
            .into_par_iter()
            .filter(|&s| !self.nodes[s as usize].deleted)
            .map(|s| Candidate {
                dist: self.distance(s, query),
                slot: s,
            })
            .collect();
        all.par_sort();
        all.truncate(k);
        all
    }

    /// Tombstone `id`. Returns whether it was live.
    pub(crate) fn remove(&mut self, id: &ConceptId) -> bool {
        match self.slots.remove(id) {
            Some(slot) => {
                self.nodes[slot as usize].deleted = true;
                self.tombstones += 1;
                true
            }
            None => false,
        }
    }

    /// Whether tombstones exceed 20% of all slots.
    pub(crate) fn needs_compaction(&self) -> bool {
        self.tombstones * 5 > self.nodes.len()
    }

    /// Rebuild from live entries in slot order, dropping tombstones.
    pub(crate) fn compacted(&self) -> Hnsw {
        let mut fresh = Hnsw::new(self.dimension, self.config.clone());
        for (slot, node) in self.nodes.iter().enumerate() {
            if !node.deleted {
                fresh.insert(node.id.clone(), self.vector(slot as u32));
            }
        }
        fresh
    }
}
