//! Core data model: concepts, associations, and their identifiers.
//!
//! A [`Concept`] is a unit of knowledge identified by a [`ConceptId`]; an
//! [`Association`] is a typed, directed edge between two concepts keyed by
//! [`AssociationKey`]. The `New*` records are the write-side inputs carried
//! inside WAL entries; the full records are materialized by the graph store
//! using the entry's timestamp, so replay is deterministic.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::GraphError;

/// Upper bound for concept and association strength.
pub const STRENGTH_MAX: f32 = 10.0;

/// Strength assigned to freshly learned concepts and associations.
pub const STRENGTH_DEFAULT: f32 = 1.0;

/// Free-form concept metadata.
pub type Metadata = BTreeMap<String, String>;

/// Unique identifier for a concept.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConceptId(String);

impl ConceptId {
    /// Wrap an explicit identifier. Empty identifiers are rejected.
    pub fn new(raw: impl Into<String>) -> Result<Self, GraphError> {
        let raw = raw.into();
        if raw.trim().is_empty() {
            return Err(GraphError::InvalidConcept {
                message: "concept id must not be empty".into(),
            });
        }
        Ok(Self(raw))
    }

    /// Derive the identifier for a piece of content.
    ///
    /// Stable across processes and versions: 16 hex digits of FNV-1a-64.
    pub fn for_content(content: &str) -> Self {
        Self(format!("{:016x}", fnv1a64(content.as_bytes())))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConceptId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ConceptId {
    type Err = GraphError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

/// Typed relation carried by an association.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationType {
    Semantic,
    Causal,
    Temporal,
    Hierarchical,
    Compositional,
}

impl RelationType {
    /// Wire code of the relation.
    pub fn code(self) -> u8 {
        match self {
            RelationType::Semantic => 0,
            RelationType::Causal => 1,
            RelationType::Temporal => 2,
            RelationType::Hierarchical => 3,
            RelationType::Compositional => 4,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(RelationType::Semantic),
            1 => Some(RelationType::Causal),
            2 => Some(RelationType::Temporal),
            3 => Some(RelationType::Hierarchical),
            4 => Some(RelationType::Compositional),
            _ => None,
        }
    }
}

impl fmt::Display for RelationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RelationType::Semantic => "semantic",
            RelationType::Causal => "causal",
            RelationType::Temporal => "temporal",
            RelationType::Hierarchical => "hierarchical",
            RelationType::Compositional => "compositional",
        };
        f.write_str(name)
    }
}

impl FromStr for RelationType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Ok(code) = s.parse::<u8>() {
            return Self::from_code(code).ok_or_else(|| format!("unknown relation code {code}"));
        }
        match s.to_ascii_lowercase().as_str() {
            "semantic" => Ok(RelationType::Semantic),
            "causal" => Ok(RelationType::Causal),
            "temporal" => Ok(RelationType::Temporal),
            "hierarchical" => Ok(RelationType::Hierarchical),
            "compositional" => Ok(RelationType::Compositional),
            other => Err(format!("unknown relation type \"{other}\"")),
        }
    }
}

/// A concept as held by the graph store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Concept {
    pub id: ConceptId,
    pub content: String,
    /// Empty when the concept was learned without an embedding.
    pub embedding: Vec<f32>,
    /// Usage-reinforced, in `[0, STRENGTH_MAX]`.
    pub strength: f32,
    /// In `[0, 1]`.
    pub confidence: f32,
    pub metadata: Metadata,
    /// Microseconds since the UNIX epoch.
    pub created_at: u64,
    pub last_accessed: u64,
    pub access_count: u64,
}

/// Write-side description of a concept, as logged in the WAL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewConcept {
    pub id: ConceptId,
    pub content: String,
    pub embedding: Vec<f32>,
    pub metadata: Metadata,
    pub confidence: f32,
}

impl NewConcept {
    /// Build a record whose id is derived from the content.
    pub fn from_content(content: impl Into<String>, embedding: Vec<f32>) -> Self {
        let content = content.into();
        Self {
            id: ConceptId::for_content(&content),
            content,
            embedding,
            metadata: Metadata::new(),
            confidence: 1.0,
        }
    }

    pub fn with_id(mut self, id: ConceptId) -> Self {
        self.id = id;
        self
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// Set the confidence, clamped into `[0, 1]`.
    pub fn with_confidence(mut self, confidence: f32) -> Self {
        self.confidence = clamp_unit(confidence);
        self
    }
}

/// Key of an association: two directions between a pair are distinct keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AssociationKey {
    pub source: ConceptId,
    pub target: ConceptId,
    pub relation: RelationType,
}

/// A directed, typed edge between two concepts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Association {
    pub source: ConceptId,
    pub target: ConceptId,
    pub relation: RelationType,
    pub confidence: f32,
    pub strength: f32,
    pub created_at: u64,
}

impl Association {
    pub fn key(&self) -> AssociationKey {
        AssociationKey {
            source: self.source.clone(),
            target: self.target.clone(),
            relation: self.relation,
        }
    }
}

/// Write-side description of an association, as logged in the WAL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewAssociation {
    pub source: ConceptId,
    pub target: ConceptId,
    pub relation: RelationType,
    pub confidence: f32,
}

impl NewAssociation {
    pub fn new(source: ConceptId, target: ConceptId, relation: RelationType) -> Self {
        Self {
            source,
            target,
            relation,
            confidence: 1.0,
        }
    }

    /// Set the confidence, clamped into `[0, 1]`.
    pub fn with_confidence(mut self, confidence: f32) -> Self {
        self.confidence = clamp_unit(confidence);
        self
    }

    pub fn key(&self) -> AssociationKey {
        AssociationKey {
            source: self.source.clone(),
            target: self.target.clone(),
            relation: self.relation,
        }
    }
}

fn clamp_unit(v: f32) -> f32 {
    if v.is_nan() { 0.0 } else { v.clamp(0.0, 1.0) }
}

/// FNV-1a 64-bit hash. Used wherever a hash must be stable on disk.
pub fn fnv1a64(bytes: &[u8]) -> u64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;
    bytes.iter().fold(OFFSET, |hash, &b| {
        (hash ^ u64::from(b)).wrapping_mul(PRIME)
    })
}

/// Current time in microseconds since the UNIX epoch.
pub fn now_micros() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros() as u64
}
