//! Learning pipeline: the write operations of an [`Engine`].
//!
//! Each call validates its input against the current graph, appends one WAL
//! entry (the durability point), then applies it to the graph store and the
//! vector index. Validation and append happen under the writer lock, so a
//! check cannot be invalidated by a concurrent writer.

use crate::concept::{ConceptId, NewAssociation, NewConcept};
use crate::embed::{EmbeddingProvider, check_dimension};
use crate::engine::Engine;
use crate::error::{GraphError, MnemosResult};
use crate::graph::GraphStore;
use crate::vector::validate_vector;
use crate::wal::{Operation, SequenceNumber};

impl Engine {
    /// Learn a concept and the associations that come with it.
    ///
    /// Associations must start or end at the new concept or at a concept
    /// that already exists. Returns the concept's id once it is durable.
    pub fn learn(
        &self,
        concept: NewConcept,
        associations: Vec<NewAssociation>,
    ) -> MnemosResult<ConceptId> {
        let id = concept.id.clone();
        let entry = self.write(|graph| {
            let op = Operation::LearnConcept {
                concept,
                associations,
            };
            validate_shape(&op, self.config().vector_dimension)?;
            check_endpoints(graph, &op)?;
            Ok(op)
        })?;
        tracing::debug!(%id, seq = entry.seq, "concept learned");
        Ok(id)
    }

    /// Embed `content` with `provider`, then learn it.
    ///
    /// The provider is asked once. A failure or a result of the wrong
    /// dimension writes nothing.
    pub fn learn_text(
        &self,
        provider: &dyn EmbeddingProvider,
        content: &str,
        associations: Vec<NewAssociation>,
    ) -> MnemosResult<ConceptId> {
        let embedding = provider.embed(content)?;
        check_dimension(self.config().vector_dimension, &embedding)?;
        self.learn(NewConcept::from_content(content, embedding), associations)
    }

    /// Learn an association between two existing concepts.
    pub fn learn_association(&self, association: NewAssociation) -> MnemosResult<SequenceNumber> {
        let entry = self.write(|graph| {
            let op = Operation::LearnAssociation(association);
            validate_shape(&op, self.config().vector_dimension)?;
            check_endpoints(graph, &op)?;
            Ok(op)
        })?;
        Ok(entry.seq)
    }

    /// Add `delta` to a concept's strength. The result is clamped to
    /// `[0, STRENGTH_MAX]`.
    pub fn update_strength(&self, concept_id: &ConceptId, delta: f32) -> MnemosResult<SequenceNumber> {
        let entry = self.write(|graph| {
            require(graph, concept_id)?;
            let op = Operation::UpdateStrength {
                concept_id: concept_id.clone(),
                delta,
            };
            validate_shape(&op, self.config().vector_dimension)?;
            Ok(op)
        })?;
        Ok(entry.seq)
    }

    /// Delete a concept, its associations and its index entry.
    pub fn delete_concept(&self, concept_id: &ConceptId) -> MnemosResult<SequenceNumber> {
        let entry = self.write(|graph| {
            require(graph, concept_id)?;
            Ok(Operation::DeleteConcept {
                concept_id: concept_id.clone(),
            })
        })?;
        tracing::debug!(%concept_id, seq = entry.seq, "concept deleted");
        Ok(entry.seq)
    }
}

/// Checks that need no graph state: content, vectors, deltas, and that the
/// operation is a plain data write.
pub(crate) fn validate_shape(op: &Operation, dimension: usize) -> MnemosResult<()> {
    match op {
        Operation::LearnConcept {
            concept,
            associations,
        } => {
            if concept.content.trim().is_empty() {
                return Err(invalid("concept content must not be empty"));
            }
            if !concept.embedding.is_empty() {
                validate_vector(dimension, &concept.embedding)?;
            }
            for a in associations {
                if a.source != concept.id && a.target != concept.id {
                    return Err(invalid(format!(
                        "association {} -> {} does not involve concept {}",
                        a.source, a.target, concept.id
                    )));
                }
            }
            Ok(())
        }
        Operation::LearnAssociation(_) | Operation::DeleteConcept { .. } => Ok(()),
        Operation::UpdateStrength { delta, .. } => {
            if delta.is_finite() {
                Ok(())
            } else {
                Err(invalid(format!("strength delta {delta} is not finite")))
            }
        }
        Operation::Checkpoint { .. }
        | Operation::Prepare { .. }
        | Operation::Commit { .. }
        | Operation::Abort { .. } => Err(invalid(format!(
            "{} is not a data operation",
            op.tag()
        ))),
    }
}

fn check_endpoints(graph: &GraphStore, op: &Operation) -> MnemosResult<()> {
    match op {
        Operation::LearnConcept {
            concept,
            associations,
        } => {
            for a in associations {
                for end in [&a.source, &a.target] {
                    if *end != concept.id {
                        require(graph, end)?;
                    }
                }
            }
            Ok(())
        }
        Operation::LearnAssociation(a) => {
            require(graph, &a.source)?;
            require(graph, &a.target)
        }
        _ => Ok(()),
    }
}

fn require(graph: &GraphStore, id: &ConceptId) -> MnemosResult<()> {
    if graph.contains(id) {
        Ok(())
    } else {
        Err(GraphError::ConceptNotFound { id: id.to_string() }.into())
    }
}

fn invalid(message: impl Into<String>) -> crate::error::MnemosError {
    GraphError::InvalidConcept {
        message: message.into(),
    }
    .into()
}
