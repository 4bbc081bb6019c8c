//! Request/response surface of an engine.
//!
//! A wrapping server decodes [`Request`]s (JSON, internally tagged by
//! `type`), hands them to [`Api::handle`] together with the caller's
//! [`Credentials`], and encodes the [`Response`]. Errors never escape as
//! Rust errors here: they become [`Response::Error`] carrying the
//! diagnostic code, e.g. `mnemos::vector::dim_mismatch`.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::concept::{Concept, ConceptId, Metadata, NewAssociation, NewConcept, RelationType};
use crate::engine::{Engine, EngineStats, Health};
use crate::error::{EngineError, MnemosError, MnemosResult};
use crate::vector::SearchHit;

/// An association learned together with a concept. A missing end refers to
/// the concept being learned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssociationSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    pub relation: RelationType,
    #[serde(default = "default_confidence")]
    pub confidence: f32,
}

fn default_confidence() -> f32 {
    1.0
}

fn default_k() -> usize {
    10
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Request {
    LearnConcept {
        content: String,
        #[serde(default)]
        embedding: Vec<f32>,
        #[serde(default)]
        metadata: Metadata,
        /// Derived from the content when absent.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        confidence: Option<f32>,
        #[serde(default)]
        associations: Vec<AssociationSpec>,
    },
    LearnAssociation {
        source: String,
        target: String,
        relation: RelationType,
        #[serde(default = "default_confidence")]
        confidence: f32,
    },
    UpdateStrength {
        concept_id: String,
        delta: f32,
    },
    DeleteConcept {
        concept_id: String,
    },
    Search {
        embedding: Vec<f32>,
        #[serde(default = "default_k")]
        k: usize,
    },
    GetConcept {
        concept_id: String,
    },
    Flush,
    GetStats,
    HealthCheck,
}

impl Request {
    /// Whether the request mutates state.
    pub fn is_write(&self) -> bool {
        matches!(
            self,
            Request::LearnConcept { .. }
                | Request::LearnAssociation { .. }
                | Request::UpdateStrength { .. }
                | Request::DeleteConcept { .. }
                | Request::Flush
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Response {
    Learned {
        concept_id: ConceptId,
    },
    /// A write other than a concept learn was logged at `seq`.
    Ack {
        seq: u64,
    },
    SearchResults {
        hits: Vec<SearchHit>,
    },
    Concept {
        concept: Option<Concept>,
    },
    Flushed {
        seq: u64,
        graph_bytes: usize,
        index_bytes: usize,
        wal_bytes: u64,
    },
    Stats(EngineStats),
    Health(Health),
    Error {
        code: String,
        message: String,
    },
}

impl Response {
    pub fn from_error(err: &MnemosError) -> Self {
        Response::Error {
            code: err.code_str(),
            message: err.to_string(),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Response::Error { .. })
    }
}

/// What the caller presented. Interpreted only by an [`Authorizer`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub principal: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

impl Credentials {
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn token(token: impl Into<String>) -> Self {
        Self {
            principal: None,
            token: Some(token.into()),
        }
    }
}

/// Hook for the embedding layer's access control.
pub trait Authorizer: Send + Sync {
    /// `Err(reason)` rejects the request.
    fn authorize(&self, credentials: &Credentials, request: &Request) -> Result<(), String>;
}

/// Dispatches requests against one engine.
pub struct Api {
    engine: Arc<Engine>,
    authorizer: Option<Arc<dyn Authorizer>>,
}

impl Api {
    /// Secure mode refuses to build an `Api` without an authorizer.
    pub fn new(
        engine: Arc<Engine>,
        authorizer: Option<Arc<dyn Authorizer>>,
    ) -> Result<Self, EngineError> {
        if engine.config().secure_mode && authorizer.is_none() {
            return Err(EngineError::InvalidConfig {
                message: "secure mode requires an authorizer".into(),
            });
        }
        Ok(Self { engine, authorizer })
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    /// Handle one request. Always produces a response.
    pub fn handle(&self, credentials: &Credentials, request: Request) -> Response {
        if let Some(auth) = &self.authorizer {
            if let Err(reason) = auth.authorize(credentials, &request) {
                tracing::warn!(principal = ?credentials.principal, %reason, "request rejected");
                return Response::from_error(&EngineError::Unauthorized { reason }.into());
            }
        }
        match self.dispatch(request) {
            Ok(resp) => resp,
            Err(e) => {
                tracing::debug!(code = %e.code_str(), error = %e, "request failed");
                Response::from_error(&e)
            }
        }
    }

    fn dispatch(&self, request: Request) -> MnemosResult<Response> {
        let engine = &self.engine;
        match request {
            Request::LearnConcept {
                content,
                embedding,
                metadata,
                id,
                confidence,
                associations,
            } => {
                let mut concept = NewConcept::from_content(content, embedding).with_metadata(metadata);
                if let Some(id) = id {
                    concept = concept.with_id(ConceptId::new(id)?);
                }
                if let Some(c) = confidence {
                    concept = concept.with_confidence(c);
                }
                let associations = associations
                    .into_iter()
                    .map(|spec| resolve_association(spec, &concept.id))
                    .collect::<MnemosResult<Vec<_>>>()?;
                let concept_id = engine.learn(concept, associations)?;
                Ok(Response::Learned { concept_id })
            }
            Request::LearnAssociation {
                source,
                target,
                relation,
                confidence,
            } => {
                let assoc = NewAssociation::new(ConceptId::new(source)?, ConceptId::new(target)?, relation)
                    .with_confidence(confidence);
                let seq = engine.learn_association(assoc)?;
                Ok(Response::Ack { seq })
            }
            Request::UpdateStrength { concept_id, delta } => {
                let seq = engine.update_strength(&ConceptId::new(concept_id)?, delta)?;
                Ok(Response::Ack { seq })
            }
            Request::DeleteConcept { concept_id } => {
                let seq = engine.delete_concept(&ConceptId::new(concept_id)?)?;
                Ok(Response::Ack { seq })
            }
            Request::Search { embedding, k } => Ok(Response::SearchResults {
                hits: engine.search(&embedding, k)?,
            }),
            Request::GetConcept { concept_id } => Ok(Response::Concept {
                concept: engine.get_concept(&ConceptId::new(concept_id)?),
            }),
            Request::Flush => {
                let report = engine.flush()?;
                Ok(Response::Flushed {
                    seq: report.seq,
                    graph_bytes: report.graph_bytes,
                    index_bytes: report.index_bytes,
                    wal_bytes: report.wal_bytes,
                })
            }
            Request::GetStats => Ok(Response::Stats(engine.stats())),
            Request::HealthCheck => Ok(Response::Health(engine.health())),
        }
    }
}

fn resolve_association(spec: AssociationSpec, concept: &ConceptId) -> MnemosResult<NewAssociation> {
    let end = |raw: Option<String>| -> MnemosResult<ConceptId> {
        match raw {
            Some(raw) => Ok(ConceptId::new(raw)?),
            None => Ok(concept.clone()),
        }
    };
    Ok(NewAssociation::new(end(spec.source)?, end(spec.target)?, spec.relation)
        .with_confidence(spec.confidence))
}

impl std::fmt::Debug for Api {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Api")
            .field("engine", &self.engine)
            .field("authorizer", &self.authorizer.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use tempfile::TempDir;

    fn api(dir: &TempDir, secure: bool, auth: Option<Arc<dyn Authorizer>>) -> Result<Api, EngineError> {
        let mut c = EngineConfig::with_storage_path(dir.path());
        c.vector_dimension = 3;
        c.secure_mode = secure;
        Api::new(Arc::new(Engine::open(c).unwrap()), auth)
    }

    struct TokenAuth;

    impl Authorizer for TokenAuth {
        fn authorize(&self, credentials: &Credentials, _request: &Request) -> Result<(), String> {
            match credentials.token.as_deref() {
                Some("s3cret") => Ok(()),
                _ => Err("missing or wrong token".into()),
            }
        }
    }

    #[test]
    fn request_json_shape() {
        let req: Request = serde_json::from_str(
            r#"{"type":"LearnConcept","content":"water boils","embedding":[1,0,0]}"#,
        )
        .unwrap();
        assert!(matches!(req, Request::LearnConcept { ref associations, .. } if associations.is_empty()));
        let flush: Request = serde_json::from_str(r#"{"type":"Flush"}"#).unwrap();
        assert_eq!(flush, Request::Flush);
        let search: Request = serde_json::from_str(r#"{"type":"Search","embedding":[1,0,0]}"#).unwrap();
        assert_eq!(search, Request::Search { embedding: vec![1.0, 0.0, 0.0], k: 10 });
    }

    #[test]
    fn learn_then_search_and_get() {
        let dir = TempDir::new().unwrap();
        let api = api(&dir, false, None).unwrap();
        let creds = Credentials::anonymous();
        let resp = api.handle(
            &creds,
            Request::LearnConcept {
                content: "water boils at 100C".into(),
                embedding: vec![0.9, 0.1, 0.0],
                metadata: Metadata::new(),
                id: None,
                confidence: None,
                associations: vec![],
            },
        );
        let Response::Learned { concept_id } = resp else {
            panic!("unexpected {resp:?}");
        };

        let resp = api.handle(
            &creds,
            Request::Search {
                embedding: vec![1.0, 0.1, 0.0],
                k: 1,
            },
        );
        match resp {
            Response::SearchResults { hits } => assert_eq!(hits[0].concept_id, concept_id),
            other => panic!("unexpected {other:?}"),
        }

        let resp = api.handle(
            &creds,
            Request::GetConcept {
                concept_id: concept_id.to_string(),
            },
        );
        assert!(matches!(resp, Response::Concept { concept: Some(_) }));
    }

    #[test]
    fn associations_default_to_new_concept() {
        let dir = TempDir::new().unwrap();
        let api = api(&dir, false, None).unwrap();
        let creds = Credentials::anonymous();
        let Response::Learned { concept_id: cause } = api.handle(
            &creds,
            Request::LearnConcept {
                content: "rain".into(),
                embedding: vec![],
                metadata: Metadata::new(),
                id: Some("rain".into()),
                confidence: None,
                associations: vec![],
            },
        ) else {
            panic!("learn failed");
        };
        let resp = api.handle(
            &creds,
            Request::LearnConcept {
                content: "wet streets".into(),
                embedding: vec![],
                metadata: Metadata::new(),
                id: None,
                confidence: Some(0.8),
                associations: vec![AssociationSpec {
                    source: Some(cause.to_string()),
                    target: None,
                    relation: RelationType::Causal,
                    confidence: 0.7,
                }],
            },
        );
        let Response::Learned { concept_id } = resp else {
            panic!("unexpected {resp:?}");
        };
        let incoming = api.engine().graph().incoming(&concept_id);
        assert_eq!(incoming.len(), 1);
        assert_eq!(incoming[0].source, cause);
    }

    #[test]
    fn errors_carry_diagnostic_codes() {
        let dir = TempDir::new().unwrap();
        let api = api(&dir, false, None).unwrap();
        let resp = api.handle(
            &Credentials::anonymous(),
            Request::Search {
                embedding: vec![1.0],
                k: 3,
            },
        );
        assert_eq!(
            resp,
            Response::Error {
                code: "mnemos::vector::dim_mismatch".into(),
                message: "dimension mismatch: expected 3, got 1".into(),
            }
        );
        let resp = api.handle(
            &Credentials::anonymous(),
            Request::UpdateStrength {
                concept_id: "nope".into(),
                delta: 1.0,
            },
        );
        assert!(matches!(resp, Response::Error { code, .. } if code == "mnemos::graph::concept_not_found"));
    }

    #[test]
    fn secure_mode_requires_authorizer() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            api(&dir, true, None),
            Err(EngineError::InvalidConfig { .. })
        ));
    }

    #[test]
    fn secure_mode_rejects_bad_credentials() {
        let dir = TempDir::new().unwrap();
        let api = api(&dir, true, Some(Arc::new(TokenAuth))).unwrap();
        let resp = api.handle(&Credentials::anonymous(), Request::GetStats);
        assert!(matches!(resp, Response::Error { code, .. } if code == "mnemos::engine::unauthorized"));
        let resp = api.handle(&Credentials::token("s3cret"), Request::GetStats);
        assert!(matches!(resp, Response::Stats(_)));
    }

    #[test]
    fn stats_and_health() {
        let dir = TempDir::new().unwrap();
        let api = api(&dir, false, None).unwrap();
        let creds = Credentials::anonymous();
        let json = serde_json::to_value(api.handle(&creds, Request::HealthCheck)).unwrap();
        assert_eq!(json["type"], "Health");
        assert_eq!(json["status"], "healthy");
        let json = serde_json::to_value(api.handle(&creds, Request::GetStats)).unwrap();
        assert_eq!(json["concept_count"], 0);
    }
}
