//! Client boundary of the external embedding service.
//!
//! The engine never computes embeddings itself. `learn_text` asks an
//! [`EmbeddingProvider`] once, checks the returned dimension, and logs the
//! result like any other learn.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// Source of embeddings for raw text.
pub trait EmbeddingProvider: Send + Sync {
    fn embed(&self, text: &str) -> Result<Vec<f32>, EngineError>;
}

/// Configuration for [`HttpEmbeddingProvider`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpEmbeddingConfig {
    /// Endpoint that accepts `POST {"texts": [..]}`.
    pub url: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_timeout_secs() -> u64 {
    30
}

impl HttpEmbeddingConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

#[derive(Serialize)]
struct EmbedRequest<'a> {
    texts: [&'a str; 1],
}

#[derive(Deserialize)]
struct EmbedResponse {
    embeddings: Vec<Vec<f32>>,
}

/// Blocking HTTP provider speaking `{"texts"} -> {"embeddings"}`.
#[derive(Debug, Clone)]
pub struct HttpEmbeddingProvider {
    config: HttpEmbeddingConfig,
    agent: ureq::Agent,
}

impl HttpEmbeddingProvider {
    pub fn new(config: HttpEmbeddingConfig) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build();
        Self { config, agent }
    }

    pub fn url(&self) -> &str {
        &self.config.url
    }
}

impl EmbeddingProvider for HttpEmbeddingProvider {
    fn embed(&self, text: &str) -> Result<Vec<f32>, EngineError> {
        let body = serde_json::to_string(&EmbedRequest { texts: [text] }).map_err(|e| {
            EngineError::Embedding {
                message: format!("JSON serialize error: {e}"),
            }
        })?;

        let resp = self
            .agent
            .post(&self.config.url)
            .set("Content-Type", "application/json")
            .send_string(&body)
            .map_err(|e: ureq::Error| match e {
                ureq::Error::Status(code, _) => EngineError::Embedding {
                    message: format!("{} returned status {code}", self.config.url),
                },
                ureq::Error::Transport(t) => EngineError::Embedding {
                    message: format!("request to {} failed: {t}", self.config.url),
                },
            })?;

        let resp_str = resp.into_string().map_err(|e| EngineError::Embedding {
            message: format!("failed to read response: {e}"),
        })?;
        parse_response(&resp_str)
    }
}

fn parse_response(body: &str) -> Result<Vec<f32>, EngineError> {
    let parsed: EmbedResponse = serde_json::from_str(body).map_err(|e| EngineError::Embedding {
        message: format!("malformed response: {e}"),
    })?;
    let count = parsed.embeddings.len();
    let mut embeddings = parsed.embeddings.into_iter();
    match (embeddings.next(), count) {
        (Some(v), 1) => Ok(v),
        _ => Err(EngineError::Embedding {
            message: format!("expected exactly one embedding, got {count}"),
        }),
    }
}

/// Reject a provider result whose length is not `dimension`.
pub fn check_dimension(dimension: usize, embedding: &[f32]) -> Result<(), EngineError> {
    if embedding.len() != dimension {
        return Err(EngineError::Embedding {
            message: format!(
                "provider returned {} dimensions, engine expects {dimension}",
                embedding.len()
            ),
        });
    }
    Ok(())
}
