//! Engine configuration: TOML file, environment overrides, validation.
//!
//! Resolution order is defaults → TOML file (if given) → `MNEMOS_*`
//! environment variables. Durations are stored as integer milliseconds or
//! seconds so the TOML stays readable; accessors return [`Duration`].

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::vector::IndexConfig;

pub const ENV_STORAGE_PATH: &str = "MNEMOS_STORAGE_PATH";
pub const ENV_RECONCILE_INTERVAL_MS: &str = "MNEMOS_RECONCILE_INTERVAL_MS";
pub const ENV_FLUSH_THRESHOLD: &str = "MNEMOS_FLUSH_THRESHOLD";
pub const ENV_FLUSH_MAX_AGE_SECS: &str = "MNEMOS_FLUSH_MAX_AGE_SECS";
pub const ENV_VECTOR_DIMENSION: &str = "MNEMOS_VECTOR_DIMENSION";
pub const ENV_SECURE_MODE: &str = "MNEMOS_SECURE_MODE";
pub const ENV_EMBEDDING_URL: &str = "MNEMOS_EMBEDDING_URL";

/// Configuration of one engine, persisted as TOML.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Data directory holding the WAL, snapshot, index and lock file.
    #[serde(default = "default_storage_path")]
    pub storage_path: PathBuf,
    /// Reconciler wake-up interval.
    #[serde(default = "default_reconcile_interval_ms")]
    pub reconcile_interval_ms: u64,
    /// Unflushed mutations that force a flush.
    #[serde(default = "default_flush_threshold")]
    pub flush_threshold: u64,
    /// Oldest unflushed mutation allowed before a flush.
    #[serde(default = "default_flush_max_age_secs")]
    pub flush_max_age_secs: u64,
    /// Embedding dimension, fixed for the lifetime of the data directory.
    #[serde(default = "default_vector_dimension")]
    pub vector_dimension: usize,
    /// Require an authorizer on the API surface.
    #[serde(default)]
    pub secure_mode: bool,
    /// Endpoint of the external embedding service.
    #[serde(default)]
    pub embedding_url: Option<String>,
    #[serde(default)]
    pub index: IndexConfig,
}

fn default_storage_path() -> PathBuf {
    PathBuf::from("mnemos-data")
}
fn default_reconcile_interval_ms() -> u64 {
    1_000
}
fn default_flush_threshold() -> u64 {
    50_000
}
fn default_flush_max_age_secs() -> u64 {
    60
}
fn default_vector_dimension() -> usize {
    768
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            storage_path: default_storage_path(),
            reconcile_interval_ms: default_reconcile_interval_ms(),
            flush_threshold: default_flush_threshold(),
            flush_max_age_secs: default_flush_max_age_secs(),
            vector_dimension: default_vector_dimension(),
            secure_mode: false,
            embedding_url: None,
            index: IndexConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Defaults with the given data directory.
    pub fn with_storage_path(path: impl Into<PathBuf>) -> Self {
        Self {
            storage_path: path.into(),
            ..Default::default()
        }
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_millis(self.reconcile_interval_ms)
    }

    pub fn flush_max_age(&self) -> Duration {
        Duration::from_secs(self.flush_max_age_secs)
    }

    /// Defaults overridden by the process environment.
    pub fn from_env() -> Result<Self, EngineError> {
        Self::default().with_overrides(|key| std::env::var(key).ok())
    }

    /// Apply `MNEMOS_*` overrides read through `lookup`.
    pub fn with_overrides<F>(mut self, lookup: F) -> Result<Self, EngineError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup(ENV_STORAGE_PATH) {
            self.storage_path = PathBuf::from(v);
        }
        if let Some(v) = lookup(ENV_RECONCILE_INTERVAL_MS) {
            self.reconcile_interval_ms = parse_number(ENV_RECONCILE_INTERVAL_MS, &v)?;
        }
        if let Some(v) = lookup(ENV_FLUSH_THRESHOLD) {
            self.flush_threshold = parse_number(ENV_FLUSH_THRESHOLD, &v)?;
        }
        if let Some(v) = lookup(ENV_FLUSH_MAX_AGE_SECS) {
            self.flush_max_age_secs = parse_number(ENV_FLUSH_MAX_AGE_SECS, &v)?;
        }
        if let Some(v) = lookup(ENV_VECTOR_DIMENSION) {
            self.vector_dimension = parse_number(ENV_VECTOR_DIMENSION, &v)?;
        }
        if let Some(v) = lookup(ENV_SECURE_MODE) {
            self.secure_mode = parse_bool(ENV_SECURE_MODE, &v)?;
        }
        if let Some(v) = lookup(ENV_EMBEDDING_URL) {
            self.embedding_url = (!v.trim().is_empty()).then_some(v);
        }
        Ok(self)
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> Result<(), EngineError> {
        let problem = if self.vector_dimension == 0 {
            Some("vector_dimension must be > 0")
        } else if self.reconcile_interval_ms == 0 {
            Some("reconcile_interval_ms must be > 0")
        } else if self.flush_threshold == 0 {
            Some("flush_threshold must be > 0")
        } else if self.index.m < 2 {
            Some("index.m must be at least 2")
        } else if self.index.ef_construction == 0 || self.index.ef_search == 0 {
            Some("index.ef_construction and index.ef_search must be > 0")
        } else if self.storage_path.as_os_str().is_empty() {
            Some("storage_path must not be empty")
        } else {
            None
        };
        match problem {
            Some(message) => Err(EngineError::InvalidConfig {
                message: message.into(),
            }),
            None => Ok(()),
        }
    }

    /// Load from a TOML file.
    pub fn load(path: &Path) -> Result<Self, EngineError> {
        let content = std::fs::read_to_string(path).map_err(|e| EngineError::DataDir {
            path: path.display().to_string(),
            source: e,
        })?;
        toml::from_str(&content).map_err(|e| EngineError::InvalidConfig {
            message: format!("failed to parse {}: {e}", path.display()),
        })
    }

    /// Save to a TOML file.
    pub fn save(&self, path: &Path) -> Result<(), EngineError> {
        let content = toml::to_string_pretty(self).map_err(|e| EngineError::InvalidConfig {
            message: format!("failed to encode config: {e}"),
        })?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| EngineError::DataDir {
                path: parent.display().to_string(),
                source: e,
            })?;
        }
        std::fs::write(path, content).map_err(|e| EngineError::DataDir {
            path: path.display().to_string(),
            source: e,
        })
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T, EngineError> {
    raw.trim().parse().map_err(|_| EngineError::InvalidConfig {
        message: format!("{key}={raw:?} is not a valid number"),
    })
}

fn parse_bool(key: &str, raw: &str) -> Result<bool, EngineError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(EngineError::InvalidConfig {
            message: format!("{key}={raw:?} is not a boolean"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn defaults_match_documented_values() {
        let c = EngineConfig::default();
        assert_eq!(c.reconcile_interval(), Duration::from_secs(1));
        assert_eq!(c.flush_threshold, 50_000);
        assert_eq!(c.flush_max_age(), Duration::from_secs(60));
        assert_eq!(c.vector_dimension, 768);
        assert!(!c.secure_mode);
        assert!(c.validate().is_ok());
    }

    #[test]
    fn environment_overrides_apply() {
        let c = EngineConfig::default()
            .with_overrides(env(&[
                (ENV_STORAGE_PATH, "/tmp/x"),
                (ENV_FLUSH_THRESHOLD, "10"),
                (ENV_VECTOR_DIMENSION, "384"),
                (ENV_SECURE_MODE, "TRUE"),
                (ENV_EMBEDDING_URL, "http://localhost:9000/embed"),
            ]))
            .unwrap();
        assert_eq!(c.storage_path, PathBuf::from("/tmp/x"));
        assert_eq!(c.flush_threshold, 10);
        assert_eq!(c.vector_dimension, 384);
        assert!(c.secure_mode);
        assert_eq!(c.embedding_url.as_deref(), Some("http://localhost:9000/embed"));
    }

    #[test]
    fn malformed_override_rejected() {
        let err = EngineConfig::default()
            .with_overrides(env(&[(ENV_RECONCILE_INTERVAL_MS, "soon")]))
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidConfig { .. }));
    }

    #[test]
    fn validate_rejects_zero_values() {
        let mut c = EngineConfig::default();
        c.vector_dimension = 0;
        assert!(c.validate().is_err());

        let mut c = EngineConfig::default();
        c.flush_threshold = 0;
        assert!(c.validate().is_err());

        let mut c = EngineConfig::default();
        c.index.m = 1;
        assert!(c.validate().is_err());
    }

    #[test]
    fn toml_round_trip_with_partial_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("mnemos.toml");
        std::fs::write(&path, "vector_dimension = 4\n[index]\nm = 4\n").unwrap();
        let c = EngineConfig::load(&path).unwrap();
        assert_eq!(c.vector_dimension, 4);
        assert_eq!(c.index.m, 4);
        assert_eq!(c.index.ef_construction, IndexConfig::default().ef_construction);
        assert_eq!(c.flush_threshold, 50_000);

        c.save(&path).unwrap();
        assert_eq!(EngineConfig::load(&path).unwrap(), c);
    }
}
