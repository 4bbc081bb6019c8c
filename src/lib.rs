// thiserror's #[error("...{field}...")] format strings reference struct fields,
// but the compiler doesn't see through the derive macro and reports false positives.
#![allow(unused_assignments)]

//! # mnemos
//!
//! A durable domain-knowledge graph store: continuous writes, low-latency
//! reads and approximate nearest-neighbor search, with zero loss of
//! acknowledged writes across crashes.
//!
//! ## Architecture
//!
//! - **Write-ahead log** (`wal`): CRC-framed, fsynced append log; the durability point
//! - **Graph store** (`graph`): in-memory concepts and associations, mmap-read snapshots
//! - **Vector index** (`vector`): HNSW over cosine distance, single-file persistence
//! - **Learning pipeline** (`learn`): validate → WAL append → graph → index
//! - **Reconciler** (`reconcile`): background snapshot + WAL checkpoint
//! - **Partitions** (`partition`): two-phase commit across sharded engines
//! - **API** (`api`): serde request/response surface with a secure-mode gate
//!
//! ## Library usage
//!
//! ```no_run
//! use mnemos::concept::NewConcept;
//! use mnemos::config::EngineConfig;
//! use mnemos::engine::Engine;
//!
//! let mut config = EngineConfig::with_storage_path("/tmp/mnemos");
//! config.vector_dimension = 3;
//! let engine = Engine::open(config).unwrap();
//! let id = engine
//!     .learn(NewConcept::from_content("water boils at 100C", vec![0.9, 0.1, 0.0]), vec![])
//!     .unwrap();
//! let hits = engine.search(&[1.0, 0.1, 0.0], 5).unwrap();
//! assert_eq!(hits[0].concept_id, id);
//! ```

pub mod api;
pub mod concept;
pub mod config;
pub mod embed;
pub mod engine;
pub mod error;
pub mod graph;
pub mod learn;
pub mod lock;
pub mod partition;
pub mod paths;
pub mod reconcile;
pub mod store;
pub mod vector;
pub mod wal;
