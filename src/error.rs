//! Rich diagnostic error types for the mnemos storage engine.
//!
//! Each subsystem defines its own error type with miette `#[diagnostic]` derives,
//! providing error codes, help text, and source chains so operators know exactly
//! what went wrong and how to fix it.

use miette::Diagnostic;
use thiserror::Error;

/// Top-level error type for the mnemos engine.
///
/// Each variant wraps a subsystem-specific error, preserving the full diagnostic
/// chain (error codes, help text, sources) through to the caller.
#[derive(Debug, Error, Diagnostic)]
pub enum MnemosError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Wal(#[from] WalError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Vector(#[from] VectorError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Partition(#[from] PartitionError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Engine(#[from] EngineError),
}

impl MnemosError {
    /// Stable diagnostic code, used as the error code on the API surface.
    pub fn code_str(&self) -> String {
        self.code()
            .map(|c| c.to_string())
            .unwrap_or_else(|| "mnemos::unknown".to_string())
    }
}

// ---------------------------------------------------------------------------
// WAL errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum WalError {
    #[error("WAL I/O error: {source}")]
    #[diagnostic(
        code(mnemos::wal::io),
        help(
            "The write-ahead log could not be written or synced. The write was not \
             acknowledged and nothing was applied. Check disk space and permissions \
             of the data directory."
        )
    )]
    Io {
        #[source]
        source: std::io::Error,
    },

    #[error("corrupt WAL entry at byte offset {offset}: {reason}")]
    #[diagnostic(
        code(mnemos::wal::corrupt_entry),
        help(
            "A torn or damaged frame was found at the tail of the log. Frames from \
             this offset on were never acknowledged and are discarded during recovery."
        )
    )]
    CorruptEntry { offset: u64, reason: String },

    #[error("WAL payload serialization error: {message}")]
    #[diagnostic(
        code(mnemos::wal::serde),
        help("The operation could not be encoded or decoded. This indicates a format change between versions.")
    )]
    Serialization { message: String },

    #[error("invalid checkpoint: up_to {up_to} is beyond the last appended sequence {last}")]
    #[diagnostic(
        code(mnemos::wal::invalid_checkpoint),
        help("Checkpoints may only cover sequences that were appended and are reflected in a snapshot.")
    )]
    InvalidCheckpoint { up_to: u64, last: u64 },

    #[error("WAL is poisoned after a failed append could not be rolled back")]
    #[diagnostic(
        code(mnemos::wal::poisoned),
        help(
            "A partially written frame could not be removed from the log. Restart the \
             process: recovery discards the torn tail."
        )
    )]
    Poisoned,

    #[error("not a mnemos WAL file: {path}")]
    #[diagnostic(
        code(mnemos::wal::bad_magic),
        help("The file does not start with the WAL magic bytes. Point the engine at the right data directory.")
    )]
    BadMagic { path: String },
}

// ---------------------------------------------------------------------------
// Store errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum StoreError {
    #[error("I/O error: {source}")]
    #[diagnostic(
        code(mnemos::store::io),
        help(
            "A filesystem operation failed. Check that the data directory exists, \
             has correct permissions, and that the disk is not full."
        )
    )]
    Io {
        #[source]
        source: std::io::Error,
    },

    #[error("redb transaction error: {message}")]
    #[diagnostic(
        code(mnemos::store::redb),
        help(
            "The embedded metadata database encountered a transaction error. \
             If the problem persists, file a bug report."
        )
    )]
    Redb { message: String },

    #[error("serialization error: {message}")]
    #[diagnostic(
        code(mnemos::store::serde),
        help(
            "Failed to serialize or deserialize data. \
             This usually means the stored data format has changed between versions."
        )
    )]
    Serialization { message: String },

    #[error("memory map error: {message}")]
    #[diagnostic(
        code(mnemos::store::mmap),
        help(
            "Failed to create or access a memory-mapped file. \
             Check available virtual memory and file permissions."
        )
    )]
    Mmap { message: String },

    #[error("invalid graph snapshot {path}: {message}")]
    #[diagnostic(
        code(mnemos::store::invalid_snapshot),
        help(
            "The snapshot file failed validation. Snapshots are replaced atomically, \
             so this indicates external damage. Move the file aside to recover from the WAL alone \
             if the log still holds the full history."
        )
    )]
    InvalidSnapshot { path: String, message: String },
}

// ---------------------------------------------------------------------------
// Graph errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum GraphError {
    #[error("concept not found: {id}")]
    #[diagnostic(
        code(mnemos::graph::concept_not_found),
        help("Learn the concept first, or check the identifier.")
    )]
    ConceptNotFound { id: String },

    #[error("invalid concept: {message}")]
    #[diagnostic(
        code(mnemos::graph::invalid_concept),
        help("Concept identifiers and content must be non-empty.")
    )]
    InvalidConcept { message: String },
}

// ---------------------------------------------------------------------------
// Vector index errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum VectorError {
    #[error("dimension mismatch: expected {expected}, got {actual}")]
    #[diagnostic(
        code(mnemos::vector::dim_mismatch),
        help(
            "Every embedding must have the dimension the engine was initialized with. \
             Vectors are never truncated or padded; re-embed with the configured model."
        )
    )]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("invalid vector: {message}")]
    #[diagnostic(
        code(mnemos::vector::invalid),
        help("Embeddings must be finite and have a non-zero norm for cosine distance.")
    )]
    InvalidVector { message: String },

    #[error("vector index file {path} is invalid: {message}")]
    #[diagnostic(
        code(mnemos::vector::format),
        help("The index is rebuilt from the graph store when its file cannot be used.")
    )]
    Format { path: String, message: String },

    #[error("vector index I/O error: {source}")]
    #[diagnostic(
        code(mnemos::vector::io),
        help("Check disk space and permissions of the data directory.")
    )]
    Io {
        #[source]
        source: std::io::Error,
    },
}

// ---------------------------------------------------------------------------
// Partition / 2PC errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum PartitionError {
    #[error("partition {partition} rejected generation {received}: accepted generation is {accepted}")]
    #[diagnostic(
        code(mnemos::partition::stale_generation),
        help(
            "A newer coordinator has taken over this partition. The sender must stop \
             coordinating writes; its in-flight transaction is aborted."
        )
    )]
    StaleGeneration {
        partition: u32,
        received: u64,
        accepted: u64,
    },

    #[error("timed out after {timeout_ms} ms waiting for partition {partition} to prepare transaction {txn}")]
    #[diagnostic(
        code(mnemos::partition::prepare_timeout),
        help("The transaction was aborted. Increase `prepare_timeout` if partitions are slow but healthy.")
    )]
    PrepareTimeout {
        txn: String,
        partition: u32,
        timeout_ms: u64,
    },

    #[error("transaction {txn} aborted: {reason}")]
    #[diagnostic(
        code(mnemos::partition::aborted),
        help("No partition applied the write. Fix the cause and retry the whole write.")
    )]
    Aborted { txn: String, reason: String },

    #[error("unknown partition {partition}")]
    #[diagnostic(
        code(mnemos::partition::unknown),
        help("The coordinator was configured with a different partition set.")
    )]
    UnknownPartition { partition: u32 },

    #[error("partition transport error: {message}")]
    #[diagnostic(
        code(mnemos::partition::transport),
        help("The message could not be delivered. It is retried up to the configured limit.")
    )]
    Transport { message: String },

    #[error("partition storage error: {message}")]
    #[diagnostic(
        code(mnemos::partition::storage),
        help("Check file permissions and disk space of the partition data directory.")
    )]
    Storage { message: String },
}

// ---------------------------------------------------------------------------
// Engine errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum EngineError {
    #[error("invalid configuration: {message}")]
    #[diagnostic(
        code(mnemos::engine::invalid_config),
        help("Check the EngineConfig fields or MNEMOS_* environment variables. {message}")
    )]
    InvalidConfig { message: String },

    #[error("data directory error: {path}")]
    #[diagnostic(
        code(mnemos::engine::data_dir),
        help(
            "The data directory could not be accessed. \
             Ensure the path exists and has read/write permissions."
        )
    )]
    DataDir {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("data directory {path} is locked by process {pid}")]
    #[diagnostic(
        code(mnemos::engine::locked),
        help(
            "Only one engine may own a data directory. Stop the other process, \
             or remove the LOCK file if that process no longer exists."
        )
    )]
    Locked { path: String, pid: u32 },

    #[error("request rejected: {reason}")]
    #[diagnostic(
        code(mnemos::engine::unauthorized),
        help("Secure mode is enabled; requests must pass the configured authorizer.")
    )]
    Unauthorized { reason: String },

    #[error("embedding provider error: {message}")]
    #[diagnostic(
        code(mnemos::engine::embedding),
        help("The external embedding service failed. Nothing was written; retry the request.")
    )]
    Embedding { message: String },
}

/// Convenience alias for functions returning mnemos results.
pub type MnemosResult<T> = std::result::Result<T, MnemosError>;
