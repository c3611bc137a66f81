//! # Laminark
//!
//! A per-developer knowledge memory engine for AI coding assistants.
//!
//! Laminark sits behind an LLM-driven coding assistant, captures the tool-use
//! events the assistant emits, distills them into durable observations, and
//! enriches them asynchronously with classification, embeddings, entities and
//! relationships. Relevant context is re-injected at the start of each session
//! and before individual tool invocations. An MCP-style tool surface exposes
//! the same store for explicit recall, saving, and curation.
//!
//! ## Features
//!
//! - Single embedded SQLite store with WAL, FTS5 and a vector index kept
//!   transactionally consistent through triggers
//! - Admission and deduplication funnel in front of every save
//! - Asynchronous enrichment: classification, embeddings, knowledge graph,
//!   debug-path and thought-branch tracking
//! - EWMA-adaptive topic-shift detection with automatic context stashing
//! - Hybrid keyword + vector search with reciprocal-rank fusion
//! - Background curation: merge, dedup, decay, prune
//!
//! ## Example
//!
//! ```rust,ignore
//! use laminark::storage::{ObservationStore, Storage};
//! use laminark::models::{Kind, NewObservation};
//!
//! let storage = Storage::open("laminark.db")?;
//! let store = ObservationStore::new(storage, project_hash);
//! let obs = store.create(NewObservation {
//!     content: "Switched the cache layer to write-through".to_string(),
//!     kind: Kind::Decision,
//!     source: "manual".to_string(),
//!     ..Default::default()
//! })?;
//! ```

#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![warn(missing_docs)]
#![forbid(unsafe_code)]
// multiple_crate_versions is inherently crate-level (detects duplicate transitive dependencies).
#![allow(clippy::multiple_crate_versions)]

use thiserror::Error as ThisError;

// Module declarations
pub mod config;
pub mod embedding;
pub mod engine;
pub mod hooks;
pub mod llm;
pub mod mcp;
pub mod models;
pub mod rendering;
pub mod search;
pub mod services;
pub mod storage;

// Re-exports for convenience
pub use config::LaminarkConfig;
pub use embedding::{Embedder, EmbeddingHandle};
pub use engine::Engine;
pub use llm::LlmProvider;
pub use models::{
    Classification, Kind, NewObservation, Observation, ObservationId, ProjectRef, Verbosity,
};
pub use search::SearchEngine;
pub use storage::{ObservationStore, Storage};

/// Error type for laminark operations.
///
/// Uses `thiserror` for automatic `Display` and `Error` trait implementations.
///
/// # Error Variant Triggers
///
/// | Variant | Raised When |
/// |---------|-------------|
/// | `StorageOpen` | Database file cannot be created, opened, or configured |
/// | `Migration` | A versioned migration fails; prior schema is left intact |
/// | `Integrity` | FTS or vector index found out of sync with the observations table |
/// | `AdapterUnavailable` | Embedding worker or LLM service is down or unconfigured |
/// | `AdapterTimeout` | Embedding or LLM request exceeded its wall-clock budget |
/// | `ValidationRejected` | Admission filter or quality gate rejected the input |
/// | `Duplicate` | Save guard matched an existing observation |
/// | `NotFound` | A referenced row does not exist |
/// | `Storage` | Any other database operation failed |
#[derive(Debug, ThisError)]
pub enum Error {
    /// The database could not be opened or configured.
    #[error("storage open failed for '{path}': {cause}")]
    StorageOpen {
        /// Path that failed to open.
        path: String,
        /// The underlying cause.
        cause: String,
    },

    /// A schema migration failed. The prior schema is left intact.
    #[error("migration v{version} failed: {cause}")]
    Migration {
        /// The migration version that failed.
        version: i64,
        /// The underlying cause.
        cause: String,
    },

    /// A derived index disagrees with the observations table.
    ///
    /// Raised by consistency checks when an FTS or vector row is missing or
    /// stale. Indicates a bug or external mutation, not a recoverable state.
    #[error("index integrity violation: {0}")]
    Integrity(String),

    /// An external adapter (embedding worker, LLM service) is unavailable.
    ///
    /// Enrichment callers catch this at the boundary and retry next cycle.
    #[error("adapter '{adapter}' unavailable: {cause}")]
    AdapterUnavailable {
        /// The adapter that is unavailable.
        adapter: String,
        /// The underlying cause.
        cause: String,
    },

    /// An external adapter call exceeded its timeout.
    #[error("adapter '{adapter}' timed out after {timeout_secs}s")]
    AdapterTimeout {
        /// The adapter that timed out.
        adapter: String,
        /// The timeout that elapsed, in seconds.
        timeout_secs: u64,
    },

    /// Input was rejected by the admission filter or a quality gate.
    ///
    /// User-visible as a friendly message, never as a protocol error.
    #[error("rejected: {0}")]
    ValidationRejected(String),

    /// The save guard matched an existing observation.
    #[error("duplicate of existing observation {existing_id}")]
    Duplicate {
        /// The id of the observation this content duplicates.
        existing_id: String,
    },

    /// A referenced row does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// A database operation failed.
    #[error("storage operation '{operation}' failed: {cause}")]
    Storage {
        /// The operation that failed.
        operation: String,
        /// The underlying cause.
        cause: String,
    },
}

impl Error {
    /// Builds a [`Error::Storage`] from an operation label and any error.
    pub(crate) fn storage(operation: &str, cause: impl std::fmt::Display) -> Self {
        Self::Storage {
            operation: operation.to_string(),
            cause: cause.to_string(),
        }
    }

    /// Returns true when the failure is a user-facing rejection rather than
    /// an internal fault.
    #[must_use]
    pub const fn is_rejection(&self) -> bool {
        matches!(self, Self::ValidationRejected(_) | Self::Duplicate { .. })
    }
}

/// Result type alias for laminark operations.
pub type Result<T> = std::result::Result<T, Error>;
