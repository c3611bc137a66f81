//! Cached health snapshot.
//!
//! A periodic task refreshes the counts; readers get the cached snapshot
//! with the uptime live-patched so `status` stays cheap on the interactive
//! path.

use crate::embedding::{EmbeddingHandle, WorkerStatus};
use crate::storage::Storage;
use crate::{Error, Result};
use serde::Serialize;
use std::sync::{Arc, Mutex};
use std::time::Instant;

/// Point-in-time engine health.
#[derive(Debug, Clone, Serialize, Default)]
pub struct StatusSnapshot {
    /// Seconds since the engine started (live-patched on read).
    pub uptime_secs: u64,
    /// Alive observations across all projects.
    pub observations: u64,
    /// Rows waiting for classification.
    pub unclassified_backlog: u64,
    /// Rows waiting for embedding.
    pub unembedded_backlog: u64,
    /// Graph node count.
    pub graph_nodes: u64,
    /// Graph edge count.
    pub graph_edges: u64,
    /// Pending notifications across all projects.
    pub pending_notifications: u64,
    /// Embedding worker state: `ready`, `pending`, or `unavailable`.
    pub embedding: String,
    /// Embedding engine name, when ready.
    pub embedding_engine: Option<String>,
}

/// Refreshable snapshot cache.
pub struct StatusCache {
    storage: Arc<Storage>,
    handle: Arc<EmbeddingHandle>,
    started: Instant,
    cached: Mutex<StatusSnapshot>,
}

impl StatusCache {
    /// Creates a cache with an empty snapshot.
    #[must_use]
    pub fn new(storage: Arc<Storage>, handle: Arc<EmbeddingHandle>) -> Self {
        Self {
            storage,
            handle,
            started: Instant::now(),
            cached: Mutex::new(StatusSnapshot::default()),
        }
    }

    /// Recomputes the counts. Called by the periodic refresher.
    ///
    /// # Errors
    ///
    /// Returns a storage error when counting fails; the previous snapshot
    /// stays cached.
    pub fn refresh(&self) -> Result<()> {
        let count = |sql: &str| -> Result<u64> {
            self.storage.with_conn(|conn| {
                conn.prepare_cached(sql)
                    .map_err(|e| Error::storage("prepare_status_count", e))?
                    .query_row([], |row| row.get::<_, i64>(0))
                    .map(|n| n.max(0) as u64)
                    .map_err(|e| Error::storage("status_count", e))
            })
        };

        let snapshot = StatusSnapshot {
            uptime_secs: self.started.elapsed().as_secs(),
            observations: count(
                "SELECT COUNT(*) FROM observations WHERE deleted_at IS NULL",
            )?,
            unclassified_backlog: count(
                "SELECT COUNT(*) FROM observations
                 WHERE deleted_at IS NULL AND classification = 'unset'",
            )?,
            unembedded_backlog: count(
                "SELECT COUNT(*) FROM observations
                 WHERE deleted_at IS NULL AND embedding_model IS NULL",
            )?,
            graph_nodes: count("SELECT COUNT(*) FROM graph_nodes")?,
            graph_edges: count("SELECT COUNT(*) FROM graph_edges")?,
            pending_notifications: count("SELECT COUNT(*) FROM pending_notifications")?,
            embedding: match self.handle.status() {
                WorkerStatus::Ready { .. } => "ready".to_string(),
                WorkerStatus::Pending => "pending".to_string(),
                WorkerStatus::Unavailable => "unavailable".to_string(),
            },
            embedding_engine: self.handle.model_name(),
        };

        if let Ok(mut cached) = self.cached.lock() {
            *cached = snapshot;
        }
        Ok(())
    }

    /// The cached snapshot with uptime patched to now.
    #[must_use]
    pub fn snapshot(&self) -> StatusSnapshot {
        let mut snapshot = self
            .cached
            .lock()
            .map(|cached| cached.clone())
            .unwrap_or_default();
        snapshot.uptime_secs = self.started.elapsed().as_secs();
        snapshot
    }
}
