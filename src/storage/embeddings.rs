//! Vector index keyed by observation id.
//!
//! Stores one fixed-dimension float vector per embedded observation and
//! answers KNN queries with cosine distance. The index lives in the same
//! database as the observations table, so inserts and deletes share the
//! writer's transactional guarantees; rows disappear with their observation
//! through `ON DELETE CASCADE`.

use super::observations::read_observation;
use super::{Storage, to_millis};
use crate::embedding::{blob_to_vector, cosine_distance, vector_to_blob};
use crate::models::{Observation, ObservationId};
use crate::{Error, Result};
use chrono::Utc;
use rusqlite::{OptionalExtension, params};
use std::sync::Arc;

/// Store for observation embedding vectors.
#[derive(Clone)]
pub struct EmbeddingStore {
    storage: Arc<Storage>,
}

impl EmbeddingStore {
    /// Creates a vector store over the shared database.
    #[must_use]
    pub const fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }

    /// Inserts or replaces the vector for an observation.
    ///
    /// The project scope is taken from the observation row itself, so a
    /// vector can never be filed under a different project than its
    /// observation.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] when the observation id is unknown.
    pub fn store(&self, id: &ObservationId, vector: &[f32]) -> Result<()> {
        self.storage.with_conn(|conn| {
            let project_hash: Option<String> = conn
                .prepare_cached("SELECT project_hash FROM observations WHERE id = ?1")
                .map_err(|e| Error::storage("prepare_embedding_project", e))?
                .query_row(params![id.as_str()], |row| row.get(0))
                .optional()
                .map_err(|e| Error::storage("embedding_project", e))?;
            let Some(project_hash) = project_hash else {
                return Err(Error::NotFound(format!("observation {id}")));
            };

            conn.prepare_cached(
                "INSERT OR REPLACE INTO observation_embeddings
                 (observation_id, project_hash, dims, vector, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )
            .map_err(|e| Error::storage("prepare_store_embedding", e))?
            .execute(params![
                id.as_str(),
                project_hash,
                vector.len() as i64,
                vector_to_blob(vector),
                to_millis(Utc::now()),
            ])
            .map_err(|e| Error::storage("store_embedding", e))?;
            Ok(())
        })
    }

    /// Fetches the vector for an observation, when one exists.
    pub fn get(&self, id: &ObservationId) -> Result<Option<Vec<f32>>> {
        self.storage.with_conn(|conn| {
            let blob: Option<Vec<u8>> = conn
                .prepare_cached(
                    "SELECT vector FROM observation_embeddings WHERE observation_id = ?1",
                )
                .map_err(|e| Error::storage("prepare_get_embedding", e))?
                .query_row(params![id.as_str()], |row| row.get(0))
                .optional()
                .map_err(|e| Error::storage("get_embedding", e))?;
            Ok(blob.as_deref().and_then(blob_to_vector))
        })
    }

    /// KNN by cosine distance, scoped to one project's alive observations.
    ///
    /// Returns `(id, distance)` pairs, nearest first. The scan is linear
    /// over the project's vectors; at per-developer scale that stays well
    /// inside the interactive budget.
    pub fn search(
        &self,
        project_hash: &str,
        query: &[f32],
        k: usize,
    ) -> Result<Vec<(ObservationId, f32)>> {
        let mut scored = self.storage.with_conn(|conn| {
            let mut stmt = conn
                .prepare_cached(
                    "SELECT e.observation_id, e.vector
                     FROM observation_embeddings e
                     JOIN observations o ON o.id = e.observation_id
                     WHERE e.project_hash = ?1 AND o.deleted_at IS NULL",
                )
                .map_err(|e| Error::storage("prepare_knn", e))?;
            let rows = stmt
                .query_map(params![project_hash], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, Vec<u8>>(1)?))
                })
                .map_err(|e| Error::storage("knn_scan", e))?;

            let mut scored = Vec::new();
            for row in rows {
                let (id, blob) = row.map_err(|e| Error::storage("knn_scan", e))?;
                if let Some(vector) = blob_to_vector(&blob) {
                    scored.push((ObservationId::from(id), cosine_distance(query, &vector)));
                }
            }
            Ok(scored)
        })?;

        scored.sort_by(|a, b| a.1.total_cmp(&b.1));
        scored.truncate(k);
        metrics::counter!("laminark_knn_searches_total").increment(1);
        Ok(scored)
    }

    /// Returns alive observations that have no vector yet, oldest first, so
    /// the backlog drains in arrival order across all projects.
    pub fn find_unembedded(&self, limit: usize) -> Result<Vec<Observation>> {
        self.storage.with_conn(|conn| {
            let mut stmt = conn
                .prepare_cached(
                    "SELECT o.* FROM observations o
                     WHERE o.deleted_at IS NULL AND o.embedding_model IS NULL
                     ORDER BY o.created_at ASC LIMIT ?1",
                )
                .map_err(|e| Error::storage("prepare_find_unembedded", e))?;
            let rows = stmt
                .query_map(params![limit as i64], read_observation)
                .map_err(|e| Error::storage("find_unembedded", e))?;
            rows.collect::<std::result::Result<Vec<_>, _>>()
                .map_err(|e| Error::storage("find_unembedded", e))
        })
    }

    /// Removes the vector for an observation (hard deletes only).
    pub fn delete(&self, id: &ObservationId) -> Result<bool> {
        self.storage.with_conn(|conn| {
            let changed = conn
                .prepare_cached("DELETE FROM observation_embeddings WHERE observation_id = ?1")
                .map_err(|e| Error::storage("prepare_delete_embedding", e))?
                .execute(params![id.as_str()])
                .map_err(|e| Error::storage("delete_embedding", e))?;
            Ok(changed > 0)
        })
    }

    /// Counts stored vectors.
    pub fn count(&self) -> Result<u64> {
        self.storage.with_conn(|conn| {
            conn.query_row("SELECT COUNT(*) FROM observation_embeddings", [], |row| {
                row.get::<_, i64>(0)
            })
            .map(|n| n.max(0) as u64)
            .map_err(|e| Error::storage("count_embeddings", e))
        })
    }
}
