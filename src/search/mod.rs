//! Search engine: keyword FTS, vector KNN, and hybrid fusion.
//!
//! Keyword search rides the FTS5 index with BM25 ranking and snippets.
//! When the embedding worker is ready and a query string is given, the
//! hybrid path embeds the query, runs both engines, and fuses the rankings
//! with reciprocal-rank fusion; with the worker down it degrades to
//! keyword-only without surfacing an error.

mod rrf;

pub use rrf::{RrfConfig, fuse};

use crate::embedding::EmbeddingHandle;
use crate::models::{Kind, Observation, ObservationId};
use crate::storage::{EmbeddingStore, Storage, observations_read_row};
use crate::{Error, Result};
use rusqlite::params;
use std::collections::HashMap;
use std::sync::Arc;

/// Options shared by the search operations.
#[derive(Debug, Clone)]
pub struct SearchOptions {
    /// Maximum results.
    pub limit: usize,
    /// Restrict to one kind.
    pub kind: Option<Kind>,
    /// Include noise rows past the grace period.
    pub include_purged: bool,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            limit: 10,
            kind: None,
            include_purged: false,
        }
    }
}

/// One scored search result.
#[derive(Debug, Clone)]
pub struct SearchHit {
    /// The matching observation.
    pub observation: Observation,
    /// Engine-specific score; higher is better.
    pub score: f32,
    /// Matched-region snippet, for keyword hits.
    pub snippet: Option<String>,
}

/// Hybrid keyword + vector search over one database.
#[derive(Clone)]
pub struct SearchEngine {
    storage: Arc<Storage>,
    embeddings: EmbeddingStore,
    handle: Arc<EmbeddingHandle>,
}

impl SearchEngine {
    /// Creates a search engine over the shared database.
    #[must_use]
    pub fn new(
        storage: Arc<Storage>,
        embeddings: EmbeddingStore,
        handle: Arc<EmbeddingHandle>,
    ) -> Self {
        Self {
            storage,
            embeddings,
            handle,
        }
    }

    /// BM25-ranked full-text search with snippets.
    pub fn search_keyword(
        &self,
        project_hash: &str,
        query: &str,
        options: &SearchOptions,
    ) -> Result<Vec<SearchHit>> {
        let Some(fts_query) = build_fts_query(query) else {
            return Ok(Vec::new());
        };

        let mut sql = String::from(
            "SELECT o.*, bm25(observations_fts) AS rank,
                    snippet(observations_fts, 1, '[', ']', '…', 12) AS snip
             FROM observations_fts
             JOIN observations o ON o.rowid = observations_fts.rowid
             WHERE observations_fts MATCH ?1
               AND o.project_hash = ?2
               AND o.deleted_at IS NULL",
        );
        let mut values: Vec<Box<dyn rusqlite::types::ToSql>> =
            vec![Box::new(fts_query), Box::new(project_hash.to_string())];

        if let Some(kind) = options.kind {
            values.push(Box::new(kind.as_str()));
            sql.push_str(&format!(" AND o.kind = ?{}", values.len()));
        }
        if !options.include_purged {
            let cutoff = crate::storage::noise_cutoff_millis();
            values.push(Box::new(cutoff));
            sql.push_str(&format!(
                " AND NOT (o.classification = 'noise' AND o.created_at < ?{})",
                values.len()
            ));
        }
        values.push(Box::new(options.limit as i64));
        sql.push_str(&format!(" ORDER BY rank LIMIT ?{}", values.len()));

        metrics::counter!("laminark_fts_searches_total").increment(1);
        self.storage.with_conn(|conn| {
            let mut stmt = conn
                .prepare_cached(&sql)
                .map_err(|e| Error::storage("prepare_fts_search", e))?;
            let rows = stmt
                .query_map(
                    rusqlite::params_from_iter(values.iter().map(|v| v.as_ref())),
                    |row| {
                        let observation = observations_read_row(row)?;
                        let rank: f64 = row.get("rank")?;
                        let snippet: Option<String> = row.get("snip")?;
                        Ok(SearchHit {
                            observation,
                            // bm25() returns "smaller is better"; negate so
                            // callers can treat scores uniformly.
                            score: -(rank as f32),
                            snippet,
                        })
                    },
                )
                .map_err(|e| Error::storage("fts_search", e))?;
            rows.collect::<std::result::Result<Vec<_>, _>>()
                .map_err(|e| Error::storage("fts_search", e))
        })
    }

    /// Project-scoped nearest-neighbour search.
    pub fn search_vector(
        &self,
        project_hash: &str,
        query_vec: &[f32],
        options: &SearchOptions,
    ) -> Result<Vec<SearchHit>> {
        let neighbours = self
            .embeddings
            .search(project_hash, query_vec, options.limit)?;
        let mut hits = Vec::with_capacity(neighbours.len());
        for (id, distance) in neighbours {
            if let Some(observation) = self.load(project_hash, &id)? {
                if options.kind.is_some_and(|k| observation.kind != k) {
                    continue;
                }
                hits.push(SearchHit {
                    observation,
                    score: 1.0 - distance,
                    snippet: None,
                });
            }
        }
        Ok(hits)
    }

    /// Hybrid search: keyword plus vector, fused with RRF.
    ///
    /// Falls back to keyword-only when the embedding worker is not ready or
    /// the query cannot be embedded.
    pub fn search_hybrid(
        &self,
        project_hash: &str,
        query: &str,
        options: &SearchOptions,
    ) -> Result<Vec<SearchHit>> {
        let keyword_hits = self.search_keyword(project_hash, query, options)?;

        let query_vec = if self.handle.is_ready() {
            self.handle.embed(query)
        } else {
            None
        };
        let Some(query_vec) = query_vec else {
            return Ok(keyword_hits);
        };
        let vector_hits = self.search_vector(project_hash, &query_vec, options)?;
        if vector_hits.is_empty() {
            return Ok(keyword_hits);
        }

        let mut by_id: HashMap<ObservationId, SearchHit> = HashMap::new();
        let mut recency: HashMap<ObservationId, i64> = HashMap::new();
        let keyword_ranking: Vec<ObservationId> = keyword_hits
            .iter()
            .map(|h| h.observation.id.clone())
            .collect();
        let vector_ranking: Vec<ObservationId> = vector_hits
            .iter()
            .map(|h| h.observation.id.clone())
            .collect();
        for hit in keyword_hits.into_iter().chain(vector_hits) {
            recency.insert(hit.observation.id.clone(), hit.observation.created_at.timestamp_millis());
            by_id.entry(hit.observation.id.clone()).or_insert(hit);
        }

        let fused = fuse(
            &[keyword_ranking, vector_ranking],
            &recency,
            RrfConfig::with_limit(options.limit),
        );

        Ok(fused
            .into_iter()
            .filter_map(|(id, score)| {
                by_id.remove(&id).map(|mut hit| {
                    hit.score = score;
                    hit
                })
            })
            .collect())
    }

    fn load(&self, project_hash: &str, id: &ObservationId) -> Result<Option<Observation>> {
        self.storage.with_conn(|conn| {
            use rusqlite::OptionalExtension;
            conn.prepare_cached(
                "SELECT * FROM observations
                 WHERE id = ?1 AND project_hash = ?2 AND deleted_at IS NULL",
            )
            .map_err(|e| Error::storage("prepare_search_load", e))?
            .query_row(params![id.as_str(), project_hash], observations_read_row)
            .optional()
            .map_err(|e| Error::storage("search_load", e))
        })
    }
}

/// Builds an FTS5 MATCH expression from free text.
///
/// Tokens are quoted so user punctuation cannot change the query grammar,
/// then OR-joined for recall over precision; BM25 ordering does the rest.
#[must_use]
pub fn build_fts_query(query: &str) -> Option<String> {
    let tokens: Vec<String> = query
        .split(|c: char| !c.is_alphanumeric() && c != '_')
        .filter(|t| !t.is_empty())
        .map(|t| format!("\"{t}\""))
        .collect();
    if tokens.is_empty() {
        None
    } else {
        Some(tokens.join(" OR "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::NewObservation;
    use crate::storage::ObservationStore;

    fn engine_with_store() -> (SearchEngine, ObservationStore) {
        let storage = Storage::in_memory().unwrap();
        let store = ObservationStore::new(Arc::clone(&storage), "proj-a");
        let engine = SearchEngine::new(
            Arc::clone(&storage),
            EmbeddingStore::new(Arc::clone(&storage)),
            Arc::new(EmbeddingHandle::disabled()),
        );
        (engine, store)
    }

    fn seed(store: &ObservationStore, title: Option<&str>, content: &str, kind: Kind) {
        store
            .create(NewObservation {
                title: title.map(ToString::to_string),
                content: content.to_string(),
                source: "manual".to_string(),
                kind: Some(kind),
                ..Default::default()
            })
            .unwrap();
    }

    #[test]
    fn keyword_search_ranks_and_snips() {
        let (engine, store) = engine_with_store();
        seed(&store, Some("auth bug"), "the authentication token expires early", Kind::Finding);
        seed(&store, None, "refactored the parser module", Kind::Change);

        let hits = engine
            .search_keyword("proj-a", "authentication token", &SearchOptions::default())
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert!(hits[0].snippet.as_deref().unwrap_or("").contains('['));
    }

    #[test]
    fn keyword_search_survives_punctuation() {
        let (engine, store) = engine_with_store();
        seed(&store, None, "fixed src/auth.rs helper", Kind::Change);
        let hits = engine
            .search_keyword("proj-a", "src/auth.rs \"quoted\" AND", &SearchOptions::default())
            .unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[test]
    fn kind_filter_applies() {
        let (engine, store) = engine_with_store();
        seed(&store, None, "token parsing finding", Kind::Finding);
        seed(&store, None, "token parsing change", Kind::Change);

        let hits = engine
            .search_keyword(
                "proj-a",
                "token parsing",
                &SearchOptions {
                    kind: Some(Kind::Change),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].observation.kind, Kind::Change);
    }

    #[test]
    fn hybrid_degrades_to_keyword_without_worker() {
        let (engine, store) = engine_with_store();
        seed(&store, None, "cache invalidation strategy", Kind::Decision);
        let hits = engine
            .search_hybrid("proj-a", "cache invalidation", &SearchOptions::default())
            .unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[test]
    fn empty_query_returns_nothing() {
        let (engine, _store) = engine_with_store();
        assert!(engine
            .search_keyword("proj-a", "!!! ???", &SearchOptions::default())
            .unwrap()
            .is_empty());
        assert!(build_fts_query("   ").is_none());
    }
}
