//! Observation store: the one place that writes observation rows.
//!
//! Every producer (admission filter, explicit save, ingestion, curation
//! merge) goes through this store. The project binding is fixed at
//! construction; callers cannot widen it.

use super::{Storage, from_millis, to_millis};
use crate::models::{
    Classification, Kind, MAX_CONTENT_BYTES, MAX_TITLE_CHARS, NewObservation, Observation,
    ObservationId, ObservationPatch,
};
use crate::{Error, Result};
use chrono::{DateTime, Duration, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};
use std::sync::Arc;

/// Grace period during which noise-classified rows stay visible in default
/// listings, so a user can see (and contest) fresh noise verdicts.
const NOISE_GRACE_SECONDS: i64 = 60;

/// Filtered listing options.
#[derive(Debug, Clone)]
pub struct ListOptions {
    /// Restrict to one kind.
    pub kind: Option<Kind>,
    /// Restrict to one classification.
    pub classification: Option<Classification>,
    /// Restrict to sources starting with this prefix (e.g. `ingest:`).
    pub source_prefix: Option<String>,
    /// Only rows created at or after this time.
    pub since: Option<DateTime<Utc>>,
    /// Maximum rows returned.
    pub limit: usize,
    /// Include soft-deleted rows.
    pub include_deleted: bool,
    /// Include noise rows past their grace period.
    pub include_purged: bool,
}

impl Default for ListOptions {
    fn default() -> Self {
        Self {
            kind: None,
            classification: None,
            source_prefix: None,
            since: None,
            limit: 50,
            include_deleted: false,
            include_purged: false,
        }
    }
}

/// Project-bound store for observation rows.
#[derive(Clone)]
pub struct ObservationStore {
    storage: Arc<Storage>,
    project_hash: String,
}

impl ObservationStore {
    /// Creates a store bound to one project.
    #[must_use]
    pub fn new(storage: Arc<Storage>, project_hash: impl Into<String>) -> Self {
        Self {
            storage,
            project_hash: project_hash.into(),
        }
    }

    /// Returns the project binding.
    #[must_use]
    pub fn project_hash(&self) -> &str {
        &self.project_hash
    }

    /// Returns the underlying storage handle.
    #[must_use]
    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    /// Creates an observation with classification left unset.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ValidationRejected`] when length bounds are violated
    /// or the content is empty.
    pub fn create(&self, input: NewObservation) -> Result<Observation> {
        self.insert(input, Classification::Unset)
    }

    /// Creates an observation with an up-front classification.
    ///
    /// Used by ingestion so imported sections bypass the noise-filter grace
    /// period machinery entirely.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ValidationRejected`] when length bounds are violated.
    pub fn create_classified(
        &self,
        input: NewObservation,
        classification: Classification,
    ) -> Result<Observation> {
        self.insert(input, classification)
    }

    fn insert(&self, input: NewObservation, classification: Classification) -> Result<Observation> {
        validate(&input)?;
        let now = Utc::now();
        let obs = Observation {
            id: ObservationId::random(),
            project_hash: self.project_hash.clone(),
            session_id: input.session_id,
            title: input.title,
            content: input.content,
            source: if input.source.is_empty() {
                "manual".to_string()
            } else {
                input.source
            },
            kind: input.kind.unwrap_or(Kind::Finding),
            classification,
            embedding_model: None,
            embedding_version: None,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        };

        self.storage.with_conn(|conn| {
            let mut stmt = conn
                .prepare_cached(
                    "INSERT INTO observations
                     (id, project_hash, session_id, title, content, source, kind,
                      classification, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                )
                .map_err(|e| Error::storage("prepare_insert_observation", e))?;
            stmt.execute(params![
                obs.id.as_str(),
                obs.project_hash,
                obs.session_id,
                obs.title,
                obs.content,
                obs.source,
                obs.kind.as_str(),
                obs.classification.as_str(),
                to_millis(obs.created_at),
                to_millis(obs.updated_at),
            ])
            .map_err(|e| Error::storage("insert_observation", e))?;
            Ok(())
        })?;

        metrics::counter!("laminark_observations_created_total").increment(1);
        Ok(obs)
    }

    /// Applies a restricted-field patch.
    ///
    /// Only title, content, classification, and embedding metadata are
    /// patchable; the type system rejects anything else.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] when the id is unknown in this project.
    pub fn update(&self, id: &ObservationId, patch: &ObservationPatch) -> Result<Observation> {
        if patch.is_empty() {
            return self
                .get_any(id)?
                .ok_or_else(|| Error::NotFound(format!("observation {id}")));
        }

        self.storage.with_conn(|conn| {
            let mut sets = vec!["updated_at = ?1".to_string()];
            let mut values: Vec<Box<dyn rusqlite::types::ToSql>> =
                vec![Box::new(to_millis(Utc::now()))];

            if let Some(title) = &patch.title {
                values.push(Box::new(title.clone()));
                sets.push(format!("title = ?{}", values.len()));
            }
            if let Some(content) = &patch.content {
                values.push(Box::new(content.clone()));
                sets.push(format!("content = ?{}", values.len()));
            }
            if let Some(classification) = patch.classification {
                values.push(Box::new(classification.as_str()));
                sets.push(format!("classification = ?{}", values.len()));
            }
            if let Some((model, version)) = &patch.embedding {
                values.push(Box::new(model.clone()));
                sets.push(format!("embedding_model = ?{}", values.len()));
                values.push(Box::new(version.clone()));
                sets.push(format!("embedding_version = ?{}", values.len()));
            }

            values.push(Box::new(id.as_str().to_string()));
            let id_param = values.len();
            values.push(Box::new(self.project_hash.clone()));
            let project_param = values.len();

            let sql = format!(
                "UPDATE observations SET {} WHERE id = ?{id_param} AND project_hash = ?{project_param}",
                sets.join(", ")
            );
            let changed = conn
                .execute(&sql, rusqlite::params_from_iter(values.iter().map(|v| v.as_ref())))
                .map_err(|e| Error::storage("update_observation", e))?;
            if changed == 0 {
                return Err(Error::NotFound(format!("observation {id}")));
            }
            Ok(())
        })?;

        self.get_any(id)?
            .ok_or_else(|| Error::NotFound(format!("observation {id}")))
    }

    /// Soft-deletes an observation. Returns false if the id is unknown.
    pub fn soft_delete(&self, id: &ObservationId) -> Result<bool> {
        let now = to_millis(Utc::now());
        self.storage.with_conn(|conn| {
            let changed = conn
                .prepare_cached(
                    "UPDATE observations SET deleted_at = ?1, updated_at = ?1
                     WHERE id = ?2 AND project_hash = ?3 AND deleted_at IS NULL",
                )
                .map_err(|e| Error::storage("prepare_soft_delete", e))?
                .execute(params![now, id.as_str(), self.project_hash])
                .map_err(|e| Error::storage("soft_delete_observation", e))?;
            Ok(changed > 0)
        })
    }

    /// Clears a soft delete. Returns false if the id is unknown.
    pub fn restore(&self, id: &ObservationId) -> Result<bool> {
        let now = to_millis(Utc::now());
        self.storage.with_conn(|conn| {
            let changed = conn
                .prepare_cached(
                    "UPDATE observations SET deleted_at = NULL, updated_at = ?1
                     WHERE id = ?2 AND project_hash = ?3 AND deleted_at IS NOT NULL",
                )
                .map_err(|e| Error::storage("prepare_restore", e))?
                .execute(params![now, id.as_str(), self.project_hash])
                .map_err(|e| Error::storage("restore_observation", e))?;
            Ok(changed > 0)
        })
    }

    /// Fetches one alive observation.
    pub fn get(&self, id: &ObservationId) -> Result<Option<Observation>> {
        self.fetch(id, false)
    }

    /// Fetches one observation, including soft-deleted rows.
    pub fn get_any(&self, id: &ObservationId) -> Result<Option<Observation>> {
        self.fetch(id, true)
    }

    fn fetch(&self, id: &ObservationId, include_deleted: bool) -> Result<Option<Observation>> {
        self.storage.with_conn(|conn| {
            let sql = if include_deleted {
                "SELECT * FROM observations WHERE id = ?1 AND project_hash = ?2"
            } else {
                "SELECT * FROM observations
                 WHERE id = ?1 AND project_hash = ?2 AND deleted_at IS NULL"
            };
            conn.prepare_cached(sql)
                .map_err(|e| Error::storage("prepare_get_observation", e))?
                .query_row(params![id.as_str(), self.project_hash], read_observation)
                .optional()
                .map_err(|e| Error::storage("get_observation", e))
        })
    }

    /// Filtered listing, newest first with a rowid tiebreaker.
    ///
    /// Noise-classified rows older than the grace period are excluded
    /// unless `include_purged` is set or the classification filter asks
    /// for them explicitly.
    pub fn list(&self, options: &ListOptions) -> Result<Vec<Observation>> {
        let mut sql = String::from("SELECT * FROM observations WHERE project_hash = ?1");
        let mut values: Vec<Box<dyn rusqlite::types::ToSql>> =
            vec![Box::new(self.project_hash.clone())];

        if !options.include_deleted {
            sql.push_str(" AND deleted_at IS NULL");
        }
        if let Some(kind) = options.kind {
            values.push(Box::new(kind.as_str()));
            sql.push_str(&format!(" AND kind = ?{}", values.len()));
        }
        if let Some(classification) = options.classification {
            values.push(Box::new(classification.as_str()));
            sql.push_str(&format!(" AND classification = ?{}", values.len()));
        }
        if let Some(prefix) = &options.source_prefix {
            values.push(Box::new(format!("{}%", escape_like(prefix))));
            sql.push_str(&format!(" AND source LIKE ?{} ESCAPE '\\'", values.len()));
        }
        if let Some(since) = options.since {
            values.push(Box::new(to_millis(since)));
            sql.push_str(&format!(" AND created_at >= ?{}", values.len()));
        }

        let wants_noise = options.include_purged
            || options.classification == Some(Classification::Noise);
        if !wants_noise {
            let cutoff = to_millis(Utc::now() - Duration::seconds(NOISE_GRACE_SECONDS));
            values.push(Box::new(cutoff));
            sql.push_str(&format!(
                " AND NOT (classification = 'noise' AND created_at < ?{})",
                values.len()
            ));
        }

        sql.push_str(" ORDER BY created_at DESC, rowid DESC");
        values.push(Box::new(options.limit as i64));
        sql.push_str(&format!(" LIMIT ?{}", values.len()));

        self.storage.with_conn(|conn| {
            let mut stmt = conn
                .prepare(&sql)
                .map_err(|e| Error::storage("prepare_list_observations", e))?;
            let rows = stmt
                .query_map(
                    rusqlite::params_from_iter(values.iter().map(|v| v.as_ref())),
                    read_observation,
                )
                .map_err(|e| Error::storage("list_observations", e))?;
            rows.collect::<std::result::Result<Vec<_>, _>>()
                .map_err(|e| Error::storage("list_observations", e))
        })
    }

    /// Finds an alive observation with byte-identical content.
    pub fn find_exact(&self, content: &str) -> Result<Option<ObservationId>> {
        self.storage.with_conn(|conn| {
            conn.prepare_cached(
                "SELECT id FROM observations
                 WHERE project_hash = ?1 AND content = ?2 AND deleted_at IS NULL
                 ORDER BY created_at DESC LIMIT 1",
            )
            .map_err(|e| Error::storage("prepare_find_exact", e))?
            .query_row(params![self.project_hash, content], |row| {
                row.get::<_, String>(0).map(ObservationId::from)
            })
            .optional()
            .map_err(|e| Error::storage("find_exact", e))
        })
    }

    /// Counts alive observations in this project.
    pub fn count_alive(&self) -> Result<u64> {
        self.storage.with_conn(|conn| {
            conn.prepare_cached(
                "SELECT COUNT(*) FROM observations
                 WHERE project_hash = ?1 AND deleted_at IS NULL",
            )
            .map_err(|e| Error::storage("prepare_count_alive", e))?
            .query_row(params![self.project_hash], |row| row.get::<_, i64>(0))
            .map(|n| n.max(0) as u64)
            .map_err(|e| Error::storage("count_alive", e))
        })
    }

    /// Selects the newest observations whose classification is unset,
    /// project-agnostic: the enricher serves all projects from one queue.
    pub fn unclassified_batch(storage: &Storage, limit: usize) -> Result<Vec<Observation>> {
        storage.with_conn(|conn| {
            let mut stmt = conn
                .prepare_cached(
                    "SELECT * FROM observations
                     WHERE classification = 'unset' AND deleted_at IS NULL
                     ORDER BY created_at DESC, project_hash LIMIT ?1",
                )
                .map_err(|e| Error::storage("prepare_unclassified_batch", e))?;
            let rows = stmt
                .query_map(params![limit as i64], read_observation)
                .map_err(|e| Error::storage("unclassified_batch", e))?;
            rows.collect::<std::result::Result<Vec<_>, _>>()
                .map_err(|e| Error::storage("unclassified_batch", e))
        })
    }

    /// Records embedding completion on an observation row, project-agnostic:
    /// the embedding pipeline serves all projects from one queue.
    pub fn mark_embedded(storage: &Storage, id: &ObservationId, model: &str) -> Result<()> {
        storage.with_conn(|conn| {
            conn.prepare_cached(
                "UPDATE observations
                 SET embedding_model = ?1, embedding_version = '1', updated_at = ?2
                 WHERE id = ?3",
            )
            .map_err(|e| Error::storage("prepare_mark_embedded", e))?
            .execute(params![model, to_millis(Utc::now()), id.as_str()])
            .map_err(|e| Error::storage("mark_embedded", e))?;
            Ok(())
        })
    }
}

/// Validates length bounds for a new observation.
fn validate(input: &NewObservation) -> Result<()> {
    if input.content.is_empty() {
        return Err(Error::ValidationRejected("content is empty".to_string()));
    }
    if input.content.len() > MAX_CONTENT_BYTES {
        return Err(Error::ValidationRejected(format!(
            "content exceeds {MAX_CONTENT_BYTES} bytes"
        )));
    }
    if let Some(title) = &input.title {
        if title.chars().count() > MAX_TITLE_CHARS {
            return Err(Error::ValidationRejected(format!(
                "title exceeds {MAX_TITLE_CHARS} characters"
            )));
        }
    }
    Ok(())
}

/// Millisecond cutoff below which noise-classified rows leave default views.
pub(crate) fn noise_cutoff_millis() -> i64 {
    to_millis(Utc::now() - Duration::seconds(NOISE_GRACE_SECONDS))
}

/// Escapes SQL LIKE wildcards so user text matches literally.
fn escape_like(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Maps a `SELECT *` row to an [`Observation`].
pub(crate) fn read_observation(row: &Row<'_>) -> rusqlite::Result<Observation> {
    let kind_str: String = row.get("kind")?;
    let class_str: String = row.get("classification")?;
    Ok(Observation {
        id: ObservationId::from(row.get::<_, String>("id")?),
        project_hash: row.get("project_hash")?,
        session_id: row.get("session_id")?,
        title: row.get("title")?,
        content: row.get("content")?,
        source: row.get("source")?,
        kind: Kind::parse(&kind_str).unwrap_or(Kind::Finding),
        classification: Classification::parse(&class_str).unwrap_or_default(),
        embedding_model: row.get("embedding_model")?,
        embedding_version: row.get("embedding_version")?,
        created_at: from_millis(row.get("created_at")?),
        updated_at: from_millis(row.get("updated_at")?),
        deleted_at: row.get::<_, Option<i64>>("deleted_at")?.map(from_millis),
    })
}

/// Verifies FTS consistency for one project: every alive row indexed, every
/// dead row absent.
///
/// # Errors
///
/// Returns [`Error::Integrity`] naming the first inconsistent id.
pub(crate) fn check_fts_consistency(conn: &Connection, project_hash: &str) -> Result<()> {
    let missing: Option<String> = conn
        .query_row(
            "SELECT o.id FROM observations o
             WHERE o.project_hash = ?1 AND o.deleted_at IS NULL
               AND o.rowid NOT IN (SELECT rowid FROM observations_fts)
             LIMIT 1",
            params![project_hash],
            |row| row.get(0),
        )
        .optional()
        .map_err(|e| Error::storage("check_fts_consistency", e))?;
    if let Some(id) = missing {
        return Err(Error::Integrity(format!(
            "alive observation {id} missing from FTS index"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> ObservationStore {
        let storage = Storage::in_memory().unwrap();
        ObservationStore::new(storage, "proj-a")
    }

    fn new_obs(content: &str) -> NewObservation {
        NewObservation {
            content: content.to_string(),
            source: "manual".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn create_and_get_round_trip() {
        let store = store();
        let obs = store.create(new_obs("hello world")).unwrap();
        let fetched = store.get(&obs.id).unwrap().unwrap();
        assert_eq!(fetched.content, "hello world");
        assert_eq!(fetched.kind, Kind::Finding);
        assert_eq!(fetched.classification, Classification::Unset);
    }

    #[test]
    fn create_rejects_oversized_content() {
        let store = store();
        let big = "x".repeat(MAX_CONTENT_BYTES + 1);
        let err = store.create(new_obs(&big)).unwrap_err();
        assert!(matches!(err, Error::ValidationRejected(_)));
    }

    #[test]
    fn create_rejects_oversized_title() {
        let store = store();
        let mut input = new_obs("fine");
        input.title = Some("t".repeat(MAX_TITLE_CHARS + 1));
        assert!(matches!(
            store.create(input),
            Err(Error::ValidationRejected(_))
        ));
    }

    #[test]
    fn soft_delete_and_restore() {
        let store = store();
        let obs = store.create(new_obs("ephemeral")).unwrap();

        assert!(store.soft_delete(&obs.id).unwrap());
        assert!(store.get(&obs.id).unwrap().is_none());
        assert!(store.get_any(&obs.id).unwrap().is_some());
        assert!(store.list(&ListOptions::default()).unwrap().is_empty());

        assert!(store.restore(&obs.id).unwrap());
        assert_eq!(store.list(&ListOptions::default()).unwrap().len(), 1);

        // Unknown ids report false rather than erroring.
        assert!(!store.soft_delete(&ObservationId::from("nope")).unwrap());
        assert!(!store.restore(&obs.id).unwrap());
    }

    #[test]
    fn update_is_restricted_to_patch_fields() {
        let store = store();
        let obs = store.create(new_obs("original")).unwrap();
        let patch = ObservationPatch {
            classification: Some(Classification::Discovery),
            ..Default::default()
        };
        let updated = store.update(&obs.id, &patch).unwrap();
        assert_eq!(updated.classification, Classification::Discovery);
        assert_eq!(updated.content, "original");
    }

    #[test]
    fn project_isolation_on_reads() {
        let storage = Storage::in_memory().unwrap();
        let store_a = ObservationStore::new(Arc::clone(&storage), "proj-a");
        let store_b = ObservationStore::new(storage, "proj-b");

        let obs = store_a.create(new_obs("a-only")).unwrap();
        assert!(store_b.get(&obs.id).unwrap().is_none());
        assert!(store_b.list(&ListOptions::default()).unwrap().is_empty());
        assert_eq!(store_a.list(&ListOptions::default()).unwrap().len(), 1);
    }

    #[test]
    fn noise_grace_period_filtering() {
        let store = store();
        let fresh = store
            .create_classified(new_obs("fresh noise"), Classification::Noise)
            .unwrap();

        // Within the grace period the row is still listed.
        let listed = store.list(&ListOptions::default()).unwrap();
        assert_eq!(listed.len(), 1);

        // Age the row past the grace period by hand.
        let old = to_millis(Utc::now() - Duration::seconds(NOISE_GRACE_SECONDS + 5));
        store
            .storage
            .with_conn(|conn| {
                conn.execute(
                    "UPDATE observations SET created_at = ?1 WHERE id = ?2",
                    params![old, fresh.id.as_str()],
                )
                .map_err(|e| Error::storage("test_age", e))
            })
            .unwrap();

        assert!(store.list(&ListOptions::default()).unwrap().is_empty());

        let purged = store
            .list(&ListOptions {
                include_purged: true,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(purged.len(), 1);
    }

    #[test]
    fn unclassified_batch_is_newest_first() {
        let store = store();
        let a = store.create(new_obs("first")).unwrap();
        let b = store.create(new_obs("second")).unwrap();
        store
            .update(
                &a.id,
                &ObservationPatch {
                    classification: Some(Classification::Solution),
                    ..Default::default()
                },
            )
            .unwrap();

        let batch = ObservationStore::unclassified_batch(store.storage(), 10).unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].id, b.id);
    }

    #[test]
    fn fts_consistency_check_passes() {
        let store = store();
        store.create(new_obs("indexed text")).unwrap();
        store
            .storage
            .with_conn(|conn| check_fts_consistency(conn, "proj-a"))
            .unwrap();
    }
}
