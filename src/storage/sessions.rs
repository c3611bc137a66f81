//! Sessions, context stashes, shift decisions, and threshold history.

use super::{Storage, from_millis, to_millis};
use crate::models::{ContextStash, ObservationSnapshot, Session, ShiftDecision, StashStatus, ThresholdSeed};
use crate::{Error, Result};
use chrono::Utc;
use rusqlite::{OptionalExtension, Row, params};
use std::sync::Arc;

/// Store for session rows and topic-shift bookkeeping.
#[derive(Clone)]
pub struct SessionStore {
    storage: Arc<Storage>,
}

impl SessionStore {
    /// Creates a session store over the shared database.
    #[must_use]
    pub const fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }

    /// Records a session start (idempotent on the session id).
    pub fn start_session(&self, id: &str, project_hash: &str) -> Result<()> {
        self.storage.with_conn(|conn| {
            conn.prepare_cached(
                "INSERT OR IGNORE INTO sessions (id, project_hash, started_at)
                 VALUES (?1, ?2, ?3)",
            )
            .map_err(|e| Error::storage("prepare_start_session", e))?
            .execute(params![id, project_hash, to_millis(Utc::now())])
            .map_err(|e| Error::storage("start_session", e))?;
            Ok(())
        })
    }

    /// Marks a session ended and stores its summary.
    pub fn end_session(&self, id: &str, summary: Option<&str>) -> Result<bool> {
        self.storage.with_conn(|conn| {
            let changed = conn
                .prepare_cached(
                    "UPDATE sessions SET ended_at = ?1, summary = ?2
                     WHERE id = ?3 AND ended_at IS NULL",
                )
                .map_err(|e| Error::storage("prepare_end_session", e))?
                .execute(params![to_millis(Utc::now()), summary, id])
                .map_err(|e| Error::storage("end_session", e))?;
            Ok(changed > 0)
        })
    }

    /// Fetches one session.
    pub fn get(&self, id: &str) -> Result<Option<Session>> {
        self.storage.with_conn(|conn| {
            conn.prepare_cached("SELECT * FROM sessions WHERE id = ?1")
                .map_err(|e| Error::storage("prepare_get_session", e))?
                .query_row(params![id], read_session)
                .optional()
                .map_err(|e| Error::storage("get_session", e))
        })
    }

    /// Returns the most recently completed session for a project.
    pub fn last_completed(&self, project_hash: &str) -> Result<Option<Session>> {
        self.storage.with_conn(|conn| {
            conn.prepare_cached(
                "SELECT * FROM sessions
                 WHERE project_hash = ?1 AND ended_at IS NOT NULL
                 ORDER BY ended_at DESC LIMIT 1",
            )
            .map_err(|e| Error::storage("prepare_last_completed", e))?
            .query_row(params![project_hash], read_session)
            .optional()
            .map_err(|e| Error::storage("last_completed", e))
        })
    }

    /// Persists a context stash.
    pub fn insert_stash(&self, stash: &ContextStash) -> Result<()> {
        let snapshots = serde_json::to_string(&stash.snapshots)
            .map_err(|e| Error::storage("serialize_snapshots", e))?;
        self.storage.with_conn(|conn| {
            conn.prepare_cached(
                "INSERT INTO context_stashes
                 (id, project_hash, topic, summary, status, snapshots, created_at, resumed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            )
            .map_err(|e| Error::storage("prepare_insert_stash", e))?
            .execute(params![
                stash.id,
                stash.project_hash,
                stash.topic,
                stash.summary,
                stash.status.as_str(),
                snapshots,
                to_millis(stash.created_at),
                stash.resumed_at.map(to_millis),
            ])
            .map_err(|e| Error::storage("insert_stash", e))?;
            Ok(())
        })
    }

    /// Lists recent stashes for a project, newest first.
    pub fn recent_stashes(&self, project_hash: &str, limit: usize) -> Result<Vec<ContextStash>> {
        self.storage.with_conn(|conn| {
            let mut stmt = conn
                .prepare_cached(
                    "SELECT * FROM context_stashes WHERE project_hash = ?1
                     ORDER BY created_at DESC LIMIT ?2",
                )
                .map_err(|e| Error::storage("prepare_recent_stashes", e))?;
            let rows = stmt
                .query_map(params![project_hash, limit as i64], read_stash)
                .map_err(|e| Error::storage("recent_stashes", e))?;
            rows.collect::<std::result::Result<Vec<_>, _>>()
                .map_err(|e| Error::storage("recent_stashes", e))
        })
    }

    /// Marks a stash resumed.
    pub fn resume_stash(&self, id: &str) -> Result<bool> {
        self.storage.with_conn(|conn| {
            let changed = conn
                .prepare_cached(
                    "UPDATE context_stashes SET status = 'resumed', resumed_at = ?1
                     WHERE id = ?2 AND status = 'stashed'",
                )
                .map_err(|e| Error::storage("prepare_resume_stash", e))?
                .execute(params![to_millis(Utc::now()), id])
                .map_err(|e| Error::storage("resume_stash", e))?;
            Ok(changed > 0)
        })
    }

    /// Logs one topic-shift evaluation.
    pub fn record_shift_decision(&self, decision: &ShiftDecision) -> Result<()> {
        self.storage.with_conn(|conn| {
            conn.prepare_cached(
                "INSERT INTO shift_decisions
                 (project_hash, session_id, distance, threshold, ewma_mean, ewma_variance,
                  shifted, confidence, stash_id, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            )
            .map_err(|e| Error::storage("prepare_record_shift", e))?
            .execute(params![
                decision.project_hash,
                decision.session_id,
                decision.distance,
                decision.threshold,
                decision.ewma_mean,
                decision.ewma_variance,
                i64::from(decision.shifted),
                decision.confidence,
                decision.stash_id,
                to_millis(decision.created_at),
            ])
            .map_err(|e| Error::storage("record_shift", e))?;
            Ok(())
        })
    }

    /// Counts shift decisions, optionally only confirmed shifts.
    pub fn count_shift_decisions(&self, project_hash: &str, shifted_only: bool) -> Result<u64> {
        self.storage.with_conn(|conn| {
            let sql = if shifted_only {
                "SELECT COUNT(*) FROM shift_decisions WHERE project_hash = ?1 AND shifted = 1"
            } else {
                "SELECT COUNT(*) FROM shift_decisions WHERE project_hash = ?1"
            };
            conn.prepare_cached(sql)
                .map_err(|e| Error::storage("prepare_count_shifts", e))?
                .query_row(params![project_hash], |row| row.get::<_, i64>(0))
                .map(|n| n.max(0) as u64)
                .map_err(|e| Error::storage("count_shifts", e))
        })
    }

    /// Persists the final EWMA state of a completed session.
    pub fn record_threshold(
        &self,
        project_hash: &str,
        session_id: Option<&str>,
        seed: ThresholdSeed,
    ) -> Result<()> {
        self.storage.with_conn(|conn| {
            conn.prepare_cached(
                "INSERT INTO threshold_history
                 (project_hash, session_id, ewma_mean, ewma_variance, threshold, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )
            .map_err(|e| Error::storage("prepare_record_threshold", e))?
            .execute(params![
                project_hash,
                session_id,
                seed.ewma_mean,
                seed.ewma_variance,
                seed.threshold,
                to_millis(Utc::now()),
            ])
            .map_err(|e| Error::storage("record_threshold", e))?;
            Ok(())
        })
    }

    /// Averages historical EWMA state to seed a new session's detector.
    pub fn threshold_seed(&self, project_hash: &str) -> Result<Option<ThresholdSeed>> {
        self.storage.with_conn(|conn| {
            conn.prepare_cached(
                "SELECT AVG(ewma_mean), AVG(ewma_variance), AVG(threshold), COUNT(*)
                 FROM threshold_history WHERE project_hash = ?1",
            )
            .map_err(|e| Error::storage("prepare_threshold_seed", e))?
            .query_row(params![project_hash], |row| {
                let count: i64 = row.get(3)?;
                if count == 0 {
                    return Ok(None);
                }
                Ok(Some(ThresholdSeed {
                    ewma_mean: row.get::<_, f64>(0)? as f32,
                    ewma_variance: row.get::<_, f64>(1)? as f32,
                    threshold: row.get::<_, f64>(2)? as f32,
                }))
            })
            .map_err(|e| Error::storage("threshold_seed", e))
        })
    }

    /// Registers project metadata so cross-project results can be labeled.
    pub fn register_project(&self, project_hash: &str, root: &str, name: &str) -> Result<()> {
        self.storage.with_conn(|conn| {
            conn.prepare_cached(
                "INSERT OR IGNORE INTO project_metadata (project_hash, root_path, name, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
            )
            .map_err(|e| Error::storage("prepare_register_project", e))?
            .execute(params![project_hash, root, name, to_millis(Utc::now())])
            .map_err(|e| Error::storage("register_project", e))?;
            Ok(())
        })
    }

    /// Returns a project's readable name, when registered.
    pub fn project_name(&self, project_hash: &str) -> Result<Option<String>> {
        self.storage.with_conn(|conn| {
            conn.prepare_cached("SELECT name FROM project_metadata WHERE project_hash = ?1")
                .map_err(|e| Error::storage("prepare_project_name", e))?
                .query_row(params![project_hash], |row| row.get(0))
                .optional()
                .map_err(|e| Error::storage("project_name", e))
        })
    }
}

#[allow(clippy::cast_possible_truncation)]
fn read_session(row: &Row<'_>) -> rusqlite::Result<Session> {
    Ok(Session {
        id: row.get("id")?,
        project_hash: row.get("project_hash")?,
        started_at: from_millis(row.get("started_at")?),
        ended_at: row.get::<_, Option<i64>>("ended_at")?.map(from_millis),
        summary: row.get("summary")?,
    })
}

fn read_stash(row: &Row<'_>) -> rusqlite::Result<ContextStash> {
    let status: String = row.get("status")?;
    let snapshots: String = row.get("snapshots")?;
    Ok(ContextStash {
        id: row.get("id")?,
        project_hash: row.get("project_hash")?,
        topic: row.get("topic")?,
        summary: row.get("summary")?,
        status: StashStatus::parse(&status).unwrap_or(StashStatus::Stashed),
        snapshots: serde_json::from_str::<Vec<ObservationSnapshot>>(&snapshots)
            .unwrap_or_default(),
        created_at: from_millis(row.get("created_at")?),
        resumed_at: row.get::<_, Option<i64>>("resumed_at")?.map(from_millis),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Kind, ObservationId};

    fn store() -> SessionStore {
        SessionStore::new(Storage::in_memory().unwrap())
    }

    #[test]
    fn session_lifecycle() {
        let store = store();
        store.start_session("s1", "p").unwrap();
        store.start_session("s1", "p").unwrap(); // idempotent

        assert!(store.get("s1").unwrap().unwrap().is_open());
        assert!(store.last_completed("p").unwrap().is_none());

        assert!(store.end_session("s1", Some("did things")).unwrap());
        assert!(!store.end_session("s1", None).unwrap()); // already ended

        let last = store.last_completed("p").unwrap().unwrap();
        assert_eq!(last.summary.as_deref(), Some("did things"));
    }

    #[test]
    fn stash_round_trip_and_resume() {
        let store = store();
        let stash = ContextStash {
            id: "st1".to_string(),
            project_hash: "p".to_string(),
            topic: "auth refactor".to_string(),
            summary: "three files touched".to_string(),
            status: StashStatus::Stashed,
            snapshots: vec![ObservationSnapshot {
                id: ObservationId::from("o1"),
                content: "edited auth.rs".to_string(),
                kind: Kind::Change,
                timestamp: Utc::now(),
                embedding: None,
            }],
            created_at: Utc::now(),
            resumed_at: None,
        };
        store.insert_stash(&stash).unwrap();

        let listed = store.recent_stashes("p", 10).unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].snapshots.len(), 1);

        assert!(store.resume_stash("st1").unwrap());
        assert!(!store.resume_stash("st1").unwrap());
        assert_eq!(store.recent_stashes("p", 10).unwrap()[0].status, StashStatus::Resumed);
    }

    #[test]
    fn threshold_seed_averages_history() {
        let store = store();
        assert!(store.threshold_seed("p").unwrap().is_none());

        store
            .record_threshold(
                "p",
                Some("s1"),
                ThresholdSeed { ewma_mean: 0.2, ewma_variance: 0.01, threshold: 0.3 },
            )
            .unwrap();
        store
            .record_threshold(
                "p",
                Some("s2"),
                ThresholdSeed { ewma_mean: 0.4, ewma_variance: 0.03, threshold: 0.5 },
            )
            .unwrap();

        let seed = store.threshold_seed("p").unwrap().unwrap();
        assert!((seed.ewma_mean - 0.3).abs() < 1e-6);
        assert!((seed.threshold - 0.4).abs() < 1e-6);
    }

    #[test]
    fn shift_decisions_are_counted() {
        let store = store();
        let decision = ShiftDecision {
            project_hash: "p".to_string(),
            session_id: Some("s1".to_string()),
            distance: 0.5,
            threshold: 0.3,
            ewma_mean: 0.2,
            ewma_variance: 0.01,
            shifted: true,
            confidence: 0.66,
            stash_id: Some("st1".to_string()),
            created_at: Utc::now(),
        };
        store.record_shift_decision(&decision).unwrap();
        store
            .record_shift_decision(&ShiftDecision { shifted: false, stash_id: None, ..decision })
            .unwrap();

        assert_eq!(store.count_shift_decisions("p", false).unwrap(), 2);
        assert_eq!(store.count_shift_decisions("p", true).unwrap(), 1);
    }
}
