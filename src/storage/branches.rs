//! Thought branch and membership storage.

use super::{Storage, from_millis, to_millis};
use crate::models::{
    ArcStage, BranchObservation, BranchState, BranchType, ObservationId, ThoughtBranch,
};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, Row, params};
use std::collections::HashMap;
use std::sync::Arc;

/// Store for thought branches.
#[derive(Clone)]
pub struct BranchStore {
    storage: Arc<Storage>,
}

impl BranchStore {
    /// Creates a branch store over the shared database.
    #[must_use]
    pub const fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }

    /// Creates a new active branch.
    pub fn create(&self, project_hash: &str, session_id: Option<&str>) -> Result<ThoughtBranch> {
        let now = Utc::now();
        let branch = ThoughtBranch {
            id: crate::models::new_id(),
            project_hash: project_hash.to_string(),
            session_id: session_id.map(ToString::to_string),
            state: BranchState::Active,
            branch_type: BranchType::Unknown,
            title: None,
            summary: None,
            tool_histogram: HashMap::new(),
            arc_stage: ArcStage::Investigation,
            started_at: now,
            ended_at: None,
            last_observation_at: now,
        };
        self.storage.with_conn(|conn| {
            conn.prepare_cached(
                "INSERT INTO thought_branches
                 (id, project_hash, session_id, state, branch_type, arc_stage,
                  started_at, last_observation_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            )
            .map_err(|e| Error::storage("prepare_create_branch", e))?
            .execute(params![
                branch.id,
                branch.project_hash,
                branch.session_id,
                branch.state.as_str(),
                branch.branch_type.as_str(),
                branch.arc_stage.as_str(),
                to_millis(branch.started_at),
                to_millis(branch.last_observation_at),
            ])
            .map_err(|e| Error::storage("create_branch", e))?;
            Ok(())
        })?;
        Ok(branch)
    }

    /// Fetches one branch.
    pub fn get(&self, id: &str) -> Result<Option<ThoughtBranch>> {
        self.storage.with_conn(|conn| {
            conn.prepare_cached("SELECT * FROM thought_branches WHERE id = ?1")
                .map_err(|e| Error::storage("prepare_get_branch", e))?
                .query_row(params![id], read_branch)
                .optional()
                .map_err(|e| Error::storage("get_branch", e))
        })
    }

    /// Lists branches for a project, newest first, optionally by state.
    pub fn list(
        &self,
        project_hash: &str,
        state: Option<BranchState>,
        limit: usize,
    ) -> Result<Vec<ThoughtBranch>> {
        self.storage.with_conn(|conn| {
            let rows = if let Some(state) = state {
                let mut stmt = conn
                    .prepare_cached(
                        "SELECT * FROM thought_branches
                         WHERE project_hash = ?1 AND state = ?2
                         ORDER BY started_at DESC LIMIT ?3",
                    )
                    .map_err(|e| Error::storage("prepare_list_branches", e))?;
                let mapped = stmt
                    .query_map(params![project_hash, state.as_str(), limit as i64], read_branch)
                    .map_err(|e| Error::storage("list_branches", e))?;
                mapped.collect::<std::result::Result<Vec<_>, _>>()
            } else {
                let mut stmt = conn
                    .prepare_cached(
                        "SELECT * FROM thought_branches WHERE project_hash = ?1
                         ORDER BY started_at DESC LIMIT ?2",
                    )
                    .map_err(|e| Error::storage("prepare_list_branches", e))?;
                let mapped = stmt
                    .query_map(params![project_hash, limit as i64], read_branch)
                    .map_err(|e| Error::storage("list_branches", e))?;
                mapped.collect::<std::result::Result<Vec<_>, _>>()
            };
            rows.map_err(|e| Error::storage("list_branches", e))
        })
    }

    /// Active branches older than `cutoff` (stale-abandonment input).
    pub fn stale_active(&self, cutoff: DateTime<Utc>) -> Result<Vec<ThoughtBranch>> {
        self.storage.with_conn(|conn| {
            let mut stmt = conn
                .prepare_cached(
                    "SELECT * FROM thought_branches
                     WHERE state = 'active' AND started_at < ?1",
                )
                .map_err(|e| Error::storage("prepare_stale_branches", e))?;
            let rows = stmt
                .query_map(params![to_millis(cutoff)], read_branch)
                .map_err(|e| Error::storage("stale_branches", e))?;
            rows.collect::<std::result::Result<Vec<_>, _>>()
                .map_err(|e| Error::storage("stale_branches", e))
        })
    }

    /// Appends an observation membership and refreshes branch bookkeeping
    /// (histogram, arc stage, last-observation time) in one transaction.
    pub fn append_observation(
        &self,
        branch_id: &str,
        observation_id: &ObservationId,
        arc_stage: ArcStage,
        tool_name: Option<&str>,
        histogram: &HashMap<String, u32>,
    ) -> Result<()> {
        self.storage.with_conn_mut(|conn| {
            let tx = conn
                .transaction()
                .map_err(|e| Error::storage("branch_append_begin", e))?;
            let position: i64 = tx
                .prepare_cached(
                    "SELECT COALESCE(MAX(position) + 1, 0) FROM branch_observations
                     WHERE branch_id = ?1",
                )
                .map_err(|e| Error::storage("prepare_branch_position", e))?
                .query_row(params![branch_id], |row| row.get(0))
                .map_err(|e| Error::storage("branch_position", e))?;
            tx.prepare_cached(
                "INSERT INTO branch_observations
                 (branch_id, observation_id, arc_stage, tool_name, position)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )
            .map_err(|e| Error::storage("prepare_branch_append", e))?
            .execute(params![
                branch_id,
                observation_id.as_str(),
                arc_stage.as_str(),
                tool_name,
                position,
            ])
            .map_err(|e| Error::storage("branch_append", e))?;

            let histogram_json = serde_json::to_string(histogram)
                .map_err(|e| Error::storage("serialize_histogram", e))?;
            tx.prepare_cached(
                "UPDATE thought_branches
                 SET tool_histogram = ?1, arc_stage = ?2, last_observation_at = ?3
                 WHERE id = ?4",
            )
            .map_err(|e| Error::storage("prepare_branch_touch", e))?
            .execute(params![
                histogram_json,
                arc_stage.as_str(),
                to_millis(Utc::now()),
                branch_id,
            ])
            .map_err(|e| Error::storage("branch_touch", e))?;

            tx.commit()
                .map_err(|e| Error::storage("branch_append_commit", e))?;
            Ok(())
        })
    }

    /// Memberships of one branch, in order.
    pub fn observations(&self, branch_id: &str) -> Result<Vec<BranchObservation>> {
        self.storage.with_conn(|conn| {
            let mut stmt = conn
                .prepare_cached(
                    "SELECT * FROM branch_observations WHERE branch_id = ?1 ORDER BY position",
                )
                .map_err(|e| Error::storage("prepare_branch_observations", e))?;
            let rows = stmt
                .query_map(params![branch_id], read_branch_observation)
                .map_err(|e| Error::storage("branch_observations", e))?;
            rows.collect::<std::result::Result<Vec<_>, _>>()
                .map_err(|e| Error::storage("branch_observations", e))
        })
    }

    /// Counts a branch's memberships.
    pub fn observation_count(&self, branch_id: &str) -> Result<usize> {
        self.storage.with_conn(|conn| {
            conn.prepare_cached("SELECT COUNT(*) FROM branch_observations WHERE branch_id = ?1")
                .map_err(|e| Error::storage("prepare_branch_count", e))?
                .query_row(params![branch_id], |row| row.get::<_, i64>(0))
                .map(|n| n.max(0) as usize)
                .map_err(|e| Error::storage("branch_count", e))
        })
    }

    /// Assigns a classification (type and title) to a branch.
    pub fn classify(&self, id: &str, branch_type: BranchType, title: &str) -> Result<()> {
        self.storage.with_conn(|conn| {
            conn.prepare_cached(
                "UPDATE thought_branches SET branch_type = ?1, title = ?2 WHERE id = ?3",
            )
            .map_err(|e| Error::storage("prepare_classify_branch", e))?
            .execute(params![branch_type.as_str(), title, id])
            .map_err(|e| Error::storage("classify_branch", e))?;
            Ok(())
        })
    }

    /// Transitions a branch out of the active state.
    pub fn finish(&self, id: &str, state: BranchState) -> Result<bool> {
        self.storage.with_conn(|conn| {
            let changed = conn
                .prepare_cached(
                    "UPDATE thought_branches SET state = ?1, ended_at = ?2
                     WHERE id = ?3 AND state = 'active'",
                )
                .map_err(|e| Error::storage("prepare_finish_branch", e))?
                .execute(params![state.as_str(), to_millis(Utc::now()), id])
                .map_err(|e| Error::storage("finish_branch", e))?;
            Ok(changed > 0)
        })
    }

    /// Stores a generated summary on a branch.
    pub fn set_summary(&self, id: &str, summary: &str) -> Result<()> {
        self.storage.with_conn(|conn| {
            conn.prepare_cached("UPDATE thought_branches SET summary = ?1 WHERE id = ?2")
                .map_err(|e| Error::storage("prepare_branch_summary", e))?
                .execute(params![summary, id])
                .map_err(|e| Error::storage("branch_summary", e))?;
            Ok(())
        })
    }

    /// Recently finished branches without a summary yet.
    pub fn unsummarized_finished(&self, limit: usize) -> Result<Vec<ThoughtBranch>> {
        self.storage.with_conn(|conn| {
            let mut stmt = conn
                .prepare_cached(
                    "SELECT * FROM thought_branches
                     WHERE state IN ('completed', 'abandoned') AND summary IS NULL
                     ORDER BY ended_at DESC LIMIT ?1",
                )
                .map_err(|e| Error::storage("prepare_unsummarized", e))?;
            let rows = stmt
                .query_map(params![limit as i64], read_branch)
                .map_err(|e| Error::storage("unsummarized", e))?;
            rows.collect::<std::result::Result<Vec<_>, _>>()
                .map_err(|e| Error::storage("unsummarized", e))
        })
    }

    /// Finished branches still typed `unknown` (classification backlog).
    pub fn unclassified_finished(&self, limit: usize) -> Result<Vec<ThoughtBranch>> {
        self.storage.with_conn(|conn| {
            let mut stmt = conn
                .prepare_cached(
                    "SELECT * FROM thought_branches
                     WHERE branch_type = 'unknown' AND state != 'active'
                     ORDER BY started_at DESC LIMIT ?1",
                )
                .map_err(|e| Error::storage("prepare_unclassified_branches", e))?;
            let rows = stmt
                .query_map(params![limit as i64], read_branch)
                .map_err(|e| Error::storage("unclassified_branches", e))?;
            rows.collect::<std::result::Result<Vec<_>, _>>()
                .map_err(|e| Error::storage("unclassified_branches", e))
        })
    }
}

fn read_branch(row: &Row<'_>) -> rusqlite::Result<ThoughtBranch> {
    let state: String = row.get("state")?;
    let branch_type: String = row.get("branch_type")?;
    let arc_stage: String = row.get("arc_stage")?;
    let histogram: String = row.get("tool_histogram")?;
    Ok(ThoughtBranch {
        id: row.get("id")?,
        project_hash: row.get("project_hash")?,
        session_id: row.get("session_id")?,
        state: BranchState::parse(&state).unwrap_or(BranchState::Active),
        branch_type: BranchType::parse(&branch_type).unwrap_or_default(),
        title: row.get("title")?,
        summary: row.get("summary")?,
        tool_histogram: serde_json::from_str(&histogram).unwrap_or_default(),
        arc_stage: ArcStage::parse(&arc_stage).unwrap_or_default(),
        started_at: from_millis(row.get("started_at")?),
        ended_at: row.get::<_, Option<i64>>("ended_at")?.map(from_millis),
        last_observation_at: from_millis(row.get("last_observation_at")?),
    })
}

#[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
fn read_branch_observation(row: &Row<'_>) -> rusqlite::Result<BranchObservation> {
    let arc_stage: String = row.get("arc_stage")?;
    Ok(BranchObservation {
        branch_id: row.get("branch_id")?,
        observation_id: ObservationId::from(row.get::<_, String>("observation_id")?),
        arc_stage: ArcStage::parse(&arc_stage).unwrap_or_default(),
        tool_name: row.get("tool_name")?,
        position: row.get::<_, i64>("position")?.max(0) as u32,
    })
}
