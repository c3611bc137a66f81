//! Debug path and waypoint storage.

use super::{Storage, from_millis, to_millis};
use crate::models::{DebugPath, KissSummary, PathState, Waypoint, WaypointKind};
use crate::{Error, Result};
use chrono::Utc;
use rusqlite::{OptionalExtension, Row, params};
use std::sync::Arc;

/// Store for debug paths and their waypoints.
#[derive(Clone)]
pub struct PathStore {
    storage: Arc<Storage>,
}

impl PathStore {
    /// Creates a path store over the shared database.
    #[must_use]
    pub const fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }

    /// Creates a new active debug path.
    pub fn create(
        &self,
        project_hash: &str,
        session_id: Option<&str>,
        trigger: &str,
    ) -> Result<DebugPath> {
        let now = Utc::now();
        let path = DebugPath {
            id: crate::models::new_id(),
            project_hash: project_hash.to_string(),
            session_id: session_id.map(ToString::to_string),
            state: PathState::Active,
            trigger: trigger.to_string(),
            resolution: None,
            kiss_summary: None,
            started_at: now,
            ended_at: None,
        };
        self.storage.with_conn(|conn| {
            conn.prepare_cached(
                "INSERT INTO debug_paths
                 (id, project_hash, session_id, state, trigger_summary, started_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )
            .map_err(|e| Error::storage("prepare_create_path", e))?
            .execute(params![
                path.id,
                path.project_hash,
                path.session_id,
                path.state.as_str(),
                path.trigger,
                to_millis(path.started_at),
            ])
            .map_err(|e| Error::storage("create_path", e))?;
            Ok(())
        })?;
        Ok(path)
    }

    /// Fetches one path.
    pub fn get(&self, id: &str) -> Result<Option<DebugPath>> {
        self.storage.with_conn(|conn| {
            conn.prepare_cached("SELECT * FROM debug_paths WHERE id = ?1")
                .map_err(|e| Error::storage("prepare_get_path", e))?
                .query_row(params![id], read_path)
                .optional()
                .map_err(|e| Error::storage("get_path", e))
        })
    }

    /// Returns the project's active path, when one exists.
    pub fn active(&self, project_hash: &str) -> Result<Option<DebugPath>> {
        self.storage.with_conn(|conn| {
            conn.prepare_cached(
                "SELECT * FROM debug_paths
                 WHERE project_hash = ?1 AND state = 'active'
                 ORDER BY started_at DESC LIMIT 1",
            )
            .map_err(|e| Error::storage("prepare_active_path", e))?
            .query_row(params![project_hash], read_path)
            .optional()
            .map_err(|e| Error::storage("active_path", e))
        })
    }

    /// Lists paths for a project, newest first.
    pub fn list(&self, project_hash: &str, limit: usize) -> Result<Vec<DebugPath>> {
        self.storage.with_conn(|conn| {
            let mut stmt = conn
                .prepare_cached(
                    "SELECT * FROM debug_paths WHERE project_hash = ?1
                     ORDER BY started_at DESC LIMIT ?2",
                )
                .map_err(|e| Error::storage("prepare_list_paths", e))?;
            let rows = stmt
                .query_map(params![project_hash, limit as i64], read_path)
                .map_err(|e| Error::storage("list_paths", e))?;
            rows.collect::<std::result::Result<Vec<_>, _>>()
                .map_err(|e| Error::storage("list_paths", e))
        })
    }

    /// Lists resolved paths (similar-path search input).
    pub fn resolved(&self, project_hash: &str, limit: usize) -> Result<Vec<DebugPath>> {
        self.storage.with_conn(|conn| {
            let mut stmt = conn
                .prepare_cached(
                    "SELECT * FROM debug_paths
                     WHERE project_hash = ?1 AND state = 'resolved'
                     ORDER BY ended_at DESC LIMIT ?2",
                )
                .map_err(|e| Error::storage("prepare_resolved_paths", e))?;
            let rows = stmt
                .query_map(params![project_hash, limit as i64], read_path)
                .map_err(|e| Error::storage("resolved_paths", e))?;
            rows.collect::<std::result::Result<Vec<_>, _>>()
                .map_err(|e| Error::storage("resolved_paths", e))
        })
    }

    /// Appends a waypoint at the next position. Returns the waypoint.
    pub fn append_waypoint(
        &self,
        path_id: &str,
        kind: WaypointKind,
        summary: &str,
    ) -> Result<Waypoint> {
        let now = Utc::now();
        self.storage.with_conn_mut(|conn| {
            let tx = conn
                .transaction()
                .map_err(|e| Error::storage("waypoint_begin", e))?;
            let position: i64 = tx
                .prepare_cached(
                    "SELECT COALESCE(MAX(position) + 1, 0) FROM path_waypoints WHERE path_id = ?1",
                )
                .map_err(|e| Error::storage("prepare_waypoint_position", e))?
                .query_row(params![path_id], |row| row.get(0))
                .map_err(|e| Error::storage("waypoint_position", e))?;
            tx.prepare_cached(
                "INSERT INTO path_waypoints (path_id, kind, summary, position, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )
            .map_err(|e| Error::storage("prepare_append_waypoint", e))?
            .execute(params![path_id, kind.as_str(), summary, position, to_millis(now)])
            .map_err(|e| Error::storage("append_waypoint", e))?;
            tx.commit()
                .map_err(|e| Error::storage("waypoint_commit", e))?;
            #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
            Ok(Waypoint {
                path_id: path_id.to_string(),
                kind,
                summary: summary.to_string(),
                position: position.max(0) as u32,
                created_at: now,
            })
        })
    }

    /// Waypoints of one path, in order.
    pub fn waypoints(&self, path_id: &str) -> Result<Vec<Waypoint>> {
        self.storage.with_conn(|conn| {
            let mut stmt = conn
                .prepare_cached(
                    "SELECT * FROM path_waypoints WHERE path_id = ?1 ORDER BY position",
                )
                .map_err(|e| Error::storage("prepare_waypoints", e))?;
            let rows = stmt
                .query_map(params![path_id], read_waypoint)
                .map_err(|e| Error::storage("waypoints", e))?;
            rows.collect::<std::result::Result<Vec<_>, _>>()
                .map_err(|e| Error::storage("waypoints", e))
        })
    }

    /// Counts a path's waypoints.
    pub fn waypoint_count(&self, path_id: &str) -> Result<usize> {
        self.storage.with_conn(|conn| {
            conn.prepare_cached("SELECT COUNT(*) FROM path_waypoints WHERE path_id = ?1")
                .map_err(|e| Error::storage("prepare_waypoint_count", e))?
                .query_row(params![path_id], |row| row.get::<_, i64>(0))
                .map(|n| n.max(0) as usize)
                .map_err(|e| Error::storage("waypoint_count", e))
        })
    }

    /// Transitions a path to resolved with a resolution summary.
    pub fn resolve(&self, id: &str, resolution: &str) -> Result<bool> {
        self.storage.with_conn(|conn| {
            let changed = conn
                .prepare_cached(
                    "UPDATE debug_paths
                     SET state = 'resolved', resolution = ?1, ended_at = ?2
                     WHERE id = ?3 AND state = 'active'",
                )
                .map_err(|e| Error::storage("prepare_resolve_path", e))?
                .execute(params![resolution, to_millis(Utc::now()), id])
                .map_err(|e| Error::storage("resolve_path", e))?;
            Ok(changed > 0)
        })
    }

    /// Transitions a path to abandoned.
    pub fn abandon(&self, id: &str) -> Result<bool> {
        self.storage.with_conn(|conn| {
            let changed = conn
                .prepare_cached(
                    "UPDATE debug_paths SET state = 'abandoned', ended_at = ?1
                     WHERE id = ?2 AND state = 'active'",
                )
                .map_err(|e| Error::storage("prepare_abandon_path", e))?
                .execute(params![to_millis(Utc::now()), id])
                .map_err(|e| Error::storage("abandon_path", e))?;
            Ok(changed > 0)
        })
    }

    /// Stores the LLM-generated structured summary on a path.
    pub fn set_kiss_summary(&self, id: &str, summary: &KissSummary) -> Result<()> {
        let json = serde_json::to_string(summary)
            .map_err(|e| Error::storage("serialize_kiss_summary", e))?;
        self.storage.with_conn(|conn| {
            conn.prepare_cached("UPDATE debug_paths SET kiss_summary = ?1 WHERE id = ?2")
                .map_err(|e| Error::storage("prepare_set_kiss", e))?
                .execute(params![json, id])
                .map_err(|e| Error::storage("set_kiss", e))?;
            Ok(())
        })
    }
}

#[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
fn read_waypoint(row: &Row<'_>) -> rusqlite::Result<Waypoint> {
    let kind: String = row.get("kind")?;
    Ok(Waypoint {
        path_id: row.get("path_id")?,
        kind: WaypointKind::parse(&kind).unwrap_or(WaypointKind::Attempt),
        summary: row.get("summary")?,
        position: row.get::<_, i64>("position")?.max(0) as u32,
        created_at: from_millis(row.get("created_at")?),
    })
}

fn read_path(row: &Row<'_>) -> rusqlite::Result<DebugPath> {
    let state: String = row.get("state")?;
    let kiss: Option<String> = row.get("kiss_summary")?;
    Ok(DebugPath {
        id: row.get("id")?,
        project_hash: row.get("project_hash")?,
        session_id: row.get("session_id")?,
        state: PathState::parse(&state).unwrap_or(PathState::Active),
        trigger: row.get("trigger_summary")?,
        resolution: row.get("resolution")?,
        kiss_summary: kiss.and_then(|s| serde_json::from_str(&s).ok()),
        started_at: from_millis(row.get("started_at")?),
        ended_at: row.get::<_, Option<i64>>("ended_at")?.map(from_millis),
    })
}
