//! Tool registry, usage events, routing state, notifications, and the
//! research buffer.

use super::{Storage, from_millis, to_millis};
use crate::embedding::{blob_to_vector, vector_to_blob};
use crate::models::{
    Notification, RegisteredTool, ResearchEntry, ToolScope, ToolStatus, ToolType,
};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, Row, params};
use std::sync::Arc;

/// Store for tool metadata and session-adjacent ephemera.
#[derive(Clone)]
pub struct ToolingStore {
    storage: Arc<Storage>,
}

impl ToolingStore {
    /// Creates a tooling store over the shared database.
    #[must_use]
    pub const fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }

    // --- tool registry -----------------------------------------------------

    /// Upserts a registry row, preserving usage counters on update.
    pub fn upsert_tool(&self, tool: &RegisteredTool) -> Result<()> {
        self.storage.with_conn(|conn| {
            let hints = serde_json::to_string(&tool.trigger_hints)
                .map_err(|e| Error::storage("serialize_trigger_hints", e))?;
            conn.prepare_cached(
                "INSERT INTO tool_registry
                 (name, tool_type, scope, status, usage_count, last_used_at, description,
                  server_name, trigger_hints, embedding, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
                 ON CONFLICT(name) DO UPDATE SET
                    tool_type = excluded.tool_type,
                    scope = excluded.scope,
                    status = 'active',
                    description = COALESCE(excluded.description, tool_registry.description),
                    server_name = COALESCE(excluded.server_name, tool_registry.server_name),
                    trigger_hints = excluded.trigger_hints,
                    updated_at = excluded.updated_at",
            )
            .map_err(|e| Error::storage("prepare_upsert_tool", e))?
            .execute(params![
                tool.name,
                tool.tool_type.as_str(),
                tool.scope.as_str(),
                tool.status.as_str(),
                tool.usage_count as i64,
                tool.last_used_at.map(to_millis),
                tool.description,
                tool.server_name,
                hints,
                tool.embedding.as_deref().map(vector_to_blob),
                to_millis(Utc::now()),
            ])
            .map_err(|e| Error::storage("upsert_tool", e))?;
            Ok(())
        })
    }

    /// Fetches one registry row.
    pub fn get_tool(&self, name: &str) -> Result<Option<RegisteredTool>> {
        self.storage.with_conn(|conn| {
            conn.prepare_cached("SELECT * FROM tool_registry WHERE name = ?1")
                .map_err(|e| Error::storage("prepare_get_tool", e))?
                .query_row(params![name], read_tool)
                .optional()
                .map_err(|e| Error::storage("get_tool", e))
        })
    }

    /// Lists active tools, most used first.
    pub fn active_tools(&self, limit: usize) -> Result<Vec<RegisteredTool>> {
        self.storage.with_conn(|conn| {
            let mut stmt = conn
                .prepare_cached(
                    "SELECT * FROM tool_registry WHERE status = 'active'
                     ORDER BY usage_count DESC, name LIMIT ?1",
                )
                .map_err(|e| Error::storage("prepare_active_tools", e))?;
            let rows = stmt
                .query_map(params![limit as i64], read_tool)
                .map_err(|e| Error::storage("active_tools", e))?;
            rows.collect::<std::result::Result<Vec<_>, _>>()
                .map_err(|e| Error::storage("active_tools", e))
        })
    }

    /// Records one use of a tool and bumps its counters.
    pub fn record_tool_use(
        &self,
        project_hash: &str,
        session_id: Option<&str>,
        tool_name: &str,
    ) -> Result<()> {
        self.storage.with_conn(|conn| {
            conn.prepare_cached(
                "INSERT INTO tool_usage_events (project_hash, session_id, tool_name, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
            )
            .map_err(|e| Error::storage("prepare_record_tool_use", e))?
            .execute(params![project_hash, session_id, tool_name, to_millis(Utc::now())])
            .map_err(|e| Error::storage("record_tool_use", e))?;
            conn.prepare_cached(
                "UPDATE tool_registry SET usage_count = usage_count + 1, last_used_at = ?1
                 WHERE name = ?2",
            )
            .map_err(|e| Error::storage("prepare_bump_tool", e))?
            .execute(params![to_millis(Utc::now()), tool_name])
            .map_err(|e| Error::storage("bump_tool", e))?;
            Ok(())
        })
    }

    /// Tool names used in one session, in event order.
    pub fn session_tool_sequence(&self, session_id: &str) -> Result<Vec<String>> {
        self.storage.with_conn(|conn| {
            let mut stmt = conn
                .prepare_cached(
                    "SELECT tool_name FROM tool_usage_events
                     WHERE session_id = ?1 ORDER BY id",
                )
                .map_err(|e| Error::storage("prepare_session_tools", e))?;
            let rows = stmt
                .query_map(params![session_id], |row| row.get::<_, String>(0))
                .map_err(|e| Error::storage("session_tools", e))?;
            rows.collect::<std::result::Result<Vec<_>, _>>()
                .map_err(|e| Error::storage("session_tools", e))
        })
    }

    /// Recent usage sequences grouped by session (pattern-mining input).
    pub fn recent_tool_sequences(
        &self,
        project_hash: &str,
        max_events: usize,
    ) -> Result<Vec<Vec<String>>> {
        self.storage.with_conn(|conn| {
            let mut stmt = conn
                .prepare_cached(
                    "SELECT session_id, tool_name FROM tool_usage_events
                     WHERE project_hash = ?1 AND session_id IS NOT NULL
                     ORDER BY id DESC LIMIT ?2",
                )
                .map_err(|e| Error::storage("prepare_recent_sequences", e))?;
            let rows = stmt
                .query_map(params![project_hash, max_events as i64], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
                })
                .map_err(|e| Error::storage("recent_sequences", e))?
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(|e| Error::storage("recent_sequences", e))?;

            // Rows arrive newest-first; rebuild per-session order.
            let mut by_session: Vec<(String, Vec<String>)> = Vec::new();
            for (session, tool) in rows.into_iter().rev() {
                match by_session.iter_mut().find(|(s, _)| *s == session) {
                    Some((_, seq)) => seq.push(tool),
                    None => by_session.push((session, vec![tool])),
                }
            }
            Ok(by_session.into_iter().map(|(_, seq)| seq).collect())
        })
    }

    // --- routing patterns and state ----------------------------------------

    /// Upserts a learned pattern, accumulating frequency.
    pub fn upsert_routing_pattern(
        &self,
        project_hash: &str,
        preceding: &[String],
        target: &str,
        frequency: u32,
    ) -> Result<()> {
        let preceding_json = serde_json::to_string(preceding)
            .map_err(|e| Error::storage("serialize_preceding", e))?;
        self.storage.with_conn(|conn| {
            conn.prepare_cached(
                "INSERT INTO routing_patterns (project_hash, preceding, target, frequency, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(project_hash, preceding, target) DO UPDATE SET
                    frequency = excluded.frequency,
                    updated_at = excluded.updated_at",
            )
            .map_err(|e| Error::storage("prepare_upsert_pattern", e))?
            .execute(params![
                project_hash,
                preceding_json,
                target,
                i64::from(frequency),
                to_millis(Utc::now()),
            ])
            .map_err(|e| Error::storage("upsert_pattern", e))?;
            Ok(())
        })
    }

    /// Loads learned patterns for a project.
    pub fn routing_patterns(&self, project_hash: &str) -> Result<Vec<(Vec<String>, String, u32)>> {
        self.storage.with_conn(|conn| {
            let mut stmt = conn
                .prepare_cached(
                    "SELECT preceding, target, frequency FROM routing_patterns
                     WHERE project_hash = ?1 ORDER BY frequency DESC",
                )
                .map_err(|e| Error::storage("prepare_routing_patterns", e))?;
            let rows = stmt
                .query_map(params![project_hash], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, i64>(2)?,
                    ))
                })
                .map_err(|e| Error::storage("routing_patterns", e))?
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(|e| Error::storage("routing_patterns", e))?;
            Ok(rows
                .into_iter()
                .map(|(preceding, target, freq)| {
                    (
                        serde_json::from_str(&preceding).unwrap_or_default(),
                        target,
                        freq.max(0) as u32,
                    )
                })
                .collect())
        })
    }

    /// Loads `(tool_calls, suggestions, last_suggestion_call)` for a session.
    pub fn routing_state(&self, session_id: &str) -> Result<(u32, u32, Option<u32>)> {
        self.storage.with_conn(|conn| {
            conn.prepare_cached(
                "SELECT tool_calls, suggestions, last_suggestion_call
                 FROM routing_state WHERE session_id = ?1",
            )
            .map_err(|e| Error::storage("prepare_routing_state", e))?
            .query_row(params![session_id], |row| {
                Ok((
                    row.get::<_, i64>(0)?.max(0) as u32,
                    row.get::<_, i64>(1)?.max(0) as u32,
                    row.get::<_, Option<i64>>(2)?.map(|v| v.max(0) as u32),
                ))
            })
            .optional()
            .map_err(|e| Error::storage("routing_state", e))
            .map(|state| state.unwrap_or((0, 0, None)))
        })
    }

    /// Persists routing rate-limit state for a session.
    pub fn save_routing_state(
        &self,
        session_id: &str,
        project_hash: &str,
        tool_calls: u32,
        suggestions: u32,
        last_suggestion_call: Option<u32>,
    ) -> Result<()> {
        self.storage.with_conn(|conn| {
            conn.prepare_cached(
                "INSERT INTO routing_state
                 (session_id, project_hash, tool_calls, suggestions, last_suggestion_call, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(session_id) DO UPDATE SET
                    tool_calls = excluded.tool_calls,
                    suggestions = excluded.suggestions,
                    last_suggestion_call = excluded.last_suggestion_call,
                    updated_at = excluded.updated_at",
            )
            .map_err(|e| Error::storage("prepare_save_routing_state", e))?
            .execute(params![
                session_id,
                project_hash,
                i64::from(tool_calls),
                i64::from(suggestions),
                last_suggestion_call.map(i64::from),
                to_millis(Utc::now()),
            ])
            .map_err(|e| Error::storage("save_routing_state", e))?;
            Ok(())
        })
    }

    // --- notifications ------------------------------------------------------

    /// Queues a user-visible message for the project.
    pub fn enqueue_notification(&self, project_hash: &str, message: &str) -> Result<()> {
        self.storage.with_conn(|conn| {
            conn.prepare_cached(
                "INSERT INTO pending_notifications (project_hash, message, created_at)
                 VALUES (?1, ?2, ?3)",
            )
            .map_err(|e| Error::storage("prepare_enqueue_notification", e))?
            .execute(params![project_hash, message, to_millis(Utc::now())])
            .map_err(|e| Error::storage("enqueue_notification", e))?;
            Ok(())
        })
    }

    /// Drains all pending notifications for the project, oldest first.
    pub fn consume_notifications(&self, project_hash: &str) -> Result<Vec<Notification>> {
        self.storage.with_conn_mut(|conn| {
            let tx = conn
                .transaction()
                .map_err(|e| Error::storage("consume_begin", e))?;
            let mut stmt = tx
                .prepare_cached(
                    "SELECT * FROM pending_notifications WHERE project_hash = ?1 ORDER BY id",
                )
                .map_err(|e| Error::storage("prepare_consume", e))?;
            let drained = stmt
                .query_map(params![project_hash], read_notification)
                .map_err(|e| Error::storage("consume", e))?
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(|e| Error::storage("consume", e))?;
            drop(stmt);
            tx.execute(
                "DELETE FROM pending_notifications WHERE project_hash = ?1",
                params![project_hash],
            )
            .map_err(|e| Error::storage("consume_delete", e))?;
            tx.commit().map_err(|e| Error::storage("consume_commit", e))?;
            Ok(drained)
        })
    }

    // --- research buffer ----------------------------------------------------

    /// Records an exploration-only tool call.
    pub fn push_research(
        &self,
        project_hash: &str,
        session_id: Option<&str>,
        tool_name: &str,
        query: &str,
    ) -> Result<()> {
        self.storage.with_conn(|conn| {
            conn.prepare_cached(
                "INSERT INTO research_buffer (project_hash, session_id, tool_name, query, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )
            .map_err(|e| Error::storage("prepare_push_research", e))?
            .execute(params![
                project_hash,
                session_id,
                tool_name,
                query,
                to_millis(Utc::now()),
            ])
            .map_err(|e| Error::storage("push_research", e))?;
            Ok(())
        })
    }

    /// Entries newer than `since`, oldest first.
    pub fn recent_research(
        &self,
        project_hash: &str,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ResearchEntry>> {
        self.storage.with_conn(|conn| {
            let mut stmt = conn
                .prepare_cached(
                    "SELECT * FROM research_buffer
                     WHERE project_hash = ?1 AND created_at >= ?2
                     ORDER BY id LIMIT ?3",
                )
                .map_err(|e| Error::storage("prepare_recent_research", e))?;
            let rows = stmt
                .query_map(
                    params![project_hash, to_millis(since), limit as i64],
                    read_research,
                )
                .map_err(|e| Error::storage("recent_research", e))?;
            rows.collect::<std::result::Result<Vec<_>, _>>()
                .map_err(|e| Error::storage("recent_research", e))
        })
    }

    /// Deletes entries older than `cutoff`; returns the count.
    pub fn flush_research(&self, project_hash: &str, cutoff: DateTime<Utc>) -> Result<usize> {
        self.storage.with_conn(|conn| {
            conn.prepare_cached(
                "DELETE FROM research_buffer WHERE project_hash = ?1 AND created_at < ?2",
            )
            .map_err(|e| Error::storage("prepare_flush_research", e))?
            .execute(params![project_hash, to_millis(cutoff)])
            .map_err(|e| Error::storage("flush_research", e))
        })
    }
}

#[allow(clippy::cast_sign_loss)]
fn read_tool(row: &Row<'_>) -> rusqlite::Result<RegisteredTool> {
    let tool_type: String = row.get("tool_type")?;
    let scope: String = row.get("scope")?;
    let status: String = row.get("status")?;
    let hints: String = row.get("trigger_hints")?;
    let embedding: Option<Vec<u8>> = row.get("embedding")?;
    Ok(RegisteredTool {
        name: row.get("name")?,
        tool_type: ToolType::parse(&tool_type).unwrap_or(ToolType::Builtin),
        scope: ToolScope::parse(&scope).unwrap_or_default(),
        status: ToolStatus::parse(&status).unwrap_or_default(),
        usage_count: row.get::<_, i64>("usage_count")?.max(0) as u64,
        last_used_at: row.get::<_, Option<i64>>("last_used_at")?.map(from_millis),
        description: row.get("description")?,
        server_name: row.get("server_name")?,
        trigger_hints: serde_json::from_str(&hints).unwrap_or_default(),
        embedding: embedding.as_deref().and_then(blob_to_vector),
    })
}

fn read_notification(row: &Row<'_>) -> rusqlite::Result<Notification> {
    Ok(Notification {
        id: row.get("id")?,
        project_hash: row.get("project_hash")?,
        message: row.get("message")?,
        created_at: from_millis(row.get("created_at")?),
    })
}

fn read_research(row: &Row<'_>) -> rusqlite::Result<ResearchEntry> {
    Ok(ResearchEntry {
        id: row.get("id")?,
        project_hash: row.get("project_hash")?,
        session_id: row.get("session_id")?,
        tool_name: row.get("tool_name")?,
        query: row.get("query")?,
        created_at: from_millis(row.get("created_at")?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> ToolingStore {
        ToolingStore::new(Storage::in_memory().unwrap())
    }

    fn tool(name: &str) -> RegisteredTool {
        RegisteredTool {
            name: name.to_string(),
            tool_type: ToolType::Builtin,
            scope: ToolScope::Global,
            status: ToolStatus::Active,
            usage_count: 0,
            last_used_at: None,
            description: Some(format!("{name} tool")),
            server_name: None,
            trigger_hints: vec!["test".to_string()],
            embedding: None,
        }
    }

    #[test]
    fn upsert_preserves_usage_counters() {
        let store = store();
        store.upsert_tool(&tool("Edit")).unwrap();
        store.record_tool_use("p", Some("s1"), "Edit").unwrap();
        store.record_tool_use("p", Some("s1"), "Edit").unwrap();

        // Re-reporting the catalogue must not reset counters.
        store.upsert_tool(&tool("Edit")).unwrap();
        let loaded = store.get_tool("Edit").unwrap().unwrap();
        assert_eq!(loaded.usage_count, 2);
        assert!(loaded.last_used_at.is_some());
    }

    #[test]
    fn session_sequence_is_ordered() {
        let store = store();
        for name in ["Read", "Edit", "Bash"] {
            store.record_tool_use("p", Some("s1"), name).unwrap();
        }
        store.record_tool_use("p", Some("s2"), "Grep").unwrap();

        assert_eq!(
            store.session_tool_sequence("s1").unwrap(),
            vec!["Read", "Edit", "Bash"]
        );
        let sequences = store.recent_tool_sequences("p", 100).unwrap();
        assert_eq!(sequences.len(), 2);
    }

    #[test]
    fn notifications_drain_once() {
        let store = store();
        store.enqueue_notification("p", "Topic shift detected.").unwrap();
        store.enqueue_notification("p", "second").unwrap();
        store.enqueue_notification("other", "not mine").unwrap();

        let drained = store.consume_notifications("p").unwrap();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].message, "Topic shift detected.");
        assert!(store.consume_notifications("p").unwrap().is_empty());
        assert_eq!(store.consume_notifications("other").unwrap().len(), 1);
    }

    #[test]
    fn research_buffer_window_and_flush() {
        let store = store();
        store.push_research("p", Some("s1"), "Read", "src/lib.rs").unwrap();
        store.push_research("p", Some("s1"), "Grep", "fn main").unwrap();

        let recent = store
            .recent_research("p", Utc::now() - chrono::Duration::minutes(30), 10)
            .unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].tool_name, "Read");

        let flushed = store.flush_research("p", Utc::now() + chrono::Duration::seconds(1)).unwrap();
        assert_eq!(flushed, 2);
        assert!(store
            .recent_research("p", Utc::now() - chrono::Duration::minutes(30), 10)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn routing_state_round_trips() {
        let store = store();
        assert_eq!(store.routing_state("s1").unwrap(), (0, 0, None));
        store.save_routing_state("s1", "p", 7, 1, Some(5)).unwrap();
        assert_eq!(store.routing_state("s1").unwrap(), (7, 1, Some(5)));
    }

    #[test]
    fn routing_patterns_round_trip() {
        let store = store();
        let preceding = vec!["Read".to_string(), "Edit".to_string()];
        store.upsert_routing_pattern("p", &preceding, "Bash", 3).unwrap();
        let patterns = store.routing_patterns("p").unwrap();
        assert_eq!(patterns.len(), 1);
        assert_eq!(patterns[0], (preceding, "Bash".to_string(), 3));
    }
}
