//! Versioned schema migrations.
//!
//! Migrations are compile-time embedded and applied transactionally on open.
//! Each migration is an idempotent schema change plus optional backfill; if
//! any statement fails the whole migration rolls back and the prior schema
//! is left intact.

use crate::{Error, Result};
use rusqlite::Connection;

/// A single migration with version and SQL.
#[derive(Debug, Clone, Copy)]
pub struct Migration {
    /// Migration version (sequential, starting at 1).
    pub version: i64,
    /// Human-readable description.
    pub description: &'static str,
    /// SQL to apply (may contain multiple statements).
    pub sql: &'static str,
}

/// FTS trigger bodies, shared with the administrative reset path.
///
/// Only alive rows are indexed. The conditional `INSERT ... SELECT ... WHERE`
/// form keeps each transition a single ordered trigger body:
///
/// - insert: index the new image when alive
/// - update: de-index the old image when it was alive, then index the new
///   image when it is alive (covers edit, soft-delete, and restore)
/// - delete: de-index the old image when it was alive
const FTS_TRIGGERS_SQL: &str = "
CREATE TRIGGER IF NOT EXISTS observations_fts_ai AFTER INSERT ON observations BEGIN
    INSERT INTO observations_fts(rowid, title, content)
        SELECT new.rowid, new.title, new.content WHERE new.deleted_at IS NULL;
END;
CREATE TRIGGER IF NOT EXISTS observations_fts_au AFTER UPDATE ON observations BEGIN
    INSERT INTO observations_fts(observations_fts, rowid, title, content)
        SELECT 'delete', old.rowid, old.title, old.content WHERE old.deleted_at IS NULL;
    INSERT INTO observations_fts(rowid, title, content)
        SELECT new.rowid, new.title, new.content WHERE new.deleted_at IS NULL;
END;
CREATE TRIGGER IF NOT EXISTS observations_fts_ad AFTER DELETE ON observations BEGIN
    INSERT INTO observations_fts(observations_fts, rowid, title, content)
        SELECT 'delete', old.rowid, old.title, old.content WHERE old.deleted_at IS NULL;
END;
";

/// All migrations, oldest first.
pub const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "observations, FTS index, sessions, project metadata",
        sql: "
CREATE TABLE IF NOT EXISTS observations (
    id TEXT PRIMARY KEY,
    project_hash TEXT NOT NULL,
    session_id TEXT,
    title TEXT,
    content TEXT NOT NULL,
    source TEXT NOT NULL,
    kind TEXT NOT NULL,
    classification TEXT NOT NULL DEFAULT 'unset',
    embedding_model TEXT,
    embedding_version TEXT,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    deleted_at INTEGER
);
CREATE INDEX IF NOT EXISTS idx_observations_project
    ON observations(project_hash, created_at);
CREATE INDEX IF NOT EXISTS idx_observations_classification
    ON observations(classification, created_at);
CREATE INDEX IF NOT EXISTS idx_observations_source
    ON observations(project_hash, source);
CREATE VIRTUAL TABLE IF NOT EXISTS observations_fts USING fts5(
    title, content,
    content='observations',
    content_rowid='rowid'
);
CREATE TABLE IF NOT EXISTS sessions (
    id TEXT PRIMARY KEY,
    project_hash TEXT NOT NULL,
    started_at INTEGER NOT NULL,
    ended_at INTEGER,
    summary TEXT
);
CREATE INDEX IF NOT EXISTS idx_sessions_project ON sessions(project_hash, started_at);
CREATE TABLE IF NOT EXISTS project_metadata (
    project_hash TEXT PRIMARY KEY,
    root_path TEXT NOT NULL,
    name TEXT NOT NULL,
    created_at INTEGER NOT NULL
);
",
    },
    Migration {
        version: 2,
        description: "knowledge graph nodes, edges, staleness flags",
        sql: "
CREATE TABLE IF NOT EXISTS graph_nodes (
    id TEXT PRIMARY KEY,
    project_hash TEXT NOT NULL,
    node_type TEXT NOT NULL,
    name TEXT NOT NULL,
    confidence REAL NOT NULL DEFAULT 1.0,
    metadata TEXT NOT NULL DEFAULT '{}',
    observation_ids TEXT NOT NULL DEFAULT '[]',
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    UNIQUE (project_hash, node_type, name)
);
CREATE TABLE IF NOT EXISTS graph_edges (
    source_id TEXT NOT NULL REFERENCES graph_nodes(id) ON DELETE CASCADE,
    target_id TEXT NOT NULL REFERENCES graph_nodes(id) ON DELETE CASCADE,
    edge_type TEXT NOT NULL,
    weight REAL NOT NULL DEFAULT 0.5,
    metadata TEXT NOT NULL DEFAULT '{}',
    created_at INTEGER NOT NULL,
    PRIMARY KEY (source_id, target_id, edge_type)
);
CREATE INDEX IF NOT EXISTS idx_graph_edges_target ON graph_edges(target_id);
CREATE TABLE IF NOT EXISTS staleness_flags (
    observation_id TEXT PRIMARY KEY,
    node_id TEXT NOT NULL,
    superseded_by TEXT NOT NULL,
    reason TEXT NOT NULL,
    created_at INTEGER NOT NULL
);
",
    },
    Migration {
        version: 3,
        description: "topic shifts, debug paths, thought branches",
        sql: "
CREATE TABLE IF NOT EXISTS context_stashes (
    id TEXT PRIMARY KEY,
    project_hash TEXT NOT NULL,
    topic TEXT NOT NULL,
    summary TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'stashed',
    snapshots TEXT NOT NULL DEFAULT '[]',
    created_at INTEGER NOT NULL,
    resumed_at INTEGER
);
CREATE INDEX IF NOT EXISTS idx_context_stashes_project
    ON context_stashes(project_hash, created_at);
CREATE TABLE IF NOT EXISTS shift_decisions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    project_hash TEXT NOT NULL,
    session_id TEXT,
    distance REAL NOT NULL,
    threshold REAL NOT NULL,
    ewma_mean REAL NOT NULL,
    ewma_variance REAL NOT NULL,
    shifted INTEGER NOT NULL,
    confidence REAL NOT NULL,
    stash_id TEXT,
    created_at INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS threshold_history (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    project_hash TEXT NOT NULL,
    session_id TEXT,
    ewma_mean REAL NOT NULL,
    ewma_variance REAL NOT NULL,
    threshold REAL NOT NULL,
    created_at INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS debug_paths (
    id TEXT PRIMARY KEY,
    project_hash TEXT NOT NULL,
    session_id TEXT,
    state TEXT NOT NULL DEFAULT 'active',
    trigger_summary TEXT NOT NULL,
    resolution TEXT,
    kiss_summary TEXT,
    started_at INTEGER NOT NULL,
    ended_at INTEGER
);
CREATE TABLE IF NOT EXISTS path_waypoints (
    path_id TEXT NOT NULL REFERENCES debug_paths(id) ON DELETE CASCADE,
    kind TEXT NOT NULL,
    summary TEXT NOT NULL,
    position INTEGER NOT NULL,
    created_at INTEGER NOT NULL,
    PRIMARY KEY (path_id, position)
);
CREATE TABLE IF NOT EXISTS thought_branches (
    id TEXT PRIMARY KEY,
    project_hash TEXT NOT NULL,
    session_id TEXT,
    state TEXT NOT NULL DEFAULT 'active',
    branch_type TEXT NOT NULL DEFAULT 'unknown',
    title TEXT,
    summary TEXT,
    tool_histogram TEXT NOT NULL DEFAULT '{}',
    arc_stage TEXT NOT NULL DEFAULT 'investigation',
    started_at INTEGER NOT NULL,
    ended_at INTEGER,
    last_observation_at INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS branch_observations (
    branch_id TEXT NOT NULL REFERENCES thought_branches(id) ON DELETE CASCADE,
    observation_id TEXT NOT NULL,
    arc_stage TEXT NOT NULL,
    tool_name TEXT,
    position INTEGER NOT NULL,
    PRIMARY KEY (branch_id, position)
);
",
    },
    Migration {
        version: 4,
        description: "vector index, tool registry, routing, notifications, research buffer",
        sql: "
CREATE TABLE IF NOT EXISTS observation_embeddings (
    observation_id TEXT PRIMARY KEY REFERENCES observations(id) ON DELETE CASCADE,
    project_hash TEXT NOT NULL,
    dims INTEGER NOT NULL,
    vector BLOB NOT NULL,
    created_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_observation_embeddings_project
    ON observation_embeddings(project_hash);
CREATE TABLE IF NOT EXISTS tool_registry (
    name TEXT PRIMARY KEY,
    tool_type TEXT NOT NULL,
    scope TEXT NOT NULL DEFAULT 'global',
    status TEXT NOT NULL DEFAULT 'active',
    usage_count INTEGER NOT NULL DEFAULT 0,
    last_used_at INTEGER,
    description TEXT,
    server_name TEXT,
    trigger_hints TEXT NOT NULL DEFAULT '[]',
    embedding BLOB,
    updated_at INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS tool_usage_events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    project_hash TEXT NOT NULL,
    session_id TEXT,
    tool_name TEXT NOT NULL,
    created_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_tool_usage_session
    ON tool_usage_events(session_id, id);
CREATE TABLE IF NOT EXISTS routing_patterns (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    project_hash TEXT NOT NULL,
    preceding TEXT NOT NULL,
    target TEXT NOT NULL,
    frequency INTEGER NOT NULL DEFAULT 1,
    updated_at INTEGER NOT NULL,
    UNIQUE (project_hash, preceding, target)
);
CREATE TABLE IF NOT EXISTS routing_state (
    session_id TEXT PRIMARY KEY,
    project_hash TEXT NOT NULL,
    tool_calls INTEGER NOT NULL DEFAULT 0,
    suggestions INTEGER NOT NULL DEFAULT 0,
    last_suggestion_call INTEGER,
    updated_at INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS pending_notifications (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    project_hash TEXT NOT NULL,
    message TEXT NOT NULL,
    created_at INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS research_buffer (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    project_hash TEXT NOT NULL,
    session_id TEXT,
    tool_name TEXT NOT NULL,
    query TEXT NOT NULL,
    created_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_research_buffer_project
    ON research_buffer(project_hash, created_at);
",
    },
];

/// Applies all pending migrations.
///
/// # Errors
///
/// Returns [`Error::Migration`] if a migration fails; the failing migration
/// rolls back and earlier migrations stay applied.
pub fn run_migrations(conn: &mut Connection, migrations: &[Migration]) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            description TEXT NOT NULL,
            applied_at INTEGER NOT NULL
        )",
        [],
    )
    .map_err(|e| Error::Migration {
        version: 0,
        cause: e.to_string(),
    })?;

    let current = schema_version(conn)?;

    for migration in migrations {
        if migration.version <= current {
            continue;
        }
        apply_migration(conn, migration)?;
    }

    // Trigger installation is idempotent and outside the version counter so
    // the administrative reset path can share the exact same definitions.
    install_fts_triggers(conn)?;

    Ok(())
}

/// Returns the highest applied migration version (0 when none).
pub fn schema_version(conn: &Connection) -> Result<i64> {
    let exists: bool = conn
        .query_row(
            "SELECT EXISTS (SELECT 1 FROM sqlite_master WHERE type='table' AND name='schema_migrations')",
            [],
            |row| row.get(0),
        )
        .map_err(|e| Error::storage("schema_version", e))?;
    if !exists {
        return Ok(0);
    }
    conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
        [],
        |row| row.get(0),
    )
    .map_err(|e| Error::storage("schema_version", e))
}

/// Applies a single migration within a transaction.
///
/// All statements and the version record execute in one transaction; if any
/// statement fails the whole migration rolls back, preventing partial schema
/// updates.
fn apply_migration(conn: &mut Connection, migration: &Migration) -> Result<()> {
    let tx = conn.transaction().map_err(|e| Error::Migration {
        version: migration.version,
        cause: e.to_string(),
    })?;

    tx.execute_batch(migration.sql)
        .map_err(|e| Error::Migration {
            version: migration.version,
            cause: e.to_string(),
        })?;

    tx.execute(
        "INSERT INTO schema_migrations (version, description, applied_at) VALUES (?1, ?2, ?3)",
        rusqlite::params![
            migration.version,
            migration.description,
            chrono::Utc::now().timestamp_millis()
        ],
    )
    .map_err(|e| Error::Migration {
        version: migration.version,
        cause: e.to_string(),
    })?;

    tx.commit().map_err(|e| Error::Migration {
        version: migration.version,
        cause: e.to_string(),
    })?;

    tracing::info!(
        version = migration.version,
        description = migration.description,
        "applied migration"
    );
    Ok(())
}

/// Installs the FTS synchronization triggers.
pub(crate) fn install_fts_triggers(conn: &Connection) -> Result<()> {
    conn.execute_batch(FTS_TRIGGERS_SQL)
        .map_err(|e| Error::storage("install_fts_triggers", e))
}

/// Drops the FTS synchronization triggers (administrative wipes only).
pub(crate) fn drop_fts_triggers(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "DROP TRIGGER IF EXISTS observations_fts_ai;
         DROP TRIGGER IF EXISTS observations_fts_au;
         DROP TRIGGER IF EXISTS observations_fts_ad;",
    )
    .map_err(|e| Error::storage("drop_fts_triggers", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_migrated() -> Connection {
        let mut conn = Connection::open_in_memory().unwrap();
        run_migrations(&mut conn, MIGRATIONS).unwrap();
        conn
    }

    #[test]
    fn migrations_are_sequential() {
        for (i, m) in MIGRATIONS.iter().enumerate() {
            assert_eq!(m.version, i as i64 + 1);
        }
    }

    #[test]
    fn run_twice_is_idempotent() {
        let mut conn = open_migrated();
        run_migrations(&mut conn, MIGRATIONS).unwrap();
        assert_eq!(
            schema_version(&conn).unwrap(),
            MIGRATIONS.last().unwrap().version
        );
    }

    #[test]
    fn fts_trigger_indexes_alive_rows_only() {
        let conn = open_migrated();
        conn.execute(
            "INSERT INTO observations (id, project_hash, content, source, kind, created_at, updated_at)
             VALUES ('a1', 'p', 'searchable pelican text', 'manual', 'finding', 1, 1)",
            [],
        )
        .unwrap();

        let hits: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM observations_fts WHERE observations_fts MATCH 'pelican'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(hits, 1);

        // Soft delete removes the FTS row in the same statement's triggers.
        conn.execute("UPDATE observations SET deleted_at = 2 WHERE id = 'a1'", [])
            .unwrap();
        let hits: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM observations_fts WHERE observations_fts MATCH 'pelican'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(hits, 0);

        // Restore re-indexes.
        conn.execute("UPDATE observations SET deleted_at = NULL WHERE id = 'a1'", [])
            .unwrap();
        let hits: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM observations_fts WHERE observations_fts MATCH 'pelican'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(hits, 1);
    }
}
