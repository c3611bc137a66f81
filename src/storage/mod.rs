//! Storage layer: the embedded `SQLite` store and its derived indices.
//!
//! One [`Storage`] handle owns the database for the whole process. Write-ahead
//! logging lets concurrent readers coexist with the single writer; every
//! multi-step write runs inside a transaction so partial writes are
//! impossible. The FTS index is kept consistent with the observations table
//! through triggers installed by the migrations.

mod branches;
mod embeddings;
mod graph;
mod migrations;
mod observations;
mod paths;
mod sessions;
mod tooling;

pub use branches::BranchStore;
pub use embeddings::EmbeddingStore;
pub use graph::{
    DEGREE_HOTSPOT_FRACTION, DecayConfig, DecayStats, Direction, DuplicateGroup, GraphStats,
    GraphStore, TraversalHop,
};
pub(crate) use graph::token_jaccard;
pub use migrations::{MIGRATIONS, Migration, run_migrations, schema_version};
pub use observations::{ListOptions, ObservationStore};
pub(crate) use observations::{noise_cutoff_millis, read_observation as observations_read_row};
pub use paths::PathStore;
pub use sessions::SessionStore;
pub use tooling::ToolingStore;

use crate::{Error, Result};
use chrono::{DateTime, Utc};
use rusqlite::Connection;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

/// Helper to acquire the connection mutex with poison recovery.
///
/// If the mutex is poisoned by a panic in a previous critical section, the
/// inner value is recovered and a warning logged. The connection state is
/// still valid; failing every later operation would only cascade the fault.
pub(crate) fn acquire_lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::warn!("storage mutex was poisoned, recovering");
            metrics::counter!("laminark_mutex_poison_recovery_total").increment(1);
            poisoned.into_inner()
        },
    }
}

/// Converts a timestamp to the millisecond integer form stored in `SQLite`.
pub(crate) fn to_millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

/// Converts a stored millisecond integer back to a timestamp.
pub(crate) fn from_millis(millis: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(millis).unwrap_or_default()
}

/// Shared handle to the embedded database.
///
/// # Concurrency Model
///
/// A `Mutex<Connection>` serializes statement execution; WAL mode and a 5 s
/// `busy_timeout` keep contention graceful. Database operations are brief,
/// so the periodic tasks and the tool surface share this one handle without
/// a cross-task lock.
pub struct Storage {
    /// Connection to the `SQLite` database.
    conn: Mutex<Connection>,
    /// Path to the database (None for in-memory).
    db_path: Option<PathBuf>,
}

impl Storage {
    /// Opens (creating if needed) the database at `path` and migrates it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StorageOpen`] if the file cannot be created or
    /// configured, and [`Error::Migration`] if a migration fails. A failed
    /// migration leaves the prior schema intact.
    pub fn open(path: impl AsRef<Path>) -> Result<Arc<Self>> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| Error::StorageOpen {
                path: path.display().to_string(),
                cause: e.to_string(),
            })?;
        }
        let conn = Connection::open(path).map_err(|e| Error::StorageOpen {
            path: path.display().to_string(),
            cause: e.to_string(),
        })?;
        configure_connection(&conn)?;

        let storage = Self {
            conn: Mutex::new(conn),
            db_path: Some(path.to_path_buf()),
        };
        storage.with_conn_mut(|conn| run_migrations(conn, MIGRATIONS))?;
        Ok(Arc::new(storage))
    }

    /// Opens an in-memory database (useful for testing).
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be initialized.
    pub fn in_memory() -> Result<Arc<Self>> {
        let conn = Connection::open_in_memory().map_err(|e| Error::StorageOpen {
            path: ":memory:".to_string(),
            cause: e.to_string(),
        })?;
        configure_connection(&conn)?;

        let storage = Self {
            conn: Mutex::new(conn),
            db_path: None,
        };
        storage.with_conn_mut(|conn| run_migrations(conn, MIGRATIONS))?;
        Ok(Arc::new(storage))
    }

    /// Returns the database path (None for in-memory).
    #[must_use]
    pub fn db_path(&self) -> Option<&Path> {
        self.db_path.as_deref()
    }

    /// Runs `f` with the locked connection.
    pub(crate) fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = acquire_lock(&self.conn);
        f(&conn)
    }

    /// Runs `f` with the locked connection, mutably (for transactions).
    pub(crate) fn with_conn_mut<T>(
        &self,
        f: impl FnOnce(&mut Connection) -> Result<T>,
    ) -> Result<T> {
        let mut conn = acquire_lock(&self.conn);
        f(&mut conn)
    }

    /// Administrative wipe of one project's observations.
    ///
    /// Large deletes through the FTS triggers are quadratic, so the wipe
    /// drops the triggers, deletes, rebuilds the FTS index with the
    /// `rebuild` command, and re-installs the triggers, all in one
    /// transaction.
    ///
    /// # Errors
    ///
    /// Returns an error if any step fails; the transaction rolls back.
    pub fn reset_project(&self, project_hash: &str) -> Result<usize> {
        self.with_conn_mut(|conn| {
            let tx = conn
                .transaction()
                .map_err(|e| Error::storage("reset_begin", e))?;

            migrations::drop_fts_triggers(&tx)?;
            let removed = tx
                .execute(
                    "DELETE FROM observations WHERE project_hash = ?1",
                    [project_hash],
                )
                .map_err(|e| Error::storage("reset_delete", e))?;
            tx.execute(
                "INSERT INTO observations_fts(observations_fts) VALUES('rebuild')",
                [],
            )
            .map_err(|e| Error::storage("reset_fts_rebuild", e))?;
            migrations::install_fts_triggers(&tx)?;

            tx.commit().map_err(|e| Error::storage("reset_commit", e))?;
            tracing::info!(project_hash, removed, "project reset complete");
            Ok(removed)
        })
    }
}

/// Configures a `SQLite` connection for performance and concurrency.
///
/// - **WAL mode**: concurrent readers with a single writer
/// - **NORMAL synchronous**: balances durability with performance
/// - **`busy_timeout`**: waits up to 5 s for locks instead of failing
/// - **`foreign_keys`**: referential integrity for the vector index
fn configure_connection(conn: &Connection) -> Result<()> {
    // journal_mode returns a string result; pragma_update would treat that
    // as an error, so the results are ignored deliberately.
    let _ = conn.pragma_update(None, "journal_mode", "WAL");
    let _ = conn.pragma_update(None, "synchronous", "NORMAL");
    let _ = conn.pragma_update(None, "busy_timeout", "5000");
    let _ = conn.pragma_update(None, "foreign_keys", "ON");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn open_creates_file_and_migrates() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("laminark.db");
        let storage = Storage::open(&path).unwrap();
        assert!(path.exists());
        let version = storage.with_conn(|conn| schema_version(conn)).unwrap();
        assert!(version >= 1);
    }

    #[test]
    fn in_memory_migrates() {
        let storage = Storage::in_memory().unwrap();
        let version = storage.with_conn(|conn| schema_version(conn)).unwrap();
        assert_eq!(version, MIGRATIONS.last().map(|m| m.version).unwrap_or(0));
    }

    #[test]
    fn millis_round_trip() {
        let now = Utc::now();
        let back = from_millis(to_millis(now));
        assert_eq!(back.timestamp_millis(), now.timestamp_millis());
    }
}
