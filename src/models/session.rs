//! Session types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A conversation unit.
///
/// The summary is a compressed, kind-grouped rendering of the session's
/// observations, produced once when the session stops.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    /// Session identifier supplied by the host.
    pub id: String,
    /// Project scope.
    pub project_hash: String,
    /// Session start.
    pub started_at: DateTime<Utc>,
    /// Session end, once stopped.
    pub ended_at: Option<DateTime<Utc>>,
    /// Generated summary, once stopped.
    pub summary: Option<String>,
}

impl Session {
    /// Returns true while the session has not been stopped.
    #[must_use]
    pub const fn is_open(&self) -> bool {
        self.ended_at.is_none()
    }
}
