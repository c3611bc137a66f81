//! Domain types for the knowledge pipeline.
//!
//! All row types share two conventions:
//!
//! - Identifiers are 32-char lowercase hex strings (16 random bytes).
//! - Every project-scoped row carries a `project_hash`, an opaque stable
//!   identifier derived from the canonical absolute path of a working
//!   directory. Reads are filtered by it; cross-project reads are opt-in.

mod branch;
mod debug_path;
mod graph;
mod observation;
mod project;
mod session;
mod tooling;
mod topic;

pub use branch::{ArcStage, BranchObservation, BranchState, BranchType, ThoughtBranch};
pub use debug_path::{
    DebugPath, DebugSignal, KissDimensions, KissSummary, PathState, Waypoint, WaypointKind,
};
pub use graph::{EdgeType, GraphEdge, GraphNode, NodeId, NodeType, MAX_NODE_DEGREE, normalize_name};
pub use observation::{
    Classification, Kind, NewObservation, Observation, ObservationId, ObservationPatch,
    MAX_CONTENT_BYTES, MAX_TITLE_CHARS,
};
pub use project::ProjectRef;
pub use session::Session;
pub use tooling::{
    Notification, RegisteredTool, ResearchEntry, ToolEvent, ToolScope, ToolStatus, ToolType,
};
pub use topic::{ContextStash, ObservationSnapshot, ShiftDecision, StashStatus, ThresholdSeed};

use serde::{Deserialize, Serialize};

/// Process-wide verbosity level for tool responses.
///
/// Every tool pre-builds three renderings and returns the level-selected one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Verbosity {
    /// Bare results only.
    Minimal = 1,
    /// Results plus one line of framing.
    #[default]
    Standard = 2,
    /// Results, framing, and diagnostic detail.
    Verbose = 3,
}

impl Verbosity {
    /// Parses a numeric level (1-3); out-of-range values clamp.
    #[must_use]
    pub const fn from_level(level: u8) -> Self {
        match level {
            0 | 1 => Self::Minimal,
            2 => Self::Standard,
            _ => Self::Verbose,
        }
    }
}

/// Generates a new 32-char hex identifier (16 random bytes).
#[must_use]
pub fn new_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_id_is_32_hex_chars() {
        let id = new_id();
        assert_eq!(id.len(), 32);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn verbosity_clamps() {
        assert_eq!(Verbosity::from_level(0), Verbosity::Minimal);
        assert_eq!(Verbosity::from_level(2), Verbosity::Standard);
        assert_eq!(Verbosity::from_level(9), Verbosity::Verbose);
    }
}
