//! Debug-path tracking types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of a debug path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PathState {
    /// Errors are accumulating; the arc is live.
    Active,
    /// The arc ended in a confirmed fix.
    Resolved,
    /// The arc was given up or timed out.
    Abandoned,
}

impl PathState {
    /// Returns the state as a stable lowercase string.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Resolved => "resolved",
            Self::Abandoned => "abandoned",
        }
    }

    /// Parses the stable string form.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(Self::Active),
            "resolved" => Some(Self::Resolved),
            "abandoned" => Some(Self::Abandoned),
            _ => None,
        }
    }
}

/// A step within a debug path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WaypointKind {
    /// An error was observed.
    Error,
    /// A fix was attempted.
    Attempt,
    /// An attempt failed.
    Failure,
    /// Something worked.
    Success,
    /// The approach changed.
    Pivot,
    /// A change was rolled back.
    Revert,
    /// New information surfaced.
    Discovery,
    /// The arc concluded.
    Resolution,
}

impl WaypointKind {
    /// Returns the kind as a stable lowercase string.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Attempt => "attempt",
            Self::Failure => "failure",
            Self::Success => "success",
            Self::Pivot => "pivot",
            Self::Revert => "revert",
            Self::Discovery => "discovery",
            Self::Resolution => "resolution",
        }
    }

    /// Parses the stable string form.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "error" => Some(Self::Error),
            "attempt" => Some(Self::Attempt),
            "failure" => Some(Self::Failure),
            "success" => Some(Self::Success),
            "pivot" => Some(Self::Pivot),
            "revert" => Some(Self::Revert),
            "discovery" => Some(Self::Discovery),
            "resolution" => Some(Self::Resolution),
            _ => None,
        }
    }
}

impl fmt::Display for WaypointKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An ordered step recorded on a debug path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Waypoint {
    /// Owning path.
    pub path_id: String,
    /// Step kind.
    pub kind: WaypointKind,
    /// One-line summary of the step.
    pub summary: String,
    /// Position within the path, starting at 0.
    pub position: u32,
    /// When the step was recorded.
    pub created_at: DateTime<Utc>,
}

/// A coherent debugging arc: trigger, waypoints, resolution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DebugPath {
    /// Unique identifier.
    pub id: String,
    /// Project scope.
    pub project_hash: String,
    /// Session the arc started in, when known.
    pub session_id: Option<String>,
    /// Lifecycle state.
    pub state: PathState,
    /// Summary of the triggering error.
    pub trigger: String,
    /// Resolution summary, once resolved.
    pub resolution: Option<String>,
    /// LLM-generated actionable summary, once resolved.
    pub kiss_summary: Option<KissSummary>,
    /// Arc start.
    pub started_at: DateTime<Utc>,
    /// Arc end, once resolved or abandoned.
    pub ended_at: Option<DateTime<Utc>>,
}

/// Structured actionable summary of a resolved debug path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KissSummary {
    /// One-sentence plain-language summary.
    pub kiss_summary: String,
    /// What actually caused the problem.
    pub root_cause: String,
    /// What change fixed it.
    pub what_fixed_it: String,
    /// Per-dimension takeaways.
    pub dimensions: KissDimensions,
}

/// Takeaways along the three KISS dimensions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KissDimensions {
    /// The reasoning error, if any.
    pub logical: String,
    /// The code-level error, if any.
    pub programmatic: String,
    /// The process error, if any.
    pub development: String,
}

/// Debug-relevant signal extracted during classification.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DebugSignal {
    /// The observation describes an error.
    #[serde(default)]
    pub is_error: bool,
    /// The observation describes a fix landing.
    #[serde(default)]
    pub is_resolution: bool,
    /// Explicit waypoint kind suggested by the classifier.
    #[serde(default)]
    pub waypoint_hint: Option<WaypointKind>,
    /// Classifier confidence in `[0, 1]`.
    #[serde(default)]
    pub confidence: f32,
}
