//! Thought-branch tracking types.

use super::ObservationId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Lifecycle state of a thought branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BranchState {
    /// Observations are still being appended.
    Active,
    /// The work unit concluded normally.
    Completed,
    /// The work unit was given up or went stale.
    Abandoned,
    /// The work unit was folded into another branch.
    Merged,
}

impl BranchState {
    /// Returns the state as a stable lowercase string.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Abandoned => "abandoned",
            Self::Merged => "merged",
        }
    }

    /// Parses the stable string form.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(Self::Active),
            "completed" => Some(Self::Completed),
            "abandoned" => Some(Self::Abandoned),
            "merged" => Some(Self::Merged),
            _ => None,
        }
    }
}

/// Work-unit category assigned by the classifier after a few observations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BranchType {
    /// Exploring unfamiliar code or behavior.
    Investigation,
    /// Chasing and fixing a defect.
    BugFix,
    /// Building new functionality.
    Feature,
    /// Restructuring without behavior change.
    Refactor,
    /// Reading docs or evaluating approaches.
    Research,
    /// Not yet classified.
    #[default]
    Unknown,
}

impl BranchType {
    /// Returns the type as a stable snake-case string.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Investigation => "investigation",
            Self::BugFix => "bug_fix",
            Self::Feature => "feature",
            Self::Refactor => "refactor",
            Self::Research => "research",
            Self::Unknown => "unknown",
        }
    }

    /// Parses the stable string form.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "investigation" => Some(Self::Investigation),
            "bug_fix" => Some(Self::BugFix),
            "feature" => Some(Self::Feature),
            "refactor" => Some(Self::Refactor),
            "research" => Some(Self::Research),
            "unknown" => Some(Self::Unknown),
            _ => None,
        }
    }
}

/// Phase of a thought branch, inferred from the tool histogram.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ArcStage {
    /// Reading and searching.
    #[default]
    Investigation,
    /// Laying out the work.
    Planning,
    /// Narrowing a problem down.
    Diagnosis,
    /// Writing the change.
    Execution,
    /// Confirming the change works.
    Verification,
}

impl ArcStage {
    /// Returns the stage as a stable lowercase string.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Investigation => "investigation",
            Self::Planning => "planning",
            Self::Diagnosis => "diagnosis",
            Self::Execution => "execution",
            Self::Verification => "verification",
        }
    }

    /// Parses the stable string form.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "investigation" => Some(Self::Investigation),
            "planning" => Some(Self::Planning),
            "diagnosis" => Some(Self::Diagnosis),
            "execution" => Some(Self::Execution),
            "verification" => Some(Self::Verification),
            _ => None,
        }
    }
}

/// A coherent work unit segmented out of the observation stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThoughtBranch {
    /// Unique identifier.
    pub id: String,
    /// Project scope.
    pub project_hash: String,
    /// Session the branch started in, when known.
    pub session_id: Option<String>,
    /// Lifecycle state.
    pub state: BranchState,
    /// Work-unit category.
    pub branch_type: BranchType,
    /// Short title, once classified.
    pub title: Option<String>,
    /// Summary, generated at completion.
    pub summary: Option<String>,
    /// Per-tool observation counts.
    pub tool_histogram: HashMap<String, u32>,
    /// Current inferred phase.
    pub arc_stage: ArcStage,
    /// Branch start.
    pub started_at: DateTime<Utc>,
    /// Branch end, once completed or abandoned.
    pub ended_at: Option<DateTime<Utc>>,
    /// Timestamp of the most recent member observation.
    pub last_observation_at: DateTime<Utc>,
}

/// Membership of one observation in a branch, tagged with the arc stage
/// current at insertion time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BranchObservation {
    /// Owning branch.
    pub branch_id: String,
    /// Member observation.
    pub observation_id: ObservationId,
    /// Arc stage at insertion time.
    pub arc_stage: ArcStage,
    /// Tool name parsed from the observation source, when hook-captured.
    pub tool_name: Option<String>,
    /// Position within the branch, starting at 0.
    pub position: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn branch_type_round_trips() {
        for bt in [
            BranchType::Investigation,
            BranchType::BugFix,
            BranchType::Feature,
            BranchType::Refactor,
            BranchType::Research,
            BranchType::Unknown,
        ] {
            assert_eq!(BranchType::parse(bt.as_str()), Some(bt));
        }
    }

    #[test]
    fn arc_stage_default_is_investigation() {
        assert_eq!(ArcStage::default(), ArcStage::Investigation);
    }
}
