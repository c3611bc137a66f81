//! Topic-shift detection types: stashes, decisions, threshold seeds.

use super::{Kind, ObservationId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle of a context stash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StashStatus {
    /// Captured at a topic shift, waiting to be resumed.
    Stashed,
    /// Surfaced back into a session.
    Resumed,
}

impl StashStatus {
    /// Returns the status as a stable lowercase string.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Stashed => "stashed",
            Self::Resumed => "resumed",
        }
    }

    /// Parses the stable string form.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "stashed" => Some(Self::Stashed),
            "resumed" => Some(Self::Resumed),
            _ => None,
        }
    }
}

/// A frozen view of one observation at stash time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservationSnapshot {
    /// The observation's id.
    pub id: ObservationId,
    /// Content at stash time.
    pub content: String,
    /// Kind at stash time.
    pub kind: Kind,
    /// Creation timestamp of the observation.
    pub timestamp: DateTime<Utc>,
    /// Embedding at stash time, when one existed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
}

/// Snapshot taken when a topic shift is detected.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextStash {
    /// Unique identifier.
    pub id: String,
    /// Project scope.
    pub project_hash: String,
    /// Short topic label (first non-empty title, else first line).
    pub topic: String,
    /// Compressed summary of the stashed observations.
    pub summary: String,
    /// Lifecycle status.
    pub status: StashStatus,
    /// Frozen observation views (at most 20).
    pub snapshots: Vec<ObservationSnapshot>,
    /// Stash creation time.
    pub created_at: DateTime<Utc>,
    /// When the stash was resumed, if ever.
    pub resumed_at: Option<DateTime<Utc>>,
}

/// One row per topic-shift evaluation, confirmed or not.
///
/// Kept for threshold tuning; the adaptive detector's full EWMA state is
/// recorded alongside the decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShiftDecision {
    /// Project scope.
    pub project_hash: String,
    /// Session the evaluation happened in, when known.
    pub session_id: Option<String>,
    /// Cosine distance between the previous and current embedding.
    pub distance: f32,
    /// Threshold in effect at evaluation time.
    pub threshold: f32,
    /// EWMA mean after the update.
    pub ewma_mean: f32,
    /// EWMA variance after the update.
    pub ewma_variance: f32,
    /// Whether a shift was declared.
    pub shifted: bool,
    /// Confidence in the shift decision (0 when not shifted).
    pub confidence: f32,
    /// Stash produced by this decision, if any.
    pub stash_id: Option<String>,
    /// Evaluation time.
    pub created_at: DateTime<Utc>,
}

/// Final EWMA state of a completed session, used to seed the next one.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ThresholdSeed {
    /// EWMA mean at session end.
    pub ewma_mean: f32,
    /// EWMA variance at session end.
    pub ewma_variance: f32,
    /// Threshold at session end.
    pub threshold: f32,
}
