//! Observation types and identifiers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Maximum observation content length in bytes.
pub const MAX_CONTENT_BYTES: usize = 100 * 1024;

/// Maximum observation title length in characters.
pub const MAX_TITLE_CHARS: usize = 200;

/// Unique identifier for an observation (16 random bytes as hex).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObservationId(String);

impl ObservationId {
    /// Creates an ID from an existing string.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generates a fresh random ID.
    #[must_use]
    pub fn random() -> Self {
        Self(super::new_id())
    }

    /// Returns the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ObservationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for ObservationId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ObservationId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Coarse semantic type of an observation.
///
/// Assigned at admission time from the event shape; drives visibility and
/// ranking together with [`Classification`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Kind {
    /// A mutation of the working tree or repository state.
    Change,
    /// External material consulted: docs, URLs, search results.
    Reference,
    /// Something learned or concluded.
    Finding,
    /// A recorded choice between alternatives.
    Decision,
    /// Evidence that something works: test runs, builds, checks.
    Verification,
}

impl Kind {
    /// All kinds, in display order.
    pub const ALL: [Self; 5] = [
        Self::Change,
        Self::Reference,
        Self::Finding,
        Self::Decision,
        Self::Verification,
    ];

    /// Returns the kind as a stable lowercase string.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Change => "change",
            Self::Reference => "reference",
            Self::Finding => "finding",
            Self::Decision => "decision",
            Self::Verification => "verification",
        }
    }

    /// Parses the stable string form.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "change" => Some(Self::Change),
            "reference" => Some(Self::Reference),
            "finding" => Some(Self::Finding),
            "decision" => Some(Self::Decision),
            "verification" => Some(Self::Verification),
            _ => None,
        }
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// LLM-assigned fine label for an observation.
///
/// Stays [`Classification::Unset`] until the enricher processes the row.
/// Rows classified as noise are retained but hidden from default search
/// after a short grace period.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Classification {
    /// Not yet classified.
    #[default]
    Unset,
    /// New information worth keeping.
    Discovery,
    /// A problem statement or failure.
    Problem,
    /// A fix or resolution.
    Solution,
    /// Low-signal content; hidden after the grace period.
    Noise,
}

impl Classification {
    /// Returns the classification as a stable lowercase string.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Unset => "unset",
            Self::Discovery => "discovery",
            Self::Problem => "problem",
            Self::Solution => "solution",
            Self::Noise => "noise",
        }
    }

    /// Parses the stable string form.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "unset" => Some(Self::Unset),
            "discovery" => Some(Self::Discovery),
            "problem" => Some(Self::Problem),
            "solution" => Some(Self::Solution),
            "noise" => Some(Self::Noise),
            _ => None,
        }
    }

    /// Returns true once the enricher has assigned a label.
    #[must_use]
    pub const fn is_set(self) -> bool {
        !matches!(self, Self::Unset)
    }
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The atomic unit of captured knowledge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Observation {
    /// Unique identifier.
    pub id: ObservationId,
    /// Project scope.
    pub project_hash: String,
    /// Session the observation was captured in, when known.
    pub session_id: Option<String>,
    /// Optional short title.
    pub title: Option<String>,
    /// The observation body (at most [`MAX_CONTENT_BYTES`]).
    pub content: String,
    /// Provenance tag, e.g. `hook:Edit`, `manual`, `ingest:NOTES.md`.
    pub source: String,
    /// Coarse semantic type.
    pub kind: Kind,
    /// LLM-assigned fine label.
    pub classification: Classification,
    /// Embedding model name once a vector exists.
    pub embedding_model: Option<String>,
    /// Embedding schema version once a vector exists.
    pub embedding_version: Option<String>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last mutation timestamp.
    pub updated_at: DateTime<Utc>,
    /// Soft-delete timestamp; `None` while alive.
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Observation {
    /// Returns true while the observation has not been soft-deleted.
    #[must_use]
    pub const fn is_alive(&self) -> bool {
        self.deleted_at.is_none()
    }

    /// Returns the tool name parsed from a `hook:<Tool>` source tag.
    #[must_use]
    pub fn hook_tool(&self) -> Option<&str> {
        self.source.strip_prefix("hook:")
    }

    /// Text used for embedding: title and content joined by a newline.
    #[must_use]
    pub fn embedding_text(&self) -> String {
        match &self.title {
            Some(title) if !title.is_empty() => format!("{title}\n{}", self.content),
            _ => self.content.clone(),
        }
    }
}

/// Input for creating an observation.
#[derive(Debug, Clone, Default)]
pub struct NewObservation {
    /// Session the observation belongs to, when known.
    pub session_id: Option<String>,
    /// Optional short title.
    pub title: Option<String>,
    /// The observation body.
    pub content: String,
    /// Provenance tag; defaults to `manual` at the tool surface.
    pub source: String,
    /// Coarse semantic type.
    pub kind: Option<Kind>,
}

/// Restricted field patch for [`Observation`].
///
/// Only the fields the enricher and curation are allowed to touch are
/// representable; anything else is rejected by construction.
#[derive(Debug, Clone, Default)]
pub struct ObservationPatch {
    /// New title.
    pub title: Option<String>,
    /// Replacement content (used by curation merges).
    pub content: Option<String>,
    /// New classification.
    pub classification: Option<Classification>,
    /// Embedding metadata `(model, version)`.
    pub embedding: Option<(String, String)>,
}

impl ObservationPatch {
    /// Returns true when the patch changes nothing.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.content.is_none()
            && self.classification.is_none()
            && self.embedding.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_round_trips() {
        for kind in Kind::ALL {
            assert_eq!(Kind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(Kind::parse("bogus"), None);
    }

    #[test]
    fn classification_default_is_unset() {
        assert_eq!(Classification::default(), Classification::Unset);
        assert!(!Classification::Unset.is_set());
        assert!(Classification::Noise.is_set());
    }

    #[test]
    fn hook_tool_parses_source_tag() {
        let obs = Observation {
            id: ObservationId::random(),
            project_hash: "p".to_string(),
            session_id: None,
            title: None,
            content: "x".to_string(),
            source: "hook:Edit".to_string(),
            kind: Kind::Change,
            classification: Classification::Unset,
            embedding_model: None,
            embedding_version: None,
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
            deleted_at: None,
        };
        assert_eq!(obs.hook_tool(), Some("Edit"));
    }

    #[test]
    fn embedding_text_prefers_title() {
        let mut obs = Observation {
            id: ObservationId::random(),
            project_hash: "p".to_string(),
            session_id: None,
            title: Some("Title".to_string()),
            content: "body".to_string(),
            source: "manual".to_string(),
            kind: Kind::Finding,
            classification: Classification::Unset,
            embedding_model: None,
            embedding_version: None,
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
            deleted_at: None,
        };
        assert_eq!(obs.embedding_text(), "Title\nbody");
        obs.title = None;
        assert_eq!(obs.embedding_text(), "body");
    }
}
