//! Knowledge graph node and edge types.

use super::ObservationId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Per-node maximum total (in + out) degree, enforced on edge insert.
pub const MAX_NODE_DEGREE: usize = 50;

/// Unique identifier for a graph node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
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

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for NodeId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Typed entity classes the extractor may produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeType {
    /// A file path within the project.
    File,
    /// A project or subsystem name.
    Project,
    /// A recorded decision.
    Decision,
    /// A named problem.
    Problem,
    /// A named solution.
    Solution,
    /// External reference material.
    Reference,
}

impl NodeType {
    /// All node types, in display order.
    pub const ALL: [Self; 6] = [
        Self::File,
        Self::Project,
        Self::Decision,
        Self::Problem,
        Self::Solution,
        Self::Reference,
    ];

    /// Returns the type as a stable lowercase string.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::File => "file",
            Self::Project => "project",
            Self::Decision => "decision",
            Self::Problem => "problem",
            Self::Solution => "solution",
            Self::Reference => "reference",
        }
    }

    /// Parses the stable string form (case-insensitive).
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "file" => Some(Self::File),
            "project" => Some(Self::Project),
            "decision" => Some(Self::Decision),
            "problem" => Some(Self::Problem),
            "solution" => Some(Self::Solution),
            "reference" => Some(Self::Reference),
            _ => None,
        }
    }
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Typed directed relationships between graph nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeType {
    /// Generic association.
    RelatedTo,
    /// Problem was solved by solution.
    SolvedBy,
    /// Effect was caused by cause.
    CausedBy,
    /// Change modifies a file.
    Modifies,
    /// Decision was informed by a finding or reference.
    InformedBy,
    /// Content references external material.
    References,
    /// Claim was verified by a check.
    VerifiedBy,
    /// Temporal ordering between work items.
    PrecededBy,
}

impl EdgeType {
    /// All edge types, in display order.
    pub const ALL: [Self; 8] = [
        Self::RelatedTo,
        Self::SolvedBy,
        Self::CausedBy,
        Self::Modifies,
        Self::InformedBy,
        Self::References,
        Self::VerifiedBy,
        Self::PrecededBy,
    ];

    /// Returns the type as a stable snake-case string.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::RelatedTo => "related_to",
            Self::SolvedBy => "solved_by",
            Self::CausedBy => "caused_by",
            Self::Modifies => "modifies",
            Self::InformedBy => "informed_by",
            Self::References => "references",
            Self::VerifiedBy => "verified_by",
            Self::PrecededBy => "preceded_by",
        }
    }

    /// Parses the stable string form.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "related_to" => Some(Self::RelatedTo),
            "solved_by" => Some(Self::SolvedBy),
            "caused_by" => Some(Self::CausedBy),
            "modifies" => Some(Self::Modifies),
            "informed_by" => Some(Self::InformedBy),
            "references" => Some(Self::References),
            "verified_by" => Some(Self::VerifiedBy),
            "preceded_by" => Some(Self::PrecededBy),
            _ => None,
        }
    }
}

impl fmt::Display for EdgeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A typed entity in the knowledge graph.
///
/// Identity is `(type, normalized name)` per project. The contributing
/// observation list is a union set maintained across upserts and merges.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphNode {
    /// Unique identifier.
    pub id: NodeId,
    /// Project scope.
    pub project_hash: String,
    /// Entity class.
    pub node_type: NodeType,
    /// Normalized entity name.
    pub name: String,
    /// Extraction confidence in `[0, 1]`.
    pub confidence: f32,
    /// Scalar metadata merged last-writer-wins.
    pub metadata: serde_json::Value,
    /// Observations that contributed to this node.
    pub observation_ids: Vec<ObservationId>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last mutation timestamp.
    pub updated_at: DateTime<Utc>,
}

/// A typed directed edge between graph nodes.
///
/// `(source, target, type)` is unique; weight decays with age.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphEdge {
    /// Source node.
    pub source: NodeId,
    /// Target node.
    pub target: NodeId,
    /// Relationship type.
    pub edge_type: EdgeType,
    /// Association strength in `[0, 1]`.
    pub weight: f32,
    /// Optional metadata.
    pub metadata: serde_json::Value,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
}

/// Normalizes an entity name for identity comparison.
///
/// Lowercases, collapses interior whitespace, and trims. File paths
/// additionally strip a leading `./`.
#[must_use]
pub fn normalize_name(node_type: NodeType, name: &str) -> String {
    let collapsed = name.split_whitespace().collect::<Vec<_>>().join(" ");
    let lowered = collapsed.to_lowercase();
    if node_type == NodeType::File {
        lowered
            .strip_prefix("./")
            .map_or(lowered.clone(), ToString::to_string)
    } else {
        lowered
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn edge_type_round_trips() {
        for edge_type in EdgeType::ALL {
            assert_eq!(EdgeType::parse(edge_type.as_str()), Some(edge_type));
        }
    }

    #[test]
    fn node_type_parse_is_case_insensitive() {
        assert_eq!(NodeType::parse("File"), Some(NodeType::File));
        assert_eq!(NodeType::parse("DECISION"), Some(NodeType::Decision));
        assert_eq!(NodeType::parse("widget"), None);
    }

    #[test]
    fn normalize_name_collapses_and_lowers() {
        assert_eq!(
            normalize_name(NodeType::Decision, "  Use   SQLite  "),
            "use sqlite"
        );
        assert_eq!(normalize_name(NodeType::File, "./src/Main.rs"), "src/main.rs");
    }
}
