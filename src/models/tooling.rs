//! Tool registry, notification, research buffer, and hook event types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Category of a registered tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolType {
    /// Built into the assistant.
    Builtin,
    /// An MCP server as a whole.
    McpServer,
    /// An individual tool exposed by an MCP server.
    McpTool,
    /// A user-invocable slash command.
    SlashCommand,
    /// A skill package.
    Skill,
    /// A plugin-provided tool.
    Plugin,
}

impl ToolType {
    /// Returns the type as a stable snake-case string.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Builtin => "builtin",
            Self::McpServer => "mcp_server",
            Self::McpTool => "mcp_tool",
            Self::SlashCommand => "slash_command",
            Self::Skill => "skill",
            Self::Plugin => "plugin",
        }
    }

    /// Parses the stable string form.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "builtin" => Some(Self::Builtin),
            "mcp_server" => Some(Self::McpServer),
            "mcp_tool" => Some(Self::McpTool),
            "slash_command" => Some(Self::SlashCommand),
            "skill" => Some(Self::Skill),
            "plugin" => Some(Self::Plugin),
            _ => None,
        }
    }
}

/// Availability scope of a registered tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ToolScope {
    /// Available everywhere.
    #[default]
    Global,
    /// Available in one project.
    Project,
    /// Bundled with a plugin.
    Plugin,
}

impl ToolScope {
    /// Returns the scope as a stable lowercase string.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Global => "global",
            Self::Project => "project",
            Self::Plugin => "plugin",
        }
    }

    /// Parses the stable string form.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "global" => Some(Self::Global),
            "project" => Some(Self::Project),
            "plugin" => Some(Self::Plugin),
            _ => None,
        }
    }
}

/// Registry status of a tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ToolStatus {
    /// Seen recently; eligible for suggestion.
    #[default]
    Active,
    /// Not reported in a while.
    Stale,
    /// Suppressed from suggestions.
    Demoted,
}

impl ToolStatus {
    /// Returns the status as a stable lowercase string.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Stale => "stale",
            Self::Demoted => "demoted",
        }
    }

    /// Parses the stable string form.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(Self::Active),
            "stale" => Some(Self::Stale),
            "demoted" => Some(Self::Demoted),
            _ => None,
        }
    }
}

/// A row in the tool registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisteredTool {
    /// Fully-qualified tool name.
    pub name: String,
    /// Tool category.
    pub tool_type: ToolType,
    /// Availability scope.
    pub scope: ToolScope,
    /// Registry status.
    pub status: ToolStatus,
    /// Times this tool has been observed in use.
    pub usage_count: u64,
    /// Most recent use.
    pub last_used_at: Option<DateTime<Utc>>,
    /// Tool description, when reported.
    pub description: Option<String>,
    /// Owning MCP server, for `mcp_tool` rows.
    pub server_name: Option<String>,
    /// Keywords that should trigger suggesting this tool.
    pub trigger_hints: Vec<String>,
    /// Description embedding, when computed.
    pub embedding: Option<Vec<f32>>,
}

/// Ephemeral per-project message, consumed on the next tool response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    /// Row id.
    pub id: i64,
    /// Project scope.
    pub project_hash: String,
    /// Message text.
    pub message: String,
    /// When the message was queued.
    pub created_at: DateTime<Utc>,
}

/// Lightweight record of an exploration-only tool call.
///
/// Read/search events land here instead of becoming observations; entries
/// within the session window provide provenance context for subsequent
/// write observations and are periodically flushed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResearchEntry {
    /// Row id.
    pub id: i64,
    /// Project scope.
    pub project_hash: String,
    /// Session the call happened in, when known.
    pub session_id: Option<String>,
    /// Tool that performed the exploration.
    pub tool_name: String,
    /// What was explored (path, pattern, query).
    pub query: String,
    /// When the call happened.
    pub created_at: DateTime<Utc>,
}

/// A tool-use event delivered by the hook surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolEvent {
    /// Tool name as reported by the host.
    pub tool_name: String,
    /// Tool input payload.
    #[serde(default)]
    pub tool_input: serde_json::Value,
    /// Tool response payload, present on post-tool events.
    #[serde(default)]
    pub tool_response: Option<serde_json::Value>,
    /// Session identifier, when known.
    #[serde(default)]
    pub session_id: Option<String>,
}
