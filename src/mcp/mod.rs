//! MCP-style tool surface.
//!
//! A thin stdio JSON-RPC loop frames requests onto a fixed set of tools.
//! Method dispatch uses typed variants rather than string matching at the
//! call sites; unknown methods are captured for error reporting.

mod definitions;
mod handlers;
mod server;

pub use handlers::{ToolOutput, call_tool};
pub use server::McpServer;

/// MCP method identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum McpMethod {
    /// Initialize the MCP session.
    Initialize,
    /// List available tools.
    ListTools,
    /// Call a specific tool.
    CallTool,
    /// Ping the server (health check).
    Ping,
    /// Unknown method (for error handling).
    Unknown(String),
}

impl McpMethod {
    /// Returns the MCP protocol method name.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Initialize => "initialize",
            Self::ListTools => "tools/list",
            Self::CallTool => "tools/call",
            Self::Ping => "ping",
            Self::Unknown(s) => s.as_str(),
        }
    }
}

impl From<&str> for McpMethod {
    fn from(s: &str) -> Self {
        match s {
            "initialize" => Self::Initialize,
            "tools/list" => Self::ListTools,
            "tools/call" => Self::CallTool,
            "ping" => Self::Ping,
            other => Self::Unknown(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn method_round_trips() {
        for name in ["initialize", "tools/list", "tools/call", "ping"] {
            assert_eq!(McpMethod::from(name).as_str(), name);
        }
        assert!(matches!(McpMethod::from("resources/list"), McpMethod::Unknown(_)));
    }
}
