//! Tool schema definitions (JSON Schema for input validation).

use serde_json::{Value, json};

fn tool(name: &str, description: &str, properties: Value, required: &[&str]) -> Value {
    json!({
        "name": name,
        "description": description,
        "inputSchema": {
            "type": "object",
            "properties": properties,
            "required": required,
        },
    })
}

/// All tools exposed by the engine, in listing order.
#[must_use]
pub fn all_tools() -> Vec<Value> {
    vec![
        tool(
            "save_memory",
            "Save a memory to the knowledge store",
            json!({
                "text": { "type": "string", "description": "Memory content" },
                "title": { "type": "string" },
                "source": { "type": "string", "default": "manual" },
                "kind": {
                    "type": "string",
                    "enum": ["change", "reference", "finding", "decision", "verification"],
                    "default": "finding"
                },
            }),
            &["text"],
        ),
        tool(
            "recall",
            "Search, view, purge, or restore memories",
            json!({
                "query": { "type": "string" },
                "id": { "type": "string" },
                "title": { "type": "string" },
                "ids": { "type": "array", "items": { "type": "string" } },
                "action": { "type": "string", "enum": ["view", "purge", "restore"], "default": "view" },
                "detail": { "type": "string", "enum": ["compact", "timeline", "full"], "default": "compact" },
                "kind": { "type": "string" },
                "limit": { "type": "integer", "default": 10 },
                "include_purged": { "type": "boolean", "default": false },
            }),
            &[],
        ),
        tool(
            "ingest_knowledge",
            "Ingest markdown knowledge files as observations",
            json!({
                "directory": { "type": "string", "description": "Directory of .md files" },
            }),
            &[],
        ),
        tool(
            "topic_context",
            "Progressive disclosure of recent topic stashes",
            json!({
                "query": { "type": "string" },
                "limit": { "type": "integer", "default": 5 },
            }),
            &[],
        ),
        tool(
            "query_graph",
            "Query the knowledge graph by entity name",
            json!({
                "query": { "type": "string" },
                "entity_type": { "type": "string" },
                "depth": { "type": "integer", "default": 2 },
                "relationship_types": { "type": "array", "items": { "type": "string" } },
                "limit": { "type": "integer", "default": 20 },
            }),
            &["query"],
        ),
        tool("graph_stats", "Knowledge graph statistics", json!({}), &[]),
        tool(
            "hygiene",
            "Report or purge low-value memories by tier",
            json!({
                "mode": { "type": "string", "enum": ["simulate", "purge"], "default": "simulate" },
                "tier": { "type": "string", "enum": ["high", "medium", "all"], "default": "high" },
                "session_id": { "type": "string" },
                "limit": { "type": "integer", "default": 50 },
            }),
            &[],
        ),
        tool("status", "Engine health snapshot", json!({}), &[]),
        tool(
            "discover_tools",
            "Search the tool registry",
            json!({
                "query": { "type": "string" },
                "scope": { "type": "string" },
                "limit": { "type": "integer", "default": 20 },
            }),
            &["query"],
        ),
        tool(
            "report_available_tools",
            "Bulk upsert of the session's tool catalogue",
            json!({
                "tools": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "name": { "type": "string" },
                            "description": { "type": "string" },
                        },
                        "required": ["name"],
                    },
                },
            }),
            &["tools"],
        ),
        tool(
            "path_start",
            "Manually start a debug path",
            json!({ "trigger": { "type": "string" } }),
            &["trigger"],
        ),
        tool(
            "path_resolve",
            "Manually resolve the active debug path",
            json!({ "resolution": { "type": "string" } }),
            &["resolution"],
        ),
        tool(
            "path_show",
            "Show one debug path with waypoints",
            json!({ "id": { "type": "string" } }),
            &[],
        ),
        tool(
            "path_list",
            "List debug paths",
            json!({ "limit": { "type": "integer", "default": 10 } }),
            &[],
        ),
        tool(
            "query_branches",
            "List thought branches",
            json!({
                "state": { "type": "string" },
                "limit": { "type": "integer", "default": 10 },
            }),
            &[],
        ),
        tool(
            "show_branch",
            "Show one thought branch with memberships",
            json!({ "id": { "type": "string" } }),
            &["id"],
        ),
        tool(
            "branch_summary",
            "Show a branch's generated summary",
            json!({ "id": { "type": "string" } }),
            &["id"],
        ),
    ]
}
