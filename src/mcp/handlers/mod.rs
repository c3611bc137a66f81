//! Tool execution logic.

mod core;
mod graph;
mod paths;

use crate::engine::Engine;
use crate::models::{ProjectRef, Verbosity};
use crate::{Error, Result};
use serde_json::Value;

/// The text returned to the transport for one tool call.
#[derive(Debug, Clone)]
pub struct ToolOutput {
    /// Rendered response (verbosity-selected, budget-enforced).
    pub text: String,
    /// User-visible failure marker; never a protocol error.
    pub is_error: bool,
}

impl ToolOutput {
    fn ok(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            is_error: false,
        }
    }

    fn error(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            is_error: true,
        }
    }
}

/// Shared handler context.
pub(super) struct ToolContext<'a> {
    pub engine: &'a Engine,
    pub project: &'a ProjectRef,
    pub verbosity: Verbosity,
}

/// Dispatches one tool call and prepends pending notifications.
#[must_use]
pub fn call_tool(
    engine: &Engine,
    project: &ProjectRef,
    verbosity: Verbosity,
    name: &str,
    args: &Value,
) -> ToolOutput {
    let ctx = ToolContext {
        engine,
        project,
        verbosity,
    };

    let result = match name {
        "save_memory" => core::save_memory(&ctx, args),
        "recall" => core::recall(&ctx, args),
        "ingest_knowledge" => core::ingest_knowledge(&ctx, args),
        "topic_context" => core::topic_context(&ctx, args),
        "status" => core::status(&ctx),
        "hygiene" => core::hygiene(&ctx, args),
        "discover_tools" => core::discover_tools(&ctx, args),
        "report_available_tools" => core::report_available_tools(&ctx, args),
        "query_graph" => graph::query_graph(&ctx, args),
        "graph_stats" => graph::graph_stats(&ctx),
        "path_start" => paths::path_start(&ctx, args),
        "path_resolve" => paths::path_resolve(&ctx, args),
        "path_show" => paths::path_show(&ctx, args),
        "path_list" => paths::path_list(&ctx, args),
        "query_branches" => paths::query_branches(&ctx, args),
        "show_branch" => paths::show_branch(&ctx, args),
        "branch_summary" => paths::branch_summary(&ctx, args),
        other => Ok(ToolOutput::error(format!("Unknown tool: {other}"))),
    };

    let mut output = match result {
        Ok(output) => output,
        Err(Error::Duplicate { existing_id }) => {
            ToolOutput::error(format!("Memory not saved: near-duplicate of {existing_id}"))
        },
        Err(Error::ValidationRejected(reason)) => {
            ToolOutput::error(format!("Memory not saved: {reason}"))
        },
        Err(Error::NotFound(what)) => ToolOutput::error(format!("Not found: {what}")),
        Err(e) => {
            tracing::warn!(tool = name, error = %e, "tool call failed");
            ToolOutput::error(format!("{name} failed: {e}"))
        },
    };

    // Pending notifications ride on the next response, oldest first.
    if let Ok(notifications) = engine.tooling().consume_notifications(&project.hash) {
        if !notifications.is_empty() {
            let mut lines: Vec<String> =
                notifications.into_iter().map(|n| n.message).collect();
            lines.push(String::new());
            lines.push(output.text);
            output.text = lines.join("\n");
        }
    }
    output
}

// --- shared argument helpers ------------------------------------------------

pub(super) fn str_arg(args: &Value, name: &str) -> Option<String> {
    args.get(name)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
}

pub(super) fn usize_arg(args: &Value, name: &str, default: usize) -> usize {
    args.get(name)
        .and_then(Value::as_u64)
        .map_or(default, |v| v as usize)
}

pub(super) fn bool_arg(args: &Value, name: &str) -> bool {
    args.get(name).and_then(Value::as_bool).unwrap_or(false)
}

pub(super) fn require_str(args: &Value, name: &str) -> Result<String> {
    str_arg(args, name).ok_or_else(|| Error::ValidationRejected(format!("'{name}' is required")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LaminarkConfig;
    use crate::embedding::EmbeddingHandle;
    use crate::storage::Storage;
    use serde_json::json;
    use std::sync::Arc;

    pub(crate) fn engine() -> Engine {
        Engine::assemble(
            LaminarkConfig::with_data_dir(std::env::temp_dir().join("laminark-handler-test")),
            Storage::in_memory().unwrap(),
            Arc::new(EmbeddingHandle::disabled()),
            None,
        )
    }

    pub(crate) fn project() -> ProjectRef {
        ProjectRef {
            hash: "proj-a".to_string(),
            root: "/tmp/proj-a".into(),
            name: "proj-a".to_string(),
        }
    }

    fn call(engine: &Engine, name: &str, args: Value) -> ToolOutput {
        call_tool(engine, &project(), Verbosity::Standard, name, &args)
    }

    #[test]
    fn save_then_duplicate_rejection() {
        let engine = engine();
        let first = call(&engine, "save_memory", json!({"text": "remember the port"}));
        assert!(!first.is_error);

        let second = call(&engine, "save_memory", json!({"text": "remember the port"}));
        assert!(second.is_error);
        assert!(second.text.contains("Memory not saved"));
    }

    #[test]
    fn notifications_prepend_once() {
        let engine = engine();
        engine
            .tooling()
            .enqueue_notification("proj-a", "Topic shift detected. Stashed 4 observations.")
            .unwrap();

        let first = call(&engine, "status", json!({}));
        assert!(first.text.starts_with("Topic shift detected."));

        let second = call(&engine, "status", json!({}));
        assert!(!second.text.starts_with("Topic shift detected."));
    }

    #[test]
    fn unknown_tool_is_tool_error() {
        let engine = engine();
        let output = call(&engine, "frobnicate", json!({}));
        assert!(output.is_error);
    }
}
