//! Hook surface: short-lived per-event entry points.
//!
//! A hook process reads one JSON event from standard input and dispatches
//! on `hook_event_name`. `SessionStart` and `PreToolUse` are synchronous:
//! whatever they return is written to standard output and injected into the
//! upstream LLM's context. Every other event returns nothing, and a failed
//! hook silently drops one event rather than breaking the host: the
//! process always exits 0.

mod post_tool_use;
mod pre_tool_use;
mod session_start;
mod stop;

use crate::engine::Engine;
use crate::models::ProjectRef;
use serde::Deserialize;
use std::path::PathBuf;

/// One event delivered on the hook surface.
#[derive(Debug, Clone, Deserialize)]
pub struct HookEvent {
    /// Which hook fired.
    pub hook_event_name: String,
    /// Host session identifier.
    #[serde(default)]
    pub session_id: Option<String>,
    /// Working directory of the assistant session.
    #[serde(default)]
    pub cwd: Option<PathBuf>,
    /// Tool name, for tool events.
    #[serde(default)]
    pub tool_name: Option<String>,
    /// Tool input payload, for tool events.
    #[serde(default)]
    pub tool_input: serde_json::Value,
    /// Tool response payload, for post-tool events.
    #[serde(default)]
    pub tool_response: Option<serde_json::Value>,
}

impl HookEvent {
    /// Parses an event from the stdin payload.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match serde_json::from_str(raw) {
            Ok(event) => Some(event),
            Err(e) => {
                tracing::warn!(error = %e, "malformed hook event dropped");
                None
            },
        }
    }

    /// The project this event belongs to.
    #[must_use]
    pub fn project(&self) -> ProjectRef {
        let cwd = self
            .cwd
            .clone()
            .or_else(|| std::env::current_dir().ok())
            .unwrap_or_else(|| PathBuf::from("."));
        ProjectRef::from_path(&cwd)
    }
}

/// Dispatches one event. The returned string, when present, belongs on
/// standard output (synchronous hooks only).
///
/// Never fails: handler errors are logged and swallowed so the hook binary
/// can keep its exit-0 contract.
#[must_use]
pub fn dispatch(engine: &Engine, event: &HookEvent) -> Option<String> {
    let result = match event.hook_event_name.as_str() {
        "SessionStart" => session_start::handle(engine, event),
        "PreToolUse" => pre_tool_use::handle(engine, event),
        "PostToolUse" | "PostToolUseFailure" => post_tool_use::handle(engine, event),
        "SessionEnd" | "Stop" => stop::handle(engine, event),
        other => {
            tracing::debug!(event = other, "unknown hook event ignored");
            Ok(None)
        },
    };
    match result {
        Ok(stdout) => stdout,
        Err(e) => {
            tracing::warn!(event = event.hook_event_name, error = %e, "hook handler failed, event dropped");
            None
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LaminarkConfig;
    use crate::embedding::EmbeddingHandle;
    use crate::storage::Storage;
    use std::sync::Arc;

    fn engine() -> Engine {
        Engine::assemble(
            LaminarkConfig::with_data_dir(std::env::temp_dir().join("laminark-hook-test")),
            Storage::in_memory().unwrap(),
            Arc::new(EmbeddingHandle::disabled()),
            None,
        )
    }

    #[test]
    fn malformed_event_is_dropped() {
        assert!(HookEvent::parse("not json").is_none());
        assert!(HookEvent::parse("{}").is_none());
    }

    #[test]
    fn unknown_event_returns_nothing() {
        let engine = engine();
        let event = HookEvent::parse(
            r#"{"hook_event_name": "SomethingNew", "session_id": "s1", "cwd": "/tmp"}"#,
        )
        .unwrap();
        assert!(dispatch(&engine, &event).is_none());
    }

    #[test]
    fn session_start_writes_context_to_stdout() {
        let engine = engine();
        let event = HookEvent::parse(
            r#"{"hook_event_name": "SessionStart", "session_id": "s1", "cwd": "/tmp"}"#,
        )
        .unwrap();
        let stdout = dispatch(&engine, &event).unwrap();
        assert!(stdout.contains("## Previous session"));
    }

    #[test]
    fn post_tool_use_is_silent() {
        let engine = engine();
        let event = HookEvent::parse(
            r#"{"hook_event_name": "PostToolUse", "session_id": "s1", "cwd": "/tmp",
                "tool_name": "Edit",
                "tool_input": {"file_path": "a.rs", "old_string": "x", "new_string": "y"}}"#,
        )
        .unwrap();
        assert!(dispatch(&engine, &event).is_none());
    }

    #[test]
    fn stop_closes_the_session() {
        let engine = engine();
        let start = HookEvent::parse(
            r#"{"hook_event_name": "SessionStart", "session_id": "s9", "cwd": "/tmp"}"#,
        )
        .unwrap();
        let _ = dispatch(&engine, &start);
        let stop = HookEvent::parse(
            r#"{"hook_event_name": "Stop", "session_id": "s9", "cwd": "/tmp"}"#,
        )
        .unwrap();
        assert!(dispatch(&engine, &stop).is_none());
        assert!(!engine.sessions().get("s9").unwrap().unwrap().is_open());
    }
}
