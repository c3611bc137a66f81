//! Hook surface edge cases: malformed payloads must drop events, never
//! break the host.

use laminark::config::LaminarkConfig;
use laminark::embedding::EmbeddingHandle;
use laminark::engine::Engine;
use laminark::hooks::{HookEvent, dispatch};
use laminark::storage::{ListOptions, Storage};
use std::sync::Arc;

fn engine() -> Engine {
    Engine::assemble(
        LaminarkConfig::with_data_dir(std::env::temp_dir().join("laminark-hooks-it")),
        Storage::in_memory().unwrap(),
        Arc::new(EmbeddingHandle::disabled()),
        None,
    )
}

#[test]
fn malformed_payloads_are_dropped() {
    for raw in ["", "not json", "[]", "42", r#"{"missing": "event name"}"#] {
        assert!(HookEvent::parse(raw).is_none(), "{raw:?} should not parse");
    }
}

#[test]
fn tool_event_without_tool_name_is_ignored() {
    let engine = engine();
    let event = HookEvent::parse(
        r#"{"hook_event_name": "PostToolUse", "session_id": "s1", "cwd": "/tmp"}"#,
    )
    .unwrap();
    assert!(dispatch(&engine, &event).is_none());
}

#[test]
fn pre_tool_use_with_weird_input_is_silent() {
    let engine = engine();
    for input in [
        r#"{"hook_event_name": "PreToolUse", "cwd": "/tmp", "tool_name": "Bash",
            "tool_input": {"command": ""}}"#,
        r#"{"hook_event_name": "PreToolUse", "cwd": "/tmp", "tool_name": "Read",
            "tool_input": {"file_path": 42}}"#,
        r#"{"hook_event_name": "PreToolUse", "cwd": "/tmp", "tool_name": "Glob",
            "tool_input": {"pattern": "**"}}"#,
    ] {
        let event = HookEvent::parse(input).unwrap();
        assert!(dispatch(&engine, &event).is_none());
    }
}

#[test]
fn stop_without_session_is_a_noop() {
    let engine = engine();
    let event = HookEvent::parse(r#"{"hook_event_name": "Stop", "cwd": "/tmp"}"#).unwrap();
    assert!(dispatch(&engine, &event).is_none());
}

#[test]
fn write_captured_end_to_end() {
    let engine = engine();
    let event = HookEvent::parse(
        r#"{"hook_event_name": "PostToolUse", "session_id": "s1", "cwd": "/tmp/hooks-project",
            "tool_name": "Edit",
            "tool_input": {"file_path": "src/a.ts", "old_string": "x", "new_string": "y"}}"#,
    )
    .unwrap();
    assert!(dispatch(&engine, &event).is_none());

    let project = event.project();
    let rows = engine
        .observations(&project.hash)
        .list(&ListOptions::default())
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].source, "hook:Edit");
    assert!(rows[0]
        .content
        .starts_with("[Edit] Modified src/a.ts: replaced \"x\" with \"y\""));
}

#[test]
fn repeated_dispatch_never_panics() {
    let engine = engine();
    let payloads = [
        r#"{"hook_event_name": "SessionStart", "session_id": "s1", "cwd": "/tmp"}"#,
        r#"{"hook_event_name": "PostToolUse", "session_id": "s1", "cwd": "/tmp",
            "tool_name": "Bash", "tool_input": {"command": "ls"}}"#,
        r#"{"hook_event_name": "PostToolUseFailure", "session_id": "s1", "cwd": "/tmp",
            "tool_name": "Bash", "tool_input": {"command": "cargo test"},
            "tool_response": {"stdout": "error: oh no"}}"#,
        r#"{"hook_event_name": "Stop", "session_id": "s1", "cwd": "/tmp"}"#,
    ];
    for _ in 0..3 {
        for raw in payloads {
            let event = HookEvent::parse(raw).unwrap();
            let _ = dispatch(&engine, &event);
        }
    }
}
