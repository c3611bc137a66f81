//! MCP transport end-to-end: raw JSON-RPC lines through the server.

use laminark::config::LaminarkConfig;
use laminark::embedding::EmbeddingHandle;
use laminark::engine::Engine;
use laminark::mcp::McpServer;
use laminark::models::{ProjectRef, Verbosity};
use laminark::storage::Storage;
use serde_json::{Value, json};
use std::sync::Arc;

fn server() -> McpServer {
    let engine = Arc::new(Engine::assemble(
        LaminarkConfig::with_data_dir(std::env::temp_dir().join("laminark-mcp-it")),
        Storage::in_memory().unwrap(),
        Arc::new(EmbeddingHandle::disabled()),
        None,
    ));
    McpServer::new(
        engine,
        ProjectRef {
            hash: "proj-mcp".to_string(),
            root: "/tmp/proj-mcp".into(),
            name: "proj-mcp".to_string(),
        },
        Verbosity::Standard,
    )
}

fn call(server: &McpServer, id: u64, tool: &str, arguments: Value) -> Value {
    let request = json!({
        "jsonrpc": "2.0",
        "id": id,
        "method": "tools/call",
        "params": { "name": tool, "arguments": arguments },
    });
    let raw = server.handle_request(&request.to_string()).unwrap();
    serde_json::from_str(&raw).unwrap()
}

fn text_of(response: &Value) -> &str {
    response["result"]["content"][0]["text"].as_str().unwrap()
}

#[test]
fn initialize_then_list_then_call() {
    let server = server();
    let init = server
        .handle_request(r#"{"jsonrpc":"2.0","id":1,"method":"initialize"}"#)
        .unwrap();
    assert!(init.contains("serverInfo"));

    let list = server
        .handle_request(r#"{"jsonrpc":"2.0","id":2,"method":"tools/list"}"#)
        .unwrap();
    let parsed: Value = serde_json::from_str(&list).unwrap();
    assert_eq!(parsed["result"]["tools"].as_array().unwrap().len(), 17);
}

#[test]
fn save_recall_round_trip() {
    let server = server();
    let saved = call(
        &server,
        1,
        "save_memory",
        json!({"text": "decided to use write-ahead logging", "kind": "decision"}),
    );
    assert_eq!(saved["result"]["isError"], json!(false));
    assert!(text_of(&saved).contains("Memory saved"));

    let recalled = call(
        &server,
        2,
        "recall",
        json!({"query": "write-ahead logging"}),
    );
    assert!(text_of(&recalled).contains("decided to use write-ahead logging")
        || text_of(&recalled).contains("memories"));
}

#[test]
fn duplicate_save_is_friendly_error() {
    let server = server();
    call(&server, 1, "save_memory", json!({"text": "same text twice"}));
    let second = call(&server, 2, "save_memory", json!({"text": "same text twice"}));
    assert_eq!(second["result"]["isError"], json!(true));
    assert!(text_of(&second).starts_with("Memory not saved"));
}

#[test]
fn status_and_graph_stats_answer() {
    let server = server();
    let status = call(&server, 1, "status", json!({}));
    assert!(text_of(&status).contains("observations"));

    let stats = call(&server, 2, "graph_stats", json!({}));
    assert!(text_of(&stats).contains("nodes"));
}

#[test]
fn manual_debug_path_tools() {
    let server = server();
    let started = call(&server, 1, "path_start", json!({"trigger": "flaky auth test"}));
    assert!(text_of(&started).contains("started"));

    let listed = call(&server, 2, "path_list", json!({}));
    assert!(text_of(&listed).contains("flaky auth test"));

    let resolved = call(&server, 3, "path_resolve", json!({"resolution": "pinned the clock"}));
    assert!(text_of(&resolved).contains("resolved"));

    let shown = call(&server, 4, "path_show", json!({}));
    // No active path anymore; the tool reports that rather than erroring.
    assert_eq!(shown["result"]["isError"], json!(false));
}

#[test]
fn report_and_discover_tools() {
    let server = server();
    let reported = call(
        &server,
        1,
        "report_available_tools",
        json!({"tools": [
            {"name": "mcp__github__create_pr", "description": "Create a pull request"},
            {"name": "Edit", "description": "Edit files"},
        ]}),
    );
    assert!(text_of(&reported).contains("Registered 2"));

    let found = call(&server, 2, "discover_tools", json!({"query": "pull request"}));
    assert!(text_of(&found).contains("mcp__github__create_pr"));
}

#[test]
fn notification_rides_next_response_once() {
    let engine = Arc::new(Engine::assemble(
        LaminarkConfig::with_data_dir(std::env::temp_dir().join("laminark-mcp-notify")),
        Storage::in_memory().unwrap(),
        Arc::new(EmbeddingHandle::disabled()),
        None,
    ));
    let server = McpServer::new(
        Arc::clone(&engine),
        ProjectRef {
            hash: "proj-mcp".to_string(),
            root: "/tmp/proj-mcp".into(),
            name: "proj-mcp".to_string(),
        },
        Verbosity::Standard,
    );

    engine
        .tooling()
        .enqueue_notification("proj-mcp", "Topic shift detected. Stashed 5 observations.")
        .unwrap();

    let first = call(&server, 1, "status", json!({}));
    assert!(text_of(&first).starts_with("Topic shift detected."));

    let second = call(&server, 2, "status", json!({}));
    assert!(!text_of(&second).starts_with("Topic shift detected."));
}
