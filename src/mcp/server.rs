//! Stdio JSON-RPC server loop.

use super::{McpMethod, definitions, handlers};
use crate::engine::Engine;
use crate::models::{ProjectRef, Verbosity};
use crate::{Error, Result};
use serde_json::{Value, json};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

/// Protocol version advertised on initialize.
const PROTOCOL_VERSION: &str = "2024-11-05";

/// The engine's MCP server, bound to the project it was started in.
pub struct McpServer {
    engine: Arc<Engine>,
    project: ProjectRef,
    verbosity: Verbosity,
}

impl McpServer {
    /// Creates a server for one project.
    #[must_use]
    pub const fn new(engine: Arc<Engine>, project: ProjectRef, verbosity: Verbosity) -> Self {
        Self {
            engine,
            project,
            verbosity,
        }
    }

    /// Serves JSON-RPC over stdin/stdout until EOF or shutdown.
    ///
    /// # Errors
    ///
    /// Returns an error only for unrecoverable I/O failures on the
    /// transport; per-request failures become JSON-RPC errors.
    pub async fn run_stdio(&self, mut shutdown: tokio::sync::watch::Receiver<bool>) -> Result<()> {
        let stdin = BufReader::new(tokio::io::stdin());
        let mut lines = stdin.lines();
        let mut stdout = tokio::io::stdout();

        loop {
            let line = tokio::select! {
                line = lines.next_line() => line.map_err(|e| Error::storage("stdin_read", e))?,
                _ = shutdown.changed() => break,
            };
            let Some(line) = line else { break };
            if line.trim().is_empty() {
                continue;
            }
            if let Some(response) = self.handle_request(&line) {
                let payload = format!("{response}\n");
                stdout
                    .write_all(payload.as_bytes())
                    .await
                    .map_err(|e| Error::storage("stdout_write", e))?;
                stdout
                    .flush()
                    .await
                    .map_err(|e| Error::storage("stdout_flush", e))?;
            }
        }
        Ok(())
    }

    /// Handles one raw request line. `None` for notifications (no id).
    #[must_use]
    pub fn handle_request(&self, raw: &str) -> Option<String> {
        let request: Value = match serde_json::from_str(raw) {
            Ok(request) => request,
            Err(_) => {
                return Some(
                    error_response(Value::Null, -32700, "parse error").to_string(),
                );
            },
        };
        let id = request.get("id").cloned();
        let method = request.get("method").and_then(Value::as_str).unwrap_or("");
        let params = request.get("params").cloned().unwrap_or(Value::Null);

        let result = self.dispatch(McpMethod::from(method), &params);

        // Requests without an id are notifications; nothing goes back.
        let id = id?;
        Some(
            match result {
                Ok(result) => json!({ "jsonrpc": "2.0", "id": id, "result": result }),
                Err((code, message)) => error_response(id, code, &message),
            }
            .to_string(),
        )
    }

    fn dispatch(&self, method: McpMethod, params: &Value) -> std::result::Result<Value, (i64, String)> {
        match method {
            McpMethod::Initialize => Ok(json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": { "tools": {} },
                "serverInfo": { "name": "laminark", "version": env!("CARGO_PKG_VERSION") },
            })),
            McpMethod::Ping => Ok(json!({})),
            McpMethod::ListTools => Ok(json!({ "tools": definitions::all_tools() })),
            McpMethod::CallTool => {
                let name = params
                    .get("name")
                    .and_then(Value::as_str)
                    .ok_or((-32602, "missing tool name".to_string()))?;
                let arguments = params.get("arguments").cloned().unwrap_or_else(|| json!({}));
                let output = handlers::call_tool(
                    &self.engine,
                    &self.project,
                    self.verbosity,
                    name,
                    &arguments,
                );
                Ok(json!({
                    "content": [{ "type": "text", "text": output.text }],
                    "isError": output.is_error,
                }))
            },
            McpMethod::Unknown(name) => Err((-32601, format!("method not found: {name}"))),
        }
    }
}

fn error_response(id: Value, code: i64, message: &str) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": { "code": code, "message": message },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LaminarkConfig;
    use crate::embedding::EmbeddingHandle;
    use crate::storage::Storage;

    fn server() -> McpServer {
        let engine = Arc::new(Engine::assemble(
            LaminarkConfig::with_data_dir(std::env::temp_dir().join("laminark-mcp-test")),
            Storage::in_memory().unwrap(),
            Arc::new(EmbeddingHandle::disabled()),
            None,
        ));
        McpServer::new(
            engine,
            ProjectRef {
                hash: "proj-a".to_string(),
                root: "/tmp/proj-a".into(),
                name: "proj-a".to_string(),
            },
            Verbosity::Standard,
        )
    }

    #[test]
    fn initialize_advertises_tools() {
        let server = server();
        let response = server
            .handle_request(r#"{"jsonrpc":"2.0","id":1,"method":"initialize"}"#)
            .unwrap();
        assert!(response.contains("laminark"));
        assert!(response.contains(PROTOCOL_VERSION));
    }

    #[test]
    fn tools_list_contains_fixed_set() {
        let server = server();
        let response = server
            .handle_request(r#"{"jsonrpc":"2.0","id":2,"method":"tools/list"}"#)
            .unwrap();
        for tool in ["save_memory", "recall", "query_graph", "status", "path_start"] {
            assert!(response.contains(tool), "{tool} missing from listing");
        }
    }

    #[test]
    fn unknown_method_is_json_rpc_error() {
        let server = server();
        let response = server
            .handle_request(r#"{"jsonrpc":"2.0","id":3,"method":"resources/list"}"#)
            .unwrap();
        assert!(response.contains("-32601"));
    }

    #[test]
    fn notifications_get_no_response() {
        let server = server();
        assert!(server
            .handle_request(r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#)
            .is_none());
    }

    #[test]
    fn tool_failures_are_tool_responses_not_protocol_errors() {
        let server = server();
        let response = server
            .handle_request(
                r#"{"jsonrpc":"2.0","id":4,"method":"tools/call",
                    "params":{"name":"save_memory","arguments":{"text":""}}}"#,
            )
            .unwrap();
        assert!(response.contains("\"isError\":true"));
        assert!(response.contains("result"));
    }
}
