//! Routing of `mcp_message` control requests to in-process tool
//! servers.
//!
//! The payload is a JSON-RPC 2.0 envelope; the router serves
//! `initialize`, `tools/list` and `tools/call` and answers everything
//! else with the standard error codes.

use serde_json::{json, Value};
use std::collections::HashMap;
use tracing::debug;

use crate::errors::ToolError;
use crate::mcp::ToolServer;

/// JSON-RPC 2.0 error codes.
const PARSE_ERROR: i64 = -32700;
const INVALID_REQUEST: i64 = -32600;
const METHOD_NOT_FOUND: i64 = -32601;
const INVALID_PARAMS: i64 = -32602;
const INTERNAL_ERROR: i64 = -32603;

/// Routes tool-server messages by server name.
pub struct ToolRouter {
    servers: HashMap<String, ToolServer>,
}

impl ToolRouter {
    /// Build a router over the given servers. Later servers shadow
    /// earlier ones with the same name.
    pub fn new(servers: Vec<ToolServer>) -> Self {
        Self {
            servers: servers
                .into_iter()
                .map(|s| (s.name().to_string(), s))
                .collect(),
        }
    }

    /// Whether any servers are registered.
    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    /// Descriptors of all servers, announced at initialize.
    pub fn descriptors(&self) -> Value {
        let mut names: Vec<_> = self.servers.keys().collect();
        names.sort();
        Value::Array(
            names
                .into_iter()
                .map(|name| self.servers[name].descriptor())
                .collect(),
        )
    }

    /// Handle one `mcp_message`. Returns the JSON-RPC response to send
    /// back, or `ServerNotFound` when the name does not resolve.
    pub async fn route(&self, server_name: &str, message: &Value) -> Result<Value, ToolError> {
        let server = self
            .servers
            .get(server_name)
            .ok_or_else(|| ToolError::ServerNotFound {
                name: server_name.to_string(),
            })?;
        Ok(handle_message(server, message).await)
    }
}

/// Serve one JSON-RPC envelope against one server. Always produces a
/// response value; protocol problems map to the standard error codes.
async fn handle_message(server: &ToolServer, message: &Value) -> Value {
    // Tolerate a doubly-encoded envelope.
    let parsed;
    let message = match message {
        Value::String(text) => match serde_json::from_str::<Value>(text) {
            Ok(v) => {
                parsed = v;
                &parsed
            }
            Err(e) => return error_response(Value::Null, PARSE_ERROR, &format!("parse error: {e}")),
        },
        other => other,
    };

    let Some(obj) = message.as_object() else {
        return error_response(Value::Null, INVALID_REQUEST, "request must be an object");
    };
    let id = obj.get("id").cloned().unwrap_or(Value::Null);
    let Some(method) = obj.get("method").and_then(Value::as_str) else {
        return error_response(id, INVALID_REQUEST, "missing method");
    };
    let params = obj.get("params").cloned().unwrap_or(Value::Null);

    debug!("tool server {:?} serving {}", server.name(), method);

    match method {
        "initialize" => success_response(
            id,
            json!({
                "capabilities": {"tools": {"list_changed": false}},
                "server_info": {"name": server.name(), "version": server.version()},
            }),
        ),
        "tools/list" => {
            let tools: Vec<Value> = server
                .tools()
                .iter()
                .map(|tool| {
                    json!({
                        "name": tool.name,
                        "description": tool.description,
                        "input_schema": tool.input_schema.to_json(),
                    })
                })
                .collect();
            success_response(id, json!({"tools": tools}))
        }
        "tools/call" => call_tool(server, id, &params).await,
        other => error_response(
            id,
            METHOD_NOT_FOUND,
            &ToolError::UnknownMethod {
                method: other.to_string(),
            }
            .to_string(),
        ),
    }
}

async fn call_tool(server: &ToolServer, id: Value, params: &Value) -> Value {
    let Some(name) = params.get("name").and_then(Value::as_str) else {
        return error_response(id, INVALID_PARAMS, "missing tool name");
    };
    let Some(tool) = server.tool(name) else {
        return error_response(
            id,
            INVALID_PARAMS,
            &ToolError::ToolNotFound {
                name: name.to_string(),
            }
            .to_string(),
        );
    };
    let arguments = params
        .get("arguments")
        .cloned()
        .unwrap_or_else(|| json!({}));

    match (tool.handler)(arguments).await {
        Ok(result) => match serde_json::to_value(&result) {
            Ok(value) => success_response(id, value),
            Err(e) => error_response(
                id,
                INTERNAL_ERROR,
                &format!("failed to encode tool result: {e}"),
            ),
        },
        Err(e) => error_response(id, INTERNAL_ERROR, &e.to_string()),
    }
}

fn success_response(id: Value, result: Value) -> Value {
    json!({"jsonrpc": "2.0", "id": id, "result": result})
}

fn error_response(id: Value, code: i64, message: &str) -> Value {
    json!({"jsonrpc": "2.0", "id": id, "error": {"code": code, "message": message}})
}
