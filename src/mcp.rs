use std::io::{BufRead, Write};

use serde::Deserialize;
use serde_json::{json, Value};

use crate::broker::Broker;
use crate::model::ProxyRequest;
use crate::store::PolicyStore;

pub const PROTOCOL_VERSION: &str = "2024-11-05";

#[derive(Debug, Deserialize)]
struct JsonRpcRequest {
    #[allow(dead_code)]
    #[serde(default)]
    jsonrpc: String,
    #[serde(default)]
    id: Option<Value>,
    method: String,
    #[serde(default)]
    params: Value,
}

/// JSON-RPC 2.0 dispatcher exposing the broker as MCP tools. Shared by the
/// stdio transport and POST /mcp; both feed one message in and write one
/// reply out (or none, for notifications).
pub struct McpHandler<'a> {
    broker: &'a Broker,
    store: &'a PolicyStore,
}

impl<'a> McpHandler<'a> {
    pub fn new(broker: &'a Broker, store: &'a PolicyStore) -> Self {
        Self { broker, store }
    }

    /// Handle one raw JSON-RPC message. Returns the serialized response, or
    /// None when the message is a notification and must not be answered.
    pub fn handle_message(&self, raw: &str) -> Option<String> {
        let value: Value = match serde_json::from_str(raw) {
            Ok(value) => value,
            Err(err) => {
                return Some(
                    error_response(Value::Null, -32700, &format!("parse error: {}", err))
                        .to_string(),
                );
            }
        };

        // Well-formed JSON that is not a request object (e.g. no method) is
        // an invalid request, not a parse error.
        let request: JsonRpcRequest = match serde_json::from_value(value.clone()) {
            Ok(request) => request,
            Err(err) => {
                let id = value
                    .get("id")
                    .cloned()
                    .filter(|v| !v.is_null())
                    .unwrap_or(Value::Null);
                return Some(
                    error_response(id, -32600, &format!("invalid request: {}", err)).to_string(),
                );
            }
        };

        // Absent id and explicit null id are both notifications.
        let id = request.id.filter(|v| !v.is_null());

        if request.method.starts_with("notifications/") {
            return None;
        }

        let outcome = match request.method.as_str() {
            "initialize" => Ok(json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": { "tools": {} },
                "serverInfo": {
                    "name": "keygate",
                    "version": env!("CARGO_PKG_VERSION"),
                },
            })),
            "ping" => Ok(json!({})),
            "tools/list" => Ok(json!({ "tools": tool_definitions() })),
            "tools/call" => self.call_tool(&request.params),
            other => Err((-32601, format!("method not found: {}", other))),
        };

        // A caller that sent no id gets no reply, success or failure.
        let id = id?;
        let reply = match outcome {
            Ok(result) => json!({ "jsonrpc": "2.0", "id": id, "result": result }),
            Err((code, message)) => error_response(id, code, &message),
        };
        Some(reply.to_string())
    }

    fn call_tool(&self, params: &Value) -> Result<Value, (i64, String)> {
        let Some(name) = params.get("name").and_then(|n| n.as_str()) else {
            return Err((-32602, "missing tool name".to_string()));
        };
        let arguments = params.get("arguments").cloned().unwrap_or_else(|| json!({}));

        match name {
            "keygate_proxy" => Ok(self.tool_proxy(arguments)),
            "keygate_list_scopes" => Ok(self.tool_list_scopes()),
            "keygate_health" => Ok(tool_text("keygate broker is running", false)),
            other => Ok(tool_text(&format!("unknown tool: {}", other), true)),
        }
    }

    fn tool_proxy(&self, arguments: Value) -> Value {
        let request: ProxyRequest = match serde_json::from_value(arguments) {
            Ok(request) => request,
            Err(err) => {
                return tool_text(&format!("invalid proxy arguments: {}", err), true);
            }
        };

        let response = self.broker.handle(&request, "mcp");
        let mut text = format!("HTTP {}", response.status_code);
        if let Some(error) = &response.error {
            text.push_str(&format!("\n[Error: {}]", error));
        }
        if let Some(body) = &response.body {
            text.push_str("\n\n");
            text.push_str(body);
        }
        tool_text(&text, response.status_code >= 400)
    }

    fn tool_list_scopes(&self) -> Value {
        let policies = self.store.policies();
        if policies.is_empty() {
            return tool_text("no scopes configured", false);
        }

        let mut lines = Vec::new();
        for policy in &policies {
            let marker = if policy.priority == 1 { " (MAIN)" } else { "" };
            let domains = if policy.allowed_domains.is_empty() {
                "any".to_string()
            } else {
                policy.allowed_domains.join(", ")
            };
            let mut line = format!(
                "{}{} | mode: {} | type: {} | domains: {} | secret: {}",
                policy.scope,
                marker,
                match policy.approval_mode {
                    crate::model::ApprovalMode::Auto => "auto",
                    crate::model::ApprovalMode::Manual => "manual",
                    crate::model::ApprovalMode::Pending => "pending",
                },
                policy.credential_type.label(),
                domains,
                if policy.has_secret { "yes" } else { "no" },
            );
            if !policy.preferred_for.is_empty() {
                line.push_str(&format!(" | tags: {}", policy.preferred_for.join(", ")));
            }
            if !policy.is_enabled {
                line.push_str(" | DISABLED");
            }
            lines.push(line);
        }
        tool_text(&lines.join("\n"), false)
    }

    /// Line-delimited stdio transport: one JSON-RPC message per line in, one
    /// response per line out.
    pub fn serve_stdio(&self) -> Result<(), String> {
        let stdin = std::io::stdin();
        let stdout = std::io::stdout();

        for line in stdin.lock().lines() {
            let line = line.map_err(|e| e.to_string())?;
            if line.trim().is_empty() {
                continue;
            }
            if let Some(reply) = self.handle_message(&line) {
                let mut out = stdout.lock();
                writeln!(out, "{}", reply).map_err(|e| e.to_string())?;
                out.flush().map_err(|e| e.to_string())?;
            }
        }
        Ok(())
    }
}

fn error_response(id: Value, code: i64, message: &str) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": { "code": code, "message": message },
    })
}

fn tool_text(text: &str, is_error: bool) -> Value {
    json!({
        "content": [{ "type": "text", "text": text }],
        "isError": is_error,
    })
}

fn tool_definitions() -> Value {
    json!([
        {
            "name": "keygate_proxy",
            "description": "Forward an HTTP request through the credential broker. The broker injects the scope's credential; never pass secrets in headers.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "scope": { "type": "string", "description": "Credential scope, e.g. 'openai'" },
                    "method": { "type": "string", "description": "HTTP method, default GET" },
                    "url": { "type": "string", "description": "Full target URL" },
                    "headers": { "type": "object", "description": "Extra request headers" },
                    "body": { "type": "string", "description": "Raw request body" },
                    "reason": { "type": "string", "description": "Why this request is being made" }
                },
                "required": ["scope", "url"]
            }
        },
        {
            "name": "keygate_list_scopes",
            "description": "List configured credential scopes with their approval mode, credential type and allowed domains.",
            "inputSchema": { "type": "object", "properties": {} }
        },
        {
            "name": "keygate_health",
            "description": "Check that the credential broker is running.",
            "inputSchema": { "type": "object", "properties": {} }
        }
    ])
}
