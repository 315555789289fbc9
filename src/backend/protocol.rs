//! JSON-RPC envelopes and the MCP framing used by the order backend.

use crate::config::BackendProtocol;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

pub const MCP_PROTOCOL_VERSION: &str = "2024-11-05";
pub const DISCOVERY_METHOD: &str = "tools/list";

#[derive(Debug, Clone, Serialize)]
pub struct RpcRequest {
    pub jsonrpc: &'static str,
    /// Absent for notifications.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    pub method: String,
    pub params: Value,
}

impl RpcRequest {
    pub fn new(id: u64, method: impl Into<String>, params: Value) -> Self {
        Self {
            jsonrpc: "2.0",
            id: Some(id),
            method: method.into(),
            params,
        }
    }

    pub fn notification(method: impl Into<String>) -> Self {
        Self {
            jsonrpc: "2.0",
            id: None,
            method: method.into(),
            params: json!({}),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RpcResponse {
    #[serde(default)]
    pub id: Value,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<RpcError>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcResponse {
    /// Does this response answer request `id`?
    ///
    /// Error responses may carry a null id when the server could not read the
    /// request at all.
    pub fn answers(&self, id: u64) -> bool {
        match &self.id {
            Value::Number(n) => n.as_u64() == Some(id),
            Value::String(s) => s.parse::<u64>().ok() == Some(id),
            Value::Null => self.error.is_some(),
            _ => false,
        }
    }
}

/// Decode a response body, accepting plain JSON or an SSE stream whose
/// `data:` lines carry the JSON-RPC message.
pub fn decode_body(body: &str) -> Result<RpcResponse> {
    let trimmed = body.trim_start();
    if trimmed.starts_with('{') {
        return serde_json::from_str(trimmed)
            .map_err(|e| Error::protocol(format!("malformed JSON-RPC response: {e}")));
    }

    let mut last = None;
    for line in body.lines() {
        if let Some(data) = line.strip_prefix("data:") {
            let data = data.trim();
            if data.starts_with('{') {
                last = Some(data);
            }
        }
    }
    let data = last.ok_or_else(|| Error::protocol("response body is not JSON-RPC"))?;
    serde_json::from_str(data)
        .map_err(|e| Error::protocol(format!("malformed JSON-RPC event: {e}")))
}

/// Method and params carrying a call to `operation`.
pub fn frame_call(protocol: BackendProtocol, operation: &str, arguments: Value) -> (String, Value) {
    match protocol {
        BackendProtocol::JsonRpc => (operation.to_string(), arguments),
        BackendProtocol::Mcp => (
            "tools/call".to_string(),
            json!({ "name": operation, "arguments": arguments }),
        ),
    }
}

/// What a successful JSON-RPC `result` means for the caller.
#[derive(Debug, Clone, PartialEq)]
pub enum CallOutcome {
    Success(Value),
    /// The backend rejected the call in-band (MCP `isError`).
    Rejected(String),
}

pub fn interpret_result(protocol: BackendProtocol, result: Value) -> CallOutcome {
    match protocol {
        BackendProtocol::JsonRpc => CallOutcome::Success(result),
        BackendProtocol::Mcp => {
            let is_error = result["isError"].as_bool().unwrap_or(false);
            let payload = mcp_payload(&result);
            if is_error {
                let message = match payload {
                    Value::String(s) => s,
                    other => other.to_string(),
                };
                CallOutcome::Rejected(message)
            } else {
                CallOutcome::Success(payload)
            }
        }
    }
}

/// Collapse an MCP tool result into a single payload value.
///
/// Prefers `structuredContent`; otherwise joins the text blocks and parses
/// them as JSON when they look like JSON.
fn mcp_payload(result: &Value) -> Value {
    if let Some(structured) = result.get("structuredContent").filter(|v| !v.is_null()) {
        return structured.clone();
    }
    let text: Vec<&str> = result["content"]
        .as_array()
        .map(|blocks| {
            blocks
                .iter()
                .filter(|b| b["type"].as_str().unwrap_or("text") == "text")
                .filter_map(|b| b["text"].as_str())
                .collect()
        })
        .unwrap_or_default();
    if text.is_empty() {
        return Value::Null;
    }
    let joined = text.join("\n");
    let candidate = joined.trim();
    if candidate.starts_with('{') || candidate.starts_with('[') {
        if let Ok(value) = serde_json::from_str(candidate) {
            return value;
        }
    }
    Value::String(joined)
}

/// Operation names advertised by a `tools/list` result.
pub fn advertised_tools(result: &Value) -> Result<Vec<String>> {
    let tools = result["tools"]
        .as_array()
        .ok_or_else(|| Error::protocol("tools/list result has no 'tools' array"))?;
    Ok(tools
        .iter()
        .filter_map(|t| t["name"].as_str().map(str::to_string))
        .collect())
}

pub fn initialize_params() -> Value {
    json!({
        "protocolVersion": MCP_PROTOCOL_VERSION,
        "capabilities": {},
        "clientInfo": { "name": "orderdesk", "version": env!("CARGO_PKG_VERSION") }
    })
}
