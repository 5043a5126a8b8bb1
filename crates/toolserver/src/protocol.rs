//! JSON-RPC 2.0 types for the tool-server protocol.
//!
//! The handshake transcript is initialize → notifications/initialized →
//! tools/list, then tools/call per invocation.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use dx_domain::tool::ToolDescriptor;

pub const PROTOCOL_VERSION: &str = "2024-11-05";

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Requests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A JSON-RPC 2.0 request (has an `id` — expects a response).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: u64,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    pub fn new(id: u64, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0".into(),
            id,
            method: method.into(),
            params,
        }
    }
}

/// A JSON-RPC 2.0 notification (no `id` — fire-and-forget).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JsonRpcNotification {
    pub jsonrpc: String,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcNotification {
    pub fn new(method: impl Into<String>) -> Self {
        Self {
            jsonrpc: "2.0".into(),
            method: method.into(),
            params: None,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Responses
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A JSON-RPC 2.0 response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    pub id: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// Extract the result value, or the error if the response carries one.
    pub fn into_result(self) -> Result<Value, JsonRpcError> {
        if let Some(err) = self.error {
            Err(err)
        } else {
            Ok(self.result.unwrap_or(Value::Null))
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl std::fmt::Display for JsonRpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Method payloads
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Parameters for the `initialize` request.
pub fn initialize_params() -> Value {
    serde_json::json!({
        "protocolVersion": PROTOCOL_VERSION,
        "capabilities": {},
        "clientInfo": {
            "name": "duplex",
            "version": env!("CARGO_PKG_VERSION"),
        }
    })
}

/// A tool definition as the server advertises it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawToolDef {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(rename = "inputSchema", default)]
    pub input_schema: Value,
}

impl RawToolDef {
    /// Namespace this definition under its server, producing the descriptor
    /// advertised to the LLM.
    pub fn into_descriptor(self, server: &str) -> ToolDescriptor {
        let description = self
            .description
            .unwrap_or_else(|| format!("Tool from {server}"));
        ToolDescriptor {
            name: format!("{server}_{}", self.name),
            description,
            input_schema: self.input_schema,
        }
    }
}

/// Result of `tools/list`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolsListResult {
    #[serde(default)]
    pub tools: Vec<RawToolDef>,
}

/// One content item in a `tools/call` result.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ToolContent {
    Text { text: String },
    #[serde(other)]
    Other,
}

/// Result of `tools/call`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolCallResult {
    #[serde(default)]
    pub content: Vec<ToolContent>,
    #[serde(rename = "isError", default)]
    pub is_error: bool,
}

impl ToolCallResult {
    /// Concatenated text content, or a placeholder when the server returned
    /// no textual payload.
    pub fn text(&self) -> String {
        let joined: Vec<&str> = self
            .content
            .iter()
            .filter_map(|c| match c {
                ToolContent::Text { text } => Some(text.as_str()),
                ToolContent::Other => None,
            })
            .collect();
        if joined.is_empty() {
            "No result".to_string()
        } else {
            joined.join("\n")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_serializes_without_null_params() {
        let req = JsonRpcRequest::new(1, "tools/list", None);
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["jsonrpc"], "2.0");
        assert!(json.get("params").is_none());
    }

    #[test]
    fn response_into_result() {
        let ok: JsonRpcResponse =
            serde_json::from_str(r#"{"jsonrpc":"2.0","id":1,"result":{"tools":[]}}"#).unwrap();
        assert!(!ok.is_error());
        assert!(ok.into_result().is_ok());

        let err: JsonRpcResponse = serde_json::from_str(
            r#"{"jsonrpc":"2.0","id":2,"error":{"code":-32601,"message":"method not found"}}"#,
        )
        .unwrap();
        assert!(err.is_error());
        assert_eq!(err.into_result().unwrap_err().code, -32601);
    }

    #[test]
    fn raw_tool_def_namespacing() {
        let def: RawToolDef = serde_json::from_str(
            r#"{"name": "multiply", "description": "Multiply two numbers",
                "inputSchema": {"type": "object"}}"#,
        )
        .unwrap();
        let descriptor = def.into_descriptor("calc");
        assert_eq!(descriptor.name, "calc_multiply");
        assert_eq!(descriptor.description, "Multiply two numbers");
    }

    #[test]
    fn missing_description_gets_server_attribution() {
        let def: RawToolDef = serde_json::from_str(r#"{"name": "ping"}"#).unwrap();
        let descriptor = def.into_descriptor("net");
        assert_eq!(descriptor.description, "Tool from net");
    }

    #[test]
    fn tool_call_result_text_extraction() {
        let result: ToolCallResult = serde_json::from_str(
            r#"{"content": [{"type": "text", "text": "105"}], "isError": false}"#,
        )
        .unwrap();
        assert!(!result.is_error);
        assert_eq!(result.text(), "105");

        let empty = ToolCallResult::default();
        assert_eq!(empty.text(), "No result");
    }

    #[test]
    fn unknown_content_kinds_are_tolerated() {
        let result: ToolCallResult = serde_json::from_str(
            r#"{"content": [{"type": "image", "data": "..."}, {"type": "text", "text": "ok"}]}"#,
        )
        .unwrap();
        assert_eq!(result.text(), "ok");
    }
}
