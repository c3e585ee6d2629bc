//! Wire types shared by tool servers and the client connector.
//!
//! JSON-RPC 2.0 envelopes plus the MCP payloads for the handshake,
//! tool discovery, and tool calls.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::errors::ProtocolError;

/// JSON-RPC protocol version carried in every envelope.
pub const JSONRPC_VERSION: &str = "2.0";

/// MCP protocol revision spoken by this crate.
pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// MCP method names.
pub mod methods {
    pub const INITIALIZE: &str = "initialize";
    pub const INITIALIZED: &str = "notifications/initialized";
    pub const CANCELLED: &str = "notifications/cancelled";
    pub const PING: &str = "ping";
    pub const TOOLS_LIST: &str = "tools/list";
    pub const TOOLS_CALL: &str = "tools/call";
}

// ─── JSON-RPC 2.0 ───────────────────────────────────────────────────────────

/// Correlation token pairing a request with its response.
///
/// The client connector always issues numeric ids; servers echo whatever
/// they receive.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(u64),
    String(String),
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RequestId::Number(n) => write!(f, "{n}"),
            RequestId::String(s) => write!(f, "{s}"),
        }
    }
}

/// JSON-RPC 2.0 request or notification (a notification has no `id`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<RequestId>,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    /// Create a new JSON-RPC request.
    pub fn new(id: u64, method: &str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: Some(RequestId::Number(id)),
            method: method.to_string(),
            params,
        }
    }

    /// Create a notification (no response expected).
    pub fn notification(method: &str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: None,
            method: method.to_string(),
            params,
        }
    }
}

/// JSON-RPC 2.0 response message (success or error).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    /// `None` serializes as `null`, used when the request id is unknown.
    pub id: Option<RequestId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    /// Successful response carrying `result`.
    pub fn success(id: RequestId, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: Some(id),
            result: Some(result),
            error: None,
        }
    }

    /// Error response. `id` is `None` when the request could not be read.
    pub fn failure(id: Option<RequestId>, code: i32, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: None,
            error: Some(JsonRpcError {
                code,
                message: message.into(),
                data: None,
            }),
        }
    }
}

/// JSON-RPC 2.0 error object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// An inbound frame classified by shape.
#[derive(Debug, Clone)]
pub enum Message {
    Request(JsonRpcRequest),
    Notification(JsonRpcRequest),
    Response(JsonRpcResponse),
}

impl Message {
    /// Classify a decoded JSON value as a request, notification, or response.
    pub fn from_value(value: Value) -> Result<Self, ProtocolError> {
        let Some(obj) = value.as_object() else {
            return Err(ProtocolError::Malformed {
                reason: "frame is not a JSON object".into(),
            });
        };

        if obj.get("jsonrpc").and_then(Value::as_str) != Some(JSONRPC_VERSION) {
            return Err(ProtocolError::Malformed {
                reason: "missing or unsupported 'jsonrpc' version".into(),
            });
        }

        if obj.contains_key("method") {
            let request: JsonRpcRequest =
                serde_json::from_value(value).map_err(|e| ProtocolError::Malformed {
                    reason: format!("invalid request: {e}"),
                })?;
            return Ok(if request.id.is_some() {
                Message::Request(request)
            } else {
                Message::Notification(request)
            });
        }

        if obj.contains_key("result") || obj.contains_key("error") {
            let response: JsonRpcResponse =
                serde_json::from_value(value).map_err(|e| ProtocolError::Malformed {
                    reason: format!("invalid response: {e}"),
                })?;
            return Ok(Message::Response(response));
        }

        Err(ProtocolError::Malformed {
            reason: "frame is neither a request nor a response".into(),
        })
    }
}

// ─── MCP Protocol Types ──────────────────────────────────────────────────────

/// A tool as published by a server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "inputSchema", default = "empty_object_schema")]
    pub input_schema: Value,
}

fn empty_object_schema() -> Value {
    serde_json::json!({ "type": "object", "properties": {} })
}

/// One block of tool output.
///
/// Only `text` is interpreted here; other block kinds (`image`, `resource`,
/// ...) keep their fields in `extra` so nothing the server sent is lost.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentBlock {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl ContentBlock {
    /// A `text` block.
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            kind: "text".to_string(),
            text: Some(text.into()),
            extra: serde_json::Map::new(),
        }
    }

    /// The text payload, if this is a text block.
    pub fn as_text(&self) -> Option<&str> {
        if self.kind == "text" {
            self.text.as_deref()
        } else {
            None
        }
    }
}

/// A call request as seen by the server-side dispatcher.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCallRequest {
    pub id: RequestId,
    pub tool_name: String,
    pub arguments: Value,
}

/// Outcome of one tool call. Produced exactly once per request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallResult {
    #[serde(default)]
    pub content: Vec<ContentBlock>,
    #[serde(rename = "isError", default)]
    pub is_error: bool,
}

impl ToolCallResult {
    /// Successful result with the given content.
    pub fn success(content: Vec<ContentBlock>) -> Self {
        Self {
            content,
            is_error: false,
        }
    }

    /// Failed result carrying a single text block.
    pub fn error_text(message: impl Into<String>) -> Self {
        Self {
            content: vec![ContentBlock::text(message)],
            is_error: true,
        }
    }

    /// All text blocks joined with newlines.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(ContentBlock::as_text)
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// `tools/call` request parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallToolParams {
    pub name: String,
    #[serde(default)]
    pub arguments: Value,
}

/// `tools/list` response payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListToolsResult {
    pub tools: Vec<ToolDefinition>,
}

/// Name and version of a peer (`clientInfo` / `serverInfo`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Implementation {
    pub name: String,
    #[serde(default)]
    pub version: String,
}

/// Tools capability advertised by a server.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolsCapability {
    #[serde(rename = "listChanged", default)]
    pub list_changed: bool,
}

/// Capabilities a server declares during `initialize`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServerCapabilities {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<ToolsCapability>,
}

/// `initialize` request parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitializeParams {
    #[serde(rename = "protocolVersion")]
    pub protocol_version: String,
    #[serde(default)]
    pub capabilities: Value,
    #[serde(rename = "clientInfo")]
    pub client_info: Implementation,
}

/// `initialize` response payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitializeResult {
    #[serde(rename = "protocolVersion")]
    pub protocol_version: String,
    #[serde(default)]
    pub capabilities: ServerCapabilities,
    #[serde(rename = "serverInfo", default, skip_serializing_if = "Option::is_none")]
    pub server_info: Option<Implementation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
}

// ─── Standard MCP Error Codes ────────────────────────────────────────────────

/// Well-known JSON-RPC / MCP error codes.
pub mod error_codes {
    /// Invalid JSON was received.
    pub const PARSE_ERROR: i32 = -32700;
    /// The JSON sent is not a valid Request object.
    pub const INVALID_REQUEST: i32 = -32600;
    /// The method does not exist or is not available.
    pub const METHOD_NOT_FOUND: i32 = -32601;
    /// Invalid method parameters.
    pub const INVALID_PARAMS: i32 = -32602;
    /// Internal JSON-RPC error.
    pub const INTERNAL_ERROR: i32 = -32603;
    /// Request arrived before the handshake completed.
    pub const SERVER_NOT_INITIALIZED: i32 = -32002;
}

// ─── Tests ───────────────────────────────────────────────────────────────────
