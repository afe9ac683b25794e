//! Thin JSON-RPC 2.0 message set for the MCP wire protocol, plus SSE body
//! parsing for streamable-HTTP responses.
//!
//! Transports speak these types; sessions never touch raw JSON lines.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::McpError;

/// Protocol version sent in the `initialize` handshake and HTTP headers.
pub const PROTOCOL_VERSION: &str = "2025-11-25";

/// JSON-RPC message id: string or integer on the wire.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageId {
    Str(String),
    Num(i64),
}

impl MessageId {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            Self::Num(_) => None,
        }
    }
}

impl From<&str> for MessageId {
    fn from(s: &str) -> Self {
        Self::Str(s.to_string())
    }
}

impl From<String> for MessageId {
    fn from(s: String) -> Self {
        Self::Str(s)
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Str(s) => f.write_str(s),
            Self::Num(n) => write!(f, "{}", n),
        }
    }
}

/// JSON-RPC error object.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ErrorObject {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ErrorObject {
    pub fn new(code: i64, message: impl Into<String>, data: Option<Value>) -> Self {
        Self {
            code,
            message: message.into(),
            data,
        }
    }
}

/// Outgoing request.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RequestMessage {
    pub jsonrpc: String,
    pub id: MessageId,
    pub method: String,
    pub params: Value,
}

impl RequestMessage {
    pub fn new(id: impl Into<MessageId>, method: impl Into<String>, params: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id: id.into(),
            method: method.into(),
            params,
        }
    }
}

/// Fire-and-forget notification (no id).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NotificationMessage {
    pub jsonrpc: String,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl NotificationMessage {
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            method: method.into(),
            params,
        }
    }
}

/// Response: result or error, matched to its request by id.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ResultMessage {
    pub id: MessageId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorObject>,
}

impl ResultMessage {
    pub fn success(id: impl Into<MessageId>, result: Value) -> Self {
        Self {
            id: id.into(),
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: impl Into<MessageId>, error: ErrorObject) -> Self {
        Self {
            id: id.into(),
            result: None,
            error: Some(error),
        }
    }

    /// Serializes as a full JSON-RPC response line.
    pub fn to_wire(&self) -> Value {
        let mut obj = json!({ "jsonrpc": "2.0", "id": self.id.clone() });
        if let Some(err) = &self.error {
            obj["error"] = serde_json::to_value(err).unwrap_or(Value::Null);
        } else {
            obj["result"] = self.result.clone().unwrap_or(Value::Null);
        }
        obj
    }
}

/// One incoming wire message, demultiplexed by shape: a `method` with an `id`
/// is a server-initiated request, a `method` without one is a notification,
/// and an `id` with `result`/`error` is a response.
#[derive(Clone, Debug)]
pub enum JsonRpcMessage {
    Request(RequestMessage),
    Notification(NotificationMessage),
    Result(ResultMessage),
}

impl JsonRpcMessage {
    /// Parses one line/body of JSON into a message, by shape.
    pub fn parse(raw: &str) -> Result<Self, McpError> {
        let value: Value = serde_json::from_str(raw)
            .map_err(|e| McpError::connection(format!("invalid JSON-RPC frame: {}", e)))?;
        Self::from_value(value)
    }

    pub fn from_value(value: Value) -> Result<Self, McpError> {
        let has_method = value.get("method").is_some();
        let has_id = value.get("id").map(|v| !v.is_null()).unwrap_or(false);

        if has_method && has_id {
            let req: RequestMessage = serde_json::from_value(value)
                .map_err(|e| McpError::connection(format!("invalid JSON-RPC request: {}", e)))?;
            Ok(Self::Request(req))
        } else if has_method {
            let n: NotificationMessage = serde_json::from_value(value).map_err(|e| {
                McpError::connection(format!("invalid JSON-RPC notification: {}", e))
            })?;
            Ok(Self::Notification(n))
        } else if has_id {
            let r: ResultMessage = serde_json::from_value(value)
                .map_err(|e| McpError::connection(format!("invalid JSON-RPC response: {}", e)))?;
            Ok(Self::Result(r))
        } else {
            Err(McpError::connection(
                "JSON-RPC frame has neither method nor id",
            ))
        }
    }
}

/// Builds the MCP `initialize` params for this client.
pub fn initialize_params() -> Value {
    json!({
        "protocolVersion": PROTOCOL_VERSION,
        "capabilities": { "tools": {} },
        "clientInfo": {
            "name": "plait-mcp",
            "version": env!("CARGO_PKG_VERSION")
        }
    })
}

/// Parses a JSON-RPC response out of an HTTP body. Supports both
/// `application/json` (single object) and `text/event-stream` (`data:` lines;
/// multi-line data accumulates until a complete response parses). Returns the
/// first message that carries a result or error.
pub fn parse_response_body(body: &str, is_sse: bool) -> Result<ResultMessage, McpError> {
    if !is_sse {
        return serde_json::from_str(body)
            .map_err(|e| McpError::connection(format!("response json: {}", e)));
    }

    let mut data_buffer = String::new();
    let try_parse = |buf: &mut String| -> Option<ResultMessage> {
        if buf.is_empty() {
            return None;
        }
        match serde_json::from_str::<ResultMessage>(buf) {
            Ok(r) if r.result.is_some() || r.error.is_some() => Some(r),
            _ => None,
        }
    };

    for line in body.lines() {
        if let Some(data) = line.strip_prefix("data: ") {
            if data == "[DONE]" || data.is_empty() {
                if let Some(r) = try_parse(&mut data_buffer) {
                    return Ok(r);
                }
                data_buffer.clear();
                continue;
            }
            if data_buffer.is_empty() {
                data_buffer = data.to_string();
            } else {
                data_buffer.push('\n');
                data_buffer.push_str(data);
            }
            if let Some(r) = try_parse(&mut data_buffer) {
                return Ok(r);
            }
        } else if line.trim().is_empty() {
            if let Some(r) = try_parse(&mut data_buffer) {
                return Ok(r);
            }
            data_buffer.clear();
        }
    }
    if let Some(r) = try_parse(&mut data_buffer) {
        return Ok(r);
    }
    Err(McpError::connection(
        "SSE stream: no JSON-RPC response (result/error) found",
    ))
}
