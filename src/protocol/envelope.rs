//! JSON-RPC 2.0 envelope types and inbound message classification.

use serde::{Deserialize, Serialize};

/// JSON-RPC protocol version constant.
pub const JSONRPC_VERSION: &str = "2.0";

// ─── Request ids ────────────────────────────────────────────────────────────

/// A request identifier: the protocol allows either a number or a string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(u64),
    String(String),
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::String(s) => f.write_str(s),
        }
    }
}

impl From<u64> for RequestId {
    fn from(n: u64) -> Self {
        Self::Number(n)
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

// ─── Outbound messages ──────────────────────────────────────────────────────

/// JSON-RPC 2.0 request message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: RequestId,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl JsonRpcRequest {
    pub fn new(
        id: impl Into<RequestId>,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: id.into(),
            method: method.to_string(),
            params,
        }
    }
}

/// JSON-RPC 2.0 notification (no `id`, never answered).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcNotification {
    pub jsonrpc: String,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl JsonRpcNotification {
    pub fn new(method: &str, params: Option<serde_json::Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.to_string(),
            params,
        }
    }
}

// ─── Inbound messages ───────────────────────────────────────────────────────

/// JSON-RPC 2.0 error object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl std::fmt::Display for JsonRpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

/// Raw inbound payload shape used for classification.
#[derive(Debug, Deserialize)]
struct RawMessage {
    #[serde(default)]
    id: Option<RequestId>,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    params: Option<serde_json::Value>,
    // `result: null` is a legal success reply; keep presence distinct from
    // absence so it is not misread as a missing result.
    #[serde(default, deserialize_with = "present")]
    result: Option<serde_json::Value>,
    #[serde(default)]
    error: Option<JsonRpcError>,
}

fn present<'de, D>(deserializer: D) -> Result<Option<serde_json::Value>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    serde_json::Value::deserialize(deserializer).map(Some)
}

/// One classified inbound envelope.
///
/// Classification is by field presence: `method` + `id` is a request,
/// `method` without `id` is a notification, `error` + `id` is an error
/// reply, `result` + `id` is a success reply.
#[derive(Debug, Clone)]
pub enum Envelope {
    Request(JsonRpcRequest),
    Response {
        id: RequestId,
        result: serde_json::Value,
    },
    Error {
        id: RequestId,
        error: JsonRpcError,
    },
    Notification(JsonRpcNotification),
}

impl Envelope {
    /// Decode one raw JSON payload into exactly one envelope kind.
    ///
    /// Returns a human-readable reason on anything that is not a valid
    /// envelope; callers decide whether that is fatal (it usually is not —
    /// stray output on a shared stream is skipped and logged).
    pub fn decode(raw: &str) -> Result<Self, String> {
        let msg: RawMessage =
            serde_json::from_str(raw).map_err(|e| format!("not a JSON object: {e}"))?;

        match (msg.id, msg.method, msg.result, msg.error) {
            (Some(id), Some(method), _, _) => Ok(Self::Request(JsonRpcRequest {
                jsonrpc: JSONRPC_VERSION.to_string(),
                id,
                method,
                params: msg.params,
            })),
            (None, Some(method), _, _) => Ok(Self::Notification(JsonRpcNotification {
                jsonrpc: JSONRPC_VERSION.to_string(),
                method,
                params: msg.params,
            })),
            (Some(id), None, _, Some(error)) => Ok(Self::Error { id, error }),
            (Some(id), None, Some(result), None) => Ok(Self::Response { id, result }),
            (Some(_), None, None, None) => {
                Err("reply carries neither result nor error".to_string())
            }
            (None, None, _, _) => Err("message has neither id nor method".to_string()),
        }
    }
}

// ─── Well-known error codes ─────────────────────────────────────────────────

/// Standard JSON-RPC error codes.
pub mod error_codes {
    /// Invalid JSON was received.
    pub const PARSE_ERROR: i64 = -32700;
    /// The JSON sent is not a valid Request object.
    pub const INVALID_REQUEST: i64 = -32600;
    /// The method does not exist or is not available.
    pub const METHOD_NOT_FOUND: i64 = -32601;
    /// Invalid method parameters.
    pub const INVALID_PARAMS: i64 = -32602;
    /// Internal JSON-RPC error.
    pub const INTERNAL_ERROR: i64 = -32603;
}

// ─── Tests ──────────────────────────────────────────────────────────────────
