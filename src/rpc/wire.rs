//! JSON-RPC 2.0 envelope types and error codes.
//!
//! Three frame shapes travel over a connection:
//!   - call open:   `{"jsonrpc":"2.0","id":N,"method":...,"params":...,"meta":...}`
//!   - stream:      `{"jsonrpc":"2.0","id":N,"stream":{"item":...}}` or
//!                  `{"jsonrpc":"2.0","id":N,"stream":{"end":true}}`
//!   - final:       `{"jsonrpc":"2.0","id":N,"result":...}` or `...,"error":{...}}`

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ─── Error codes ─────────────────────────────────────────────────────────────

pub const PARSE_ERROR: i32 = -32700;
pub const INVALID_REQUEST: i32 = -32600;
pub const METHOD_NOT_FOUND: i32 = -32601;
/// Malformed params or failed request validation (gRPC InvalidArgument analog).
pub const INVALID_ARGUMENT: i32 = -32602;
pub const INTERNAL_ERROR: i32 = -32603;
pub const NOT_FOUND: i32 = -32001;
pub const UNAUTHENTICATED: i32 = -32004;

// ─── Frames ──────────────────────────────────────────────────────────────────

/// A call-open frame.
#[derive(Debug, Deserialize)]
pub struct RpcRequest {
    pub jsonrpc: String,
    pub id: Option<Value>,
    pub method: String,
    pub params: Option<Value>,
    /// Caller-supplied header map; the auth interceptor reads
    /// `meta.authorization` from here.
    pub meta: Option<Value>,
}

/// Payload of a mid-call stream frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item: Option<Value>,
    /// Half-close marker; sent by the client after its last item.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub end: bool,
}

/// Any decoded incoming frame.
#[derive(Debug)]
pub enum Frame {
    Request(RpcRequest),
    Stream { id: Value, payload: StreamPayload },
}

impl Frame {
    /// Decode one frame of wire text. A frame with a `stream` member is a
    /// stream frame; anything else must parse as a call-open request.
    pub fn decode(text: &str) -> Result<Frame, serde_json::Error> {
        #[derive(Deserialize)]
        struct Probe {
            jsonrpc: String,
            id: Option<Value>,
            stream: Option<StreamPayload>,
        }

        let probe: Probe = serde_json::from_str(text)?;
        if let Some(payload) = probe.stream {
            if probe.jsonrpc != "2.0" {
                return Err(serde::de::Error::custom("jsonrpc must be \"2.0\""));
            }
            return Ok(Frame::Stream {
                id: probe.id.unwrap_or(Value::Null),
                payload,
            });
        }
        Ok(Frame::Request(serde_json::from_str(text)?))
    }
}

#[derive(Serialize)]
pub struct RpcResponse {
    pub jsonrpc: &'static str,
    pub id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i32,
    pub message: String,
}

/// Serialize a final success response.
pub fn result_response(id: &Value, result: Value) -> String {
    let resp = RpcResponse {
        jsonrpc: "2.0",
        id: id.clone(),
        result: Some(result),
        error: None,
    };
    serde_json::to_string(&resp).unwrap_or_default()
}

/// Serialize a final error response.
pub fn error_response(id: &Value, code: i32, message: &str) -> String {
    let resp = RpcResponse {
        jsonrpc: "2.0",
        id: id.clone(),
        result: None,
        error: Some(RpcError {
            code,
            message: message.to_string(),
        }),
    };
    serde_json::to_string(&resp).unwrap_or_default()
}

/// Serialize a stream frame carrying one item.
pub fn stream_item(id: &Value, item: Value) -> String {
    serde_json::json!({
        "jsonrpc": "2.0",
        "id": id,
        "stream": { "item": item }
    })
    .to_string()
}

/// Serialize a half-close stream frame.
pub fn stream_end(id: &Value) -> String {
    serde_json::json!({
        "jsonrpc": "2.0",
        "id": id,
        "stream": { "end": true }
    })
    .to_string()
}
