//! JSON-RPC 2.0 envelope.
//!
//! Incoming bodies are classified by shape rather than by a tag field:
//! `method` + `id` is a request, `method` alone is a notification, and
//! `id` with `result`/`error` is a response.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const JSONRPC_VERSION: &str = "2.0";

// =============================================================================
// Error Codes
// =============================================================================

/// Body was not valid JSON.
pub const PARSE_ERROR: i64 = -32700;
/// Valid JSON, but not a JSON-RPC message.
pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const INTERNAL_ERROR: i64 = -32603;
/// The operation was cancelled before it produced a result.
pub const REQUEST_CANCELLED: i64 = -32800;

/// A session with the requested key is already open.
pub const SESSION_ALREADY_EXISTS: i64 = -32001;
/// No open session with the requested key.
pub const SESSION_NOT_FOUND: i64 = -32002;
/// A background operation of the same kind is still running for this session.
pub const OPERATION_IN_PROGRESS: i64 = -32003;
/// The session exists but has not finished initializing, or was closed after a failure.
pub const SESSION_NOT_READY: i64 = -32004;
/// The staged edit conflicts with the row's pending edit.
pub const EDIT_REJECTED: i64 = -32005;
/// The database driver reported a failure.
pub const DRIVER_ERROR: i64 = -32010;
/// An edit commit stopped at a failing statement. `data` carries the edit index.
pub const COMMIT_FAILED: i64 = -32011;
/// No connection is registered for the owner URI.
pub const CONNECTION_NOT_FOUND: i64 = -32012;

// =============================================================================
// Envelope Types
// =============================================================================

/// Request identifier. Clients may use numbers or strings.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(i64),
    String(String),
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestId::Number(n) => write!(f, "{}", n),
            RequestId::String(s) => write!(f, "{}", s),
        }
    }
}

/// Error object carried by a failed response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn parse_error(detail: impl fmt::Display) -> Self {
        Self::new(PARSE_ERROR, format!("Parse error: {}", detail))
    }

    pub fn invalid_request(detail: impl fmt::Display) -> Self {
        Self::new(INVALID_REQUEST, format!("Invalid request: {}", detail))
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(METHOD_NOT_FOUND, format!("Method not found: {}", method))
    }

    pub fn invalid_params(detail: impl fmt::Display) -> Self {
        Self::new(INVALID_PARAMS, format!("Invalid params: {}", detail))
    }

    pub fn internal(detail: impl fmt::Display) -> Self {
        Self::new(INTERNAL_ERROR, format!("Internal error: {}", detail))
    }
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl std::error::Error for RpcError {}

fn default_version() -> String {
    JSONRPC_VERSION.to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    #[serde(default = "default_version")]
    pub jsonrpc: String,
    pub id: RequestId,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl Request {
    pub fn new(id: RequestId, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: default_version(),
            id,
            method: method.into(),
            params,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    #[serde(default = "default_version")]
    pub jsonrpc: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl Notification {
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: default_version(),
            method: method.into(),
            params,
        }
    }
}

/// Response to a request. `id` is `null` only when the request id could not
/// be recovered (parse errors).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    #[serde(default = "default_version")]
    pub jsonrpc: String,
    pub id: Option<RequestId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl Response {
    pub fn success(id: RequestId, result: Value) -> Self {
        Self {
            jsonrpc: default_version(),
            id: Some(id),
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: Option<RequestId>, error: RpcError) -> Self {
        Self {
            jsonrpc: default_version(),
            id,
            result: None,
            error: Some(error),
        }
    }

    /// Collapse into a `Result`. A response with neither field (a `null`
    /// result deserializes that way) counts as success with `null`.
    pub fn into_result(self) -> Result<Value, RpcError> {
        match self.error {
            Some(err) => Err(err),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }
}

/// Empty object result (`{}`), used by acknowledgement-only methods.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmptyResult {}

// =============================================================================
// Message
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Message {
    Request(Request),
    Notification(Notification),
    Response(Response),
}

/// Why an incoming body could not become a [`Message`]. `id` is recovered
/// when the body was an object carrying one, so the error can be addressed.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodeFailure {
    pub id: Option<RequestId>,
    pub error: RpcError,
}

impl Message {
    pub fn from_slice(body: &[u8]) -> Result<Message, DecodeFailure> {
        let value: Value = serde_json::from_slice(body).map_err(|e| DecodeFailure {
            id: None,
            error: RpcError::parse_error(e),
        })?;
        Self::from_value(value)
    }

    pub fn from_value(value: Value) -> Result<Message, DecodeFailure> {
        let obj = match value.as_object() {
            Some(obj) => obj,
            None => {
                return Err(DecodeFailure {
                    id: None,
                    error: RpcError::invalid_request("message must be a JSON object"),
                })
            }
        };

        let id = obj
            .get("id")
            .and_then(|v| serde_json::from_value::<RequestId>(v.clone()).ok());
        let has_method = obj.get("method").map(Value::is_string).unwrap_or(false);
        let has_outcome = obj.contains_key("result") || obj.contains_key("error");

        let invalid = |id: Option<RequestId>, e: serde_json::Error| DecodeFailure {
            id,
            error: RpcError::invalid_request(e),
        };

        if has_method && id.is_some() {
            serde_json::from_value(value)
                .map(Message::Request)
                .map_err(|e| invalid(id, e))
        } else if has_method {
            serde_json::from_value(value)
                .map(Message::Notification)
                .map_err(|e| invalid(None, e))
        } else if has_outcome {
            serde_json::from_value(value)
                .map(Message::Response)
                .map_err(|e| invalid(id, e))
        } else {
            Err(DecodeFailure {
                id,
                error: RpcError::invalid_request("missing method or result"),
            })
        }
    }

    pub fn to_vec(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    pub fn method(&self) -> Option<&str> {
        match self {
            Message::Request(r) => Some(&r.method),
            Message::Notification(n) => Some(&n.method),
            Message::Response(_) => None,
        }
    }
}
