//! JSON-RPC 2.0 envelope types.
//!
//! Every envelope on the wire is a single-line JSON object. Classification
//! follows the member set rather than a tag:
//!
//! - `method` + `id` → [`Message::Request`]
//! - `method` without `id` → [`Message::Notification`]
//! - `id` + (`result` | `error`) → [`Message::Response`]

use std::fmt;

use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ProtocolError, Result};

/// JSON-RPC version string.
pub const JSONRPC_VERSION: &str = "2.0";

// ─────────────────────────────────────────────────────────────────────────────
// Identifiers
// ─────────────────────────────────────────────────────────────────────────────

/// Request identifier chosen by the sender.
///
/// Only needs to be unique among the sender's currently outstanding requests.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    /// Integer identifier.
    Number(i64),
    /// String identifier.
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

impl From<i64> for RequestId {
    fn from(value: i64) -> Self {
        RequestId::Number(value)
    }
}

impl From<&str> for RequestId {
    fn from(value: &str) -> Self {
        RequestId::String(value.to_string())
    }
}

impl From<String> for RequestId {
    fn from(value: String) -> Self {
        RequestId::String(value)
    }
}

/// Caller-chosen token correlating progress updates to one operation.
///
/// Same wire shape as a request id (string or integer).
pub type ProgressToken = RequestId;

// ─────────────────────────────────────────────────────────────────────────────
// Envelopes
// ─────────────────────────────────────────────────────────────────────────────

/// A JSON-RPC request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    /// JSON-RPC version (always "2.0").
    pub jsonrpc: String,
    /// Request ID for correlating responses.
    pub id: RequestId,
    /// Method name to call.
    pub method: String,
    /// Method parameters (optional).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    /// Create a new JSON-RPC request.
    pub fn new(id: impl Into<RequestId>, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: id.into(),
            method: method.into(),
            params,
        }
    }

    /// The progress token from `params._meta.progressToken`, if the caller
    /// asked for progress updates.
    pub fn progress_token(&self) -> Option<ProgressToken> {
        let token = self.params.as_ref()?.get("_meta")?.get("progressToken")?;
        serde_json::from_value(token.clone()).ok()
    }

    /// Attach a progress token under `params._meta.progressToken`.
    pub fn with_progress_token(mut self, token: ProgressToken) -> Self {
        let mut params = match self.params.take() {
            Some(Value::Object(map)) => map,
            Some(other) => {
                let mut map = serde_json::Map::new();
                map.insert("value".to_string(), other);
                map
            }
            None => serde_json::Map::new(),
        };
        let meta = params
            .entry("_meta")
            .or_insert_with(|| Value::Object(serde_json::Map::new()));
        if let Value::Object(meta) = meta {
            meta.insert(
                "progressToken".to_string(),
                serde_json::to_value(&token).unwrap_or(Value::Null),
            );
        }
        self.params = Some(Value::Object(params));
        self
    }
}

/// A JSON-RPC notification (no id, no response expected).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcNotification {
    /// JSON-RPC version (always "2.0").
    pub jsonrpc: String,
    /// Method name.
    pub method: String,
    /// Method parameters (optional).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcNotification {
    /// Create a new notification.
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.into(),
            params,
        }
    }

    /// Deserialize the params into a typed structure.
    pub fn parse_params<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        let params = self.params.clone().unwrap_or(Value::Null);
        Ok(serde_json::from_value(params)?)
    }
}

/// A JSON-RPC response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    /// JSON-RPC version (always "2.0").
    pub jsonrpc: String,
    /// Request ID this response is for.
    pub id: RequestId,
    /// Result on success. A present `null` result is kept as `Some(Null)`.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "present_value"
    )]
    pub result: Option<Value>,
    /// Error on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

/// Deserialize a member that is present (possibly `null`) as `Some`.
fn present_value<'de, D>(deserializer: D) -> std::result::Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

impl JsonRpcResponse {
    /// Create a success response.
    pub fn success(id: RequestId, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    /// Create an error response.
    pub fn failure(id: RequestId, error: JsonRpcError) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: None,
            error: Some(error),
        }
    }

    /// Build a response from a handler outcome.
    pub fn from_outcome(id: RequestId, outcome: std::result::Result<Value, JsonRpcError>) -> Self {
        match outcome {
            Ok(result) => Self::success(id, result),
            Err(error) => Self::failure(id, error),
        }
    }

    /// Check if this is an error response.
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// Get the result, or return an error if this is an error response.
    pub fn into_result(self) -> std::result::Result<Value, JsonRpcError> {
        if let Some(error) = self.error {
            Err(error)
        } else {
            Ok(self.result.unwrap_or(Value::Null))
        }
    }
}

/// A JSON-RPC error object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("{message} (code {code})")]
pub struct JsonRpcError {
    /// Error code.
    pub code: i64,
    /// Error message.
    pub message: String,
    /// Optional additional data.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

// Standard JSON-RPC error codes
impl JsonRpcError {
    /// Parse error - Invalid JSON.
    pub const PARSE_ERROR: i64 = -32700;
    /// Invalid Request - Not a valid Request object.
    pub const INVALID_REQUEST: i64 = -32600;
    /// Method not found.
    pub const METHOD_NOT_FOUND: i64 = -32601;
    /// Invalid params.
    pub const INVALID_PARAMS: i64 = -32602;
    /// Internal error.
    pub const INTERNAL_ERROR: i64 = -32603;
    /// The request carried missing or invalid credentials.
    pub const UNAUTHORIZED: i64 = -32001;
}

impl JsonRpcError {
    /// Create a new error object.
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    /// Attach additional data.
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    /// Parse error.
    pub fn parse_error(message: impl Into<String>) -> Self {
        Self::new(Self::PARSE_ERROR, message)
    }

    /// Invalid request.
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(Self::INVALID_REQUEST, message)
    }

    /// Method not found.
    pub fn method_not_found(method: &str) -> Self {
        Self::new(
            Self::METHOD_NOT_FOUND,
            format!("method not found: {}", method),
        )
    }

    /// Invalid params.
    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(Self::INVALID_PARAMS, message)
    }

    /// Internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(Self::INTERNAL_ERROR, message)
    }

    /// Unauthorized.
    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(Self::UNAUTHORIZED, message)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Message
// ─────────────────────────────────────────────────────────────────────────────

/// Any JSON-RPC envelope.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Message {
    /// A request expecting a response.
    Request(JsonRpcRequest),
    /// A response to an earlier request.
    Response(JsonRpcResponse),
    /// A one-way notification.
    Notification(JsonRpcNotification),
}

impl<'de> Deserialize<'de> for Message {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = Value::deserialize(deserializer)?;
        Message::from_value(value).map_err(de::Error::custom)
    }
}

impl Message {
    /// Classify a decoded JSON value.
    pub fn from_value(value: Value) -> Result<Self> {
        let Value::Object(ref object) = value else {
            return Err(ProtocolError::invalid_envelope(
                "envelope must be a JSON object",
            ));
        };

        match object.get("jsonrpc").and_then(Value::as_str) {
            Some(JSONRPC_VERSION) => {}
            other => {
                return Err(ProtocolError::invalid_envelope(format!(
                    "unsupported jsonrpc version: {:?}",
                    other
                )));
            }
        }

        let has_method = object.contains_key("method");
        let has_id = object.get("id").is_some_and(|id| !id.is_null());
        let has_result = object.contains_key("result");
        let has_error = object.contains_key("error");

        match (has_method, has_id, has_result || has_error) {
            (true, true, false) => Ok(Message::Request(serde_json::from_value(value)?)),
            (true, false, false) => Ok(Message::Notification(serde_json::from_value(value)?)),
            (false, true, true) if has_result != has_error => {
                Ok(Message::Response(serde_json::from_value(value)?))
            }
            _ => Err(ProtocolError::invalid_envelope(
                "not a request, response or notification",
            )),
        }
    }

    /// Parse a single envelope from raw bytes.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let value: Value = serde_json::from_slice(bytes)?;
        Self::from_value(value)
    }

    /// Serialize to single-line JSON.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// The method name for requests and notifications.
    pub fn method(&self) -> Option<&str> {
        match self {
            Message::Request(req) => Some(&req.method),
            Message::Notification(note) => Some(&note.method),
            Message::Response(_) => None,
        }
    }

    /// The id for requests and responses.
    pub fn id(&self) -> Option<&RequestId> {
        match self {
            Message::Request(req) => Some(&req.id),
            Message::Response(resp) => Some(&resp.id),
            Message::Notification(_) => None,
        }
    }

    /// Check if this is a request.
    pub fn is_request(&self) -> bool {
        matches!(self, Message::Request(_))
    }
}

impl From<JsonRpcRequest> for Message {
    fn from(value: JsonRpcRequest) -> Self {
        Message::Request(value)
    }
}

impl From<JsonRpcResponse> for Message {
    fn from(value: JsonRpcResponse) -> Self {
        Message::Response(value)
    }
}

impl From<JsonRpcNotification> for Message {
    fn from(value: JsonRpcNotification) -> Self {
        Message::Notification(value)
    }
}
