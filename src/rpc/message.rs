//! JSON-RPC 2.0 message model and classification.
//!
//! Every decoded frame body is parsed into a [`serde_json::Value`] first and
//! then classified by field presence into one of the three [`Message`]
//! shapes. Anything that does not fit exactly one shape is rejected with
//! [`AppError::InvalidResponse`].

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{AppError, Result};

/// Protocol marker every message must carry in its `jsonrpc` field.
pub const JSONRPC_VERSION: &str = "2.0";

/// Invalid JSON was received.
pub const PARSE_ERROR: i64 = -32700;
/// The JSON sent is not a valid request object.
pub const INVALID_REQUEST: i64 = -32600;
/// The method does not exist or is not available.
pub const METHOD_NOT_FOUND: i64 = -32601;
/// Invalid method parameters.
pub const INVALID_PARAMS: i64 = -32602;
/// Internal JSON-RPC error.
pub const INTERNAL_ERROR: i64 = -32603;

// ── RequestId ─────────────────────────────────────────────────────────────────

/// Correlation identifier of a request/response pair.
///
/// Ids allocated by this client are always strings. Ids issued by the peer
/// are echoed back in the form they arrived in.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    /// Numeric id.
    Number(i64),
    /// String id.
    String(String),
}

impl Display for RequestId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::String(s) => f.write_str(s),
        }
    }
}

impl From<&str> for RequestId {
    fn from(value: &str) -> Self {
        Self::String(value.to_owned())
    }
}

impl From<String> for RequestId {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<i64> for RequestId {
    fn from(value: i64) -> Self {
        Self::Number(value)
    }
}

// ── RpcError ──────────────────────────────────────────────────────────────────

/// JSON-RPC error object carried in a [`Message::Response`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    /// Numeric error code; the reserved range is -32768..=-32000.
    pub code: i64,
    /// Short human-readable description.
    pub message: String,
    /// Optional structured detail.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    /// Build an error with an arbitrary code.
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    /// Attach structured detail to the error.
    #[must_use]
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    /// `-32700` parse error.
    pub fn parse_error(message: impl Into<String>) -> Self {
        Self::new(PARSE_ERROR, message)
    }

    /// `-32600` invalid request.
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(INVALID_REQUEST, message)
    }

    /// `-32601` method not found.
    pub fn method_not_found(method: &str) -> Self {
        Self::new(METHOD_NOT_FOUND, format!("method not found: {method}"))
    }

    /// `-32602` invalid params.
    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(INVALID_PARAMS, message)
    }

    /// `-32603` internal error.
    pub fn internal_error(message: impl Into<String>) -> Self {
        Self::new(INTERNAL_ERROR, message)
    }
}

impl Display for RpcError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (code {})", self.message, self.code)
    }
}

impl std::error::Error for RpcError {}

// ── Message ───────────────────────────────────────────────────────────────────

/// A classified JSON-RPC 2.0 message.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// Carries `method` and `id`; the receiver must answer it.
    Request {
        /// Correlation id to echo in the response.
        id: RequestId,
        /// Method name.
        method: String,
        /// Method parameters, if any.
        params: Option<Value>,
    },
    /// Carries `method` but no `id`; fire-and-forget.
    Notification {
        /// Method name.
        method: String,
        /// Method parameters, if any.
        params: Option<Value>,
    },
    /// Carries `id` and exactly one of `result` or `error`.
    Response {
        /// Id of the request being answered.
        id: RequestId,
        /// `Ok(result)` or `Err(error)`.
        outcome: std::result::Result<Value, RpcError>,
    },
}

impl Message {
    /// Build a request.
    #[must_use]
    pub fn request(id: impl Into<RequestId>, method: impl Into<String>, params: Option<Value>) -> Self {
        Self::Request {
            id: id.into(),
            method: method.into(),
            params,
        }
    }

    /// Build a notification.
    #[must_use]
    pub fn notification(method: impl Into<String>, params: Option<Value>) -> Self {
        Self::Notification {
            method: method.into(),
            params,
        }
    }

    /// Build a response.
    #[must_use]
    pub fn response(
        id: impl Into<RequestId>,
        outcome: std::result::Result<Value, RpcError>,
    ) -> Self {
        Self::Response {
            id: id.into(),
            outcome,
        }
    }

    /// Method name for requests and notifications.
    #[must_use]
    pub fn method(&self) -> Option<&str> {
        match self {
            Self::Request { method, .. } | Self::Notification { method, .. } => Some(method),
            Self::Response { .. } => None,
        }
    }

    /// Serialise into the JSON-RPC 2.0 wire object.
    #[must_use]
    pub fn to_value(&self) -> Value {
        let mut obj = Map::new();
        obj.insert("jsonrpc".into(), Value::String(JSONRPC_VERSION.into()));

        match self {
            Self::Request { id, method, params } => {
                obj.insert("id".into(), id_to_value(id));
                obj.insert("method".into(), Value::String(method.clone()));
                if let Some(params) = params {
                    obj.insert("params".into(), params.clone());
                }
            }
            Self::Notification { method, params } => {
                obj.insert("method".into(), Value::String(method.clone()));
                if let Some(params) = params {
                    obj.insert("params".into(), params.clone());
                }
            }
            Self::Response { id, outcome } => {
                obj.insert("id".into(), id_to_value(id));
                match outcome {
                    Ok(result) => {
                        obj.insert("result".into(), result.clone());
                    }
                    Err(err) => {
                        obj.insert("error".into(), error_to_value(err));
                    }
                }
            }
        }

        Value::Object(obj)
    }

    /// Classify a parsed JSON body.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::InvalidResponse`] when `jsonrpc` is absent or not
    /// `"2.0"`, or when the field combination matches no message shape
    /// (for example `method` together with `result`).
    pub fn from_value(value: Value) -> Result<Self> {
        let Value::Object(mut obj) = value else {
            return Err(malformed("body is not a json object"));
        };

        match obj.get("jsonrpc") {
            Some(Value::String(v)) if v == JSONRPC_VERSION => {}
            Some(other) => return Err(malformed(&format!("unsupported jsonrpc version {other}"))),
            None => return Err(malformed("missing jsonrpc field")),
        }

        let method = obj.remove("method");
        let id = obj.remove("id");
        let params = obj.remove("params").filter(|p| !p.is_null());
        let result = obj.remove("result");
        let error = obj.remove("error").filter(|e| !e.is_null());

        match (method, id) {
            (Some(method), id) => {
                if result.is_some() || error.is_some() {
                    return Err(malformed("message carries both method and result/error"));
                }
                let Value::String(method) = method else {
                    return Err(malformed("method is not a string"));
                };
                match id {
                    Some(id) => Ok(Self::Request {
                        id: parse_id(id)?,
                        method,
                        params,
                    }),
                    None => Ok(Self::Notification { method, params }),
                }
            }
            (None, Some(id)) => {
                let id = parse_id(id)?;
                match (result, error) {
                    (Some(result), None) => Ok(Self::Response {
                        id,
                        outcome: Ok(result),
                    }),
                    (None, Some(error)) => {
                        let error: RpcError = serde_json::from_value(error)
                            .map_err(|e| malformed(&format!("invalid error object: {e}")))?;
                        Ok(Self::Response {
                            id,
                            outcome: Err(error),
                        })
                    }
                    (Some(_), Some(_)) => Err(malformed("response carries both result and error")),
                    (None, None) => Err(malformed("response carries neither result nor error")),
                }
            }
            (None, None) => Err(malformed("message has neither method nor id")),
        }
    }
}

// ── Private helpers ───────────────────────────────────────────────────────────

fn malformed(reason: &str) -> AppError {
    AppError::InvalidResponse(format!("malformed message: {reason}"))
}

fn parse_id(id: Value) -> Result<RequestId> {
    match id {
        Value::String(s) => Ok(RequestId::String(s)),
        Value::Number(n) => n
            .as_i64()
            .map(RequestId::Number)
            .ok_or_else(|| malformed(&format!("id {n} is not an integer"))),
        other => Err(malformed(&format!("id must be a string or integer, got {other}"))),
    }
}

fn id_to_value(id: &RequestId) -> Value {
    match id {
        RequestId::Number(n) => Value::from(*n),
        RequestId::String(s) => Value::String(s.clone()),
    }
}

fn error_to_value(err: &RpcError) -> Value {
    let mut obj = Map::new();
    obj.insert("code".into(), Value::from(err.code));
    obj.insert("message".into(), Value::String(err.message.clone()));
    if let Some(data) = &err.data {
        obj.insert("data".into(), data.clone());
    }
    Value::Object(obj)
}

// ── Tests ─────────────────────────────────────────────────────────────────────
