//! JSON-RPC 2.0 envelopes
//!
//! Every message crossing a transport is decoded exactly once into the closed
//! [`Envelope`] sum type. The wire form is a flat JSON object; which variant it
//! represents is decided by the presence of `method`, `id`, `result` and
//! `error`.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::error::ProtocolError;

/// JSON-RPC protocol version string
pub const JSONRPC_VERSION: &str = "2.0";

/// Request identifier (numbers and strings are both legal on the wire)
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

impl From<i64> for RequestId {
    fn from(n: i64) -> Self {
        RequestId::Number(n)
    }
}

impl From<String> for RequestId {
    fn from(s: String) -> Self {
        RequestId::String(s)
    }
}

/// JSON-RPC error object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl JsonRpcError {
    pub const METHOD_NOT_FOUND: i64 = -32601;

    pub fn method_not_found(method: &str) -> Self {
        Self {
            code: Self::METHOD_NOT_FOUND,
            message: format!("Method not found: {}", method),
            data: None,
        }
    }
}

/// A decoded protocol message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawEnvelope", into = "RawEnvelope")]
pub enum Envelope {
    /// A call expecting a response
    Request {
        id: RequestId,
        method: String,
        params: Option<Value>,
    },
    /// A call without an id; no response is expected
    Notification {
        method: String,
        params: Option<Value>,
    },
    /// Successful response
    Response { id: RequestId, result: Value },
    /// Error response (`id` may be null when the server could not parse the request)
    Error {
        id: Option<RequestId>,
        error: JsonRpcError,
    },
}

impl Envelope {
    pub fn request(
        id: impl Into<RequestId>,
        method: impl Into<String>,
        params: Option<Value>,
    ) -> Self {
        Envelope::Request {
            id: id.into(),
            method: method.into(),
            params,
        }
    }

    pub fn notification(method: impl Into<String>, params: Option<Value>) -> Self {
        Envelope::Notification {
            method: method.into(),
            params,
        }
    }

    /// The id this envelope carries, if any
    pub fn id(&self) -> Option<&RequestId> {
        match self {
            Envelope::Request { id, .. } | Envelope::Response { id, .. } => Some(id),
            Envelope::Error { id, .. } => id.as_ref(),
            Envelope::Notification { .. } => None,
        }
    }

    /// The method name for requests and notifications
    pub fn method(&self) -> Option<&str> {
        match self {
            Envelope::Request { method, .. } | Envelope::Notification { method, .. } => {
                Some(method)
            }
            _ => None,
        }
    }

    pub fn is_notification(&self) -> bool {
        matches!(self, Envelope::Notification { .. })
    }

    /// Decode a single envelope from a JSON string
    pub fn from_json(text: &str) -> Result<Self, ProtocolError> {
        let raw: RawEnvelope = serde_json::from_str(text)?;
        Envelope::try_from(raw)
    }

    /// Decode a single envelope from an already-parsed JSON value
    pub fn from_value(value: Value) -> Result<Self, ProtocolError> {
        let raw: RawEnvelope = serde_json::from_value(value)?;
        Envelope::try_from(raw)
    }
}

/// Flat wire representation shared by all variants
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RawEnvelope {
    jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<RequestId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    params: Option<Value>,
    // `"result": null` is a legal success value, so presence is tracked separately
    #[serde(default, deserialize_with = "present", skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<JsonRpcError>,
}

fn present<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Value>, D::Error> {
    Value::deserialize(deserializer).map(Some)
}

impl TryFrom<RawEnvelope> for Envelope {
    type Error = ProtocolError;

    fn try_from(raw: RawEnvelope) -> Result<Self, ProtocolError> {
        if raw.jsonrpc != JSONRPC_VERSION {
            return Err(ProtocolError::Version(raw.jsonrpc));
        }

        if let Some(method) = raw.method {
            if raw.result.is_some() || raw.error.is_some() {
                return Err(ProtocolError::Malformed(format!(
                    "'{}' carries both a method and a result/error",
                    method
                )));
            }
            return Ok(match raw.id {
                Some(id) => Envelope::Request {
                    id,
                    method,
                    params: raw.params,
                },
                None => Envelope::Notification {
                    method,
                    params: raw.params,
                },
            });
        }

        match (raw.result, raw.error) {
            (Some(_), Some(_)) => Err(ProtocolError::Malformed(
                "response carries both result and error".to_string(),
            )),
            (Some(result), None) => match raw.id {
                Some(id) => Ok(Envelope::Response { id, result }),
                None => Err(ProtocolError::Malformed("response without id".to_string())),
            },
            (None, Some(error)) => Ok(Envelope::Error { id: raw.id, error }),
            (None, None) => Err(ProtocolError::Malformed(
                "envelope has neither method, result nor error".to_string(),
            )),
        }
    }
}

impl From<Envelope> for RawEnvelope {
    fn from(envelope: Envelope) -> Self {
        let mut raw = RawEnvelope {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: None,
            method: None,
            params: None,
            result: None,
            error: None,
        };
        match envelope {
            Envelope::Request { id, method, params } => {
                raw.id = Some(id);
                raw.method = Some(method);
                raw.params = params;
            }
            Envelope::Notification { method, params } => {
                raw.method = Some(method);
                raw.params = params;
            }
            Envelope::Response { id, result } => {
                raw.id = Some(id);
                raw.result = Some(result);
            }
            Envelope::Error { id, error } => {
                raw.id = id;
                raw.error = Some(error);
            }
        }
        raw
    }
}
