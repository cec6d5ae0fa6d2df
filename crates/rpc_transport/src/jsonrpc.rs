//! JSON-RPC 2.0 envelopes carried as pub/sub payloads.
//!
//! A call travels on a method topic as a [`Request`]; the provider answers on
//! the caller's response topic with a [`Response`] that echoes the `id`.
//! Notifications are requests without an `id` and never get an answer.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const VERSION: &str = "2.0";

pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const INTERNAL_ERROR: i64 = -32603;
/// First code of the range left to applications.
pub const SERVER_ERROR: i64 = -32000;

fn version() -> String {
    VERSION.to_string()
}

/// Request identifier. Calls made by this crate always use strings, but
/// peers may answer with numbers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(untagged)]
pub enum Id {
    Number(i64),
    String(String),
    #[default]
    Null,
}

impl Id {
    /// The id rendered as a single topic segment, `None` for `null`.
    pub fn as_segment(&self) -> Option<String> {
        match self {
            Id::Number(n) => Some(n.to_string()),
            Id::String(s) => Some(s.clone()),
            Id::Null => None,
        }
    }
}

impl std::fmt::Display for Id {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.as_segment() {
            Some(segment) => f.write_str(&segment),
            None => f.write_str("null"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Request {
    #[serde(default = "version")]
    pub jsonrpc: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Id>,
}

impl Request {
    pub fn call(id: Id, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: version(),
            method: method.into(),
            params,
            id: Some(id),
        }
    }

    pub fn notification(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: version(),
            method: method.into(),
            params,
            id: None,
        }
    }

    /// A `null` id is treated like a missing one.
    pub fn is_notification(&self) -> bool {
        matches!(self.id, None | Some(Id::Null))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ErrorObject {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ErrorObject {
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
}

/// Answer to a [`Request`]. Peers are expected to set exactly one of
/// `result` and `error`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Response {
    #[serde(default = "version")]
    pub jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorObject>,
    /// Peers that drop the id are still answered through their topic.
    #[serde(default)]
    pub id: Id,
}

impl Response {
    pub fn from_result(id: Id, outcome: Result<Value, ErrorObject>) -> Self {
        let (result, error) = match outcome {
            Ok(value) => (Some(value), None),
            Err(error) => (None, Some(error)),
        };
        Self {
            jsonrpc: version(),
            result,
            error,
            id,
        }
    }

    /// `error` wins over `result`; a response with neither yields `null`.
    pub fn into_result(self) -> Result<Value, ErrorObject> {
        match self.error {
            Some(error) => Err(error),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }
}
