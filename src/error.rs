use rpc_transport::TransportError;
use rpc_transport::jsonrpc::ErrorObject;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Everything that can go wrong between a caller, a Connection and a remote
/// method provider.
///
/// `Timeout`, `Closed` and `Remote` reach callers through [`crate::PendingCall::wait`];
/// the rest are logged where they happen and the offending message dropped.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RpcError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("malformed payload: {0}")]
    Payload(String),

    #[error("no handler registered for method `{0}`")]
    UnregisteredMethod(String),

    #[error("no pending call or method for topic `{0}`")]
    UnroutableTopic(String),

    #[error("call timed out after {0} ms")]
    Timeout(u64),

    #[error("connection closed")]
    Closed,

    #[error("invalid {kind} `{value}`: {reason}")]
    InvalidName {
        kind: String,
        value: String,
        reason: String,
    },

    #[error("remote error {code}: {message}")]
    Remote {
        code: i64,
        message: String,
        data: Option<Value>,
    },
}

impl RpcError {
    /// Short tag attached to failed node outputs.
    pub fn name(&self) -> &'static str {
        match self {
            RpcError::Transport(_) => "transport",
            RpcError::Payload(_) => "payload",
            RpcError::UnregisteredMethod(_) => "unregistered_method",
            RpcError::UnroutableTopic(_) => "unroutable_topic",
            RpcError::Timeout(_) => "timeout",
            RpcError::Closed => "closed",
            RpcError::InvalidName { .. } => "invalid_name",
            RpcError::Remote { .. } => "remote",
        }
    }

    pub(crate) fn invalid(kind: &str, value: &str, reason: &str) -> Self {
        RpcError::InvalidName {
            kind: kind.to_string(),
            value: value.to_string(),
            reason: reason.to_string(),
        }
    }
}

impl From<TransportError> for RpcError {
    fn from(err: TransportError) -> Self {
        RpcError::Transport(err.to_string())
    }
}

impl From<serde_json::Error> for RpcError {
    fn from(err: serde_json::Error) -> Self {
        RpcError::Payload(err.to_string())
    }
}

impl From<ErrorObject> for RpcError {
    fn from(err: ErrorObject) -> Self {
        RpcError::Remote {
            code: err.code,
            message: err.message,
            data: err.data,
        }
    }
}
