use rpc_transport::jsonrpc::ErrorObject;
use serde_json::Value;
use tracing::warn;

use super::NodeMessage;

/// Answers calls that a listener node emitted.
#[derive(Debug, Clone)]
pub struct ResponseNode {
    id: String,
}

impl ResponseNode {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }

    /// A payload shaped like a JSON-RPC error object (`code` and `message`
    /// under `error`) is sent as an error, anything else as the result.
    /// Returns false when the message cannot be answered.
    #[tracing::instrument(name = "rpc_response_node_input", skip(self, msg), fields(node = %self.id))]
    pub fn input(&self, msg: NodeMessage) -> bool {
        let Some(reply) = msg.reply else {
            warn!("missing rpc callback");
            return false;
        };
        reply.reply(outcome(msg.payload))
    }
}

fn outcome(payload: Value) -> Result<Value, ErrorObject> {
    if let Some(error) = payload.get("error") {
        if let Ok(error) = serde_json::from_value::<ErrorObject>(error.clone()) {
            return Err(error);
        }
    }
    Ok(payload)
}
