use std::sync::Arc;
use std::time::Duration;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::warn;

use super::StatusCell;
use crate::config::ConnectionSettings;
use crate::connection::{Connection, ConnectionUser, StatusUpdate};
use crate::error::RpcError;
use crate::registry::ConnectionRegistry;

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RequestNodeConfig {
    pub id: String,
    /// Used when the incoming message carries no `method`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    /// 0 waits for the connection default.
    #[serde(default)]
    pub timeout_ms: u64,
}

/// Calls a remote method for every input message.
pub struct RequestNode {
    config: RequestNodeConfig,
    namespace: String,
    registry: ConnectionRegistry,
    connection: Connection,
    status: Arc<StatusCell>,
}

impl RequestNode {
    pub async fn open(
        registry: &ConnectionRegistry,
        settings: &ConnectionSettings,
        config: RequestNodeConfig,
    ) -> Result<Self, RpcError> {
        let status = Arc::new(StatusCell::new(config.id.clone()));
        let user: Arc<dyn ConnectionUser> = status.clone();
        let connection = registry.register_user(settings, &user).await?;
        Ok(Self {
            config,
            namespace: settings.namespace.clone(),
            registry: registry.clone(),
            connection,
            status,
        })
    }

    /// Result of the call on success. On failure the input comes back with an
    /// `error: {name, message}` member.
    #[tracing::instrument(name = "rpc_request_node_input", skip(self, msg), fields(node = %self.config.id))]
    pub async fn input(&self, msg: Value) -> Value {
        let method = msg
            .get("method")
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| self.config.method.clone());
        let Some(method) = method else {
            warn!("no method on the message and none configured");
            return with_error(msg, &RpcError::invalid("method", "", "no method given"));
        };

        let params = params_of(&msg);
        let timeout = (self.config.timeout_ms > 0).then(|| Duration::from_millis(self.config.timeout_ms));

        match self.connection.call(&method, params, timeout).await {
            Ok(result) => result,
            Err(err) => with_error(msg, &err),
        }
    }

    pub fn status(&self) -> Option<StatusUpdate> {
        self.status.latest()
    }

    pub async fn close(self) -> Result<(), RpcError> {
        self.registry
            .unregister_user(&self.namespace, &self.config.id)
            .await
            .map(|_| ())
    }
}

/// `params` when present, otherwise the message itself minus its `method`.
fn params_of(msg: &Value) -> Option<Value> {
    if let Some(params) = msg.get("params") {
        return Some(params.clone());
    }
    let mut params = msg.clone();
    if let Value::Object(map) = &mut params {
        map.remove("method");
    }
    Some(params)
}

fn with_error(msg: Value, err: &RpcError) -> Value {
    let error = json!({ "name": err.name(), "message": err.to_string() });
    match msg {
        Value::Object(mut map) => {
            map.insert("error".to_string(), error);
            Value::Object(map)
        }
        other => json!({ "payload": other, "error": error }),
    }
}
