use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::warn;

use super::{NodeMessage, StatusCell};
use crate::config::ConnectionSettings;
use crate::connection::{Connection, ConnectionUser, InboundCall, MethodHandler, StatusUpdate};
use crate::error::RpcError;
use crate::registry::ConnectionRegistry;

struct ForwardToFlow {
    method: String,
    tx: mpsc::UnboundedSender<NodeMessage>,
}

#[async_trait]
impl MethodHandler for ForwardToFlow {
    async fn handle(&self, call: InboundCall) {
        let msg = NodeMessage {
            payload: call.params.unwrap_or(Value::Null),
            reply: Some(call.responder),
        };
        if self.tx.send(msg).is_err() {
            warn!(method = %self.method, "listener output closed, call dropped");
        }
    }
}

/// Provides one method and emits each inbound call for the workflow.
pub struct ListenerNode {
    id: String,
    method: String,
    namespace: String,
    registry: ConnectionRegistry,
    connection: Connection,
    handler: Arc<dyn MethodHandler>,
    status: Arc<StatusCell>,
}

impl std::fmt::Debug for ListenerNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerNode")
            .field("id", &self.id)
            .field("method", &self.method)
            .field("namespace", &self.namespace)
            .finish_non_exhaustive()
    }
}

impl ListenerNode {
    pub async fn open(
        registry: &ConnectionRegistry,
        settings: &ConnectionSettings,
        id: &str,
        method: &str,
    ) -> Result<(Self, mpsc::UnboundedReceiver<NodeMessage>), RpcError> {
        let status = Arc::new(StatusCell::new(id));
        let user: Arc<dyn ConnectionUser> = status.clone();
        let connection = registry.register_user(settings, &user).await?;

        let (tx, rx) = mpsc::unbounded_channel();
        let handler: Arc<dyn MethodHandler> = Arc::new(ForwardToFlow {
            method: method.to_string(),
            tx,
        });
        if let Err(err) = connection.register_method(method, handler.clone()).await {
            registry.unregister_user(&settings.namespace, id).await?;
            return Err(err);
        }

        let node = Self {
            id: id.to_string(),
            method: method.to_string(),
            namespace: settings.namespace.clone(),
            registry: registry.clone(),
            connection,
            handler,
            status,
        };
        Ok((node, rx))
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn status(&self) -> Option<StatusUpdate> {
        self.status.latest()
    }

    /// A listener opened later for the same method keeps it registered.
    pub async fn close(self) -> Result<(), RpcError> {
        self.connection.release_method(&self.method, &self.handler).await?;
        self.registry
            .unregister_user(&self.namespace, &self.id)
            .await
            .map(|_| ())
    }
}
