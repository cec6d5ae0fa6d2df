use std::sync::Arc;

use dashmap::DashMap;
use rpc_transport::TransportPtr;
use tokio::sync::Mutex;
use tracing::info;

use crate::config::ConnectionSettings;
use crate::connection::{Connection, ConnectionUser};
use crate::error::RpcError;

/// Process-wide map of namespace to [`Connection`].
///
/// A connection is created for the first user of a namespace and shut down
/// after its last user leaves. Register and unregister are serialised so a
/// namespace is never created twice or torn down under a new user.
#[derive(Clone)]
pub struct ConnectionRegistry {
    transport: TransportPtr,
    connections: Arc<DashMap<String, Connection>>,
    lifecycle: Arc<Mutex<()>>,
}

impl ConnectionRegistry {
    pub fn new(transport: TransportPtr) -> Self {
        Self {
            transport,
            connections: Arc::new(DashMap::new()),
            lifecycle: Arc::new(Mutex::new(())),
        }
    }

    pub async fn register_user(
        &self,
        settings: &ConnectionSettings,
        user: &Arc<dyn ConnectionUser>,
    ) -> Result<Connection, RpcError> {
        let _guard = self.lifecycle.lock().await;

        let existing = self.get(&settings.namespace);
        let connection = match existing {
            Some(connection) => connection,
            None => {
                let connection = Connection::spawn(settings.clone(), self.transport.clone())?;
                self.connections
                    .insert(settings.namespace.clone(), connection.clone());
                info!(namespace = %settings.namespace, "connection created");
                connection
            }
        };
        connection.register_user(user).await?;
        Ok(connection)
    }

    /// Returns the users left on the namespace; 0 means the connection is gone.
    pub async fn unregister_user(&self, namespace: &str, user_id: &str) -> Result<usize, RpcError> {
        let _guard = self.lifecycle.lock().await;

        let Some(connection) = self.get(namespace) else {
            return Ok(0);
        };
        let remaining = connection.unregister_user(user_id).await?;
        if remaining == 0 {
            self.connections.remove(namespace);
            connection.shutdown().await;
            info!(namespace, "connection removed");
        }
        Ok(remaining)
    }

    pub fn get(&self, namespace: &str) -> Option<Connection> {
        self.connections.get(namespace).map(|entry| entry.value().clone())
    }

    pub fn namespaces(&self) -> Vec<String> {
        let mut namespaces: Vec<String> = self
            .connections
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        namespaces.sort();
        namespaces
    }

    /// Shuts every connection down regardless of remaining users.
    pub async fn shutdown(&self) {
        let _guard = self.lifecycle.lock().await;
        let namespaces = self.namespaces();
        for namespace in namespaces {
            if let Some((_, connection)) = self.connections.remove(&namespace) {
                connection.shutdown().await;
            }
        }
    }
}

impl std::fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionRegistry")
            .field("namespaces", &self.namespaces())
            .finish()
    }
}
