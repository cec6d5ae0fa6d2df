/*
┌───────────────────────── Connection (handle, Clone) ─────────────────────────┐
│ register_user / register_method / begin_call / notify / snapshot / shutdown  │
└──────────────────────────────┬───────────────────────────────────────────────┘
                               │ Command (unbounded mpsc, oneshot acks)
                               ▼
┌────────────────────────── ConnectionActor (one task) ────────────────────────┐
│  state machine ── users (weak) ── MethodRegistry ── ResponseCorrelator       │
│        ▲                                │                  ▲                 │
│        │ TransportEvent                 │ spawn handler    │ deliver         │
│        │                                ▼                  │                 │
│  TransportLink ◀── publish ── OutboundReply ◀── Responder   router.rs        │
└──────────────────────────────────────────────────────────────────────────────┘

The actor polls transport events first, then fired timers, then handler
replies, then commands.
All registry, correlator and state changes happen on that one task.
*/
mod actor;
pub mod correlator;
mod dispatcher;
pub mod methods;
mod router;
pub mod state;

use std::sync::{Arc, Weak};
use std::time::Duration;

use rpc_transport::TransportPtr;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::debug;

use crate::config::ConnectionSettings;
use crate::correlation::CorrelationId;
use crate::error::RpcError;

pub use correlator::CallResult;
pub use methods::{InboundCall, MethodHandler, Responder, handler_fn};
pub use state::{ConnectionState, ConnectionUser, StatusFill, StatusUpdate};

use actor::ConnectionActor;

pub(crate) enum Command {
    RegisterUser {
        id: String,
        user: Weak<dyn ConnectionUser>,
        ack: oneshot::Sender<usize>,
    },
    UnregisterUser {
        id: String,
        ack: oneshot::Sender<usize>,
    },
    RegisterMethod {
        method: String,
        handler: Arc<dyn MethodHandler>,
        ack: oneshot::Sender<Result<(), RpcError>>,
    },
    UnregisterMethod {
        method: String,
        ack: oneshot::Sender<Result<(), RpcError>>,
    },
    ReleaseMethod {
        method: String,
        handler: Arc<dyn MethodHandler>,
        ack: oneshot::Sender<Result<bool, RpcError>>,
    },
    Call {
        id: CorrelationId,
        method: String,
        params: Option<Value>,
        timeout: Option<Duration>,
        completion: oneshot::Sender<CallResult>,
    },
    Notify {
        method: String,
        params: Option<Value>,
        ack: oneshot::Sender<Result<(), RpcError>>,
    },
    Snapshot {
        ack: oneshot::Sender<ConnectionSnapshot>,
    },
    Shutdown {
        ack: oneshot::Sender<()>,
    },
}

/// Fired by timer tasks. Polled ahead of replies and commands so deadlines
/// hold under inbound load.
pub(crate) enum Timer {
    Expire { id: CorrelationId, timeout_ms: u64 },
    Retry { generation: u64 },
}

/// Point-in-time view of a connection, for diagnostics and tests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ConnectionSnapshot {
    pub namespace: String,
    pub state: ConnectionState,
    pub users: Vec<String>,
    pub methods: Vec<String>,
    pub pending_calls: usize,
    pub linked: bool,
}

/// An outbound call in flight.
#[derive(Debug)]
pub struct PendingCall {
    id: CorrelationId,
    rx: oneshot::Receiver<CallResult>,
}

impl PendingCall {
    pub fn id(&self) -> &CorrelationId {
        &self.id
    }

    /// Resolves exactly once: the response, a timeout or the connection
    /// closing. A connection that went away entirely counts as closed.
    pub async fn wait(self) -> CallResult {
        self.rx.await.unwrap_or(Err(RpcError::Closed))
    }
}

/// Handle to the single connection of one namespace.
///
/// Cheap to clone. The underlying actor stops once it is shut down or every
/// handle is dropped.
#[derive(Clone, Debug)]
pub struct Connection {
    namespace: String,
    commands: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<StatusUpdate>,
}

impl Connection {
    /// Starts the actor. Nothing connects until the first user registers.
    pub fn spawn(settings: ConnectionSettings, transport: TransportPtr) -> Result<Self, RpcError> {
        let scheme = settings.scheme()?;
        let namespace = settings.namespace.clone();
        let (commands, rx) = mpsc::unbounded_channel();
        let (status_tx, status) = watch::channel(StatusUpdate::new(ConnectionState::Connecting, None));

        let actor = ConnectionActor::new(settings, scheme, transport, status_tx);
        tokio::spawn(actor.run(rx));
        debug!(namespace = %namespace, "connection actor started");

        Ok(Self {
            namespace,
            commands,
            status,
        })
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T, RpcError> {
        let (tx, rx) = oneshot::channel();
        self.commands.send(make(tx)).map_err(|_| RpcError::Closed)?;
        rx.await.map_err(|_| RpcError::Closed)
    }

    /// Adds a user and returns the user count. The first user connects.
    pub async fn register_user(&self, user: &Arc<dyn ConnectionUser>) -> Result<usize, RpcError> {
        let id = user.id().to_string();
        let user = Arc::downgrade(user);
        self.request(|ack| Command::RegisterUser { id, user, ack }).await
    }

    /// Removes a user and returns the remaining count. The last one disconnects.
    pub async fn unregister_user(&self, id: &str) -> Result<usize, RpcError> {
        let id = id.to_string();
        self.request(|ack| Command::UnregisterUser { id, ack }).await
    }

    pub async fn register_method(&self, method: &str, handler: Arc<dyn MethodHandler>) -> Result<(), RpcError> {
        let method = method.to_string();
        self.request(|ack| Command::RegisterMethod { method, handler, ack })
            .await?
    }

    pub async fn unregister_method(&self, method: &str) -> Result<(), RpcError> {
        let method = method.to_string();
        self.request(|ack| Command::UnregisterMethod { method, ack }).await?
    }

    /// Unregisters `method` only while `handler` is the one registered for it.
    /// Returns false when another registration has replaced it since.
    pub async fn release_method(&self, method: &str, handler: &Arc<dyn MethodHandler>) -> Result<bool, RpcError> {
        let method = method.to_string();
        let handler = handler.clone();
        self.request(|ack| Command::ReleaseMethod { method, handler, ack })
            .await?
    }

    /// Publishes a call and returns without waiting for the outcome.
    ///
    /// `timeout` of `None` falls back to the configured default; a zero
    /// duration means wait indefinitely.
    pub fn begin_call(&self, method: &str, params: Option<Value>, timeout: Option<Duration>) -> PendingCall {
        let id = CorrelationId::generate();
        let (completion, rx) = oneshot::channel();
        let _ = self.commands.send(Command::Call {
            id: id.clone(),
            method: method.to_string(),
            params,
            timeout,
            completion,
        });
        PendingCall { id, rx }
    }

    pub async fn call(&self, method: &str, params: Option<Value>, timeout: Option<Duration>) -> CallResult {
        self.begin_call(method, params, timeout).wait().await
    }

    /// Fire and forget: publishes a call without an id.
    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), RpcError> {
        let method = method.to_string();
        self.request(|ack| Command::Notify { method, params, ack }).await?
    }

    pub fn status(&self) -> StatusUpdate {
        self.status.borrow().clone()
    }

    pub fn state(&self) -> ConnectionState {
        self.status.borrow().state
    }

    pub fn watch_status(&self) -> watch::Receiver<StatusUpdate> {
        self.status.clone()
    }

    pub async fn wait_for_state(&self, state: ConnectionState, timeout: Duration) -> Result<(), RpcError> {
        let mut status = self.status.clone();
        tokio::time::timeout(timeout, status.wait_for(|update| update.state == state))
            .await
            .map_err(|_| RpcError::Timeout(timeout.as_millis() as u64))?
            .map(|_| ())
            .map_err(|_| RpcError::Closed)
    }

    pub async fn snapshot(&self) -> Result<ConnectionSnapshot, RpcError> {
        self.request(|ack| Command::Snapshot { ack }).await
    }

    /// Closes the link, fails pending calls and stops the actor. Idempotent.
    pub async fn shutdown(&self) {
        let _ = self.request(|ack| Command::Shutdown { ack }).await;
    }
}
