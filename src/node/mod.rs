//! Adapters for a host workflow runtime.
//!
//! A [`RequestNode`] calls remote methods, a [`ListenerNode`] provides one and
//! emits every inbound call as a [`NodeMessage`], and a [`ResponseNode`]
//! answers such a message once the workflow produced a result.

mod listener;
mod request;
mod response;

pub use listener::ListenerNode;
pub use request::{RequestNode, RequestNodeConfig};
pub use response::ResponseNode;

use serde_json::Value;
use tokio::sync::watch;

use crate::connection::{ConnectionUser, Responder, StatusUpdate};

/// A message flowing between nodes. `reply` is only present on messages
/// emitted by a listener and is consumed by the response node.
#[derive(Debug)]
pub struct NodeMessage {
    pub payload: Value,
    pub reply: Option<Responder>,
}

impl NodeMessage {
    pub fn new(payload: Value) -> Self {
        Self { payload, reply: None }
    }
}

/// The connection user behind every node: remembers the latest status so
/// the host can render it.
pub struct StatusCell {
    id: String,
    latest: watch::Sender<Option<StatusUpdate>>,
}

impl StatusCell {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            latest: watch::Sender::new(None),
        }
    }

    pub fn latest(&self) -> Option<StatusUpdate> {
        self.latest.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<StatusUpdate>> {
        self.latest.subscribe()
    }
}

impl ConnectionUser for StatusCell {
    fn id(&self) -> &str {
        &self.id
    }

    fn status(&self, update: &StatusUpdate) {
        self.latest.send_replace(Some(update.clone()));
    }
}
