use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use rpc_transport::jsonrpc::{ErrorObject, Id, Request, Response};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use crate::error::RpcError;
use crate::topic::TopicScheme;

/// What the transport subscription set has to do after a registry change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionChange {
    Subscribe(String),
    Unsubscribe(String),
    Unchanged,
}

/// A reply on its way back to the connection actor for publishing.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundReply {
    pub topic: String,
    pub response: Response,
}

/// One-shot reply capability handed to method handlers.
///
/// Routing data (caller id and response topic) stays inside; handlers only
/// decide on the outcome. Notifications get a responder that discards.
#[derive(Debug)]
pub struct Responder {
    id: Option<Id>,
    topic: Option<String>,
    tx: mpsc::UnboundedSender<OutboundReply>,
}

impl Responder {
    pub(crate) fn new(id: Option<Id>, topic: Option<String>, tx: mpsc::UnboundedSender<OutboundReply>) -> Self {
        Self { id, topic, tx }
    }

    /// False for notifications and for callers whose id cannot be answered.
    pub fn expects_reply(&self) -> bool {
        self.topic.is_some()
    }

    /// Queues the reply; returns whether anything was actually sent.
    pub fn reply(self, result: Result<Value, ErrorObject>) -> bool {
        let (Some(id), Some(topic)) = (self.id, self.topic) else {
            return false;
        };
        let response = Response::from_result(id, result);
        self.tx.send(OutboundReply { topic, response }).is_ok()
    }
}

/// A call as seen by a method provider.
#[derive(Debug)]
pub struct InboundCall {
    pub method: String,
    pub params: Option<Value>,
    pub responder: Responder,
}

#[async_trait]
pub trait MethodHandler: Send + Sync + 'static {
    async fn handle(&self, call: InboundCall);
}

/// Adapts an async closure over the params into a [`MethodHandler`] that
/// always replies with the closure's outcome.
pub struct FnHandler<F>(F);

pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn MethodHandler>
where
    F: Fn(Option<Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, ErrorObject>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

#[async_trait]
impl<F, Fut> MethodHandler for FnHandler<F>
where
    F: Fn(Option<Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, ErrorObject>> + Send + 'static,
{
    async fn handle(&self, call: InboundCall) {
        let outcome = (self.0)(call.params).await;
        call.responder.reply(outcome);
    }
}

/// Method name to handler, keyed by the derived call topic.
///
/// All methods of a namespace share one wildcard subscription; it is
/// requested when the first method arrives and released with the last.
pub struct MethodRegistry {
    scheme: TopicScheme,
    handlers: HashMap<String, Arc<dyn MethodHandler>>,
}

impl MethodRegistry {
    pub fn new(scheme: TopicScheme) -> Self {
        Self {
            scheme,
            handlers: HashMap::new(),
        }
    }

    pub fn register(
        &mut self,
        method: &str,
        handler: Arc<dyn MethodHandler>,
    ) -> Result<SubscriptionChange, RpcError> {
        let topic = self.scheme.call_topic(method)?;
        let was_empty = self.handlers.is_empty();
        if self.handlers.insert(topic, handler).is_some() {
            debug!(method, "replaced method handler");
        }
        Ok(if was_empty {
            SubscriptionChange::Subscribe(self.scheme.method_wildcard())
        } else {
            SubscriptionChange::Unchanged
        })
    }

    pub fn unregister(&mut self, method: &str) -> Result<SubscriptionChange, RpcError> {
        let topic = self.scheme.call_topic(method)?;
        if self.handlers.remove(&topic).is_none() {
            return Ok(SubscriptionChange::Unchanged);
        }
        Ok(if self.handlers.is_empty() {
            SubscriptionChange::Unsubscribe(self.scheme.method_wildcard())
        } else {
            SubscriptionChange::Unchanged
        })
    }

    /// True when `handler` is the one currently registered for `method`.
    pub fn is_current(&self, method: &str, handler: &Arc<dyn MethodHandler>) -> bool {
        self.scheme
            .call_topic(method)
            .ok()
            .and_then(|topic| self.handlers.get(&topic))
            .is_some_and(|current| std::ptr::addr_eq(Arc::as_ptr(current), Arc::as_ptr(handler)))
    }

    pub fn clear(&mut self) -> SubscriptionChange {
        if self.handlers.is_empty() {
            return SubscriptionChange::Unchanged;
        }
        self.handlers.clear();
        SubscriptionChange::Unsubscribe(self.scheme.method_wildcard())
    }

    pub fn contains(&self, method: &str) -> bool {
        self.scheme
            .call_topic(method)
            .map(|topic| self.handlers.contains_key(&topic))
            .unwrap_or(false)
    }

    pub fn methods(&self) -> Vec<String> {
        let mut methods: Vec<String> = self
            .handlers
            .keys()
            .filter_map(|topic| topic.rsplit('/').next().map(str::to_string))
            .collect();
        methods.sort();
        methods
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Runs the handler for `topic` on its own task. Panics inside the
    /// handler are logged and go no further.
    pub fn dispatch(
        &self,
        topic: &str,
        method: &str,
        envelope: Value,
        replies: &mpsc::UnboundedSender<OutboundReply>,
    ) -> Result<(), RpcError> {
        let handler = self
            .handlers
            .get(topic)
            .cloned()
            .ok_or_else(|| RpcError::UnregisteredMethod(method.to_string()))?;

        let request: Request = serde_json::from_value(envelope)?;
        if request.method != method {
            warn!(topic, envelope_method = %request.method, "envelope method differs from topic, using topic");
        }

        let reply_topic = request.id.as_ref().and_then(|id| self.scheme.reply_topic(id));
        if !request.is_notification() && reply_topic.is_none() {
            warn!(method, id = ?request.id, "call id cannot be used as a response topic, reply will be dropped");
        }

        let call = InboundCall {
            method: method.to_string(),
            params: request.params,
            responder: Responder::new(request.id, reply_topic, replies.clone()),
        };

        let method = method.to_string();
        tokio::spawn(async move {
            if let Err(panic) = AssertUnwindSafe(handler.handle(call)).catch_unwind().await {
                let reason = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                error!(method = %method, reason = %reason, "method handler panicked");
            }
        });
        Ok(())
    }
}
