use std::collections::HashMap;
use std::time::{Duration, Instant};

use rpc_transport::jsonrpc::Response;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tracing::debug;

use crate::correlation::CorrelationId;
use crate::error::RpcError;
use crate::topic::TopicScheme;

pub type CallResult = Result<Value, RpcError>;

struct Waiter {
    id: CorrelationId,
    method: String,
    started: Instant,
    completion: oneshot::Sender<CallResult>,
    timer: Option<AbortHandle>,
}

/// A response matched to its call. The caller has already been resolved.
#[derive(Debug)]
pub struct Delivered {
    pub id: CorrelationId,
    pub method: String,
    pub elapsed: Duration,
    pub remote_error: bool,
    /// Response topic to release.
    pub topic: String,
}

/// A call removed without a response; whoever removed it decides the error.
#[derive(Debug)]
pub struct CancelledCall {
    pub id: CorrelationId,
    pub method: String,
    pub elapsed: Duration,
    pub topic: String,
    completion: oneshot::Sender<CallResult>,
}

impl CancelledCall {
    /// Completes the caller; a caller that stopped waiting is ignored.
    pub fn resolve(self, error: RpcError) {
        let _ = self.completion.send(Err(error));
    }
}

/// Pending calls keyed by their response topic.
///
/// Entries leave the table on first delivery, cancel or drain, so each call
/// completes at most once and a second response for it is unroutable.
pub struct ResponseCorrelator {
    scheme: TopicScheme,
    pending: HashMap<String, Waiter>,
}

impl ResponseCorrelator {
    pub fn new(scheme: TopicScheme) -> Self {
        Self {
            scheme,
            pending: HashMap::new(),
        }
    }

    /// Stores the completion and returns the response topic to subscribe.
    pub fn await_response(
        &mut self,
        id: CorrelationId,
        method: &str,
        completion: oneshot::Sender<CallResult>,
    ) -> String {
        let topic = self.scheme.response_topic(&id);
        self.pending.insert(
            topic.clone(),
            Waiter {
                id,
                method: method.to_string(),
                started: Instant::now(),
                completion,
                timer: None,
            },
        );
        topic
    }

    /// Remembers the timeout task so a response can disarm it.
    pub fn arm_timer(&mut self, id: &CorrelationId, timer: AbortHandle) {
        match self.pending.get_mut(&self.scheme.response_topic(id)) {
            Some(waiter) => waiter.timer = Some(timer),
            None => timer.abort(),
        }
    }

    /// Resolves the call waiting on `topic`.
    ///
    /// A JSON-RPC error object fails the call with [`RpcError::Remote`]; a
    /// JSON-RPC result succeeds with its value; an `error` member that is not
    /// an error object fails with [`RpcError::Payload`]; any other body is
    /// handed over as the raw result.
    pub fn deliver(&mut self, topic: &str, envelope: Value) -> Result<Delivered, RpcError> {
        let waiter = self
            .pending
            .remove(topic)
            .ok_or_else(|| RpcError::UnroutableTopic(topic.to_string()))?;
        if let Some(timer) = &waiter.timer {
            timer.abort();
        }

        let outcome = match as_response(&envelope) {
            Ok(Some(response)) => {
                if response.id.as_segment().as_deref() != Some(waiter.id.as_str()) {
                    debug!(topic, id = %response.id, "response id differs from correlation id");
                }
                response.into_result().map_err(RpcError::from)
            }
            Ok(None) => Ok(envelope),
            Err(err) => Err(err),
        };
        let remote_error = outcome.is_err();
        let _ = waiter.completion.send(outcome);

        Ok(Delivered {
            id: waiter.id,
            method: waiter.method,
            elapsed: waiter.started.elapsed(),
            remote_error,
            topic: topic.to_string(),
        })
    }

    pub fn cancel(&mut self, id: &CorrelationId) -> Option<CancelledCall> {
        let topic = self.scheme.response_topic(id);
        self.pending
            .remove(&topic)
            .map(|waiter| into_cancelled(topic, waiter))
    }

    /// Removes every pending call.
    pub fn drain(&mut self) -> Vec<CancelledCall> {
        self.pending
            .drain()
            .map(|(topic, waiter)| into_cancelled(topic, waiter))
            .collect()
    }

    pub fn contains(&self, id: &CorrelationId) -> bool {
        self.pending.contains_key(&self.scheme.response_topic(id))
    }

    pub fn topics(&self) -> Vec<String> {
        self.pending.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

fn into_cancelled(topic: String, waiter: Waiter) -> CancelledCall {
    if let Some(timer) = &waiter.timer {
        timer.abort();
    }
    CancelledCall {
        id: waiter.id,
        method: waiter.method,
        elapsed: waiter.started.elapsed(),
        topic,
        completion: waiter.completion,
    }
}

/// `None` for bodies that are not JSON-RPC responses. An `error` member that
/// is not an error object fails the call rather than passing as a result.
fn as_response(envelope: &Value) -> Result<Option<Response>, RpcError> {
    let Some(object) = envelope.as_object() else {
        return Ok(None);
    };
    if !object.contains_key("result") && !object.contains_key("error") {
        return Ok(None);
    }
    match serde_json::from_value(envelope.clone()) {
        Ok(response) => Ok(Some(response)),
        Err(e) if object.contains_key("error") => Err(RpcError::Payload(format!("malformed error member: {e}"))),
        Err(_) => Ok(None),
    }
}
