use std::time::Duration;

use rpc_transport::jsonrpc::{Id, Request};
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use super::Timer;
use super::actor::ConnectionActor;
use super::correlator::CallResult;
use super::state::ConnectionState;
use crate::correlation::CorrelationId;
use crate::error::RpcError;
use crate::metrics::CallOutcome;

impl ConnectionActor {
    /// Registers, subscribes, publishes and arms the timer, in that order,
    /// so a fast response can never arrive before its waiter exists.
    pub(super) async fn start_call(
        &mut self,
        id: CorrelationId,
        method: String,
        params: Option<Value>,
        timeout: Option<Duration>,
        completion: oneshot::Sender<CallResult>,
    ) {
        let call_topic = match self.scheme.call_topic(&method) {
            Ok(topic) => topic,
            Err(err) => {
                let _ = completion.send(Err(err));
                return;
            }
        };
        if self.state == ConnectionState::Closed || !self.has_users() {
            debug!(namespace = %self.namespace(), method = %method, "call on closed connection");
            let _ = completion.send(Err(RpcError::Closed));
            return;
        }

        let response_topic = self.correlator.await_response(id.clone(), &method, completion);
        self.metrics.call_started(&self.settings.namespace, &method);
        self.subscribe(&response_topic).await;

        let request = Request::call(Id::String(id.to_string()), method.as_str(), params);
        match serde_json::to_value(&request) {
            Ok(body) => {
                self.publish(&call_topic, &body).await;
            }
            Err(err) => {
                if let Some(call) = self.correlator.cancel(&id) {
                    self.unsubscribe(&call.topic).await;
                    call.resolve(err.into());
                }
                return;
            }
        }
        debug!(namespace = %self.namespace(), method = %method, correlation_id = %id, "call published");

        let timeout = timeout.or(self.settings.default_timeout()).filter(|t| !t.is_zero());
        if let Some(timeout) = timeout {
            self.arm_timer(&id, timeout);
        }
    }

    fn arm_timer(&mut self, id: &CorrelationId, timeout: Duration) {
        let timers = self.timers.clone();
        let expired = id.clone();
        let timeout_ms = timeout.as_millis() as u64;
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = timers.send(Timer::Expire { id: expired, timeout_ms });
        });
        self.correlator.arm_timer(id, timer.abort_handle());
    }

    /// A response that won the race already removed the entry; then this is a no-op.
    pub(super) async fn expire(&mut self, id: &CorrelationId, timeout_ms: u64) {
        let Some(call) = self.correlator.cancel(id) else {
            return;
        };
        self.unsubscribe(&call.topic).await;
        warn!(
            namespace = %self.namespace(),
            method = %call.method,
            correlation_id = %id,
            timeout_ms,
            "call timed out"
        );
        self.metrics
            .call_completed(&self.settings.namespace, &call.method, CallOutcome::Timeout, call.elapsed);
        call.resolve(RpcError::Timeout(timeout_ms));
    }

    pub(super) async fn notify(&mut self, method: &str, params: Option<Value>) -> Result<(), RpcError> {
        let topic = self.scheme.call_topic(method)?;
        if self.state == ConnectionState::Closed || !self.has_users() {
            return Err(RpcError::Closed);
        }
        let body = serde_json::to_value(Request::notification(method, params))?;
        self.publish(&topic, &body).await;
        Ok(())
    }
}
