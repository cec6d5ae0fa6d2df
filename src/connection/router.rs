use serde_json::Value;
use tracing::trace;

use super::actor::ConnectionActor;
use crate::error::RpcError;
use crate::metrics::CallOutcome;
use crate::topic::TopicKind;

impl ConnectionActor {
    /// Parses the payload and hands it to the method registry or the
    /// correlator, depending on the topic.
    pub(super) async fn route_inbound(&mut self, topic: &str, payload: &[u8]) -> Result<(), RpcError> {
        let envelope: Value = serde_json::from_slice(payload)?;

        match self.scheme.classify(topic) {
            TopicKind::Call(method) => {
                trace!(namespace = %self.namespace(), topic, "inbound call");
                self.methods.dispatch(topic, &method, envelope, &self.replies_tx)
            }
            TopicKind::Response(_) => {
                let delivered = self.correlator.deliver(topic, envelope)?;
                self.unsubscribe(&delivered.topic).await;
                let outcome = if delivered.remote_error {
                    CallOutcome::RemoteError
                } else {
                    CallOutcome::Ok
                };
                self.metrics
                    .call_completed(&self.settings.namespace, &delivered.method, outcome, delivered.elapsed);
                trace!(
                    namespace = %self.namespace(),
                    correlation_id = %delivered.id,
                    elapsed_ms = delivered.elapsed.as_millis() as u64,
                    "call resolved"
                );
                Ok(())
            }
            TopicKind::Unroutable => Err(RpcError::UnroutableTopic(topic.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use rpc_transport::MemoryTransport;
    use serde_json::json;
    use tokio::sync::{oneshot, watch};

    use super::*;
    use crate::config::ConnectionSettings;
    use crate::connection::methods::handler_fn;
    use crate::connection::{ConnectionState, StatusUpdate};
    use crate::correlation::CorrelationId;

    /// An actor with no link; routing never needs one.
    fn actor() -> ConnectionActor {
        let settings = ConnectionSettings::new("calc");
        let scheme = settings.scheme().unwrap();
        let status = watch::Sender::new(StatusUpdate::new(ConnectionState::Connecting, None));
        ConnectionActor::new(settings, scheme, Arc::new(MemoryTransport::new()), status)
    }

    #[tokio::test]
    async fn non_json_payloads_are_payload_errors() {
        let mut actor = actor();
        let err = actor.route_inbound("calc/method/sum", b"not json").await.unwrap_err();
        assert_eq!(err.name(), "payload");
    }

    #[tokio::test]
    async fn topics_outside_both_prefixes_are_unroutable() {
        let mut actor = actor();
        assert_eq!(
            actor.route_inbound("calc/status/x", b"{}").await,
            Err(RpcError::UnroutableTopic("calc/status/x".to_string()))
        );
        assert_eq!(
            actor.route_inbound("other/method/sum", b"{}").await,
            Err(RpcError::UnroutableTopic("other/method/sum".to_string()))
        );
    }

    #[tokio::test]
    async fn calls_for_unknown_methods_are_reported() {
        let mut actor = actor();
        actor
            .methods
            .register("sum", handler_fn(|_| async { Ok(json!(8)) }))
            .unwrap();

        let call = json!({"jsonrpc": "2.0", "method": "mul", "id": "1"}).to_string();
        assert_eq!(
            actor.route_inbound("calc/method/mul", call.as_bytes()).await,
            Err(RpcError::UnregisteredMethod("mul".to_string()))
        );

        let call = json!({"jsonrpc": "2.0", "method": "sum", "id": "2"}).to_string();
        assert_eq!(actor.route_inbound("calc/method/sum", call.as_bytes()).await, Ok(()));
    }

    #[tokio::test]
    async fn a_second_response_for_a_call_is_unroutable() {
        let mut actor = actor();
        let id = CorrelationId::generate();
        let (tx, rx) = oneshot::channel();
        let topic = actor.correlator.await_response(id.clone(), "sum", tx);

        let answer = json!({"jsonrpc": "2.0", "result": 8, "id": id.as_str()}).to_string();
        assert_eq!(actor.route_inbound(&topic, answer.as_bytes()).await, Ok(()));
        assert_eq!(rx.await.unwrap(), Ok(json!(8)));

        assert_eq!(
            actor.route_inbound(&topic, answer.as_bytes()).await,
            Err(RpcError::UnroutableTopic(topic.clone()))
        );
    }
}
