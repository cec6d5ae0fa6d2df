use std::collections::BTreeMap;
use std::sync::Weak;

use rpc_transport::{TransportEvent, TransportHandle, TransportPtr};
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::ConnectionSnapshot;
use super::{Command, Timer};
use super::correlator::ResponseCorrelator;
use super::methods::{MethodRegistry, OutboundReply, SubscriptionChange};
use super::state::{ConnectionState, ConnectionUser, StatusUpdate};
use crate::config::ConnectionSettings;
use crate::error::RpcError;
use crate::metrics::{CallMetrics, CallOutcome};
use crate::topic::TopicScheme;

/// Owner of all per-namespace state. Only reachable through [`Command`]s.
pub(super) struct ConnectionActor {
    pub(super) settings: ConnectionSettings,
    pub(super) scheme: TopicScheme,
    transport: TransportPtr,
    pub(super) link: Option<Box<dyn TransportHandle>>,
    events: Option<mpsc::UnboundedReceiver<TransportEvent>>,
    pub(super) state: ConnectionState,
    users: BTreeMap<String, Weak<dyn ConnectionUser>>,
    pub(super) methods: MethodRegistry,
    pub(super) correlator: ResponseCorrelator,
    pub(super) replies_tx: mpsc::UnboundedSender<OutboundReply>,
    replies_rx: mpsc::UnboundedReceiver<OutboundReply>,
    pub(super) timers: mpsc::UnboundedSender<Timer>,
    timers_rx: mpsc::UnboundedReceiver<Timer>,
    status: watch::Sender<StatusUpdate>,
    retry: Option<CancellationToken>,
    retry_generation: u64,
    lifetime: CancellationToken,
    pub(super) metrics: CallMetrics,
}

/// Next transport event, or never when there is no link.
async fn next_event(events: &mut Option<mpsc::UnboundedReceiver<TransportEvent>>) -> Option<TransportEvent> {
    match events {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

impl ConnectionActor {
    pub(super) fn new(
        settings: ConnectionSettings,
        scheme: TopicScheme,
        transport: TransportPtr,
        status: watch::Sender<StatusUpdate>,
    ) -> Self {
        let (replies_tx, replies_rx) = mpsc::unbounded_channel();
        let (timers, timers_rx) = mpsc::unbounded_channel();
        Self {
            methods: MethodRegistry::new(scheme.clone()),
            correlator: ResponseCorrelator::new(scheme.clone()),
            settings,
            scheme,
            transport,
            link: None,
            events: None,
            state: ConnectionState::Connecting,
            users: BTreeMap::new(),
            replies_tx,
            replies_rx,
            timers,
            timers_rx,
            status,
            retry: None,
            retry_generation: 0,
            lifetime: CancellationToken::new(),
            metrics: CallMetrics::new(),
        }
    }

    pub(super) fn namespace(&self) -> &str {
        &self.settings.namespace
    }

    pub(super) async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        loop {
            tokio::select! {
                biased;

                event = next_event(&mut self.events) => match event {
                    Some(event) => self.handle_event(event).await,
                    None => {
                        self.events = None;
                        self.fail("transport event stream ended".to_string()).await;
                    }
                },

                Some(timer) = self.timers_rx.recv() => match timer {
                    Timer::Expire { id, timeout_ms } => self.expire(&id, timeout_ms).await,
                    Timer::Retry { generation } => self.retry(generation).await,
                },

                Some(reply) = self.replies_rx.recv() => self.publish_reply(reply).await,

                command = commands.recv() => match command {
                    Some(Command::Shutdown { ack }) => {
                        self.teardown().await;
                        let _ = ack.send(());
                        break;
                    }
                    Some(command) => self.handle_command(command).await,
                    None => {
                        self.teardown().await;
                        break;
                    }
                },
            }
        }
        debug!(namespace = %self.namespace(), "connection actor stopped");
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::RegisterUser { id, user, ack } => {
                let count = self.register_user(id, user).await;
                let _ = ack.send(count);
            }
            Command::UnregisterUser { id, ack } => {
                let count = self.unregister_user(&id).await;
                let _ = ack.send(count);
            }
            Command::RegisterMethod { method, handler, ack } => {
                let result = match self.methods.register(&method, handler) {
                    Ok(change) => {
                        info!(namespace = %self.namespace(), method = %method, "method registered");
                        self.apply_change(change).await;
                        Ok(())
                    }
                    Err(e) => Err(e),
                };
                let _ = ack.send(result);
            }
            Command::UnregisterMethod { method, ack } => {
                let result = match self.methods.unregister(&method) {
                    Ok(change) => {
                        info!(namespace = %self.namespace(), method = %method, "method unregistered");
                        self.apply_change(change).await;
                        Ok(())
                    }
                    Err(e) => Err(e),
                };
                let _ = ack.send(result);
            }
            Command::ReleaseMethod { method, handler, ack } => {
                let result = if self.methods.is_current(&method, &handler) {
                    match self.methods.unregister(&method) {
                        Ok(change) => {
                            info!(namespace = %self.namespace(), method = %method, "method released");
                            self.apply_change(change).await;
                            Ok(true)
                        }
                        Err(e) => Err(e),
                    }
                } else {
                    debug!(namespace = %self.namespace(), method = %method, "method owned by a newer registration, kept");
                    Ok(false)
                };
                let _ = ack.send(result);
            }
            Command::Call {
                id,
                method,
                params,
                timeout,
                completion,
            } => self.start_call(id, method, params, timeout, completion).await,
            Command::Notify { method, params, ack } => {
                let result = self.notify(&method, params).await;
                let _ = ack.send(result);
            }
            Command::Snapshot { ack } => {
                let _ = ack.send(self.snapshot());
            }
            Command::Shutdown { ack } => {
                // handled in `run`
                let _ = ack.send(());
            }
        }
    }

    async fn handle_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Connected => {
                self.resubscribe().await;
                self.set_state(ConnectionState::Connected, None);
            }
            TransportEvent::Reconnecting => {
                self.set_state(ConnectionState::Connecting, Some("reconnecting".to_string()))
            }
            TransportEvent::Offline => self.set_state(ConnectionState::Offline, None),
            TransportEvent::Closed => {
                self.drop_link().await;
                self.fail_pending(RpcError::Closed, CallOutcome::Closed);
                self.set_state(ConnectionState::Closed, None);
            }
            TransportEvent::Error(reason) => self.fail(reason).await,
            TransportEvent::Message { topic, payload } => {
                if let Err(err) = self.route_inbound(&topic, &payload).await {
                    match &err {
                        RpcError::UnregisteredMethod(method) => {
                            error!(namespace = %self.namespace(), topic = %topic, method = %method, "call for unregistered method dropped")
                        }
                        RpcError::Payload(reason) => {
                            warn!(namespace = %self.namespace(), topic = %topic, reason = %reason, "malformed payload dropped")
                        }
                        _ => warn!(namespace = %self.namespace(), topic = %topic, error = %err, "inbound message dropped"),
                    }
                }
            }
        }
    }

    async fn register_user(&mut self, id: String, user: Weak<dyn ConnectionUser>) -> usize {
        if let Some(live) = user.upgrade() {
            live.status(&self.status.borrow());
        }
        let fresh = self.users.insert(id.clone(), user).is_none();
        debug!(namespace = %self.namespace(), user = %id, users = self.users.len(), "user registered");
        if fresh && self.users.len() == 1 {
            self.set_state(ConnectionState::Connecting, None);
            self.connect().await;
        }
        self.users.len()
    }

    async fn unregister_user(&mut self, id: &str) -> usize {
        if self.users.remove(id).is_some() {
            debug!(namespace = %self.namespace(), user = %id, users = self.users.len(), "user unregistered");
            if self.users.is_empty() {
                self.disconnect().await;
            }
        }
        self.users.len()
    }

    pub(super) fn has_users(&self) -> bool {
        !self.users.is_empty()
    }

    async fn connect(&mut self) {
        let address = self.settings.endpoint.address();
        match self.transport.connect(&self.settings.endpoint).await {
            Ok(link) => {
                info!(namespace = %self.namespace(), address = %address, "transport link opened");
                self.link = Some(link.handle);
                self.events = Some(link.events);
            }
            Err(err) => self.fail(err.to_string()).await,
        }
    }

    /// Closes the link and schedules exactly one reconnect attempt.
    /// Pending calls stay in place and are re-subscribed once connected.
    async fn fail(&mut self, reason: String) {
        error!(namespace = %self.namespace(), reason = %reason, "transport failed");
        self.set_state(ConnectionState::Failed, Some(format!("error: {reason}")));
        self.drop_link().await;
        if self.has_users() {
            self.schedule_retry();
        }
    }

    fn schedule_retry(&mut self) {
        if let Some(previous) = self.retry.take() {
            previous.cancel();
        }
        self.retry_generation += 1;
        let generation = self.retry_generation;
        let token = self.lifetime.child_token();
        let delay = self.settings.retry_delay();
        let timers = self.timers.clone();

        let cancelled = token.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancelled.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    let _ = timers.send(Timer::Retry { generation });
                }
            }
        });
        debug!(namespace = %self.namespace(), delay_ms = delay.as_millis() as u64, "reconnect scheduled");
        self.retry = Some(token);
    }

    async fn retry(&mut self, generation: u64) {
        if generation != self.retry_generation || self.link.is_some() || !self.has_users() {
            debug!(namespace = %self.namespace(), generation, "stale reconnect ignored");
            return;
        }
        self.retry = None;
        self.set_state(ConnectionState::Connecting, Some("retrying".to_string()));
        self.connect().await;
    }

    fn cancel_retry(&mut self) {
        if let Some(token) = self.retry.take() {
            token.cancel();
        }
        // invalidates a retry timer that already fired
        self.retry_generation += 1;
    }

    async fn drop_link(&mut self) {
        self.events = None;
        if let Some(link) = self.link.take() {
            link.close().await;
        }
    }

    /// Last user gone: nothing survives but the actor itself.
    async fn disconnect(&mut self) {
        self.cancel_retry();
        self.drop_link().await;
        self.fail_pending(RpcError::Closed, CallOutcome::Closed);
        self.methods.clear();
        self.set_state(ConnectionState::Closed, None);
        info!(namespace = %self.namespace(), "disconnected");
    }

    async fn teardown(&mut self) {
        self.lifetime.cancel();
        self.disconnect().await;
        self.users.clear();
    }

    pub(super) fn fail_pending(&mut self, error: RpcError, outcome: CallOutcome) {
        for call in self.correlator.drain() {
            self.metrics
                .call_completed(&self.settings.namespace, &call.method, outcome, call.elapsed);
            debug!(namespace = %self.settings.namespace, correlation_id = %call.id, method = %call.method, "pending call cancelled");
            call.resolve(error.clone());
        }
    }

    pub(super) fn set_state(&mut self, state: ConnectionState, message: Option<String>) {
        self.state = state;
        let update = StatusUpdate::new(state, message);
        info!(
            namespace = %self.namespace(),
            state = %state,
            message = update.message.as_deref().unwrap_or(""),
            "connection state changed"
        );
        for user in self.users.values().filter_map(Weak::upgrade) {
            user.status(&update);
        }
        self.status.send_replace(update);
    }

    async fn resubscribe(&mut self) {
        if !self.methods.is_empty() {
            let wildcard = self.scheme.method_wildcard();
            self.subscribe(&wildcard).await;
        }
        for topic in self.correlator.topics() {
            self.subscribe(&topic).await;
        }
    }

    pub(super) async fn apply_change(&mut self, change: SubscriptionChange) {
        match change {
            SubscriptionChange::Subscribe(pattern) => self.subscribe(&pattern).await,
            SubscriptionChange::Unsubscribe(pattern) => self.unsubscribe(&pattern).await,
            SubscriptionChange::Unchanged => {}
        }
    }

    /// Without a link this is a no-op; everything is re-subscribed on connect.
    pub(super) async fn subscribe(&self, pattern: &str) {
        if let Some(link) = &self.link {
            if let Err(err) = link.subscribe(pattern).await {
                warn!(namespace = %self.namespace(), pattern, error = %err, "subscribe failed");
            }
        }
    }

    pub(super) async fn unsubscribe(&self, pattern: &str) {
        if let Some(link) = &self.link {
            if let Err(err) = link.unsubscribe(pattern).await {
                warn!(namespace = %self.namespace(), pattern, error = %err, "unsubscribe failed");
            }
        }
    }

    /// Offline or unlinked publishes are dropped, not queued.
    pub(super) async fn publish(&self, topic: &str, body: &Value) -> bool {
        if self.state == ConnectionState::Offline {
            warn!(namespace = %self.namespace(), topic, "offline, publish dropped");
            return false;
        }
        let Some(link) = &self.link else {
            warn!(namespace = %self.namespace(), topic, state = %self.state, "no transport link, publish dropped");
            return false;
        };
        let payload = match serde_json::to_vec(body) {
            Ok(payload) => payload,
            Err(err) => {
                error!(namespace = %self.namespace(), topic, error = %err, "could not encode payload");
                return false;
            }
        };
        match link.publish(topic, payload).await {
            Ok(()) => true,
            Err(err) => {
                warn!(namespace = %self.namespace(), topic, error = %err, "publish failed");
                false
            }
        }
    }

    async fn publish_reply(&self, reply: OutboundReply) {
        match serde_json::to_value(&reply.response) {
            Ok(body) => {
                self.publish(&reply.topic, &body).await;
            }
            Err(err) => error!(namespace = %self.namespace(), topic = %reply.topic, error = %err, "could not encode reply"),
        }
    }

    fn snapshot(&self) -> ConnectionSnapshot {
        ConnectionSnapshot {
            namespace: self.settings.namespace.clone(),
            state: self.state,
            users: self.users.keys().cloned().collect(),
            methods: self.methods.methods(),
            pending_calls: self.correlator.len(),
            linked: self.link.is_some(),
        }
    }
}
