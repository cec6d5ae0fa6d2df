//! In-process broker implementing [`Transport`].
//!
//! Every `connect` opens a session on a shared broker; publishes are routed to
//! every online session holding a matching subscription, in publish order.
//! Besides routing, the broker keeps counters and lets callers inject
//! lifecycle events, which is what tests and the demo binary need.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::message::EndpointConfig;
use crate::transport::{
    Transport, TransportError, TransportEvent, TransportHandle, TransportLink, topic_matches,
    validate_pattern,
};

#[derive(Debug)]
struct Session {
    events: mpsc::UnboundedSender<TransportEvent>,
    subscriptions: Vec<String>,
    online: bool,
}

#[derive(Debug, Default)]
struct Broker {
    sessions: DashMap<u64, Session>,
    next_session: AtomicU64,
    attempts: AtomicUsize,
    connects: AtomicUsize,
    closes: AtomicUsize,
    refused: AtomicUsize,
    subscribe_calls: DashMap<String, usize>,
    unsubscribe_calls: DashMap<String, usize>,
}

impl Broker {
    fn route(&self, topic: &str, payload: &[u8]) -> usize {
        let mut delivered = 0;
        for session in self.sessions.iter() {
            if !session.online {
                continue;
            }
            if session.subscriptions.iter().any(|p| topic_matches(p, topic)) {
                let event = TransportEvent::Message {
                    topic: topic.to_string(),
                    payload: payload.to_vec(),
                };
                if session.events.send(event).is_ok() {
                    delivered += 1;
                }
            }
        }
        delivered
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemoryTransport {
    broker: Arc<Broker>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Successful connects.
    pub fn connect_count(&self) -> usize {
        self.broker.connects.load(Ordering::SeqCst)
    }

    /// Connects tried, including refused ones.
    pub fn connect_attempts(&self) -> usize {
        self.broker.attempts.load(Ordering::SeqCst)
    }

    pub fn close_count(&self) -> usize {
        self.broker.closes.load(Ordering::SeqCst)
    }

    pub fn session_count(&self) -> usize {
        self.broker.sessions.len()
    }

    /// The next `n` connects fail with [`TransportError::Connect`].
    pub fn refuse_next_connects(&self, n: usize) {
        self.broker.refused.store(n, Ordering::SeqCst);
    }

    /// Active subscription patterns over all sessions, sorted and deduplicated.
    pub fn subscriptions(&self) -> Vec<String> {
        let mut all: Vec<String> = self
            .broker
            .sessions
            .iter()
            .flat_map(|s| s.subscriptions.clone())
            .collect();
        all.sort();
        all.dedup();
        all
    }

    pub fn subscribe_calls(&self, pattern: &str) -> usize {
        self.broker.subscribe_calls.get(pattern).map(|c| *c).unwrap_or(0)
    }

    pub fn unsubscribe_calls(&self, pattern: &str) -> usize {
        self.broker.unsubscribe_calls.get(pattern).map(|c| *c).unwrap_or(0)
    }

    /// Publish as an outside peer without a session of its own.
    pub fn inject(&self, topic: &str, payload: &[u8]) -> usize {
        self.broker.route(topic, payload)
    }

    /// Push a lifecycle event to every session, updating its online flag the
    /// way a real client would.
    pub fn emit(&self, event: TransportEvent) {
        if let TransportEvent::Message { topic, payload } = &event {
            self.inject(topic, payload);
            return;
        }
        for mut session in self.broker.sessions.iter_mut() {
            match &event {
                TransportEvent::Connected => session.online = true,
                TransportEvent::Offline | TransportEvent::Closed | TransportEvent::Error(_) => {
                    session.online = false
                }
                _ => {}
            }
            let _ = session.events.send(event.clone());
        }
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn connect(&self, endpoint: &EndpointConfig) -> Result<TransportLink, TransportError> {
        self.broker.attempts.fetch_add(1, Ordering::SeqCst);
        let refused = self
            .broker
            .refused
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(TransportError::Connect {
                address: endpoint.address(),
                reason: "connection refused".to_string(),
            });
        }

        let id = self.broker.next_session.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::unbounded_channel();
        // the in-memory broker accepts immediately
        let _ = tx.send(TransportEvent::Connected);
        self.broker.sessions.insert(
            id,
            Session {
                events: tx,
                subscriptions: Vec::new(),
                online: true,
            },
        );
        self.broker.connects.fetch_add(1, Ordering::SeqCst);
        debug!(
            session = id,
            client_id = endpoint.client_id.as_deref().unwrap_or("-"),
            "memory session opened"
        );

        Ok(TransportLink {
            handle: Box::new(MemoryHandle {
                id,
                broker: self.broker.clone(),
            }),
            events: rx,
        })
    }
}

struct MemoryHandle {
    id: u64,
    broker: Arc<Broker>,
}

#[async_trait]
impl TransportHandle for MemoryHandle {
    async fn subscribe(&self, pattern: &str) -> Result<(), TransportError> {
        validate_pattern(pattern)?;
        {
            let mut session = self
                .broker
                .sessions
                .get_mut(&self.id)
                .ok_or(TransportError::NotConnected)?;
            if !session.subscriptions.iter().any(|p| p == pattern) {
                session.subscriptions.push(pattern.to_string());
            }
        }
        *self
            .broker
            .subscribe_calls
            .entry(pattern.to_string())
            .or_insert(0) += 1;
        trace!(session = self.id, pattern, "subscribed");
        Ok(())
    }

    async fn unsubscribe(&self, pattern: &str) -> Result<(), TransportError> {
        {
            let mut session = self
                .broker
                .sessions
                .get_mut(&self.id)
                .ok_or(TransportError::NotConnected)?;
            session.subscriptions.retain(|p| p != pattern);
        }
        *self
            .broker
            .unsubscribe_calls
            .entry(pattern.to_string())
            .or_insert(0) += 1;
        trace!(session = self.id, pattern, "unsubscribed");
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        if topic.contains('+') || topic.contains('#') {
            return Err(TransportError::InvalidPattern(topic.to_string()));
        }
        let online = self
            .broker
            .sessions
            .get(&self.id)
            .map(|s| s.online)
            .ok_or(TransportError::NotConnected)?;
        if !online {
            return Err(TransportError::NotConnected);
        }
        let delivered = self.broker.route(topic, &payload);
        trace!(session = self.id, topic, delivered, "published");
        Ok(())
    }

    async fn close(&self) {
        if self.broker.sessions.remove(&self.id).is_some() {
            self.broker.closes.fetch_add(1, Ordering::SeqCst);
            debug!(session = self.id, "memory session closed");
        }
    }
}
