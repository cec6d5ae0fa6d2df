use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::message::EndpointConfig;

/// Everything a live transport link reports back, in delivery order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Connected,
    Reconnecting,
    Closed,
    Offline,
    Error(String),
    Message { topic: String, payload: Vec<u8> },
}

#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransportError {
    #[error("could not connect to {address}: {reason}")]
    Connect { address: String, reason: String },

    #[error("transport is not connected")]
    NotConnected,

    #[error("invalid topic pattern `{0}`")]
    InvalidPattern(String),

    #[error("transport error: {0}")]
    Other(String),
}

/// Operations on an established link. Subscriptions are idempotent per pattern.
#[async_trait]
pub trait TransportHandle: Send + Sync {
    async fn subscribe(&self, pattern: &str) -> Result<(), TransportError>;
    async fn unsubscribe(&self, pattern: &str) -> Result<(), TransportError>;
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError>;
    /// Ends the link. No events are emitted afterwards.
    async fn close(&self);
}

/// Returned by [`Transport::connect`]. The link usually starts out connecting;
/// `Connected` arrives on `events` once the broker accepts it.
pub struct TransportLink {
    pub handle: Box<dyn TransportHandle>,
    pub events: mpsc::UnboundedReceiver<TransportEvent>,
}

impl std::fmt::Debug for TransportLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("TransportLink")
    }
}

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn connect(&self, endpoint: &EndpointConfig) -> Result<TransportLink, TransportError>;
}

pub type TransportPtr = Arc<dyn Transport>;

/// Single-level (`+`) and trailing multi-level (`#`) wildcards are only
/// accepted as the last segment of a pattern.
pub fn validate_pattern(pattern: &str) -> Result<(), TransportError> {
    if pattern.is_empty() {
        return Err(TransportError::InvalidPattern(pattern.to_string()));
    }
    let segments: Vec<&str> = pattern.split('/').collect();
    let last = segments.len() - 1;
    for (i, segment) in segments.iter().enumerate() {
        let wildcard = *segment == "+" || *segment == "#";
        let embedded = !wildcard && (segment.contains('+') || segment.contains('#'));
        if embedded || (wildcard && i != last) {
            return Err(TransportError::InvalidPattern(pattern.to_string()));
        }
    }
    Ok(())
}

/// MQTT style topic matching for the patterns accepted by [`validate_pattern`].
pub fn topic_matches(pattern: &str, topic: &str) -> bool {
    let mut pattern_levels = pattern.split('/');
    let mut topic_levels = topic.split('/');
    loop {
        match (pattern_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => continue,
            (Some(p), Some(t)) if p == t => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}
