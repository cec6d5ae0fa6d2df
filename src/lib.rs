pub mod config;
pub mod connection;
pub mod correlation;
pub mod error;
pub mod logger;
pub mod metrics;
pub mod node;
pub mod registry;
pub mod schema;
pub mod topic;

pub use config::ConnectionSettings;
pub use connection::{
    Connection, ConnectionSnapshot, ConnectionState, ConnectionUser, InboundCall, MethodHandler,
    PendingCall, Responder, StatusUpdate, handler_fn,
};
pub use correlation::CorrelationId;
pub use error::RpcError;
pub use registry::ConnectionRegistry;
pub use topic::{TopicKind, TopicScheme};
