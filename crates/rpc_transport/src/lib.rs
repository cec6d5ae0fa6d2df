pub mod jsonrpc;
pub mod memory;
pub mod message;
pub mod transport;

pub use memory::MemoryTransport;
pub use message::EndpointConfig;
pub use transport::{
    Transport, TransportError, TransportEvent, TransportHandle, TransportLink, TransportPtr,
};
