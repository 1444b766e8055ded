//! Transport ports.
//!
//! Transports are byte-in/byte-out: the dispatcher hands a packed envelope
//! and an endpoint URL to an [`OutboundTransport`], and inbound bytes enter
//! the agent through [`crate::dispatch::InboundHandler::receive`]. Concrete
//! HTTP/WebSocket adapters live outside this crate; the in-memory
//! [`channel::ChannelTransport`] backs local delivery and the tests.

use async_trait::async_trait;
use url::Url;

pub mod channel;

pub use channel::ChannelTransport;

#[derive(thiserror::Error, Debug)]
pub enum TransportError {
    #[error("invalid transport scheme '{0}'")]
    InvalidScheme(String),
    #[error("unknown endpoint '{0}'")]
    UnknownEndpoint(String),
    #[error("endpoint '{0}' is not accepting messages")]
    Closed(String),
    #[error("connection to '{0}' failed: {1}")]
    Connection(String, String),
}

#[async_trait]
pub trait OutboundTransport: Send + Sync {
    /// Whether this transport handles the given endpoint scheme.
    fn supports(&self, scheme: &str) -> bool;

    /// Transmit one packed envelope. Errors are surfaced synchronously to the
    /// caller; no retry happens at this layer.
    async fn send(&self, endpoint: &Url, message: &[u8]) -> Result<(), TransportError>;
}
