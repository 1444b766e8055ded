use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use async_trait::async_trait;
use tokio::sync::mpsc;
use url::Url;

use super::{OutboundTransport, TransportError};

pub const SCHEME: &str = "mem";

/// Bound per endpoint queue; senders feel backpressure beyond this.
pub const CHANNEL_CAPACITY: usize = 16;

/// In-memory transport: endpoints are `mem://` URLs mapped to bounded
/// channels. Agents listen on their endpoint and feed received frames into
/// their inbound handler.
#[derive(Default, Clone)]
pub struct ChannelTransport {
    endpoints: Arc<RwLock<HashMap<String, mpsc::Sender<Vec<u8>>>>>,
}

impl ChannelTransport {
    pub fn new() -> Self {
        Default::default()
    }

    /// Register `endpoint` and return the stream of frames sent to it.
    /// Listening again on the same endpoint replaces the previous receiver.
    pub fn listen(&self, endpoint: &Url) -> mpsc::Receiver<Vec<u8>> {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);

        if let Ok(mut endpoints) = self.endpoints.write() {
            endpoints.insert(endpoint.as_str().to_string(), tx);
        }

        rx
    }
}

#[async_trait]
impl OutboundTransport for ChannelTransport {
    fn supports(&self, scheme: &str) -> bool {
        scheme == SCHEME
    }

    async fn send(&self, endpoint: &Url, message: &[u8]) -> Result<(), TransportError> {
        if !self.supports(endpoint.scheme()) {
            return Err(TransportError::InvalidScheme(endpoint.scheme().to_string()));
        }

        let sender = {
            let endpoints = self
                .endpoints
                .read()
                .map_err(|_| TransportError::Closed(endpoint.to_string()))?;

            endpoints
                .get(endpoint.as_str())
                .cloned()
                .ok_or_else(|| TransportError::UnknownEndpoint(endpoint.to_string()))?
        };

        sender
            .send(message.to_vec())
            .await
            .map_err(|_| TransportError::Closed(endpoint.to_string()))
    }
}
