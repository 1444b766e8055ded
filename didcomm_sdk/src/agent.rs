use std::{sync::Arc, time::Duration};

use tokio::sync::mpsc;
use url::Url;

use crate::{
    didexchange::{ConnectionStore, DidExchangeService, ServiceConfig},
    dispatch::{InboundHandler, OutboundDispatcher},
    error::Error,
    kms::Kms,
    messenger::Messenger,
    resolver::{DidResolver, RetryPolicy},
    storage::StorageProvider,
    transport::OutboundTransport,
};

/// Agent-wide configuration; the defaults suit interactive use.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub label: String,
    pub service_endpoint: Url,
    pub auto_accept: bool,
    pub action_grace: Duration,
    pub strict_actions: bool,
    pub handshake_timeout: Duration,
    pub resolver_retry: RetryPolicy,
}

impl AgentConfig {
    pub fn new(label: impl Into<String>, service_endpoint: Url) -> Self {
        AgentConfig {
            label: label.into(),
            service_endpoint,
            auto_accept: true,
            action_grace: Duration::from_secs(10),
            strict_actions: false,
            handshake_timeout: Duration::from_secs(600),
            resolver_retry: RetryPolicy::default(),
        }
    }

    fn service_config(&self) -> ServiceConfig {
        let mut config = ServiceConfig::new(self.label.clone(), self.service_endpoint.clone());
        config.auto_accept = self.auto_accept;
        config.action_grace = self.action_grace;
        config.strict_actions = self.strict_actions;
        config.handshake_timeout = self.handshake_timeout;
        config.resolver_retry = self.resolver_retry;
        config
    }
}

/// One DIDComm agent: the KMS, stores, dispatcher, messenger and protocol
/// services wired together over caller-provided storage, resolution and
/// transport capabilities.
pub struct Agent {
    kms: Arc<Kms>,
    connections: Arc<ConnectionStore>,
    didexchange: Arc<DidExchangeService>,
    messenger: Arc<Messenger>,
    inbound: Arc<InboundHandler>,
    dispatcher: Arc<OutboundDispatcher>,
}

impl Agent {
    pub async fn new(
        config: AgentConfig,
        storage: &dyn StorageProvider,
        resolver: Arc<dyn DidResolver>,
        transport: Arc<dyn OutboundTransport>,
    ) -> Result<Self, Error> {
        let kms = Arc::new(Kms::new());

        let dispatcher =
            Arc::new(OutboundDispatcher::new(kms.clone(), transport, storage).await?);
        let connections = Arc::new(ConnectionStore::open(storage).await?);
        dispatcher.set_connection_lookup(connections.clone());

        let messenger = Arc::new(Messenger::new(storage, dispatcher.clone()).await?);

        let didexchange = Arc::new(DidExchangeService::new(
            kms.clone(),
            connections.clone(),
            resolver,
            dispatcher.clone(),
            config.service_config(),
        ));

        let inbound = Arc::new(InboundHandler::new(
            kms.clone(),
            messenger.clone(),
            connections.clone(),
        ));
        inbound.register_service(didexchange.clone());

        Ok(Agent {
            kms,
            connections,
            didexchange,
            messenger,
            inbound,
            dispatcher,
        })
    }

    pub fn kms(&self) -> &Arc<Kms> {
        &self.kms
    }

    pub fn didexchange(&self) -> &Arc<DidExchangeService> {
        &self.didexchange
    }

    pub fn messenger(&self) -> &Arc<Messenger> {
        &self.messenger
    }

    pub fn connections(&self) -> &Arc<ConnectionStore> {
        &self.connections
    }

    /// Feed one inbound ciphertext frame from a transport.
    pub async fn receive(&self, ciphertext: &[u8]) -> Result<(), Error> {
        self.inbound.receive(ciphertext).await
    }

    /// Re-send envelopes that were durably queued but never acknowledged
    /// (crash recovery).
    pub async fn retransmit_pending(&self) -> Result<usize, Error> {
        self.dispatcher.retransmit_pending().await
    }

    /// Periodically abandon handshakes that outlived the configured timeout.
    pub fn start_housekeeping(self: Arc<Self>, every: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);

            loop {
                ticker.tick().await;

                match self.didexchange.abandon_expired().await {
                    Ok(0) => {}
                    Ok(count) => tracing::info!(count, "abandoned expired handshakes"),
                    Err(err) => tracing::warn!("handshake expiry sweep failed: {err}"),
                }
            }
        })
    }

    /// Drive inbound frames from a transport stream until it closes.
    /// Processing failures are logged, not fatal to the loop.
    pub fn listen(
        self: Arc<Self>,
        mut frames: mpsc::Receiver<Vec<u8>>,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(frame) = frames.recv().await {
                if let Err(err) = self.receive(&frame).await {
                    tracing::warn!("inbound processing failed: {err}");
                }
            }
        })
    }
}
