use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use url::Url;
use uuid::Uuid;

use super::outbox::{OUTBOX_STORE, Outbox};
use crate::{
    crypto,
    definitions::{Destination, VerKey},
    error::Error,
    kms::Kms,
    messages::{Message, types},
    storage::StorageProvider,
    transport::OutboundTransport,
};

/// Resolves `(my_did, their_did)` to the sender key and destination recorded
/// for that connection. Implemented by the connection store.
#[async_trait]
pub trait ConnectionLookup: Send + Sync {
    async fn sender_and_destination(
        &self,
        my_did: &str,
        their_did: &str,
    ) -> Result<(VerKey, Destination), Error>;
}

/// A packed envelope that sits in the outbox awaiting transmission.
pub struct QueuedSend {
    entry: String,
    endpoint: Url,
    envelope: Vec<u8>,
}

/// Packs outbound messages and hands them to the transport, wrapping with
/// Forward messages for routed delivery.
pub struct OutboundDispatcher {
    kms: Arc<Kms>,
    transport: Arc<dyn OutboundTransport>,
    outbox: Outbox,
    connections: RwLock<Option<Arc<dyn ConnectionLookup>>>,
}

impl OutboundDispatcher {
    pub async fn new(
        kms: Arc<Kms>,
        transport: Arc<dyn OutboundTransport>,
        storage: &dyn StorageProvider,
    ) -> Result<Self, Error> {
        let outbox = Outbox::new(storage.open_store(OUTBOX_STORE).await?);

        Ok(OutboundDispatcher {
            kms,
            transport,
            outbox,
            connections: RwLock::new(None),
        })
    }

    /// Wire the connection lookup once the connection store exists.
    pub fn set_connection_lookup(&self, lookup: Arc<dyn ConnectionLookup>) {
        if let Ok(mut connections) = self.connections.write() {
            *connections = Some(lookup);
        }
    }

    /// Pack `msg` for `destination` and transmit it.
    pub async fn send(
        &self,
        msg: &Message,
        sender: &VerKey,
        destination: &Destination,
    ) -> Result<(), Error> {
        let queued = self.enqueue(msg, sender, destination).await?;

        self.flush(queued).await
    }

    /// Pack `msg` and durably queue it without transmitting. Callers that
    /// must not advance state before the outbound is queued (the DID
    /// Exchange service) enqueue first, persist their record, then
    /// [`flush`](Self::flush).
    pub async fn enqueue(
        &self,
        msg: &Message,
        sender: &VerKey,
        destination: &Destination,
    ) -> Result<QueuedSend, Error> {
        let envelope = self.pack_for(&msg.to_bytes()?, sender, destination)?;
        let entry = self
            .outbox
            .push(&destination.service_endpoint, &envelope)
            .await?;

        Ok(QueuedSend {
            entry,
            endpoint: destination.service_endpoint.clone(),
            envelope,
        })
    }

    /// Transmit a previously queued envelope and drop it from the outbox.
    pub async fn flush(&self, queued: QueuedSend) -> Result<(), Error> {
        tracing::debug!(
            endpoint = %queued.endpoint,
            bytes = queued.envelope.len(),
            "transmitting packed message"
        );
        self.transport.send(&queued.endpoint, &queued.envelope).await?;

        self.outbox.remove(&queued.entry).await?;

        Ok(())
    }

    /// Look up the connection for `(my_did, their_did)` and send through it.
    pub async fn send_to_did(
        &self,
        msg: &Message,
        my_did: &str,
        their_did: &str,
    ) -> Result<(), Error> {
        let lookup = self
            .connections
            .read()?
            .clone()
            .ok_or(Error::Internal)?;

        let (sender, destination) = lookup.sender_and_destination(my_did, their_did).await?;

        self.send(msg, &sender, &destination).await
    }

    /// Re-send every envelope that was queued but never acknowledged.
    pub async fn retransmit_pending(&self) -> Result<usize, Error> {
        let mut sent = 0;

        for entry in self.outbox.pending().await? {
            self.transport.send(&entry.endpoint, &entry.envelope).await?;
            self.outbox.remove(&entry.id).await?;
            sent += 1;
        }

        Ok(sent)
    }

    /// Inner pack plus one Forward wrap per routing key; the first routing
    /// key wraps the innermost envelope.
    fn pack_for(
        &self,
        payload: &[u8],
        sender: &VerKey,
        destination: &Destination,
    ) -> Result<Vec<u8>, Error> {
        let mut envelope = crypto::pack(&self.kms, payload, sender, &destination.recipient_keys)?;

        let mut next_hop = destination
            .recipient_keys
            .first()
            .ok_or_else(|| Error::Validation("destination has no recipient keys".into()))?
            .clone();

        for routing_key in &destination.routing_keys {
            let forward = types::Forward {
                typ: types::FORWARD.into(),
                id: Uuid::new_v4().to_string(),
                to: next_hop,
                msg: serde_json::from_slice(&envelope)?,
            };

            let wrapped = Message::from_payload(&forward)?;
            envelope = crypto::pack(
                &self.kms,
                &wrapped.to_bytes()?,
                sender,
                std::slice::from_ref(routing_key),
            )?;
            next_hop = routing_key.clone();
        }

        Ok(envelope)
    }

}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        crypto::unpack,
        messages::types::Forward,
        storage::MemoryStorageProvider,
        transport::{ChannelTransport, TransportError},
    };

    fn destination(recipient: &VerKey, routing: Vec<VerKey>) -> Destination {
        Destination {
            service_endpoint: "mem://router".parse().unwrap(),
            recipient_keys: vec![recipient.clone()],
            routing_keys: routing,
        }
    }

    #[tokio::test]
    async fn send_packs_to_recipient() {
        let kms = Arc::new(Kms::new());
        let sender = kms.create_key().unwrap();

        let recipient_kms = Kms::new();
        let recipient = recipient_kms.create_key().unwrap();

        let transport = ChannelTransport::new();
        let mut inbox = transport.listen(&"mem://router".parse().unwrap());

        let storage = MemoryStorageProvider::new();
        let dispatcher = OutboundDispatcher::new(kms, Arc::new(transport), &storage)
            .await
            .unwrap();

        let msg = Message::new(types::COMPLETE);
        dispatcher
            .send(&msg, &sender, &destination(&recipient, vec![]))
            .await
            .unwrap();

        let frame = inbox.recv().await.unwrap();
        let opened = unpack(&recipient_kms, &frame).unwrap();
        assert_eq!(opened.sender_key, sender);
    }

    #[tokio::test]
    async fn routing_keys_wrap_outermost_last() {
        let kms = Arc::new(Kms::new());
        let sender = kms.create_key().unwrap();

        let recipient_kms = Kms::new();
        let recipient = recipient_kms.create_key().unwrap();
        let router1_kms = Kms::new();
        let router1 = router1_kms.create_key().unwrap();
        let router2_kms = Kms::new();
        let router2 = router2_kms.create_key().unwrap();

        let transport = ChannelTransport::new();
        let mut inbox = transport.listen(&"mem://router".parse().unwrap());

        let storage = MemoryStorageProvider::new();
        let dispatcher = OutboundDispatcher::new(kms, Arc::new(transport), &storage)
            .await
            .unwrap();

        let msg = Message::new(types::COMPLETE);
        dispatcher
            .send(
                &msg,
                &sender,
                &destination(&recipient, vec![router1.clone(), router2.clone()]),
            )
            .await
            .unwrap();

        // outermost envelope is for the last routing key
        let frame = inbox.recv().await.unwrap();
        let outer = unpack(&router2_kms, &frame).unwrap();
        let outer_fwd: Forward = Message::from_bytes(&outer.plaintext)
            .unwrap()
            .to_payload()
            .unwrap();
        assert_eq!(outer_fwd.to, router1);

        // next layer is for the first routing key, pointing at the recipient
        let inner_bytes = serde_json::to_vec(&outer_fwd.msg).unwrap();
        let inner = unpack(&router1_kms, &inner_bytes).unwrap();
        let inner_fwd: Forward = Message::from_bytes(&inner.plaintext)
            .unwrap()
            .to_payload()
            .unwrap();
        assert_eq!(inner_fwd.to, recipient);

        // innermost envelope opens for the recipient
        let core_bytes = serde_json::to_vec(&inner_fwd.msg).unwrap();
        let core = unpack(&recipient_kms, &core_bytes).unwrap();
        assert_eq!(core.sender_key, sender);
    }

    #[tokio::test]
    async fn transport_failure_leaves_entry_queued() {
        let kms = Arc::new(Kms::new());
        let sender = kms.create_key().unwrap();
        let recipient = Kms::new().create_key().unwrap();

        // nobody listens on the endpoint: send fails
        let transport = ChannelTransport::new();
        let storage = MemoryStorageProvider::new();
        let dispatcher = OutboundDispatcher::new(kms, Arc::new(transport.clone()), &storage)
            .await
            .unwrap();

        let msg = Message::new(types::COMPLETE);
        let err = dispatcher
            .send(&msg, &sender, &destination(&recipient, vec![]))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Transport(TransportError::UnknownEndpoint(_))
        ));

        // once the endpoint exists, the queued envelope is retransmitted
        let mut inbox = transport.listen(&"mem://router".parse().unwrap());
        assert_eq!(dispatcher.retransmit_pending().await.unwrap(), 1);
        assert!(inbox.recv().await.is_some());
        assert_eq!(dispatcher.retransmit_pending().await.unwrap(), 0);
    }
}
