use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use futures::future::BoxFuture;

use crate::{
    crypto,
    definitions::VerKey,
    error::Error,
    kms::Kms,
    messages::{Message, types},
    messenger::Messenger,
};

/// Keys the envelope was addressed with, plus the DIDs they map to (empty
/// strings while no connection knows the keys yet, i.e. mid-handshake).
#[derive(Debug, Clone)]
pub struct InboundContext {
    pub recipient_key: VerKey,
    pub sender_key: VerKey,
    pub my_did: String,
    pub their_did: String,
}

/// A protocol implementation that consumes inbound messages of the types it
/// accepts.
#[async_trait]
pub trait ProtocolService: Send + Sync {
    fn accepts(&self, msg_type: &str) -> bool;

    async fn handle_inbound(&self, msg: Message, ctx: &InboundContext) -> Result<(), Error>;
}

/// Maps envelope keys back to connection DIDs.
#[async_trait]
pub trait KeyDidMapper: Send + Sync {
    async fn dids_for_keys(&self, recipient: &VerKey, sender: &VerKey) -> (String, String);
}

/// Accepts ciphertext from any transport: unpack, parse, record, dispatch by
/// `@type`. Forward envelopes addressed to a held key are re-entered as new
/// inbound messages (local loopback).
pub struct InboundHandler {
    kms: Arc<Kms>,
    messenger: Arc<Messenger>,
    mapper: Arc<dyn KeyDidMapper>,
    services: RwLock<Vec<Arc<dyn ProtocolService>>>,
}

impl InboundHandler {
    pub fn new(kms: Arc<Kms>, messenger: Arc<Messenger>, mapper: Arc<dyn KeyDidMapper>) -> Self {
        InboundHandler {
            kms,
            messenger,
            mapper,
            services: RwLock::new(Vec::new()),
        }
    }

    pub fn register_service(&self, service: Arc<dyn ProtocolService>) {
        if let Ok(mut services) = self.services.write() {
            services.push(service);
        }
    }

    pub async fn receive(&self, ciphertext: &[u8]) -> Result<(), Error> {
        self.receive_frame(ciphertext.to_vec()).await
    }

    // boxed for the forward-loopback recursion
    fn receive_frame(&self, ciphertext: Vec<u8>) -> BoxFuture<'_, Result<(), Error>> {
        Box::pin(async move {
            let unpacked = crypto::unpack(&self.kms, &ciphertext)?;
            let mut msg = Message::from_bytes(&unpacked.plaintext)
                .map_err(|e| Error::Validation(format!("inbound message is not JSON: {e}")))?;

            let Some(typ) = msg.typ().map(str::to_string) else {
                return Err(Error::Validation("inbound message has no @type".into()));
            };

            if typ == types::FORWARD {
                return self.handle_forward(&msg).await;
            }

            let (my_did, their_did) = self
                .mapper
                .dids_for_keys(&unpacked.recipient_key, &unpacked.sender_key)
                .await;

            self.messenger
                .handle_inbound(&mut msg, &my_did, &their_did)
                .await?;

            let ctx = InboundContext {
                recipient_key: unpacked.recipient_key,
                sender_key: unpacked.sender_key,
                my_did,
                their_did,
            };

            let service = self
                .services
                .read()?
                .iter()
                .find(|s| s.accepts(&typ))
                .cloned();

            match service {
                Some(service) => service.handle_inbound(msg, &ctx).await,
                None => {
                    tracing::warn!(msg_type = %typ, "no protocol service for inbound message");
                    Err(Error::UnhandledType(typ))
                }
            }
        })
    }

    async fn handle_forward(&self, msg: &Message) -> Result<(), Error> {
        let forward: types::Forward = msg
            .to_payload()
            .map_err(|e| Error::Validation(format!("malformed forward message: {e}")))?;

        if !self.kms.has_key(&forward.to) {
            // relaying to remote mediatees is routing configuration, not core
            return Err(Error::Validation(format!(
                "forward target key '{}' is not held locally",
                forward.to
            )));
        }

        tracing::debug!(to = %forward.to, "unwrapping forward for local delivery");

        let inner = serde_json::to_vec(&forward.msg)?;

        self.receive_frame(inner).await
    }
}

#[cfg(test)]
mod test {
    use std::sync::Mutex;

    use super::*;
    use crate::{
        dispatch::OutboundDispatcher,
        storage::MemoryStorageProvider,
        transport::ChannelTransport,
    };
    use serde_json::json;

    struct NullMapper;

    #[async_trait]
    impl KeyDidMapper for NullMapper {
        async fn dids_for_keys(&self, _recipient: &VerKey, _sender: &VerKey) -> (String, String) {
            (String::new(), String::new())
        }
    }

    struct RecordingService {
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ProtocolService for RecordingService {
        fn accepts(&self, msg_type: &str) -> bool {
            types::protocol_of(msg_type) == types::DIDEXCHANGE_PROTOCOL
        }

        async fn handle_inbound(&self, msg: Message, _ctx: &InboundContext) -> Result<(), Error> {
            self.seen
                .lock()
                .unwrap()
                .push(msg.id().unwrap_or_default().to_string());
            Ok(())
        }
    }

    async fn handler(kms: Arc<Kms>) -> (InboundHandler, Arc<RecordingService>) {
        let storage = MemoryStorageProvider::new();
        let transport = Arc::new(ChannelTransport::new());
        let dispatcher = Arc::new(
            OutboundDispatcher::new(kms.clone(), transport, &storage)
                .await
                .unwrap(),
        );
        let messenger = Arc::new(Messenger::new(&storage, dispatcher).await.unwrap());

        let handler = InboundHandler::new(kms, messenger, Arc::new(NullMapper));
        let service = Arc::new(RecordingService {
            seen: Mutex::new(Vec::new()),
        });
        handler.register_service(service.clone());

        (handler, service)
    }

    fn packed(sender_kms: &Kms, sender: &VerKey, recipient: &VerKey, value: serde_json::Value) -> Vec<u8> {
        let msg = Message::from_value(value).unwrap();
        crypto::pack(
            sender_kms,
            &msg.to_bytes().unwrap(),
            sender,
            std::slice::from_ref(recipient),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn dispatches_by_type() {
        let kms = Arc::new(Kms::new());
        let me = kms.create_key().unwrap();
        let peer_kms = Kms::new();
        let peer = peer_kms.create_key().unwrap();

        let (handler, service) = handler(kms).await;

        let frame = packed(
            &peer_kms,
            &peer,
            &me,
            json!({"@type": types::COMPLETE, "@id": "m-1", "~thread": {"thid": "t-1"}}),
        );
        handler.receive(&frame).await.unwrap();

        assert_eq!(service.seen.lock().unwrap().as_slice(), ["m-1"]);
    }

    #[tokio::test]
    async fn unknown_type_is_surfaced() {
        let kms = Arc::new(Kms::new());
        let me = kms.create_key().unwrap();
        let peer_kms = Kms::new();
        let peer = peer_kms.create_key().unwrap();

        let (handler, _service) = handler(kms).await;

        let frame = packed(
            &peer_kms,
            &peer,
            &me,
            json!({"@type": "did:sov:BzCbsNYhMrjHiqZDTUASHg;spec/unknown/9.9/nope", "@id": "m-2"}),
        );

        assert!(matches!(
            handler.receive(&frame).await,
            Err(Error::UnhandledType(_))
        ));
    }

    #[tokio::test]
    async fn forward_loops_back_to_held_key() {
        let kms = Arc::new(Kms::new());
        let me = kms.create_key().unwrap();
        let peer_kms = Kms::new();
        let peer = peer_kms.create_key().unwrap();

        let (handler, service) = handler(kms.clone()).await;

        let inner = packed(
            &peer_kms,
            &peer,
            &me,
            json!({"@type": types::COMPLETE, "@id": "m-3", "~thread": {"thid": "t-3"}}),
        );

        let forward = json!({
            "@type": types::FORWARD,
            "@id": "fwd-1",
            "to": me.as_str(),
            "msg": serde_json::from_slice::<serde_json::Value>(&inner).unwrap(),
        });
        let frame = packed(&peer_kms, &peer, &me, forward);

        handler.receive(&frame).await.unwrap();
        assert_eq!(service.seen.lock().unwrap().as_slice(), ["m-3"]);
    }

    #[tokio::test]
    async fn forward_to_foreign_key_is_rejected() {
        let kms = Arc::new(Kms::new());
        let me = kms.create_key().unwrap();
        let peer_kms = Kms::new();
        let peer = peer_kms.create_key().unwrap();
        let elsewhere = peer_kms.create_key().unwrap();

        let (handler, _service) = handler(kms).await;

        let forward = json!({
            "@type": types::FORWARD,
            "@id": "fwd-2",
            "to": elsewhere.as_str(),
            "msg": {},
        });
        let frame = packed(&peer_kms, &peer, &me, forward);

        assert!(matches!(
            handler.receive(&frame).await,
            Err(Error::Validation(_))
        ));
    }
}
