//! The messenger enforces DIDComm threading correlators so protocol services
//! can focus on payload semantics.
//!
//! Every valid inbound message is recorded under its `@id`; replies consult
//! that record to reconstruct `~thread`. Per-thread metadata set by services
//! is persisted separately and merged back into inbound messages next to the
//! map, never onto the wire.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::{
    definitions::{Destination, VerKey},
    dispatch::OutboundDispatcher,
    error::Error,
    messages::{Message, Metadata, Thread},
    storage::{StorageProvider, Store},
};

pub const MESSENGER_STORE: &str = "messenger_store";

fn metadata_key(thread_id: &str) -> String {
    format!("metadata_{thread_id}")
}

/// Durable per-message correlation state, keyed by `@id`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct MessageRecord {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    my_did: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    their_did: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    thread_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    parent_thread_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    metadata: Option<Metadata>,
}

/// Options for [`Messenger::reply_to_nested`]; whatever is missing is filled
/// from the record identified by `msg_id`.
#[derive(Debug, Clone, Default)]
pub struct NestedReplyOpts {
    pub msg_id: Option<String>,
    pub thread_id: Option<String>,
    pub my_did: Option<String>,
    pub their_did: Option<String>,
}

pub struct Messenger {
    store: Arc<dyn Store>,
    dispatcher: Arc<OutboundDispatcher>,
}

impl Messenger {
    pub async fn new(
        storage: &dyn StorageProvider,
        dispatcher: Arc<OutboundDispatcher>,
    ) -> Result<Self, Error> {
        Ok(Messenger {
            store: storage.open_store(MESSENGER_STORE).await?,
            dispatcher,
        })
    }

    /// Record an inbound message and merge any stored per-thread metadata
    /// into it. Fails when `@id` is absent.
    pub async fn handle_inbound(
        &self,
        msg: &mut Message,
        my_did: &str,
        their_did: &str,
    ) -> Result<(), Error> {
        let Some(id) = msg.id().map(str::to_string) else {
            return Err(Error::Validation(
                "message-id is absent and can't be processed".into(),
            ));
        };

        // even without a ~thread decorator the id doubles as the thread id
        let thread_id = msg.thread_id().unwrap_or_else(|| id.clone());

        if let Some(metadata) = self.load_metadata(&thread_id).await? {
            msg.set_metadata(metadata);
        }

        self.save_record(
            &id,
            MessageRecord {
                my_did: my_did.to_string(),
                their_did: their_did.to_string(),
                thread_id,
                parent_thread_id: msg.parent_thread_id(),
                metadata: None,
            },
        )
        .await
    }

    /// Send `msg` on a fresh thread (`thid` = its own id) over the
    /// connection identified by the DID pair.
    pub async fn send(&self, mut msg: Message, my_did: &str, their_did: &str) -> Result<(), Error> {
        let id = msg.ensure_id();

        self.save_metadata(&mut msg).await?;

        msg.set_thread(Thread::with_thid(id));

        self.dispatcher.send_to_did(&msg, my_did, their_did).await
    }

    /// Send `msg` straight to a destination, outside any connection and
    /// without a thread decorator (invitation responses and similar).
    pub async fn send_to_destination(
        &self,
        mut msg: Message,
        sender: &VerKey,
        destination: &Destination,
    ) -> Result<(), Error> {
        msg.ensure_id();

        self.save_metadata(&mut msg).await?;

        msg.clear_thread();

        self.dispatcher.send(&msg, sender, destination).await
    }

    /// Reply on the thread of the message identified by `msg_id`. Any
    /// `~thread` already on `msg` is rewritten.
    pub async fn reply_to(&self, msg_id: &str, mut msg: Message) -> Result<(), Error> {
        msg.ensure_id();

        let record = self.get_record(msg_id).await?;

        msg.set_thread(Thread {
            thid: Some(record.thread_id.clone()),
            pthid: record.parent_thread_id.clone(),
            ..Default::default()
        });

        self.save_metadata(&mut msg).await?;

        self.dispatcher
            .send_to_did(&msg, &record.my_did, &record.their_did)
            .await
    }

    /// Start a new thread whose parent is the referenced thread.
    pub async fn reply_to_nested(
        &self,
        mut msg: Message,
        opts: &NestedReplyOpts,
    ) -> Result<(), Error> {
        msg.ensure_id();

        self.save_metadata(&mut msg).await?;

        let opts = self.fill_nested_reply_opts(opts.clone()).await?;

        let (Some(thread_id), Some(my_did), Some(their_did)) =
            (opts.thread_id, opts.my_did, opts.their_did)
        else {
            return Err(Error::Validation(
                "nested reply is missing thread or party information".into(),
            ));
        };

        msg.set_thread(Thread::with_pthid(thread_id));

        self.dispatcher.send_to_did(&msg, &my_did, &their_did).await
    }

    async fn fill_nested_reply_opts(
        &self,
        mut opts: NestedReplyOpts,
    ) -> Result<NestedReplyOpts, Error> {
        if opts.thread_id.is_some() && opts.my_did.is_some() && opts.their_did.is_some() {
            return Ok(opts);
        }

        let Some(msg_id) = opts.msg_id.as_deref() else {
            tracing::debug!("nested reply options incomplete and no message id to fill them from");
            return Ok(opts);
        };

        let record = self.get_record(msg_id).await?;

        opts.thread_id = opts.thread_id.or(Some(record.thread_id));
        opts.my_did = opts.my_did.or(Some(record.my_did));
        opts.their_did = opts.their_did.or(Some(record.their_did));

        Ok(opts)
    }

    async fn save_metadata(&self, msg: &mut Message) -> Result<(), Error> {
        let Some(metadata) = msg.take_metadata() else {
            return Ok(());
        };

        let Some(thread_id) = msg.thread_id() else {
            return Ok(());
        };

        self.save_record(
            &metadata_key(&thread_id),
            MessageRecord {
                metadata: Some(metadata),
                ..Default::default()
            },
        )
        .await
    }

    async fn load_metadata(&self, thread_id: &str) -> Result<Option<Metadata>, Error> {
        match self.store.get(&metadata_key(thread_id)).await {
            Ok(bytes) => {
                let record: MessageRecord = serde_json::from_slice(&bytes)?;
                Ok(record.metadata)
            }
            Err(err) if err.is_not_found() => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn get_record(&self, msg_id: &str) -> Result<MessageRecord, Error> {
        let bytes = self.store.get(msg_id).await?;

        Ok(serde_json::from_slice(&bytes)?)
    }

    async fn save_record(&self, key: &str, record: MessageRecord) -> Result<(), Error> {
        let bytes = serde_json::to_vec(&record)?;

        self.store.put(key, &bytes).await.map_err(Into::into)
    }

    /// Whether an inbound message with this id has been recorded (P1 probe,
    /// used by tests and idempotency checks).
    pub async fn has_record(&self, msg_id: &str) -> Result<bool, Error> {
        match self.store.get(msg_id).await {
            Ok(_) => Ok(true),
            Err(err) if err.is_not_found() => Ok(false),
            Err(err) => Err(err.into()),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        crypto::unpack,
        definitions::Destination,
        kms::Kms,
        messages::types,
        storage::MemoryStorageProvider,
        transport::ChannelTransport,
    };
    use serde_json::json;

    struct Fixture {
        messenger: Messenger,
        kms: Arc<Kms>,
        peer_kms: Arc<Kms>,
        transport: ChannelTransport,
    }

    /// Static lookup standing in for the connection store: every DID pair
    /// maps to the same sender key and destination.
    struct FixedLookup {
        sender: VerKey,
        destination: Destination,
    }

    #[async_trait::async_trait]
    impl crate::dispatch::ConnectionLookup for FixedLookup {
        async fn sender_and_destination(
            &self,
            _my_did: &str,
            _their_did: &str,
        ) -> Result<(VerKey, Destination), Error> {
            Ok((self.sender.clone(), self.destination.clone()))
        }
    }

    async fn fixture() -> Fixture {
        let kms = Arc::new(Kms::new());
        let peer_kms = Arc::new(Kms::new());
        let transport = ChannelTransport::new();
        let storage = MemoryStorageProvider::new();

        let dispatcher = Arc::new(
            OutboundDispatcher::new(kms.clone(), Arc::new(transport.clone()), &storage)
                .await
                .unwrap(),
        );
        let messenger = Messenger::new(&storage, dispatcher).await.unwrap();

        Fixture {
            messenger,
            kms,
            peer_kms,
            transport,
        }
    }

    /// Listen on `mem://peer` and point `send_to_did` at it.
    fn wire_peer(fixture: &Fixture) -> tokio::sync::mpsc::Receiver<Vec<u8>> {
        let sender = fixture.kms.create_key().unwrap();
        let recipient = fixture.peer_kms.create_key().unwrap();
        let endpoint: url::Url = "mem://peer".parse().unwrap();
        let inbox = fixture.transport.listen(&endpoint);

        fixture
            .messenger
            .dispatcher
            .set_connection_lookup(Arc::new(FixedLookup {
                sender,
                destination: Destination {
                    service_endpoint: endpoint,
                    recipient_keys: vec![recipient],
                    routing_keys: vec![],
                },
            }));

        inbox
    }

    #[tokio::test]
    async fn inbound_without_id_is_rejected() {
        let fixture = fixture().await;
        let mut msg = Message::from_value(json!({"@type": types::COMPLETE})).unwrap();

        assert!(matches!(
            fixture
                .messenger
                .handle_inbound(&mut msg, "did:peer:me", "did:peer:them")
                .await,
            Err(Error::Validation(_))
        ));
    }

    #[tokio::test]
    async fn inbound_is_recorded_by_id() {
        let fixture = fixture().await;
        let mut msg = Message::from_value(json!({
            "@type": types::COMPLETE,
            "@id": "m-1",
            "~thread": {"thid": "t-1", "pthid": "p-1"},
        }))
        .unwrap();

        fixture
            .messenger
            .handle_inbound(&mut msg, "did:peer:me", "did:peer:them")
            .await
            .unwrap();

        assert!(fixture.messenger.has_record("m-1").await.unwrap());
    }

    async fn outbound_wire(fixture: &Fixture, inbox: &mut tokio::sync::mpsc::Receiver<Vec<u8>>) -> Message {
        let frame = inbox.recv().await.unwrap();
        let opened = unpack(fixture.peer_kms.as_ref(), &frame).unwrap();
        Message::from_bytes(&opened.plaintext).unwrap()
    }

    #[tokio::test]
    async fn reply_to_restores_thread() {
        let fixture = fixture().await;
        let mut inbox = wire_peer(&fixture);

        let mut inbound = Message::from_value(json!({
            "@type": types::COMPLETE,
            "@id": "m-1",
            "~thread": {"thid": "t-1", "pthid": "p-1"},
        }))
        .unwrap();
        fixture
            .messenger
            .handle_inbound(&mut inbound, "did:peer:me", "did:peer:them")
            .await
            .unwrap();

        fixture
            .messenger
            .reply_to("m-1", Message::new(types::COMPLETE))
            .await
            .unwrap();

        let wire = outbound_wire(&fixture, &mut inbox).await;
        let thread = wire.thread().unwrap();
        assert_eq!(thread.thid.as_deref(), Some("t-1"));
        assert_eq!(thread.pthid.as_deref(), Some("p-1"));
        assert!(wire.id().is_some());
    }

    #[tokio::test]
    async fn reply_to_unknown_message_fails() {
        let fixture = fixture().await;
        let _inbox = wire_peer(&fixture);

        assert!(
            fixture
                .messenger
                .reply_to("no-such-id", Message::new(types::COMPLETE))
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn nested_reply_starts_child_thread() {
        let fixture = fixture().await;
        let mut inbox = wire_peer(&fixture);

        let mut inbound = Message::from_value(json!({
            "@type": types::COMPLETE,
            "@id": "m-1",
            "~thread": {"thid": "t-1", "pthid": "p-1"},
        }))
        .unwrap();
        fixture
            .messenger
            .handle_inbound(&mut inbound, "did:peer:me", "did:peer:them")
            .await
            .unwrap();

        fixture
            .messenger
            .reply_to_nested(
                Message::new(types::COMPLETE),
                &NestedReplyOpts {
                    msg_id: Some("m-1".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let wire = outbound_wire(&fixture, &mut inbox).await;
        let thread = wire.thread().unwrap();
        // the referenced thread becomes the parent; no thid at the top level
        assert_eq!(thread.pthid.as_deref(), Some("t-1"));
        assert_eq!(thread.thid, None);
        assert!(wire.id().is_some());
    }

    #[tokio::test]
    async fn send_starts_own_thread() {
        let fixture = fixture().await;
        let mut inbox = wire_peer(&fixture);

        fixture
            .messenger
            .send(Message::new(types::COMPLETE), "did:peer:me", "did:peer:them")
            .await
            .unwrap();

        let wire = outbound_wire(&fixture, &mut inbox).await;
        assert_eq!(wire.thread().unwrap().thid.as_deref(), wire.id());
    }

    #[tokio::test]
    async fn send_to_destination_strips_thread() {
        let fixture = fixture().await;

        let sender = fixture.kms.create_key().unwrap();
        let recipient = fixture.peer_kms.create_key().unwrap();
        let endpoint: url::Url = "mem://peer".parse().unwrap();
        let mut inbox = fixture.transport.listen(&endpoint);
        let destination = Destination {
            service_endpoint: endpoint,
            recipient_keys: vec![recipient],
            routing_keys: vec![],
        };

        let mut msg = Message::new(types::COMPLETE);
        msg.set_thread(Thread::with_thid("stale-thread"));

        fixture
            .messenger
            .send_to_destination(msg, &sender, &destination)
            .await
            .unwrap();

        let wire = outbound_wire(&fixture, &mut inbox).await;
        assert!(wire.thread().is_none());
        assert!(wire.id().is_some());
    }

    #[tokio::test]
    async fn metadata_round_trips_through_the_store() {
        let fixture = fixture().await;

        let sender = fixture.kms.create_key().unwrap();
        let recipient = fixture.peer_kms.create_key().unwrap();
        let endpoint: url::Url = "mem://peer".parse().unwrap();
        let mut inbox = fixture.transport.listen(&endpoint);
        let destination = Destination {
            service_endpoint: endpoint,
            recipient_keys: vec![recipient],
            routing_keys: vec![],
        };

        // outbound message on thread t-2 carries service metadata
        let mut msg = Message::from_value(json!({
            "@type": types::COMPLETE,
            "@id": "out-1",
            "~thread": {"thid": "t-2"},
        }))
        .unwrap();
        let mut metadata = Metadata::new();
        metadata.insert("state".into(), json!("responded"));
        msg.set_metadata(metadata);

        fixture
            .messenger
            .send_to_destination(msg, &sender, &destination)
            .await
            .unwrap();

        // metadata was persisted, not transmitted
        let wire = outbound_wire(&fixture, &mut inbox).await;
        assert!(wire.get("state").is_none());

        // an inbound continuation of t-2 gets the metadata merged back
        let mut inbound = Message::from_value(json!({
            "@type": types::COMPLETE,
            "@id": "in-1",
            "~thread": {"thid": "t-2"},
        }))
        .unwrap();
        fixture
            .messenger
            .handle_inbound(&mut inbound, "did:peer:me", "did:peer:them")
            .await
            .unwrap();

        assert_eq!(
            inbound.metadata().and_then(|m| m.get("state")),
            Some(&json!("responded"))
        );
    }
}
