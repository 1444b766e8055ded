//! On-the-wire DIDComm messages.
//!
//! Wire messages are schemaless JSON maps with mandatory `@type`/`@id` and an
//! optional `~thread` decorator. [`Message`] wraps the raw map so unknown
//! extension fields survive round-trips, and offers typed accessors for the
//! correlators. Per-thread metadata rides next to the map, never inside it,
//! so the serializer cannot leak it onto the wire.

use std::collections::HashMap;

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::{Map, Value};
use uuid::Uuid;

pub mod types;

const JSON_ID: &str = "@id";
const JSON_TYPE: &str = "@type";
const JSON_THREAD: &str = "~thread";

/// The `~thread` decorator (request/reply correlation).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Thread {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pthid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sender_order: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub received_orders: Option<HashMap<String, u64>>,
}

impl Thread {
    pub fn with_thid(thid: impl Into<String>) -> Self {
        Thread {
            thid: Some(thid.into()),
            ..Default::default()
        }
    }

    pub fn with_pthid(pthid: impl Into<String>) -> Self {
        Thread {
            pthid: Some(pthid.into()),
            ..Default::default()
        }
    }
}

/// Free-form per-thread scratchpad attached by services via the messenger.
pub type Metadata = Map<String, Value>;

/// A DIDComm message: the raw wire map plus non-wire metadata.
#[derive(Debug, Clone, Default)]
pub struct Message {
    fields: Map<String, Value>,
    metadata: Option<Metadata>,
}

impl Message {
    /// A new message of the given `@type` with a fresh `@id`.
    pub fn new(typ: &str) -> Message {
        let mut fields = Map::new();
        fields.insert(JSON_TYPE.into(), Value::String(typ.into()));
        fields.insert(JSON_ID.into(), Value::String(Uuid::new_v4().to_string()));

        Message {
            fields,
            metadata: None,
        }
    }

    pub fn from_value(value: Value) -> Result<Message, serde_json::Error> {
        let fields = serde_json::from_value(value)?;

        Ok(Message {
            fields,
            metadata: None,
        })
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Message, serde_json::Error> {
        Ok(Message {
            fields: serde_json::from_slice(bytes)?,
            metadata: None,
        })
    }

    /// Build a message from a typed payload struct (one of [`types`]).
    pub fn from_payload<T: Serialize>(payload: &T) -> Result<Message, serde_json::Error> {
        Message::from_value(serde_json::to_value(payload)?)
    }

    /// Decode the whole map into a typed payload struct.
    pub fn to_payload<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(Value::Object(self.fields.clone()))
    }

    /// The wire form. Metadata is not part of it.
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(&self.fields)
    }

    pub fn to_value(&self) -> Value {
        Value::Object(self.fields.clone())
    }

    pub fn id(&self) -> Option<&str> {
        self.fields.get(JSON_ID).and_then(Value::as_str)
    }

    /// Fill `@id` with a fresh UUID when absent; returns the effective id.
    pub fn ensure_id(&mut self) -> String {
        if let Some(id) = self.id() {
            return id.to_string();
        }

        let id = Uuid::new_v4().to_string();
        self.fields.insert(JSON_ID.into(), Value::String(id.clone()));
        id
    }

    pub fn typ(&self) -> Option<&str> {
        self.fields.get(JSON_TYPE).and_then(Value::as_str)
    }

    pub fn thread(&self) -> Option<Thread> {
        self.fields
            .get(JSON_THREAD)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    pub fn set_thread(&mut self, thread: Thread) {
        if let Ok(value) = serde_json::to_value(&thread) {
            self.fields.insert(JSON_THREAD.into(), value);
        }
    }

    pub fn clear_thread(&mut self) {
        self.fields.remove(JSON_THREAD);
    }

    /// The effective thread id: `~thread.thid`, falling back to `@id`.
    pub fn thread_id(&self) -> Option<String> {
        self.thread()
            .and_then(|t| t.thid)
            .or_else(|| self.id().map(str::to_string))
    }

    pub fn parent_thread_id(&self) -> Option<String> {
        self.thread().and_then(|t| t.pthid)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    pub fn set(&mut self, key: &str, value: Value) {
        self.fields.insert(key.into(), value);
    }

    pub fn metadata(&self) -> Option<&Metadata> {
        self.metadata.as_ref()
    }

    pub fn set_metadata(&mut self, metadata: Metadata) {
        self.metadata = Some(metadata);
    }

    pub(crate) fn take_metadata(&mut self) -> Option<Metadata> {
        self.metadata.take()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn new_message_has_type_and_id() {
        let msg = Message::new(types::COMPLETE);

        assert_eq!(msg.typ(), Some(types::COMPLETE));
        assert!(msg.id().is_some());
        assert_eq!(msg.thread_id().as_deref(), msg.id());
    }

    #[test]
    fn thread_id_prefers_thid() {
        let mut msg = Message::new(types::COMPLETE);
        msg.set_thread(Thread::with_thid("t-1"));

        assert_eq!(msg.thread_id().as_deref(), Some("t-1"));
        assert_eq!(msg.parent_thread_id(), None);
    }

    #[test]
    fn unknown_fields_survive_round_trip() {
        let raw = serde_json::json!({
            "@type": types::COMPLETE,
            "@id": "m-1",
            "custom-extension": {"a": 1},
        });

        let msg = Message::from_value(raw.clone()).unwrap();
        let bytes = msg.to_bytes().unwrap();
        let reparsed: Value = serde_json::from_slice(&bytes).unwrap();

        assert_eq!(reparsed, raw);
    }

    #[test]
    fn metadata_never_hits_the_wire() {
        let mut msg = Message::new(types::COMPLETE);
        let mut metadata = Metadata::new();
        metadata.insert("internal".into(), Value::Bool(true));
        msg.set_metadata(metadata);

        let wire = String::from_utf8(msg.to_bytes().unwrap()).unwrap();
        assert!(!wire.contains("internal"));
    }

    #[test]
    fn ensure_id_is_stable() {
        let mut msg = Message::from_value(serde_json::json!({"@type": types::COMPLETE})).unwrap();

        let id = msg.ensure_id();
        assert_eq!(msg.ensure_id(), id);
    }
}
