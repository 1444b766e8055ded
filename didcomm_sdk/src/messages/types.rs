//! Protocol message type URIs and typed payloads.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::Thread;
use crate::definitions::{DidDoc, VerKey};

pub const TYPE_PREFIX: &str = "did:sov:BzCbsNYhMrjHiqZDTUASHg;spec/";

pub const DIDEXCHANGE_PROTOCOL: &str = "did:sov:BzCbsNYhMrjHiqZDTUASHg;spec/didexchange/1.0";
pub const INVITATION: &str = "did:sov:BzCbsNYhMrjHiqZDTUASHg;spec/didexchange/1.0/invitation";
pub const REQUEST: &str = "did:sov:BzCbsNYhMrjHiqZDTUASHg;spec/didexchange/1.0/request";
pub const RESPONSE: &str = "did:sov:BzCbsNYhMrjHiqZDTUASHg;spec/didexchange/1.0/response";
pub const COMPLETE: &str = "did:sov:BzCbsNYhMrjHiqZDTUASHg;spec/didexchange/1.0/complete";

pub const FORWARD: &str = "did:sov:BzCbsNYhMrjHiqZDTUASHg;spec/routing/1.0/forward";

pub const PROBLEM_REPORT: &str =
    "did:sov:BzCbsNYhMrjHiqZDTUASHg;spec/problem-report/1.0/problem-report";

pub const SIGNATURE_ED25519_SHA512: &str =
    "did:sov:BzCbsNYhMrjHiqZDTUASHg;spec/signature/1.0/ed25519Sha512_single";

/// The protocol family+version of a message type URI (everything up to the
/// final path segment).
pub fn protocol_of(typ: &str) -> &str {
    typ.rsplit_once('/').map(|(family, _)| family).unwrap_or(typ)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Connection {
    pub did: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub did_doc: Option<DidDoc>,
}

/// `didexchange/1.0/request`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionRequest {
    #[serde(rename = "@type")]
    pub typ: String,
    #[serde(rename = "@id")]
    pub id: String,
    pub label: String,
    pub connection: Connection,
    #[serde(rename = "~thread", skip_serializing_if = "Option::is_none")]
    pub thread: Option<Thread>,
}

/// The `connection~sig` attachment carried by a response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionSignature {
    #[serde(rename = "@type")]
    pub typ: String,
    pub signature: String,
    pub sig_data: String,
    pub signer: VerKey,
}

/// `didexchange/1.0/response`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionResponse {
    #[serde(rename = "@type")]
    pub typ: String,
    #[serde(rename = "@id")]
    pub id: String,
    #[serde(rename = "~thread")]
    pub thread: Thread,
    #[serde(rename = "connection~sig")]
    pub connection_sig: ConnectionSignature,
}

/// `didexchange/1.0/complete`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Complete {
    #[serde(rename = "@type")]
    pub typ: String,
    #[serde(rename = "@id")]
    pub id: String,
    #[serde(rename = "~thread")]
    pub thread: Thread,
}

/// `problem-report/1.0/problem-report`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProblemReport {
    #[serde(rename = "@type")]
    pub typ: String,
    #[serde(rename = "@id")]
    pub id: String,
    #[serde(rename = "~thread", skip_serializing_if = "Option::is_none")]
    pub thread: Option<Thread>,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

/// `routing/1.0/forward`: the routing wrapper around an inner packed envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Forward {
    #[serde(rename = "@type")]
    pub typ: String,
    #[serde(rename = "@id")]
    pub id: String,
    pub to: VerKey,
    pub msg: Value,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn protocol_extraction() {
        assert_eq!(protocol_of(REQUEST), DIDEXCHANGE_PROTOCOL);
        assert_eq!(protocol_of(INVITATION), DIDEXCHANGE_PROTOCOL);
        assert_ne!(protocol_of(FORWARD), DIDEXCHANGE_PROTOCOL);
    }

    #[test]
    fn request_round_trip_keeps_thread() {
        let request = ConnectionRequest {
            typ: REQUEST.into(),
            id: "req-1".into(),
            label: "bob".into(),
            connection: Connection {
                did: "did:peer:bob".into(),
                did_doc: None,
            },
            thread: Some(Thread::with_pthid("inv-1")),
        };

        let msg = crate::messages::Message::from_payload(&request).unwrap();
        assert_eq!(msg.typ(), Some(REQUEST));
        assert_eq!(msg.parent_thread_id().as_deref(), Some("inv-1"));

        let back: ConnectionRequest = msg.to_payload().unwrap();
        assert_eq!(back.connection.did, "did:peer:bob");
    }
}
