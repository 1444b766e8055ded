use std::fmt::{self, Debug, Display};

use serde::{Deserialize, Serialize};
use url::Url;

/// A base58-encoded Ed25519 verification key.
///
/// The verkey is the stable identifier of a public key within the agent: it
/// names a key in the [KMS](crate::kms::Kms), appears as `kid` in packed
/// envelopes and as recipient/routing keys in invitations and DID documents.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VerKey(String);

pub const VERKEY_SIZE: usize = 32;

impl VerKey {
    pub fn from_public_bytes(bytes: &[u8; VERKEY_SIZE]) -> Self {
        VerKey(bs58::encode(bytes).into_string())
    }

    /// Decode the base58 form back into raw key bytes.
    pub fn to_public_bytes(&self) -> Result<[u8; VERKEY_SIZE], InvalidVerKey> {
        let decoded = bs58::decode(&self.0)
            .into_vec()
            .map_err(|_| InvalidVerKey(self.0.clone()))?;

        decoded
            .as_slice()
            .try_into()
            .map_err(|_| InvalidVerKey(self.0.clone()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for VerKey {
    fn from(value: String) -> Self {
        VerKey(value)
    }
}

impl From<&str> for VerKey {
    fn from(value: &str) -> Self {
        VerKey(value.to_string())
    }
}

impl Display for VerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Debug for VerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VerKey({})", self.0)
    }
}

#[derive(thiserror::Error, Debug)]
#[error("invalid verification key '{0}'")]
pub struct InvalidVerKey(pub String);

/// A single verification method inside a DID document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationMethod {
    pub id: String,
    #[serde(rename = "type")]
    pub method_type: String,
    pub controller: String,
    #[serde(rename = "publicKeyBase58")]
    pub public_key_base58: VerKey,
}

/// A service entry inside a DID document, pointing at a DIDComm endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DidService {
    pub id: String,
    #[serde(rename = "type")]
    pub service_type: String,
    pub service_endpoint: Url,
    #[serde(default)]
    pub recipient_keys: Vec<VerKey>,
    #[serde(default)]
    pub routing_keys: Vec<VerKey>,
}

pub const DIDCOMM_SERVICE_TYPE: &str = "did-communication";
pub const ED25519_VERIFICATION_KEY_TYPE: &str = "Ed25519VerificationKey2018";

/// An immutable DID document snapshot as returned by a resolver.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DidDoc {
    pub id: String,
    #[serde(default, rename = "verificationMethod")]
    pub verification_methods: Vec<VerificationMethod>,
    #[serde(default, rename = "service")]
    pub services: Vec<DidService>,
}

impl DidDoc {
    /// The first DIDComm service entry, if the document advertises one.
    pub fn didcomm_service(&self) -> Option<&DidService> {
        self.services
            .iter()
            .find(|s| s.service_type == DIDCOMM_SERVICE_TYPE)
            .or_else(|| self.services.first())
    }
}

/// Where to deliver an outbound message: the endpoint plus the keys to pack
/// for and to route through.
#[derive(Debug, Clone, PartialEq)]
pub struct Destination {
    pub service_endpoint: Url,
    pub recipient_keys: Vec<VerKey>,
    pub routing_keys: Vec<VerKey>,
}

#[derive(thiserror::Error, Debug)]
#[error("DID document for '{0}' has no usable DIDComm service")]
pub struct NoDidCommService(pub String);

impl Destination {
    /// Extract the transmission destination from a resolved DID document.
    pub fn from_did_doc(doc: &DidDoc) -> Result<Destination, NoDidCommService> {
        let service = doc
            .didcomm_service()
            .filter(|s| !s.recipient_keys.is_empty())
            .ok_or_else(|| NoDidCommService(doc.id.clone()))?;

        Ok(Destination {
            service_endpoint: service.service_endpoint.clone(),
            recipient_keys: service.recipient_keys.clone(),
            routing_keys: service.routing_keys.clone(),
        })
    }
}

/// An out-of-band invitation starting a DID Exchange handshake.
///
/// Either `recipient_keys` + `service_endpoint` are set (pairwise variant) or
/// `did` is set (public-DID variant, resolved by the invitee).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Invitation {
    #[serde(rename = "@type")]
    pub typ: String,
    #[serde(rename = "@id")]
    pub id: String,
    pub label: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub recipient_keys: Vec<VerKey>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service_endpoint: Option<Url>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub routing_keys: Vec<VerKey>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub did: Option<String>,
}

impl Invitation {
    /// The key the inviter committed to; signatures over the connection
    /// response must verify against it.
    pub fn invitation_key(&self) -> Option<&VerKey> {
        self.recipient_keys.first()
    }
}
