use base64ct::{Base64UrlUnpadded, Encoding};
use serde::{Deserialize, Serialize};

use super::CryptoError;
use crate::definitions::VerKey;

pub const ENVELOPE_TYP: &str = "JWM/1.0";
pub const ALG_AUTHCRYPT: &str = "Authcrypt";
pub const ENC_XCHACHA: &str = "xchacha20poly1305_ietf";

/// The outer DIDComm v1 packed-message envelope. All fields are base64url.
#[derive(Debug, Serialize, Deserialize)]
pub struct Envelope {
    pub protected: String,
    pub iv: String,
    pub ciphertext: String,
    pub tag: String,
}

/// The decoded `protected` header.
#[derive(Debug, Serialize, Deserialize)]
pub struct Protected {
    pub enc: String,
    pub typ: String,
    pub alg: String,
    pub recipients: Vec<Recipient>,
}

/// One per-recipient entry: the content encryption key boxed sender→recipient
/// plus the anonymously boxed sender verkey.
#[derive(Debug, Serialize, Deserialize)]
pub struct Recipient {
    pub encrypted_key: String,
    pub header: RecipientHeader,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RecipientHeader {
    pub kid: VerKey,
    pub sender: String,
    pub iv: String,
}

impl Envelope {
    pub fn to_bytes(&self) -> Result<Vec<u8>, CryptoError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Envelope, CryptoError> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Decode the protected header; the raw base64url string stays the AEAD
    /// associated data, so callers keep `self.protected` for decryption.
    pub fn decode_protected(&self) -> Result<Protected, CryptoError> {
        let raw = Base64UrlUnpadded::decode_vec(&self.protected)?;

        Ok(serde_json::from_slice(&raw)?)
    }
}

impl Protected {
    pub fn encode(&self) -> Result<String, CryptoError> {
        Ok(Base64UrlUnpadded::encode_string(&serde_json::to_vec(self)?))
    }
}

pub fn b64_encode(bytes: &[u8]) -> String {
    Base64UrlUnpadded::encode_string(bytes)
}

pub fn b64_decode(value: &str) -> Result<Vec<u8>, CryptoError> {
    Ok(Base64UrlUnpadded::decode_vec(value)?)
}
