//! The packing/unpacking pipeline: authenticated encryption of DIDComm v1
//! message envelopes keyed by verification keys.
//!
//! A packed message is a JWE-like JSON structure (see [`envelope`]): the
//! payload is encrypted once under a fresh content encryption key with
//! XChaCha20-Poly1305, and that key is boxed sender→recipient for every
//! recipient. The sender's verkey travels inside an anonymous box per
//! recipient, so only holders of a recipient private key learn who sent the
//! message.

use chacha20poly1305::{
    KeyInit, XChaCha20Poly1305, XNonce,
    aead::{Aead, AeadCore, Payload},
};
use rand_core::OsRng;

use crate::{
    definitions::VerKey,
    kms::{self, BOX_NONCE_SIZE, Kms},
};

pub mod envelope;
mod error;

pub use error::CryptoError;

use envelope::{
    ALG_AUTHCRYPT, ENC_XCHACHA, ENVELOPE_TYP, Envelope, Protected, Recipient, RecipientHeader,
    b64_decode, b64_encode,
};

const TAG_SIZE: usize = 16;

/// The result of opening a packed envelope.
#[derive(Debug)]
pub struct UnpackedEnvelope {
    pub plaintext: Vec<u8>,
    pub sender_key: VerKey,
    pub recipient_key: VerKey,
}

/// Pack `plaintext` from the held `sender` key to every key in `recipients`.
///
/// The result is a self-describing byte string consumable by any receiver
/// holding one of the recipient private keys.
pub fn pack(
    kms: &Kms,
    plaintext: &[u8],
    sender: &VerKey,
    recipients: &[VerKey],
) -> Result<Vec<u8>, CryptoError> {
    if recipients.is_empty() {
        return Err(CryptoError::Format("no recipient keys".into()));
    }

    let cek = XChaCha20Poly1305::generate_key(&mut OsRng);

    let mut entries = Vec::with_capacity(recipients.len());
    for recipient in recipients {
        let nonce = XChaCha20Poly1305::generate_nonce(&mut OsRng);
        let encrypted_key = kms.crypto_box_seal(sender, recipient, &nonce, &cek)?;
        let boxed_sender = kms::anonymous_seal(recipient, sender.as_str().as_bytes())?;

        entries.push(Recipient {
            encrypted_key: b64_encode(&encrypted_key),
            header: RecipientHeader {
                kid: recipient.clone(),
                sender: b64_encode(&boxed_sender),
                iv: b64_encode(&nonce),
            },
        });
    }

    let protected = Protected {
        enc: ENC_XCHACHA.into(),
        typ: ENVELOPE_TYP.into(),
        alg: ALG_AUTHCRYPT.into(),
        recipients: entries,
    }
    .encode()?;

    let payload_nonce = XChaCha20Poly1305::generate_nonce(&mut OsRng);
    let mut sealed = XChaCha20Poly1305::new(&cek)
        .encrypt(
            &payload_nonce,
            Payload {
                msg: plaintext,
                aad: protected.as_bytes(),
            },
        )
        .map_err(|_| CryptoError::Encrypt)?;

    let tag = sealed.split_off(sealed.len() - TAG_SIZE);

    Envelope {
        protected,
        iv: b64_encode(&payload_nonce),
        ciphertext: b64_encode(&sealed),
        tag: b64_encode(&tag),
    }
    .to_bytes()
}

/// Open a packed envelope with whichever recipient key the KMS holds.
pub fn unpack(kms: &Kms, message: &[u8]) -> Result<UnpackedEnvelope, CryptoError> {
    let envelope = Envelope::from_bytes(message)?;
    let protected = envelope.decode_protected()?;

    if protected.typ != ENVELOPE_TYP || protected.alg != ALG_AUTHCRYPT {
        return Err(CryptoError::Format(format!(
            "unsupported envelope {}/{}",
            protected.typ, protected.alg
        )));
    }

    let recipient = protected
        .recipients
        .iter()
        .find(|r| kms.has_key(&r.header.kid))
        .ok_or(CryptoError::NoRecipient)?;

    let recipient_key = recipient.header.kid.clone();

    let sender_raw = kms
        .sealed_box_open(&recipient_key, &b64_decode(&recipient.header.sender)?)
        .map_err(|_| CryptoError::Auth)?;
    let sender_key = VerKey::from(
        String::from_utf8(sender_raw).map_err(|_| CryptoError::Format("sender verkey".into()))?,
    );

    let cek_nonce = b64_decode(&recipient.header.iv)?;
    if cek_nonce.len() != BOX_NONCE_SIZE {
        return Err(CryptoError::Format("recipient nonce length".into()));
    }

    let cek = kms
        .crypto_box_open(
            &recipient_key,
            &sender_key,
            &cek_nonce,
            &b64_decode(&recipient.encrypted_key)?,
        )
        .map_err(|_| CryptoError::Auth)?;
    let cek: [u8; 32] = cek
        .as_slice()
        .try_into()
        .map_err(|_| CryptoError::Format("content key length".into()))?;

    let payload_nonce = b64_decode(&envelope.iv)?;
    if payload_nonce.len() != BOX_NONCE_SIZE {
        return Err(CryptoError::Format("payload nonce length".into()));
    }

    let mut sealed = b64_decode(&envelope.ciphertext)?;
    sealed.extend_from_slice(&b64_decode(&envelope.tag)?);

    let plaintext = XChaCha20Poly1305::new(&cek.into())
        .decrypt(
            XNonce::from_slice(&payload_nonce),
            Payload {
                msg: &sealed,
                aad: envelope.protected.as_bytes(),
            },
        )
        .map_err(|_| CryptoError::Auth)?;

    Ok(UnpackedEnvelope {
        plaintext,
        sender_key,
        recipient_key,
    })
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn pack_unpack_round_trip() {
        let alice_kms = Kms::new();
        let bob_kms = Kms::new();
        let alice = alice_kms.create_key().unwrap();
        let bob = bob_kms.create_key().unwrap();

        let packed = pack(&alice_kms, b"hello bob", &alice, std::slice::from_ref(&bob)).unwrap();
        let opened = unpack(&bob_kms, &packed).unwrap();

        assert_eq!(opened.plaintext, b"hello bob");
        assert_eq!(opened.sender_key, alice);
        assert_eq!(opened.recipient_key, bob);
    }

    #[test]
    fn any_held_recipient_key_opens() {
        let alice_kms = Kms::new();
        let bob_kms = Kms::new();
        let carol_kms = Kms::new();
        let alice = alice_kms.create_key().unwrap();
        let bob = bob_kms.create_key().unwrap();
        let carol = carol_kms.create_key().unwrap();

        let packed = pack(
            &alice_kms,
            b"hello both",
            &alice,
            &[bob.clone(), carol.clone()],
        )
        .unwrap();

        assert_eq!(unpack(&bob_kms, &packed).unwrap().recipient_key, bob);
        assert_eq!(unpack(&carol_kms, &packed).unwrap().recipient_key, carol);
    }

    #[test]
    fn unpack_without_recipient_key() {
        let alice_kms = Kms::new();
        let bob_kms = Kms::new();
        let alice = alice_kms.create_key().unwrap();
        let bob = bob_kms.create_key().unwrap();

        let packed = pack(&alice_kms, b"hello", &alice, &[bob]).unwrap();

        // alice's KMS does not hold bob's private key
        assert!(matches!(
            unpack(&alice_kms, &packed),
            Err(CryptoError::NoRecipient)
        ));
    }

    #[test]
    fn tampered_ciphertext_fails_auth() {
        let alice_kms = Kms::new();
        let bob_kms = Kms::new();
        let alice = alice_kms.create_key().unwrap();
        let bob = bob_kms.create_key().unwrap();

        let packed = pack(&alice_kms, b"hello bob", &alice, &[bob]).unwrap();
        let mut envelope = Envelope::from_bytes(&packed).unwrap();

        let mut raw = b64_decode(&envelope.ciphertext).unwrap();
        raw[0] ^= 0x01;
        envelope.ciphertext = b64_encode(&raw);

        assert!(matches!(
            unpack(&bob_kms, &envelope.to_bytes().unwrap()),
            Err(CryptoError::Auth)
        ));
    }

    #[test]
    fn tampered_protected_header_fails() {
        let alice_kms = Kms::new();
        let bob_kms = Kms::new();
        let alice = alice_kms.create_key().unwrap();
        let bob = bob_kms.create_key().unwrap();

        let packed = pack(&alice_kms, b"hello bob", &alice, &[bob.clone()]).unwrap();
        let mut envelope = Envelope::from_bytes(&packed).unwrap();

        // re-encode the protected header with an extra recipient entry; the
        // AAD no longer matches what the sender authenticated
        let mut protected = envelope.decode_protected().unwrap();
        let mut clone = serde_json::to_value(&protected.recipients[0]).unwrap();
        clone["header"]["kid"] = serde_json::Value::String(bob.to_string());
        protected
            .recipients
            .push(serde_json::from_value(clone).unwrap());
        envelope.protected = protected.encode().unwrap();

        assert!(unpack(&bob_kms, &envelope.to_bytes().unwrap()).is_err());
    }

    #[test]
    fn garbage_input_is_a_format_error() {
        let kms = Kms::new();

        assert!(matches!(
            unpack(&kms, b"not json at all"),
            Err(CryptoError::Format(_))
        ));
    }
}
