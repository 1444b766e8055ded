use std::{
    collections::HashMap,
    sync::RwLock,
};

use crypto_box::{
    ChaChaBox, PublicKey, SecretKey,
    aead::{Aead, AeadCore, generic_array::GenericArray},
};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand_core::OsRng;
use zeroize::Zeroize;

use crate::definitions::{VERKEY_SIZE, VerKey};

#[derive(thiserror::Error, Debug)]
pub enum KmsError {
    #[error("key not found for '{0}'")]
    KeyNotFound(String),
    #[error("invalid key material for '{0}'")]
    InvalidKey(String),
    #[error("encryption failed")]
    Encrypt,
    #[error("decryption failed")]
    Decrypt,
    #[error("could not verify signature for '{0}'")]
    Verify(String),
    #[error("internal error")]
    Internal,
}

impl<T> From<std::sync::PoisonError<T>> for KmsError {
    fn from(_: std::sync::PoisonError<T>) -> Self {
        Self::Internal
    }
}

/// The XChaCha20 nonce length used by the box constructions.
pub const BOX_NONCE_SIZE: usize = 24;

/// Key management service.
///
/// Holds Ed25519 signing keys indexed by their base58 verkey. The matching
/// X25519 key-agreement keys are derived on demand (montgomery conversion),
/// so a single verkey identifies both the signing and the encryption
/// capability of a party. Private key material never leaves this struct:
/// signing and all box operations that need a private key are methods here.
#[derive(Default)]
pub struct Kms {
    keys: RwLock<HashMap<VerKey, SigningKey>>,
}

impl Kms {
    pub fn new() -> Self {
        Default::default()
    }

    /// Generate a fresh Ed25519 keypair and return its verkey.
    pub fn create_key(&self) -> Result<VerKey, KmsError> {
        let signing = SigningKey::generate(&mut OsRng);
        let verkey = VerKey::from_public_bytes(signing.verifying_key().as_bytes());

        self.keys.write()?.insert(verkey.clone(), signing);

        Ok(verkey)
    }

    /// Import a keypair from its 32-byte seed. Used for wallet restore; the
    /// caller's copy of the seed is wiped.
    pub fn import_seed(&self, mut seed: [u8; 32]) -> Result<VerKey, KmsError> {
        let signing = SigningKey::from_bytes(&seed);
        seed.zeroize();

        let verkey = VerKey::from_public_bytes(signing.verifying_key().as_bytes());

        self.keys.write()?.insert(verkey.clone(), signing);

        Ok(verkey)
    }

    pub fn has_key(&self, key: &VerKey) -> bool {
        self.keys
            .read()
            .map(|keys| keys.contains_key(key))
            .unwrap_or(false)
    }

    pub fn sign(&self, message: &[u8], key: &VerKey) -> Result<Vec<u8>, KmsError> {
        let keys = self.keys.read()?;
        let signing = keys
            .get(key)
            .ok_or_else(|| KmsError::KeyNotFound(key.to_string()))?;

        Ok(signing.sign(message).to_bytes().to_vec())
    }

    /// Verify `signature` over `message` against a (possibly foreign) verkey.
    pub fn verify(message: &[u8], signature: &[u8], key: &VerKey) -> Result<(), KmsError> {
        let public = verifying_key(key)?;
        let signature =
            Signature::from_slice(signature).map_err(|_| KmsError::Verify(key.to_string()))?;

        public
            .verify(message, &signature)
            .map_err(|_| KmsError::Verify(key.to_string()))
    }

    /// Authenticated encryption from a held sender key to a recipient public
    /// key (NaCl box).
    pub(crate) fn crypto_box_seal(
        &self,
        sender: &VerKey,
        recipient: &VerKey,
        nonce: &[u8],
        plaintext: &[u8],
    ) -> Result<Vec<u8>, KmsError> {
        let secret = self.agreement_secret(sender)?;
        let public = agreement_public(recipient)?;

        ChaChaBox::new(&public, &secret)
            .encrypt(nonce_from(nonce)?, plaintext)
            .map_err(|_| KmsError::Encrypt)
    }

    /// Open a NaCl box addressed to a held recipient key.
    pub(crate) fn crypto_box_open(
        &self,
        recipient: &VerKey,
        sender: &VerKey,
        nonce: &[u8],
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, KmsError> {
        let secret = self.agreement_secret(recipient)?;
        let public = agreement_public(sender)?;

        ChaChaBox::new(&public, &secret)
            .decrypt(nonce_from(nonce)?, ciphertext)
            .map_err(|_| KmsError::Decrypt)
    }

    /// Open an anonymous box produced by [`anonymous_seal`].
    pub(crate) fn sealed_box_open(
        &self,
        recipient: &VerKey,
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, KmsError> {
        if ciphertext.len() < 32 + BOX_NONCE_SIZE {
            return Err(KmsError::Decrypt);
        }

        let ephemeral: [u8; 32] = ciphertext[..32].try_into().map_err(|_| KmsError::Decrypt)?;
        let nonce = &ciphertext[32..32 + BOX_NONCE_SIZE];
        let boxed = &ciphertext[32 + BOX_NONCE_SIZE..];

        let secret = self.agreement_secret(recipient)?;

        ChaChaBox::new(&PublicKey::from(ephemeral), &secret)
            .decrypt(nonce_from(nonce)?, boxed)
            .map_err(|_| KmsError::Decrypt)
    }

    /// The X25519 secret derived from a held Ed25519 key.
    fn agreement_secret(&self, key: &VerKey) -> Result<SecretKey, KmsError> {
        let keys = self.keys.read()?;
        let signing = keys
            .get(key)
            .ok_or_else(|| KmsError::KeyNotFound(key.to_string()))?;

        Ok(SecretKey::from(signing.to_scalar_bytes()))
    }
}

/// Anonymous encryption to a recipient verkey: an ephemeral keypair boxes the
/// plaintext, and the ephemeral public key plus nonce prefix the ciphertext.
/// Needs no KMS entry, only the recipient's public key.
pub(crate) fn anonymous_seal(recipient: &VerKey, plaintext: &[u8]) -> Result<Vec<u8>, KmsError> {
    let ephemeral = SecretKey::generate(&mut OsRng);
    let nonce = ChaChaBox::generate_nonce(&mut OsRng);
    let public = agreement_public(recipient)?;

    let boxed = ChaChaBox::new(&public, &ephemeral)
        .encrypt(&nonce, plaintext)
        .map_err(|_| KmsError::Encrypt)?;

    let mut out = Vec::with_capacity(32 + BOX_NONCE_SIZE + boxed.len());
    out.extend_from_slice(ephemeral.public_key().as_bytes());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&boxed);

    Ok(out)
}

/// The X25519 public key corresponding to an Ed25519 verkey.
pub(crate) fn agreement_public(key: &VerKey) -> Result<PublicKey, KmsError> {
    let public = verifying_key(key)?;

    Ok(PublicKey::from(public.to_montgomery().to_bytes()))
}

fn verifying_key(key: &VerKey) -> Result<VerifyingKey, KmsError> {
    let bytes: [u8; VERKEY_SIZE] = key
        .to_public_bytes()
        .map_err(|_| KmsError::InvalidKey(key.to_string()))?;

    VerifyingKey::from_bytes(&bytes).map_err(|_| KmsError::InvalidKey(key.to_string()))
}

fn nonce_from(nonce: &[u8]) -> Result<&GenericArray<u8, <ChaChaBox as AeadCore>::NonceSize>, KmsError> {
    if nonce.len() != BOX_NONCE_SIZE {
        return Err(KmsError::Decrypt);
    }

    Ok(GenericArray::from_slice(nonce))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn sign_and_verify() {
        let kms = Kms::new();
        let key = kms.create_key().unwrap();

        let signature = kms.sign(b"payload", &key).unwrap();
        Kms::verify(b"payload", &signature, &key).unwrap();

        assert!(Kms::verify(b"other payload", &signature, &key).is_err());
    }

    #[test]
    fn sign_with_unknown_key() {
        let kms = Kms::new();
        let foreign = VerKey::from_public_bytes(&[9u8; VERKEY_SIZE]);

        assert!(matches!(
            kms.sign(b"payload", &foreign),
            Err(KmsError::KeyNotFound(_))
        ));
    }

    #[test]
    fn box_round_trip() {
        let kms = Kms::new();
        let alice = kms.create_key().unwrap();
        let bob = kms.create_key().unwrap();

        let nonce = [1u8; BOX_NONCE_SIZE];
        let boxed = kms.crypto_box_seal(&alice, &bob, &nonce, b"secret").unwrap();
        let opened = kms.crypto_box_open(&bob, &alice, &nonce, &boxed).unwrap();

        assert_eq!(opened, b"secret");
    }

    #[test]
    fn sealed_box_round_trip() {
        let kms = Kms::new();
        let bob = kms.create_key().unwrap();

        let boxed = anonymous_seal(&bob, b"anonymous hello").unwrap();
        let opened = kms.sealed_box_open(&bob, &boxed).unwrap();

        assert_eq!(opened, b"anonymous hello");
    }

    #[test]
    fn sealed_box_rejects_tampering() {
        let kms = Kms::new();
        let bob = kms.create_key().unwrap();

        let mut boxed = anonymous_seal(&bob, b"anonymous hello").unwrap();
        let last = boxed.len() - 1;
        boxed[last] ^= 0x01;

        assert!(matches!(
            kms.sealed_box_open(&bob, &boxed),
            Err(KmsError::Decrypt)
        ));
    }

    #[test]
    fn import_is_deterministic() {
        let kms = Kms::new();
        let seed = [42u8; 32];

        let key = kms.import_seed(seed).unwrap();
        let again = kms.import_seed(seed).unwrap();

        assert_eq!(key, again);
        assert!(kms.has_key(&key));
    }
}
