//! The `connection~sig` attachment of a connection response.
//!
//! `sig_data` is an 8-byte big-endian timestamp followed by the JSON of the
//! signed connection block. The signer must be the invitation's first
//! recipient key, proving the responder controls the key the invitation
//! advertised.

use crate::{
    crypto::envelope::{b64_decode, b64_encode},
    definitions::VerKey,
    error::Error,
    kms::Kms,
    messages::types::{Connection, ConnectionSignature, SIGNATURE_ED25519_SHA512},
};

use super::connection::now_secs;

pub fn sign_connection(
    kms: &Kms,
    connection: &Connection,
    signer: &VerKey,
) -> Result<ConnectionSignature, Error> {
    let payload = serde_json::to_vec(connection)?;

    let mut sig_data = Vec::with_capacity(8 + payload.len());
    sig_data.extend_from_slice(&now_secs().to_be_bytes());
    sig_data.extend_from_slice(&payload);

    let signature = kms.sign(&sig_data, signer)?;

    Ok(ConnectionSignature {
        typ: SIGNATURE_ED25519_SHA512.into(),
        signature: b64_encode(&signature),
        sig_data: b64_encode(&sig_data),
        signer: signer.clone(),
    })
}

/// Verify the attachment against the key the invitation committed to and
/// recover the signed connection block.
pub fn verify_connection(
    sig: &ConnectionSignature,
    invitation_key: &VerKey,
) -> Result<Connection, Error> {
    if &sig.signer != invitation_key {
        return Err(Error::Validation(format!(
            "connection signed by '{}', expected invitation key '{invitation_key}'",
            sig.signer
        )));
    }

    let sig_data = b64_decode(&sig.sig_data)?;
    if sig_data.len() <= 8 {
        return Err(Error::Validation("connection signature data too short".into()));
    }

    let signature = b64_decode(&sig.signature)?;
    Kms::verify(&sig_data, &signature, invitation_key)?;

    Ok(serde_json::from_slice(&sig_data[8..])?)
}
