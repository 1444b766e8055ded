use crate::kms::KmsError;

#[derive(thiserror::Error, Debug)]
pub enum CryptoError {
    #[error("malformed envelope: {0}")]
    Format(String),
    #[error("envelope authentication failed")]
    Auth,
    #[error("no recipient key held for envelope")]
    NoRecipient,
    #[error("envelope encryption failed")]
    Encrypt,
    #[error("key not available: {0}")]
    Key(String),
}

impl From<KmsError> for CryptoError {
    fn from(err: KmsError) -> Self {
        match err {
            KmsError::Decrypt | KmsError::Verify(_) => CryptoError::Auth,
            KmsError::Encrypt => CryptoError::Encrypt,
            KmsError::KeyNotFound(key) => CryptoError::Key(key),
            KmsError::InvalidKey(key) => CryptoError::Format(format!("invalid key '{key}'")),
            KmsError::Internal => CryptoError::Encrypt,
        }
    }
}

impl From<serde_json::Error> for CryptoError {
    fn from(err: serde_json::Error) -> Self {
        CryptoError::Format(err.to_string())
    }
}

impl From<base64ct::Error> for CryptoError {
    fn from(err: base64ct::Error) -> Self {
        CryptoError::Format(err.to_string())
    }
}
