/// Error originating from the DIDComm agent.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Crypto(#[from] crate::crypto::CryptoError),
    #[error(transparent)]
    Kms(#[from] crate::kms::KmsError),
    #[error(transparent)]
    Storage(#[from] crate::storage::StorageError),
    #[error(transparent)]
    Resolver(#[from] crate::resolver::ResolverError),
    #[error(transparent)]
    Transport(#[from] crate::transport::TransportError),
    #[error(transparent)]
    State(#[from] crate::didexchange::StateError),
    #[error("(de)serialization failure: {0}")]
    Json(#[from] serde_json::Error),
    #[error("validation failure: {0}")]
    Validation(String),
    #[error("no handler registered for message type '{0}'")]
    UnhandledType(String),
    #[error("connection not found for '{0}'")]
    ConnectionNotFound(String),
    #[error("deadline exceeded: {0}")]
    Timeout(String),
    #[error("internal error")]
    Internal,
}

impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(_: std::sync::PoisonError<T>) -> Self {
        Self::Internal
    }
}
