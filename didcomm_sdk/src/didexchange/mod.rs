//! The DID Exchange protocol: a multi-party handshake driven by
//! asynchronous, potentially out-of-order messages, with durably persisted
//! connection state and cryptographic verification of the exchanged DID
//! documents.

mod connection;
mod events;
pub mod machine;
mod service;
mod signature;

pub use connection::{CONNECTION_STORE, ConnectionRecord, ConnectionStore, Namespace, State};
pub use events::{
    ActionEvent, ActionKind, ContinueOpts, EVENT_CHANNEL_CAPACITY, StateMsg,
};
pub use machine::{Role, StateError, Trigger};
pub use service::{DidExchangeService, ServiceConfig};
pub use signature::{sign_connection, verify_connection};
