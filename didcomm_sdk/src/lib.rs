#![deny(rustdoc::broken_intra_doc_links)]

//! # DIDComm v1 secure messaging agent
//!
//! A peer-to-peer messaging agent for parties identified by decentralized
//! identifiers (DIDs). Two agents with no prior shared secrets establish a
//! mutually authenticated, end-to-end-encrypted connection through the
//! DID Exchange handshake, then exchange arbitrary application messages
//! grouped into threads and optionally relayed through routers.
//!
//! The primary entry point is [`Agent`], which wires the key management
//! service, the packing pipeline, the messenger and the
//! [DID Exchange service](didexchange::DidExchangeService) over three
//! caller-provided capabilities: [`storage::StorageProvider`],
//! [`resolver::DidResolver`] and [`transport::OutboundTransport`].
//!
//! ## Example
//!
//! The following establishes a connection between two agents over the
//! in-memory transport:
//!
//! ```rust
//! use std::sync::Arc;
//! use didcomm_sdk::{
//!     Agent, AgentConfig,
//!     didexchange::State,
//!     resolver::StaticResolver,
//!     storage::MemoryStorageProvider,
//!     transport::ChannelTransport,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), didcomm_sdk::Error> {
//!     let transport = Arc::new(ChannelTransport::new());
//!     let resolver = Arc::new(StaticResolver::new());
//!
//!     let alice = Arc::new(Agent::new(
//!         AgentConfig::new("alice", "mem://alice".parse().unwrap()),
//!         &MemoryStorageProvider::new(),
//!         resolver.clone(),
//!         transport.clone(),
//!     ).await?);
//!     let bob = Arc::new(Agent::new(
//!         AgentConfig::new("bob", "mem://bob".parse().unwrap()),
//!         &MemoryStorageProvider::new(),
//!         resolver,
//!         transport.clone(),
//!     ).await?);
//!
//!     // deliver each agent's frames from its endpoint
//!     alice.clone().listen(transport.listen(&"mem://alice".parse().unwrap()));
//!     bob.clone().listen(transport.listen(&"mem://bob".parse().unwrap()));
//!
//!     // alice invites, bob accepts; both sides auto-continue to completion
//!     let (invitation, record) = alice.didexchange().create_invitation().await?;
//!     bob.didexchange().receive_invitation(invitation).await?;
//!
//!     tokio::time::sleep(std::time::Duration::from_millis(500)).await;
//!     assert_eq!(
//!         alice.didexchange().connection(&record.connection_id).await?.state,
//!         State::Completed,
//!     );
//!
//!     Ok(())
//! }
//! ```

mod agent;

/// The packing/unpacking pipeline: DIDComm v1 envelopes authenticated and
/// encrypted under per-connection verification keys.
pub mod crypto;

/// Common data structures used throughout the crate: verification keys,
/// DID documents, destinations, invitations.
pub mod definitions;

pub mod didexchange;

/// Outbound packing/transmission, the durable outbox, and inbound routing.
pub mod dispatch;

mod error;

/// Key management: keypair generation, signing, verification, and the box
/// primitives behind the packer. Private keys never leave this module.
pub mod kms;

/// Wire messages, the `~thread` decorator and the typed protocol payloads.
pub mod messages;

/// Threading correlators and reply primitives over the dispatcher.
pub mod messenger;

pub mod resolver;

/// The key/value persistence contract plus the in-memory reference
/// implementation.
pub mod storage;

pub mod transport;


pub use agent::{Agent, AgentConfig};
pub use definitions::{Destination, DidDoc, Invitation, VerKey};
pub use error::Error;
pub use messages::{Message, Thread};
