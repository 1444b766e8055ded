//! Message dispatch: the outbound packing/transmission pipeline, the durable
//! outbox backing it, and the inbound unpack-and-route pipeline.

mod inbound;
mod outbound;
pub mod outbox;

pub use inbound::{InboundContext, InboundHandler, KeyDidMapper, ProtocolService};
pub use outbound::{ConnectionLookup, OutboundDispatcher, QueuedSend};
pub use outbox::{Outbox, OutboxEntry};
