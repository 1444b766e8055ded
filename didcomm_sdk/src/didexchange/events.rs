use tokio::sync::oneshot;

use super::connection::State;

/// Bound for both subscription channels; slow subscribers apply
/// backpressure rather than growing an unbounded queue.
pub const EVENT_CHANNEL_CAPACITY: usize = 16;

/// Post-state informational event, delivered in state-transition order
/// within a thread.
#[derive(Debug, Clone)]
pub struct StateMsg {
    pub connection_id: String,
    pub thread_id: String,
    pub state: State,
    /// Set when the transition was caused by a failure (problem report,
    /// rejected signature, timeout).
    pub error: Option<String>,
}

/// Options supplied when continuing a pending action.
#[derive(Debug, Clone, Default)]
pub struct ContinueOpts {
    /// Use this public DID instead of generating a fresh pairwise DID.
    pub public_did: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionKind {
    InvitationReceived,
    RequestReceived,
    ResponseReceived,
}

#[derive(Debug)]
pub(super) enum ActionDecision {
    Continue(ContinueOpts),
    Stop(String),
}

/// Pre-state event: the service suspends the transition until the consumer
/// calls [`continue_with`](Self::continue_with) or [`stop`](Self::stop), or
/// the grace period elapses.
#[derive(Debug)]
pub struct ActionEvent {
    pub connection_id: String,
    pub thread_id: String,
    pub kind: ActionKind,
    pub(super) responder: oneshot::Sender<ActionDecision>,
}

impl ActionEvent {
    pub fn continue_with(self, opts: ContinueOpts) {
        let _ = self.responder.send(ActionDecision::Continue(opts));
    }

    pub fn stop(self, reason: impl Into<String>) {
        let _ = self.responder.send(ActionDecision::Stop(reason.into()));
    }
}
