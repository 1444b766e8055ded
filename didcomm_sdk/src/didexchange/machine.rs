use super::connection::State;

/// The two asymmetric roles of the exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Inviter,
    Invitee,
}

/// Events that drive connection state transitions: local API calls and
/// inbound protocol messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    CreateInvitation,
    ReceiveInvitation,
    AcceptInvitation,
    ReceiveRequest,
    AcceptRequest,
    ReceiveResponse,
    AcceptResponse,
    ReceiveComplete,
    ReceiveProblemReport,
    Timeout,
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum StateError {
    #[error("invalid transition from {from} with {trigger:?} as {role:?}")]
    InvalidTransition {
        role: Role,
        from: State,
        trigger: Trigger,
    },
    #[error("message replays an already-applied step in state {0}")]
    Stale(State),
    #[error("message arrived ahead of state {0}")]
    Premature(State),
}

/// Compute the successor state, or classify the trigger as stale (duplicate
/// or late delivery, an idempotent no-op for the caller) or premature
/// (out-of-order delivery within the thread, parked by the caller).
pub fn transition(role: Role, current: State, trigger: Trigger) -> Result<State, StateError> {
    use State::*;
    use Trigger::*;

    match (role, current, trigger) {
        // failure paths shared by both roles
        (_, from, ReceiveProblemReport | Timeout) if !from.is_terminal() => Ok(Abandoned),
        (_, Abandoned, _) => Err(StateError::Stale(Abandoned)),

        // inviter
        (Role::Inviter, Null, CreateInvitation) => Ok(Invited),
        (Role::Inviter, Invited, ReceiveRequest) => Ok(Requested),
        (Role::Inviter, Requested, AcceptRequest) => Ok(Responded),
        (Role::Inviter, Responded, ReceiveComplete) => Ok(Completed),
        // duplicate request after the handshake moved on
        (Role::Inviter, Requested | Responded | Completed, ReceiveRequest) => {
            Err(StateError::Stale(current))
        }
        (Role::Inviter, Completed, ReceiveComplete) => Err(StateError::Stale(Completed)),
        // complete outran the locally produced response
        (Role::Inviter, Invited | Requested, ReceiveComplete) => {
            Err(StateError::Premature(current))
        }

        // invitee
        (Role::Invitee, Null, ReceiveInvitation) => Ok(Invited),
        (Role::Invitee, Invited, AcceptInvitation) => Ok(Requested),
        (Role::Invitee, Requested, ReceiveResponse) => Ok(Responded),
        (Role::Invitee, Responded, AcceptResponse) => Ok(Completed),
        (Role::Invitee, Responded | Completed, ReceiveResponse) => Err(StateError::Stale(current)),
        // response outran the locally produced request
        (Role::Invitee, Invited, ReceiveResponse) => Err(StateError::Premature(Invited)),

        (_, from, trigger) => Err(StateError::InvalidTransition {
            role,
            from,
            trigger,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inviter_happy_path() {
        let mut state = State::Null;

        for trigger in [
            Trigger::CreateInvitation,
            Trigger::ReceiveRequest,
            Trigger::AcceptRequest,
            Trigger::ReceiveComplete,
        ] {
            state = transition(Role::Inviter, state, trigger).unwrap();
        }

        assert_eq!(state, State::Completed);
    }

    #[test]
    fn invitee_happy_path() {
        let mut state = State::Null;

        for trigger in [
            Trigger::ReceiveInvitation,
            Trigger::AcceptInvitation,
            Trigger::ReceiveResponse,
            Trigger::AcceptResponse,
        ] {
            state = transition(Role::Invitee, state, trigger).unwrap();
        }

        assert_eq!(state, State::Completed);
    }

    #[test]
    fn duplicate_request_is_stale() {
        assert_eq!(
            transition(Role::Inviter, State::Requested, Trigger::ReceiveRequest),
            Err(StateError::Stale(State::Requested))
        );
        assert_eq!(
            transition(Role::Inviter, State::Completed, Trigger::ReceiveRequest),
            Err(StateError::Stale(State::Completed))
        );
    }

    #[test]
    fn early_response_is_premature() {
        assert_eq!(
            transition(Role::Invitee, State::Invited, Trigger::ReceiveResponse),
            Err(StateError::Premature(State::Invited))
        );
        assert_eq!(
            transition(Role::Inviter, State::Requested, Trigger::ReceiveComplete),
            Err(StateError::Premature(State::Requested))
        );
    }

    #[test]
    fn problem_report_abandons_any_live_state() {
        for state in [
            State::Invited,
            State::Requested,
            State::Responded,
        ] {
            assert_eq!(
                transition(Role::Invitee, state, Trigger::ReceiveProblemReport),
                Ok(State::Abandoned)
            );
            assert_eq!(transition(Role::Inviter, state, Trigger::Timeout), Ok(State::Abandoned));
        }
    }

    #[test]
    fn terminal_states_reject_everything() {
        assert_eq!(
            transition(Role::Invitee, State::Abandoned, Trigger::ReceiveResponse),
            Err(StateError::Stale(State::Abandoned))
        );
        assert!(matches!(
            transition(Role::Inviter, State::Completed, Trigger::AcceptRequest),
            Err(StateError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn roles_do_not_cross() {
        assert!(matches!(
            transition(Role::Invitee, State::Invited, Trigger::ReceiveRequest),
            Err(StateError::InvalidTransition { .. })
        ));
        assert!(matches!(
            transition(Role::Inviter, State::Invited, Trigger::AcceptInvitation),
            Err(StateError::InvalidTransition { .. })
        ));
    }
}
