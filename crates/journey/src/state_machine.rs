use serde::{Deserialize, Serialize};

use journey_core::error::{JourneyError, JourneyResult};
use journey_core::types::SessionStatus;

/// A single permitted session status change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateTransition {
    pub from: SessionStatus,
    pub to: SessionStatus,
    pub trigger: String,
}

/// Guards session lifecycle by enforcing a finite set of valid status
/// transitions. Staying in the same non-terminal status is always allowed.
#[derive(Debug, Clone)]
pub struct SessionStateMachine {
    transitions: Vec<StateTransition>,
}

impl SessionStateMachine {
    pub fn new() -> Self {
        use SessionStatus::*;

        let table = [
            // Active ->
            (Active, WaitingDelay, "delay_scheduled"),
            (Active, AwaitingReply, "wait_for_reply"),
            (Active, Completed, "journey_complete"),
            (Active, Cancelled, "re_entry_restart"),
            (Active, Broken, "step_vanished"),
            // WaitingDelay ->
            (WaitingDelay, Active, "delay_elapsed"),
            (WaitingDelay, Completed, "journey_complete"),
            (WaitingDelay, Cancelled, "re_entry_restart"),
            (WaitingDelay, Broken, "step_vanished"),
            // AwaitingReply ->
            (AwaitingReply, Active, "reply_or_timeout"),
            (AwaitingReply, Completed, "timeout_end"),
            (AwaitingReply, Cancelled, "re_entry_restart"),
            (AwaitingReply, Broken, "step_vanished"),
        ];

        let transitions = table
            .into_iter()
            .map(|(from, to, trigger)| StateTransition {
                from,
                to,
                trigger: trigger.to_string(),
            })
            .collect();

        Self { transitions }
    }

    pub fn can_transition(&self, from: SessionStatus, to: SessionStatus) -> bool {
        (from == to && !from.is_terminal())
            || self.transitions.iter().any(|t| t.from == from && t.to == to)
    }

    /// Returns an error if `from -> to` is not permitted.
    pub fn check(&self, from: SessionStatus, to: SessionStatus) -> JourneyResult<()> {
        if self.can_transition(from, to) {
            Ok(())
        } else {
            Err(JourneyError::InvalidTransition { from, to })
        }
    }
}

impl Default for SessionStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_transitions() {
        let sm = SessionStateMachine::new();
        assert!(sm.can_transition(SessionStatus::Active, SessionStatus::WaitingDelay));
        assert!(sm.can_transition(SessionStatus::WaitingDelay, SessionStatus::Active));
        assert!(sm.can_transition(SessionStatus::AwaitingReply, SessionStatus::Completed));
        assert!(sm.can_transition(SessionStatus::Active, SessionStatus::Active));
    }

    #[test]
    fn test_terminal_states_are_final() {
        let sm = SessionStateMachine::new();
        for terminal in [
            SessionStatus::Completed,
            SessionStatus::Cancelled,
            SessionStatus::Broken,
        ] {
            for to in SessionStatus::OPEN {
                assert!(!sm.can_transition(terminal, to));
            }
            assert!(!sm.can_transition(terminal, terminal));
        }
        let err = sm
            .check(SessionStatus::Completed, SessionStatus::Active)
            .unwrap_err();
        assert!(matches!(err, JourneyError::InvalidTransition { .. }));
    }

    #[test]
    fn test_waiting_delay_cannot_skip_to_awaiting_reply() {
        let sm = SessionStateMachine::new();
        assert!(!sm.can_transition(SessionStatus::WaitingDelay, SessionStatus::AwaitingReply));
    }
}
