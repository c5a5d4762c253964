//! Session workflow states and the transition table.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WorkflowState {
    #[serde(rename = "NEW")]
    New,
    #[serde(rename = "REPLIED")]
    Replied,
    #[serde(rename = "QUOTED")]
    Quoted,
    #[serde(rename = "FOLLOWED")]
    Followed,
    #[serde(rename = "ORDERED")]
    Ordered,
    #[serde(rename = "CLOSED")]
    Closed,
    #[serde(rename = "MANUAL")]
    Manual,
}

impl WorkflowState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "NEW",
            Self::Replied => "REPLIED",
            Self::Quoted => "QUOTED",
            Self::Followed => "FOLLOWED",
            Self::Ordered => "ORDERED",
            Self::Closed => "CLOSED",
            Self::Manual => "MANUAL",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_uppercase().as_str() {
            "NEW" => Some(Self::New),
            "REPLIED" => Some(Self::Replied),
            "QUOTED" => Some(Self::Quoted),
            "FOLLOWED" => Some(Self::Followed),
            "ORDERED" => Some(Self::Ordered),
            "CLOSED" => Some(Self::Closed),
            "MANUAL" => Some(Self::Manual),
            _ => None,
        }
    }
}

impl std::fmt::Display for WorkflowState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

pub struct SessionStateMachine;

impl SessionStateMachine {
    /// Allowed targets per state. `CLOSED` is terminal; `MANUAL` can return
    /// to any working state.
    fn allowed(from: WorkflowState) -> &'static [WorkflowState] {
        use WorkflowState::*;
        match from {
            New => &[Replied, Quoted, Manual, Closed],
            Replied => &[Quoted, Followed, Ordered, Manual, Closed],
            Quoted => &[Followed, Ordered, Manual, Closed],
            Followed => &[Ordered, Manual, Closed],
            Ordered => &[Closed, Manual],
            Closed => &[],
            Manual => &[Replied, Quoted, Followed, Ordered, Closed],
        }
    }

    pub fn can_transition(from: WorkflowState, to: WorkflowState) -> bool {
        from == to || Self::allowed(from).contains(&to)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use WorkflowState::*;

    #[test]
    fn closed_is_terminal() {
        for to in [New, Replied, Quoted, Followed, Ordered, Manual] {
            assert!(!SessionStateMachine::can_transition(Closed, to));
        }
    }

    #[test]
    fn same_state_is_a_noop_transition() {
        assert!(SessionStateMachine::can_transition(Replied, Replied));
    }

    #[test]
    fn new_can_quote_directly() {
        assert!(SessionStateMachine::can_transition(New, Quoted));
        assert!(!SessionStateMachine::can_transition(New, Followed));
        assert!(!SessionStateMachine::can_transition(New, Ordered));
    }

    #[test]
    fn manual_returns_to_working_states() {
        assert!(SessionStateMachine::can_transition(Manual, Ordered));
        assert!(!SessionStateMachine::can_transition(Manual, New));
    }

    #[test]
    fn ordered_only_closes_or_escalates() {
        assert!(SessionStateMachine::can_transition(Ordered, Closed));
        assert!(SessionStateMachine::can_transition(Ordered, Manual));
        assert!(!SessionStateMachine::can_transition(Ordered, Quoted));
    }

    #[test]
    fn state_roundtrips_through_strings() {
        for state in [New, Replied, Quoted, Followed, Ordered, Closed, Manual] {
            assert_eq!(WorkflowState::parse(state.as_str()), Some(state));
        }
        assert_eq!(WorkflowState::parse("bogus"), None);
    }
}
