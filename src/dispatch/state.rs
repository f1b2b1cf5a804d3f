//! Work item state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state of a work item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageState {
    /// Waiting for an eligible worker.
    Pending,
    /// Claimed by a worker, no output yet.
    Assigned,
    /// Worker has started producing output.
    InProgress,
    /// Final content delivered.
    Complete,
    /// Worker reported a generation failure.
    Error,
    /// Cancelled, or timed out with no retries left.
    Aborted,
}

impl MessageState {
    /// Check if this state allows transitioning to another state.
    pub fn can_transition_to(&self, target: MessageState) -> bool {
        use MessageState::*;

        matches!(
            (self, target),
            // From Pending
            (Pending, Assigned) | (Pending, Aborted) |
            // From Assigned
            (Assigned, InProgress) | (Assigned, Error) |
            (Assigned, Pending) | (Assigned, Aborted) |
            // From InProgress
            (InProgress, Complete) | (InProgress, Error) |
            (InProgress, Pending) | (InProgress, Aborted)
        )
    }

    /// Check if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Error | Self::Aborted)
    }

    /// States in which the item holds a worker.
    pub fn holds_worker(&self) -> bool {
        matches!(self, Self::Assigned | Self::InProgress)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Assigned => "assigned",
            Self::InProgress => "in_progress",
            Self::Complete => "complete",
            Self::Error => "error",
            Self::Aborted => "aborted",
        }
    }
}

impl std::fmt::Display for MessageState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for MessageState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "assigned" => Ok(Self::Assigned),
            "in_progress" => Ok(Self::InProgress),
            "complete" => Ok(Self::Complete),
            "error" => Ok(Self::Error),
            "aborted" => Ok(Self::Aborted),
            other => Err(format!("unknown message state: {other}")),
        }
    }
}

/// A state transition event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateTransition {
    pub from: MessageState,
    pub to: MessageState,
    pub timestamp: DateTime<Utc>,
    pub reason: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_transitions_valid() {
        assert!(MessageState::Pending.can_transition_to(MessageState::Assigned));
        assert!(MessageState::Assigned.can_transition_to(MessageState::InProgress));
        assert!(MessageState::InProgress.can_transition_to(MessageState::Complete));
        assert!(MessageState::InProgress.can_transition_to(MessageState::Error));
        assert!(MessageState::Assigned.can_transition_to(MessageState::Pending));
        assert!(MessageState::InProgress.can_transition_to(MessageState::Aborted));
    }

    #[test]
    fn state_transitions_invalid() {
        assert!(!MessageState::Pending.can_transition_to(MessageState::InProgress));
        assert!(!MessageState::Pending.can_transition_to(MessageState::Complete));
        assert!(!MessageState::Assigned.can_transition_to(MessageState::Complete));
        assert!(!MessageState::Complete.can_transition_to(MessageState::Error));
        assert!(!MessageState::Error.can_transition_to(MessageState::Pending));
        assert!(!MessageState::Aborted.can_transition_to(MessageState::Pending));
    }

    #[test]
    fn terminal_states() {
        assert!(MessageState::Complete.is_terminal());
        assert!(MessageState::Error.is_terminal());
        assert!(MessageState::Aborted.is_terminal());
        assert!(!MessageState::Pending.is_terminal());
        assert!(!MessageState::InProgress.is_terminal());
    }

    #[test]
    fn terminal_states_have_no_exits() {
        use MessageState::*;
        let all = [Pending, Assigned, InProgress, Complete, Error, Aborted];
        for from in all.iter().filter(|s| s.is_terminal()) {
            for to in all {
                assert!(!from.can_transition_to(to), "{from} -> {to}");
            }
        }
    }

    #[test]
    fn state_display_and_parse() {
        assert_eq!(MessageState::InProgress.to_string(), "in_progress");
        assert_eq!("aborted".parse::<MessageState>().unwrap(), MessageState::Aborted);
        assert!("manual".parse::<MessageState>().is_err());
    }

    #[test]
    fn state_serde_roundtrip() {
        let json = serde_json::to_string(&MessageState::InProgress).unwrap();
        assert_eq!(json, "\"in_progress\"");
        let parsed: MessageState = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, MessageState::InProgress);
    }
}
