//! Stream lifecycle state machine.

use serde::{Deserialize, Serialize};

use crate::Error;

/// Stream lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StreamState {
    /// Ingestion is starting and the source identifier is not yet known.
    Initializing,
    /// A producer is registered; waiting for the first confirmed throughput.
    Ready,
    /// Media is flowing and viewers may attach.
    Live,
    /// A fault was observed; recovery may bring the stream back to `Ready`.
    Error,
    /// All resources have been released.
    Stopped,
    /// Final state after cleanup.
    Closed,
}

impl StreamState {
    pub const ALL: [StreamState; 6] = [
        Self::Initializing,
        Self::Ready,
        Self::Live,
        Self::Error,
        Self::Stopped,
        Self::Closed,
    ];

    /// Convert to database string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initializing => "INITIALIZING",
            Self::Ready => "READY",
            Self::Live => "LIVE",
            Self::Error => "ERROR",
            Self::Stopped => "STOPPED",
            Self::Closed => "CLOSED",
        }
    }

    /// Parse from database string representation.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "INITIALIZING" => Some(Self::Initializing),
            "READY" => Some(Self::Ready),
            "LIVE" => Some(Self::Live),
            "ERROR" => Some(Self::Error),
            "STOPPED" => Some(Self::Stopped),
            "CLOSED" => Some(Self::Closed),
            _ => None,
        }
    }

    /// `Stopped` and `Closed` are terminal; nothing restarts from them.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped | Self::Closed)
    }

    /// Validate a state transition.
    pub fn can_transition_to(&self, target: StreamState) -> bool {
        use StreamState::*;

        matches!(
            (self, target),
            (Initializing, Ready | Error | Stopped)
                | (Ready, Live | Error | Stopped)
                | (Live, Error | Stopped)
                | (Error, Ready | Stopped)
                | (Stopped, Closed)
        )
    }

    /// Attempt to transition to a new state.
    pub fn transition_to(&self, target: StreamState) -> Result<StreamState, Error> {
        if self.can_transition_to(target) {
            Ok(target)
        } else {
            Err(Error::InvalidStateTransition {
                from: self.as_str().to_string(),
                to: target.as_str().to_string(),
            })
        }
    }
}

impl std::fmt::Display for StreamState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_state_round_trips_through_str() {
        for state in StreamState::ALL {
            assert_eq!(StreamState::parse(state.as_str()), Some(state));
        }
        assert_eq!(StreamState::parse("live"), None);
    }

    #[rstest]
    #[case(StreamState::Initializing, StreamState::Ready, true)]
    #[case(StreamState::Initializing, StreamState::Error, true)]
    #[case(StreamState::Initializing, StreamState::Stopped, true)]
    #[case(StreamState::Initializing, StreamState::Live, false)]
    #[case(StreamState::Ready, StreamState::Live, true)]
    #[case(StreamState::Ready, StreamState::Initializing, false)]
    #[case(StreamState::Live, StreamState::Error, true)]
    #[case(StreamState::Live, StreamState::Ready, false)]
    #[case(StreamState::Live, StreamState::Closed, false)]
    #[case(StreamState::Error, StreamState::Ready, true)]
    #[case(StreamState::Error, StreamState::Live, false)]
    #[case(StreamState::Error, StreamState::Error, false)]
    #[case(StreamState::Stopped, StreamState::Closed, true)]
    #[case(StreamState::Stopped, StreamState::Ready, false)]
    #[case(StreamState::Closed, StreamState::Stopped, false)]
    fn test_transition_table(
        #[case] from: StreamState,
        #[case] to: StreamState,
        #[case] allowed: bool,
    ) {
        assert_eq!(from.can_transition_to(to), allowed);
        assert_eq!(from.transition_to(to).is_ok(), allowed);
    }

    #[test]
    fn test_terminal_states() {
        assert!(StreamState::Stopped.is_terminal());
        assert!(StreamState::Closed.is_terminal());
        assert!(!StreamState::Error.is_terminal());
        assert!(!StreamState::Live.is_terminal());
    }

    #[test]
    fn test_invalid_transition_error() {
        let err = StreamState::Closed
            .transition_to(StreamState::Live)
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Invalid state transition: cannot transition from CLOSED to LIVE"
        );
    }

    #[test]
    fn test_serde_uses_screaming_snake_case() {
        let json = serde_json::to_string(&StreamState::Initializing).unwrap();
        assert_eq!(json, "\"INITIALIZING\"");
    }
}
