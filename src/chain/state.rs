use serde::{Deserialize, Serialize};
use std::fmt;

/// States of the orchestrator. Each non-terminal state has exactly one handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChainState {
    Fetching,
    Extracting,
    Solving,
    Submitting,
    Deciding,
    Done,
    Aborted,
}

impl ChainState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChainState::Fetching => "fetching",
            ChainState::Extracting => "extracting",
            ChainState::Solving => "solving",
            ChainState::Submitting => "submitting",
            ChainState::Deciding => "deciding",
            ChainState::Done => "done",
            ChainState::Aborted => "aborted",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ChainState::Done | ChainState::Aborted)
    }

    /// Whether the state machine may move from `self` to `next`.
    pub fn can_transition_to(&self, next: ChainState) -> bool {
        use ChainState::*;
        matches!(
            (self, next),
            (Fetching, Extracting)
                | (Fetching, Aborted)
                | (Extracting, Solving)
                | (Extracting, Aborted)
                | (Solving, Submitting)
                | (Submitting, Deciding)
                | (Deciding, Solving)
                | (Deciding, Submitting)
                | (Deciding, Fetching)
                | (Deciding, Done)
                | (Deciding, Aborted)
        )
    }
}

impl fmt::Display for ChainState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
