//! The chain: its data shapes, the per-link ledger and retry policy, and the
//! orchestrator state machine.

pub mod ledger;
pub mod orchestrator;
pub mod state;
pub mod types;

pub use ledger::{AttemptLedger, Decision, RetryPolicy, TriedAnswer};
pub use orchestrator::{ChainOrchestrator, ChainReport, Collaborators};
pub use state::ChainState;
pub use types::{
    Answer, Artifact, ArtifactKind, ChallengeLink, Cookie, Credentials, PageContext,
    SubmissionOutcome, SubmissionPayload, TaskDescription, cookie_header,
};
