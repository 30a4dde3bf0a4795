//! Per-link attempt bookkeeping and the time-boxed retry policy.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;

use super::types::{Answer, SubmissionOutcome};

/// A wrong answer and the reason the server gave for rejecting it.
#[derive(Debug, Clone, PartialEq)]
pub struct TriedAnswer {
    pub answer: Answer,
    pub reason: Option<String>,
}

/// Mutable state for the current link. Owned by one orchestrator, reset on
/// every advance, never shared between links or chains.
#[derive(Debug, Clone)]
pub struct AttemptLedger {
    retry_count: u32,
    tried_answers: Vec<TriedAnswer>,
    elapsed_start: Instant,
}

impl Default for AttemptLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl AttemptLedger {
    pub fn new() -> Self {
        Self {
            retry_count: 0,
            tried_answers: Vec::new(),
            elapsed_start: Instant::now(),
        }
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn tried_answers(&self) -> &[TriedAnswer] {
        &self.tried_answers
    }

    pub fn time_taken(&self) -> Duration {
        self.elapsed_start.elapsed()
    }

    /// Record a rejected answer and count the retry it triggers.
    pub fn record_retry(&mut self, answer: Answer, reason: Option<String>) {
        self.retry_count += 1;
        self.tried_answers.push(TriedAnswer { answer, reason });
    }

    /// Clear counters and restart the elapsed timer.
    pub fn reset(&mut self) {
        *self = Self::new();
    }
}

/// Bounds for retrying a wrong answer on the same link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_wrong_retries: u32,
    pub retry_window: Duration,
    pub projected_limit: Duration,
    pub max_parse_failures: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_wrong_retries: 3,
            retry_window: Duration::from_secs(150),
            projected_limit: Duration::from_secs(180),
            max_parse_failures: 5,
        }
    }
}

/// What the orchestrator does after a parsed verdict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Solve the same link again with the wrong answer fed back.
    Retry,
    /// Move to the given link with a fresh ledger.
    Advance(String),
    /// Nothing left to do.
    Finish,
}

impl RetryPolicy {
    /// Decide the next step from a verdict, the link's ledger and the time
    /// spent on the link so far.
    pub fn decide(
        &self,
        outcome: &SubmissionOutcome,
        ledger: &AttemptLedger,
        time_taken: Duration,
    ) -> Decision {
        if outcome.correct {
            return match &outcome.next_url {
                Some(url) => Decision::Advance(url.clone()),
                None => Decision::Finish,
            };
        }

        let within_time = self.within_time_budget(ledger.retry_count(), time_taken);
        let retry = match &outcome.next_url {
            // Nothing to advance to: the retry cap does not apply, time still does.
            None => within_time,
            Some(_) => within_time && ledger.retry_count() < self.max_wrong_retries,
        };

        if retry {
            Decision::Retry
        } else {
            match &outcome.next_url {
                Some(url) => Decision::Advance(url.clone()),
                None => Decision::Finish,
            }
        }
    }

    /// `time_taken < window` and `time_taken + time_taken / (retries + 1) < limit`.
    pub fn within_time_budget(&self, retry_count: u32, time_taken: Duration) -> bool {
        let avg_time = time_taken / (retry_count + 1);
        let projected_retry_time = time_taken + avg_time;
        time_taken < self.retry_window && projected_retry_time < self.projected_limit
    }

    /// True once consecutive unparseable submissions exceed the bound.
    pub fn parse_failures_exhausted(&self, consecutive_failures: u32) -> bool {
        consecutive_failures > self.max_parse_failures
    }
}
