//! The chain orchestrator: drives one chain from its start link to `Done` or
//! `Aborted`, owning the per-link ledger and every retry decision.

use chrono::Utc;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::ledger::{AttemptLedger, Decision, RetryPolicy};
use super::state::ChainState;
use super::types::{
    Answer, ChallengeLink, Credentials, PageContext, SubmissionOutcome, SubmissionPayload,
    TaskDescription,
};
use crate::audit::{AttemptRecord, AttemptVerdict, AuditLogger, TerminalRecord, TransitionRecord};
use crate::errors::ChainError;
use crate::extract::TaskExtractor;
use crate::page::{PageVisitor, ScratchDirs};
use crate::solver::AnswerSolver;
use crate::submit::{RawSubmission, Submitter};

/// The external capabilities a chain runs against.
#[derive(Clone)]
pub struct Collaborators {
    pub visitor: Arc<dyn PageVisitor>,
    pub extractor: Arc<dyn TaskExtractor>,
    pub solver: Arc<dyn AnswerSolver>,
    pub submitter: Arc<dyn Submitter>,
}

/// How a chain ended.
#[derive(Debug, Clone, Serialize)]
pub struct ChainReport {
    pub run_id: Uuid,
    pub state: ChainState,
    pub last_link: String,
    /// Links answered correctly, in order.
    pub links_solved: Vec<String>,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub abort_reason: Option<String>,
    #[serde(skip)]
    pub error: Option<ChainError>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audit_file: Option<PathBuf>,
}

impl ChainReport {
    pub fn is_done(&self) -> bool {
        self.state == ChainState::Done
    }
}

/// Work carried between states for the current link. The page and task are
/// reused across retries; only the answer changes.
struct Work {
    page: PageContext,
    task: TaskDescription,
}

enum Step {
    Fetching,
    Extracting(PageContext),
    Solving(Work),
    Submitting(Work, Answer),
    Deciding(Work, Answer, Result<RawSubmission, String>),
    Done,
    Aborted(ChainError),
}

impl Step {
    fn state(&self) -> ChainState {
        match self {
            Step::Fetching => ChainState::Fetching,
            Step::Extracting(_) => ChainState::Extracting,
            Step::Solving(_) => ChainState::Solving,
            Step::Submitting(..) => ChainState::Submitting,
            Step::Deciding(..) => ChainState::Deciding,
            Step::Done => ChainState::Done,
            Step::Aborted(_) => ChainState::Aborted,
        }
    }
}

/// Mutable state of one chain. Exactly one link is current at any time.
struct Cursor {
    link: ChallengeLink,
    ledger: AttemptLedger,
    parse_failures: u32,
    attempt_started: Instant,
    attempts: u32,
    solved: Vec<String>,
    /// Visit directories of the current link.
    scratch: ScratchDirs,
}

impl Cursor {
    fn new(link: ChallengeLink) -> Self {
        Self {
            link,
            ledger: AttemptLedger::new(),
            parse_failures: 0,
            attempt_started: Instant::now(),
            attempts: 0,
            solved: Vec::new(),
            scratch: ScratchDirs::default(),
        }
    }

    fn move_to(&mut self, link: ChallengeLink) {
        self.scratch.release();
        self.link = link;
        self.ledger.reset();
        self.parse_failures = 0;
    }
}

/// One instance per chain. Holds no state shared with other chains.
pub struct ChainOrchestrator {
    collaborators: Collaborators,
    credentials: Credentials,
    policy: RetryPolicy,
    audit: Option<AuditLogger>,
    run_id: Uuid,
}

impl ChainOrchestrator {
    pub fn new(collaborators: Collaborators, credentials: Credentials, policy: RetryPolicy) -> Self {
        Self {
            collaborators,
            credentials,
            policy,
            audit: None,
            run_id: Uuid::new_v4(),
        }
    }

    pub fn with_audit(mut self, audit: AuditLogger) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn with_run_id(mut self, run_id: Uuid) -> Self {
        self.run_id = run_id;
        self
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Run the chain to a terminal state. Only unrecoverable errors abort; every
    /// other failure is absorbed by the retry policy.
    pub async fn run(mut self, start_url: &str) -> ChainReport {
        info!(run_id = %self.run_id, start_url, "chain started");
        if let Some(audit) = self.audit.as_mut() {
            if let Err(e) = audit.start_run(self.run_id, start_url, &self.credentials.email) {
                warn!("audit unavailable, continuing without it: {:#}", e);
                self.audit = None;
            }
        }

        let mut cursor = Cursor::new(ChallengeLink::start(start_url));
        let mut step = Step::Fetching;

        while !step.state().is_terminal() {
            let from = step.state();
            let link_url = cursor.link.url.clone();
            step = match step {
                Step::Fetching => self.fetch(&mut cursor).await,
                Step::Extracting(page) => self.extract(&cursor, page).await,
                Step::Solving(work) => self.solve(&mut cursor, work).await,
                Step::Submitting(work, answer) => self.submit(&cursor, work, answer).await,
                Step::Deciding(work, answer, reply) => {
                    self.decide(&mut cursor, work, answer, reply)
                }
                terminal @ (Step::Done | Step::Aborted(_)) => terminal,
            };
            self.record_transition(&link_url, from, step.state());
        }

        self.finish(cursor, step)
    }

    async fn fetch(&self, cursor: &mut Cursor) -> Step {
        let page = self.collaborators.visitor.visit(&cursor.link).await;
        cursor.scratch.track(&page);
        if page.is_unretrievable() {
            return Step::Aborted(ChainError::PageUnretrievable {
                url: cursor.link.url.clone(),
                message: page
                    .fetch_error
                    .unwrap_or_else(|| "page had no content".to_string()),
            });
        }
        // The page's own cookies supersede whatever the link was created with.
        if !page.cookies.is_empty() {
            cursor.link = cursor.link.with_cookies(page.cookies.clone());
        }
        Step::Extracting(page)
    }

    async fn extract(&self, cursor: &Cursor, page: PageContext) -> Step {
        match self.collaborators.extractor.extract(&page).await {
            Ok(task) => Step::Solving(Work { page, task }),
            Err(e) => Step::Aborted(ChainError::TaskNotExtractable {
                url: cursor.link.url.clone(),
                message: e.to_string(),
            }),
        }
    }

    async fn solve(&self, cursor: &mut Cursor, work: Work) -> Step {
        cursor.attempt_started = Instant::now();
        let answer = match self
            .collaborators
            .solver
            .solve(&work.task, &work.page, cursor.ledger.tried_answers())
            .await
        {
            Ok(answer) => answer,
            Err(e) => {
                warn!(link = %cursor.link.url, "solver failed, submitting empty answer: {}", e);
                Answer::Text(String::new())
            }
        };
        Step::Submitting(work, answer)
    }

    async fn submit(&self, cursor: &Cursor, work: Work, answer: Answer) -> Step {
        let payload = SubmissionPayload::new(&self.credentials, &cursor.link, &answer);
        let reply = self
            .collaborators
            .submitter
            .submit(
                &work.task.submission_url,
                &payload,
                &cursor.link.cookies,
                &cursor.link.referer,
            )
            .await
            .map_err(|e| e.to_string());
        Step::Deciding(work, answer, reply)
    }

    fn decide(
        &mut self,
        cursor: &mut Cursor,
        work: Work,
        answer: Answer,
        reply: Result<RawSubmission, String>,
    ) -> Step {
        cursor.attempts += 1;
        let parsed = match &reply {
            Ok(raw) => SubmissionOutcome::parse(&raw.body).ok_or_else(|| {
                format!("response is not a verdict: {}", preview(&raw.body))
            }),
            Err(e) => Err(e.clone()),
        };

        let outcome = match parsed {
            Ok(outcome) => outcome,
            Err(detail) => {
                cursor.parse_failures += 1;
                warn!(
                    link = %cursor.link.url,
                    failures = cursor.parse_failures,
                    "submission unparseable: {}",
                    detail
                );
                self.record_attempt(cursor, &work, &answer, AttemptVerdict::Unparsed { detail });
                if self.policy.parse_failures_exhausted(cursor.parse_failures) {
                    return Step::Aborted(ChainError::SubmissionParseExhausted {
                        url: cursor.link.url.clone(),
                        failures: cursor.parse_failures,
                    });
                }
                return Step::Submitting(work, answer);
            }
        };

        cursor.parse_failures = 0;
        let verdict = if outcome.correct {
            AttemptVerdict::Correct
        } else {
            AttemptVerdict::Wrong {
                reason: outcome.reason.clone(),
            }
        };
        self.record_attempt(cursor, &work, &answer, verdict);

        let time_taken = cursor.ledger.time_taken();
        let decision = self.policy.decide(&outcome, &cursor.ledger, time_taken);
        info!(
            link = %cursor.link.url,
            correct = outcome.correct,
            reason = outcome.reason.as_deref().unwrap_or(""),
            retry_count = cursor.ledger.retry_count(),
            time_taken_secs = time_taken.as_secs_f64(),
            decision = ?decision,
            "submission verdict"
        );
        if outcome.correct {
            cursor.solved.push(cursor.link.url.clone());
        }

        match decision {
            Decision::Retry => {
                cursor.ledger.record_retry(answer, outcome.reason);
                Step::Solving(work)
            }
            Decision::Advance(next_url) => {
                let set_cookies = reply.map(|raw| raw.set_cookies).unwrap_or_default();
                let next = ChallengeLink::next(&cursor.link, next_url, set_cookies);
                cursor.move_to(next);
                Step::Fetching
            }
            Decision::Finish => {
                cursor.ledger.reset();
                Step::Done
            }
        }
    }

    fn record_transition(&mut self, link: &str, from: ChainState, to: ChainState) {
        debug_assert!(from.can_transition_to(to), "{from} -> {to}");
        info!(run_id = %self.run_id, link, from = %from, to = %to, "state transition");
        if let Some(audit) = self.audit.as_mut() {
            let record = TransitionRecord {
                at: Utc::now(),
                link: link.to_string(),
                from: from.to_string(),
                to: to.to_string(),
            };
            if let Err(e) = audit.record_transition(record) {
                warn!("failed to record transition: {:#}", e);
            }
        }
    }

    fn record_attempt(&mut self, cursor: &Cursor, work: &Work, answer: &Answer, verdict: AttemptVerdict) {
        let Some(audit) = self.audit.as_mut() else {
            return;
        };
        let record = AttemptRecord {
            at: Utc::now(),
            link: cursor.link.url.clone(),
            submission_url: work.task.submission_url.clone(),
            answer: answer.to_json(),
            retry_count: cursor.ledger.retry_count(),
            duration_secs: cursor.attempt_started.elapsed().as_secs_f64(),
            verdict,
        };
        if let Err(e) = audit.record_attempt(record) {
            warn!("failed to record attempt: {:#}", e);
        }
    }

    fn finish(mut self, mut cursor: Cursor, step: Step) -> ChainReport {
        cursor.scratch.release();
        let (state, error) = match step {
            Step::Aborted(e) => (ChainState::Aborted, Some(e)),
            _ => (ChainState::Done, None),
        };
        let last_link = cursor.link.url.clone();

        match &error {
            Some(e) => error!(run_id = %self.run_id, link = %last_link, "chain aborted: {}", e),
            None => info!(
                run_id = %self.run_id,
                solved = cursor.solved.len(),
                attempts = cursor.attempts,
                "chain done"
            ),
        }

        let audit_file = self.audit.as_mut().and_then(|audit| {
            let terminal = match &error {
                Some(e) => TerminalRecord::Aborted {
                    last_link: last_link.clone(),
                    reason: e.to_string(),
                },
                None => TerminalRecord::Done {
                    last_link: last_link.clone(),
                },
            };
            audit
                .finish_run(terminal)
                .inspect_err(|e| warn!("failed to finish audit record: {:#}", e))
                .ok()
        });

        ChainReport {
            run_id: self.run_id,
            state,
            last_link,
            links_solved: cursor.solved,
            attempts: cursor.attempts,
            abort_reason: error.as_ref().map(|e| e.to_string()),
            error,
            audit_file,
        }
    }
}

fn preview(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.chars().count() > 200 {
        format!("{}...", trimmed.chars().take(200).collect::<String>())
    } else {
        trimmed.to_string()
    }
}
