pub mod logger;

pub use logger::AuditLogger;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The persisted record of one chain execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainRun {
    pub run_id: Uuid,
    pub start_url: String,
    pub email: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub transitions: Vec<TransitionRecord>,
    pub attempts: Vec<AttemptRecord>,
    pub terminal: Option<TerminalRecord>,
}

impl ChainRun {
    pub fn new(run_id: Uuid, start_url: &str, email: &str) -> Self {
        Self {
            run_id,
            start_url: start_url.to_string(),
            email: email.to_string(),
            started_at: Utc::now(),
            ended_at: None,
            transitions: Vec::new(),
            attempts: Vec::new(),
            terminal: None,
        }
    }

    pub fn finish(&mut self, terminal: TerminalRecord) {
        self.ended_at = Some(Utc::now());
        self.terminal = Some(terminal);
    }

    /// Distinct links in the order they were first visited.
    pub fn links_visited(&self) -> Vec<&str> {
        let mut links: Vec<&str> = Vec::new();
        for t in &self.transitions {
            if !links.contains(&t.link.as_str()) {
                links.push(&t.link);
            }
        }
        links
    }
}

/// One edge of the orchestrator state machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub at: DateTime<Utc>,
    pub link: String,
    pub from: String,
    pub to: String,
}

/// How a submission attempt ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum AttemptVerdict {
    Correct,
    Wrong { reason: Option<String> },
    /// Transport error or a body that was not a verdict.
    Unparsed { detail: String },
}

/// One solve+submit cycle against a link.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub at: DateTime<Utc>,
    pub link: String,
    pub submission_url: String,
    pub answer: serde_json::Value,
    pub retry_count: u32,
    pub duration_secs: f64,
    pub verdict: AttemptVerdict,
}

/// The state the chain stopped in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum TerminalRecord {
    Done { last_link: String },
    Aborted { last_link: String, reason: String },
}
