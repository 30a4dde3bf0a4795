//! Turning a page context into a task description.

use async_trait::async_trait;
use regex::Regex;
use serde_json::Value;
use std::sync::{Arc, LazyLock};
use tracing::{debug, info};

use crate::chain::{PageContext, TaskDescription};
use crate::errors::ExtractError;
use crate::llm::{ChatMessage, CompletionRequest, LlmClient};

/// Appended to every question so the solver only computes.
pub const COMPUTE_ONLY_DIRECTIVE: &str =
    "Compute the answer only and return the bare value. Do not submit or POST it anywhere; submission is handled separately.";

/// A sentence that opens with a submission verb.
static SUBMISSION_IMPERATIVE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(?:then\s+|and\s+|finally,?\s+|please\s+)?(?:post|submit|send)\b").unwrap()
});

/// Where to send something: a URL, an absolute path or an endpoint.
static SUBMISSION_TARGET: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)https?://|(?:^|\s)/[\w\-./]+|\bendpoint\b").unwrap()
});

#[async_trait]
pub trait TaskExtractor: Send + Sync {
    async fn extract(&self, page: &PageContext) -> Result<TaskDescription, ExtractError>;
}

/// Asks the chat model to pull `{submission_url, json_format, question}` out of
/// the rendered page.
pub struct LlmTaskExtractor {
    llm: Arc<dyn LlmClient>,
}

impl LlmTaskExtractor {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }

    fn prompt(page: &PageContext) -> String {
        format!(
            r#"Extract the submission details from the quiz page below.

Base URL: {base}

{context}

Return a JSON object with exactly these keys:
- "submission_url": the URL answers are posted to, as written on the page
- "json_format": a sample of the JSON payload the page asks for (keys and value types)
- "question": the question to answer, rephrased so that it asks only for the computed
  value and never asks to submit or POST anything

Return only the JSON object."#,
            base = page.url,
            context = page.render()
        )
    }
}

#[async_trait]
impl TaskExtractor for LlmTaskExtractor {
    async fn extract(&self, page: &PageContext) -> Result<TaskDescription, ExtractError> {
        let reply = self
            .llm
            .complete(CompletionRequest {
                messages: vec![
                    ChatMessage::system(
                        "You extract structured task descriptions from quiz pages. You never solve them.",
                    ),
                    ChatMessage::user(Self::prompt(page)),
                ],
                json_mode: true,
                ..Default::default()
            })
            .await?;
        debug!(reply = reply.text(), "extractor reply");

        let task = parse_task(reply.text(), &page.url)?;
        info!(submission_url = %task.submission_url, "task extracted");
        Ok(task)
    }
}

/// Parse the extractor's JSON reply and normalise it into a task description.
pub fn parse_task(raw: &str, page_url: &str) -> Result<TaskDescription, ExtractError> {
    let cleaned = raw.replace("```json", "").replace("```", "");
    let value: Value = serde_json::from_str(cleaned.trim())
        .map_err(|e| ExtractError::InvalidJson(e.to_string()))?;
    let object = value
        .as_object()
        .ok_or_else(|| ExtractError::InvalidJson("expected a JSON object".to_string()))?;

    let submission_url = object
        .get("submission_url")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or(ExtractError::MissingField("submission_url"))?;
    let question = object
        .get("question")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or(ExtractError::MissingField("question"))?;
    let payload_shape = object
        .get("json_format")
        .cloned()
        .unwrap_or_else(|| Value::Object(Default::default()));

    Ok(TaskDescription {
        submission_url: resolve_submission_url(submission_url, page_url)?,
        payload_shape,
        question: neutralize_submission_instructions(question),
    })
}

/// Absolute URL for `url`, using the page URL as base.
pub fn resolve_submission_url(url: &str, page_url: &str) -> Result<String, ExtractError> {
    let unresolvable = || ExtractError::UnresolvableUrl {
        url: url.to_string(),
        base: page_url.to_string(),
    };
    if let Ok(absolute) = reqwest::Url::parse(url) {
        return Ok(absolute.to_string());
    }
    let base = reqwest::Url::parse(page_url).map_err(|_| unresolvable())?;
    base.join(url)
        .map(|u| u.to_string())
        .map_err(|_| unresolvable())
}

/// Drop sentences instructing the reader to submit to some location, then
/// append the compute-only directive. Sentences that merely use "post" or
/// describe the answer format are kept.
pub fn neutralize_submission_instructions(question: &str) -> String {
    let kept: Vec<&str> = sentences(question)
        .into_iter()
        .filter(|s| !is_submission_instruction(s))
        .collect();
    let mut out = kept.join(" ");
    if !out.is_empty() {
        out.push(' ');
    }
    out.push_str(COMPUTE_ONLY_DIRECTIVE);
    out
}

fn is_submission_instruction(sentence: &str) -> bool {
    SUBMISSION_IMPERATIVE.is_match(sentence) && SUBMISSION_TARGET.is_match(sentence)
}

/// Sentences end at a newline or at `.`, `!`, `?` followed by whitespace, so
/// URLs and decimals stay intact.
fn sentences(text: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut start = 0;
    let mut chars = text.char_indices().peekable();
    while let Some((i, c)) = chars.next() {
        let next_is_space = chars.peek().is_none_or(|(_, n)| n.is_whitespace());
        let end = match c {
            '\n' => Some(i),
            '.' | '!' | '?' if next_is_space => Some(i + c.len_utf8()),
            _ => None,
        };
        if let Some(end) = end {
            out.push(text[start..end].trim());
            start = end;
        }
    }
    out.push(text[start..].trim());
    out.retain(|s| !s.is_empty());
    out
}
