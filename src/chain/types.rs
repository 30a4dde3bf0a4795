//! Data shapes exchanged between the orchestrator and its collaborators.

use base64::Engine;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// A single `name=value` cookie pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cookie {
    pub name: String,
    pub value: String,
}

impl Cookie {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }

    /// Parse the leading `name=value` pair of a `Set-Cookie` header.
    pub fn from_set_cookie(header: &str) -> Option<Self> {
        let pair = header.split(';').next()?.trim();
        let (name, value) = pair.split_once('=')?;
        let name = name.trim();
        if name.is_empty() {
            return None;
        }
        Some(Self::new(name, value.trim()))
    }
}

/// Render cookies as a `Cookie` request header value.
pub fn cookie_header(cookies: &[Cookie]) -> Option<String> {
    if cookies.is_empty() {
        return None;
    }
    Some(
        cookies
            .iter()
            .map(|c| format!("{}={}", c.name, c.value))
            .collect::<Vec<_>>()
            .join("; "),
    )
}

/// One node of the chain. Immutable once constructed; the orchestrator replaces
/// it wholesale when advancing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChallengeLink {
    pub url: String,
    pub cookies: Vec<Cookie>,
    pub referer: String,
}

impl ChallengeLink {
    /// The first link of a chain: no cookies, and the link is its own referer.
    pub fn start(url: impl Into<String>) -> Self {
        let url = url.into();
        Self {
            referer: url.clone(),
            url,
            cookies: Vec::new(),
        }
    }

    /// The link reached from `previous`, carrying only the cookies the server
    /// handed out with the submission response.
    pub fn next(previous: &ChallengeLink, url: impl Into<String>, cookies: Vec<Cookie>) -> Self {
        Self {
            url: url.into(),
            cookies,
            referer: previous.url.clone(),
        }
    }

    /// Same link, with cookies replaced by the ones the page itself supplied.
    pub fn with_cookies(&self, cookies: Vec<Cookie>) -> Self {
        Self {
            url: self.url.clone(),
            cookies,
            referer: self.referer.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactKind {
    Media,
    File,
}

/// A file downloaded while building a page context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub kind: ArtifactKind,
    pub local_path: PathBuf,
    pub source_url: String,
}

/// Everything learned from one visit to a link. Owned by a single loop iteration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PageContext {
    /// URL the context was built from; the base for resolving relative links.
    pub url: String,
    pub text: String,
    pub downloaded_artifacts: Vec<Artifact>,
    pub transcripts: Vec<String>,
    pub cookies: Vec<Cookie>,
    pub raw_source_path: Option<PathBuf>,
    /// Set when nothing could be retrieved; `text` then carries `Error: ...`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fetch_error: Option<String>,
    /// Scratch directory holding the saved source and downloads of this visit.
    #[serde(skip)]
    pub visit_dir: Option<PathBuf>,
}

impl PageContext {
    pub fn unretrievable(url: impl Into<String>, error: impl Into<String>) -> Self {
        let error = error.into();
        Self {
            url: url.into(),
            text: format!("Error: {}", error),
            fetch_error: Some(error),
            ..Self::default()
        }
    }

    /// True when the visit produced nothing the extractor could work from.
    pub fn is_unretrievable(&self) -> bool {
        self.fetch_error.is_some()
            || (self.text.trim().is_empty()
                && self.downloaded_artifacts.is_empty()
                && self.transcripts.is_empty())
    }

    /// The prompt-ready rendering shared by the extractor and the solver.
    pub fn render(&self) -> String {
        let files = serde_json::to_string_pretty(&self.downloaded_artifacts)
            .unwrap_or_else(|_| "[]".to_string());
        format!(
            "--- PAGE URL ---\n{}\n\n--- PAGE CONTENT ---\n{}\n\n--- DOWNLOADED FILES ---\n{}\n\n--- AUDIO TRANSCRIPTIONS ---\n{}\n",
            self.url,
            self.text,
            files,
            self.transcripts.join("\n")
        )
    }
}

/// What the page asks for, and where the answer goes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDescription {
    pub submission_url: String,
    /// Sample of the expected payload, kept free-form.
    pub payload_shape: serde_json::Value,
    /// The question, phrased so that it never asks for the submission itself.
    pub question: String,
}

/// The value submitted for one attempt.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Answer {
    Number(serde_json::Number),
    Bool(bool),
    /// `data:<mime>;base64,<payload>` reference, submitted as a string.
    Blob(String),
    Text(String),
    Structured(serde_json::Value),
}

impl Answer {
    /// Interpret free-form model output. Never fails: anything that is not a
    /// well-formed JSON value becomes literal text.
    pub fn from_model_output(raw: &str) -> Self {
        let trimmed = strip_code_fence(raw.trim());
        match serde_json::from_str::<serde_json::Value>(trimmed) {
            Ok(value) => Self::from_json(value),
            Err(_) => Self::from_text(trimmed),
        }
    }

    pub fn from_json(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Number(n) => Answer::Number(n),
            serde_json::Value::Bool(b) => Answer::Bool(b),
            serde_json::Value::String(s) => Self::from_text(&s),
            serde_json::Value::Null => Answer::Text("null".to_string()),
            other => Answer::Structured(other),
        }
    }

    fn from_text(text: &str) -> Self {
        if is_base64_data_uri(text) {
            Answer::Blob(text.to_string())
        } else {
            Answer::Text(text.to_string())
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Answer::Number(n) => serde_json::Value::Number(n.clone()),
            Answer::Bool(b) => serde_json::Value::Bool(*b),
            Answer::Blob(s) | Answer::Text(s) => serde_json::Value::String(s.clone()),
            Answer::Structured(v) => v.clone(),
        }
    }
}

impl std::fmt::Display for Answer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Answer::Text(s) => write!(f, "{}", s),
            Answer::Blob(s) if s.len() > 64 => {
                let head: String = s.chars().take(64).collect();
                write!(f, "{}... ({} chars)", head, s.len())
            }
            other => write!(f, "{}", other.to_json()),
        }
    }
}

fn strip_code_fence(text: &str) -> &str {
    let Some(rest) = text.strip_prefix("```") else {
        return text;
    };
    let rest = rest.strip_suffix("```").unwrap_or(rest);
    // Drop an info string such as `json` on the opening fence line.
    match rest.split_once('\n') {
        Some((info, body)) if !info.trim().contains(' ') => body.trim(),
        _ => rest.trim(),
    }
}

fn is_base64_data_uri(text: &str) -> bool {
    let Some(rest) = text.strip_prefix("data:") else {
        return false;
    };
    let Some((_, payload)) = rest.split_once(";base64,") else {
        return false;
    };
    base64::engine::general_purpose::STANDARD
        .decode(payload.trim())
        .is_ok()
}

/// The email/secret pair echoed in every submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub email: String,
    pub secret: String,
}

/// Body posted to the quiz server.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubmissionPayload {
    pub email: String,
    pub secret: String,
    pub url: String,
    pub answer: serde_json::Value,
}

impl SubmissionPayload {
    pub fn new(credentials: &Credentials, link: &ChallengeLink, answer: &Answer) -> Self {
        Self {
            email: credentials.email.clone(),
            secret: credentials.secret.clone(),
            url: link.url.clone(),
            answer: answer.to_json(),
        }
    }
}

/// The parsed verdict of the quiz server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmissionOutcome {
    pub correct: bool,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default, rename = "url")]
    pub next_url: Option<String>,
}

impl SubmissionOutcome {
    /// Parse a raw response body. `None` means the body is not a verdict.
    pub fn parse(raw: &str) -> Option<Self> {
        let mut outcome: SubmissionOutcome = serde_json::from_str(raw.trim()).ok()?;
        if outcome
            .next_url
            .as_deref()
            .is_some_and(|u| u.trim().is_empty())
        {
            outcome.next_url = None;
        }
        Some(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_answer_from_number_output() {
        assert_eq!(Answer::from_model_output("30"), Answer::Number(30.into()));
        assert_eq!(Answer::from_model_output(" 30 \n").to_json(), json!(30));
    }

    #[test]
    fn test_answer_from_fenced_json_object() {
        let answer = Answer::from_model_output("```json\n{\"total\": 12}\n```");
        assert_eq!(answer, Answer::Structured(json!({"total": 12})));
    }

    #[test]
    fn test_answer_malformed_output_is_literal_text() {
        let answer = Answer::from_model_output("The answer is {Paris");
        assert_eq!(answer, Answer::Text("The answer is {Paris".to_string()));
    }

    #[test]
    fn test_answer_json_string_is_unquoted() {
        assert_eq!(
            Answer::from_model_output("\"Paris\""),
            Answer::Text("Paris".to_string())
        );
    }

    #[test]
    fn test_answer_bool_and_blob() {
        assert_eq!(Answer::from_model_output("true"), Answer::Bool(true));
        let blob = Answer::from_model_output("data:image/png;base64,aGVsbG8=");
        assert!(matches!(blob, Answer::Blob(_)));
        assert_eq!(blob.to_json(), json!("data:image/png;base64,aGVsbG8="));
        // Invalid base64 payload stays text
        assert!(matches!(
            Answer::from_model_output("data:image/png;base64,@@@"),
            Answer::Text(_)
        ));
    }

    #[test]
    fn test_outcome_parse_variants() {
        let o = SubmissionOutcome::parse(r#"{"correct": true, "url": "https://q/2"}"#).unwrap();
        assert!(o.correct);
        assert_eq!(o.next_url.as_deref(), Some("https://q/2"));

        let o = SubmissionOutcome::parse(r#"{"correct": false, "reason": "wrong", "url": ""}"#)
            .unwrap();
        assert!(!o.correct);
        assert_eq!(o.reason.as_deref(), Some("wrong"));
        assert!(o.next_url.is_none());

        assert!(SubmissionOutcome::parse("<html>502 Bad Gateway</html>").is_none());
        assert!(SubmissionOutcome::parse(r#"{"reason": "no verdict"}"#).is_none());
    }

    #[test]
    fn test_set_cookie_parsing_and_header() {
        let c = Cookie::from_set_cookie("session=abc123; Path=/; HttpOnly").unwrap();
        assert_eq!(c, Cookie::new("session", "abc123"));
        assert!(Cookie::from_set_cookie("=oops").is_none());
        assert_eq!(
            cookie_header(&[Cookie::new("a", "1"), Cookie::new("b", "2")]).as_deref(),
            Some("a=1; b=2")
        );
        assert!(cookie_header(&[]).is_none());
    }

    #[test]
    fn test_next_link_uses_previous_as_referer() {
        let start = ChallengeLink::start("https://q/1");
        assert_eq!(start.referer, "https://q/1");
        let next = ChallengeLink::next(&start, "https://q/2", vec![]);
        assert_eq!(next.referer, "https://q/1");
        assert!(next.cookies.is_empty());
    }

    #[test]
    fn test_unretrievable_page_context() {
        let page = PageContext::unretrievable("https://q/1", "connection refused");
        assert!(page.is_unretrievable());
        assert!(page.text.starts_with("Error: "));

        let empty = PageContext {
            url: "https://q/1".into(),
            ..PageContext::default()
        };
        assert!(empty.is_unretrievable());

        let ok = PageContext {
            url: "https://q/1".into(),
            text: "Sum 10 and 20".into(),
            ..PageContext::default()
        };
        assert!(!ok.is_unretrievable());
        assert!(ok.render().contains("Sum 10 and 20"));
    }

    #[test]
    fn test_payload_carries_current_link() {
        let creds = Credentials {
            email: "student@example.com".into(),
            secret: "s3cret".into(),
        };
        let link = ChallengeLink::start("https://q/1");
        let payload = SubmissionPayload::new(&creds, &link, &Answer::Number(30.into()));
        let value = serde_json::to_value(&payload).unwrap();
        assert_eq!(
            value,
            json!({"email": "student@example.com", "secret": "s3cret", "url": "https://q/1", "answer": 30})
        );
    }
}
