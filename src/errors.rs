//! Typed error hierarchy for the chain solver.
//!
//! One enum per subsystem:
//! - `ChainError`: unrecoverable chain failures (the only errors that abort a chain)
//! - `ExtractError`: task extraction failures
//! - `SolveError`: answer solver failures
//! - `LlmError`: chat-completion transport and decoding failures
//! - `SubmitError`: submission transport failures
//! - `ConfigError`: configuration loading failures
//!
//! Sandbox failures deliberately have no enum here: the executor renders every
//! failure as an `Error: ...` string for the solver to reason over.

use thiserror::Error;

/// Terminal failures that move the orchestrator to the aborted state.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChainError {
    #[error("No content retrievable from {url}: {message}")]
    PageUnretrievable { url: String, message: String },

    #[error("No well-formed task found on {url}: {message}")]
    TaskNotExtractable { url: String, message: String },

    #[error("Submission response unparseable {failures} consecutive times for {url}")]
    SubmissionParseExhausted { url: String, failures: u32 },
}

/// Errors from deriving a task description from a page.
#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("Extractor response was not valid JSON: {0}")]
    InvalidJson(String),

    #[error("Extractor response is missing field '{0}'")]
    MissingField(&'static str),

    #[error("Submission URL '{url}' cannot be resolved against '{base}'")]
    UnresolvableUrl { url: String, base: String },

    #[error(transparent)]
    Llm(#[from] LlmError),
}

/// Errors from the answer solver.
#[derive(Debug, Error)]
pub enum SolveError {
    #[error("Solver exhausted {steps} steps without a final answer")]
    StepBudgetExhausted { steps: u32 },

    #[error(transparent)]
    Llm(#[from] LlmError),
}

/// Errors from the chat-completion client.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("Missing API key (set OPENAI_API_KEY)")]
    MissingApiKey,

    #[error("LLM request failed: {0}")]
    Transport(#[source] reqwest::Error),

    #[error("LLM returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("LLM response invalid: {0}")]
    InvalidResponse(String),
}

/// Errors from posting an answer.
#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("Submission request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },
}

/// Errors from loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {source}")]
    Read {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file at {path}: {source}")]
    Parse {
        path: std::path::PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_error_parse_exhausted_carries_count() {
        let err = ChainError::SubmissionParseExhausted {
            url: "https://quiz.example/a".to_string(),
            failures: 6,
        };
        match &err {
            ChainError::SubmissionParseExhausted { failures, .. } => assert_eq!(*failures, 6),
            _ => panic!("Expected SubmissionParseExhausted"),
        }
        assert!(err.to_string().contains("6 consecutive"));
    }

    #[test]
    fn chain_error_variants_are_distinct() {
        let page = ChainError::PageUnretrievable {
            url: "u".into(),
            message: "m".into(),
        };
        let task = ChainError::TaskNotExtractable {
            url: "u".into(),
            message: "m".into(),
        };
        assert_ne!(page, task);
        assert!(page.to_string().starts_with("No content retrievable"));
        assert!(task.to_string().starts_with("No well-formed task"));
    }

    #[test]
    fn extract_error_converts_from_llm_error() {
        let err: ExtractError = LlmError::MissingApiKey.into();
        assert!(matches!(err, ExtractError::Llm(LlmError::MissingApiKey)));
    }

    #[test]
    fn llm_status_error_mentions_status_and_body() {
        let err = LlmError::Status {
            status: 429,
            body: "rate limited".into(),
        };
        let text = err.to_string();
        assert!(text.contains("429"));
        assert!(text.contains("rate limited"));
    }

    #[test]
    fn config_error_invalid_value_is_matchable() {
        let err = ConfigError::InvalidValue {
            key: "CHAIN_SOLVER_PORT".into(),
            message: "not a number".into(),
        };
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn all_error_types_implement_std_error_trait() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&ChainError::PageUnretrievable {
            url: "u".into(),
            message: "m".into(),
        });
        assert_std_error(&ExtractError::MissingField("question"));
        assert_std_error(&SolveError::StepBudgetExhausted { steps: 3 });
        assert_std_error(&LlmError::MissingApiKey);
    }
}
