//! Configuration for the chain solver.
//!
//! Read from `chain-solver.toml`, then overridden by environment variables
//! (a `.env` file is loaded first), then by CLI flags.
//!
//! ```toml
//! [server]
//! host = "0.0.0.0"
//! port = 8000
//!
//! [credentials]
//! email = "student@example.com"
//!
//! [llm]
//! model = "gpt-4o-mini"
//! max_solver_steps = 12
//!
//! [retry]
//! max_wrong_retries = 3
//! retry_window_secs = 150
//! projected_limit_secs = 180
//! max_parse_failures = 5
//!
//! [sandbox]
//! timeout_secs = 30
//! work_dir = "downloads"
//!
//! [page]
//! renderer = "http"   # or "browser" (needs the `browser` feature)
//! settle_ms = 3000
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::chain::{Credentials, RetryPolicy};
use crate::errors::ConfigError;
use crate::llm::OpenAiConfig;
use crate::sandbox::ExecutionLimits;

pub const CONFIG_FILE: &str = "chain-solver.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub host: String,
    pub port: u16,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
        }
    }
}

/// The expected secret doubles as the secret echoed in submissions.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CredentialsSection {
    pub email: Option<String>,
    pub secret: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmSection {
    /// Normally supplied through `OPENAI_API_KEY`.
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    pub api_base: String,
    pub model: String,
    pub temperature: f32,
    pub timeout_secs: u64,
    pub max_solver_steps: u32,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            api_key: None,
            api_base: "https://api.openai.com/v1".to_string(),
            model: "gpt-4o-mini".to_string(),
            temperature: 0.0,
            timeout_secs: 120,
            max_solver_steps: crate::solver::DEFAULT_MAX_STEPS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySection {
    pub max_wrong_retries: u32,
    pub retry_window_secs: u64,
    pub projected_limit_secs: u64,
    pub max_parse_failures: u32,
}

impl Default for RetrySection {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            max_wrong_retries: policy.max_wrong_retries,
            retry_window_secs: policy.retry_window.as_secs(),
            projected_limit_secs: policy.projected_limit.as_secs(),
            max_parse_failures: policy.max_parse_failures,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxSection {
    pub timeout_secs: u64,
    pub loop_iteration_limit: u64,
    /// Where pages, downloads and sandbox-relative paths live.
    pub work_dir: PathBuf,
}

impl Default for SandboxSection {
    fn default() -> Self {
        let limits = ExecutionLimits::default();
        Self {
            timeout_secs: limits.timeout.as_secs(),
            loop_iteration_limit: limits.loop_iteration_limit,
            work_dir: PathBuf::from("downloads"),
        }
    }
}

/// How pages are fetched before harvesting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PageRenderer {
    /// Plain GET of the page source.
    #[default]
    Http,
    /// Headless Chromium; scripts run before the DOM is read.
    Browser,
}

impl PageRenderer {
    pub fn as_str(&self) -> &'static str {
        match self {
            PageRenderer::Http => "http",
            PageRenderer::Browser => "browser",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PageSection {
    pub renderer: PageRenderer,
    /// Wait after navigation so client-side scripts can fill the page.
    pub settle_ms: u64,
    pub navigation_timeout_secs: u64,
    /// Chrome/Chromium binary; found on PATH when unset.
    pub chrome_executable: Option<PathBuf>,
}

impl Default for PageSection {
    fn default() -> Self {
        Self {
            renderer: PageRenderer::Http,
            settle_ms: 3000,
            navigation_timeout_secs: 30,
            chrome_executable: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    pub dir: PathBuf,
    pub file: String,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("logs"),
            file: "app.jsonl".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditSection {
    pub dir: PathBuf,
}

impl Default for AuditSection {
    fn default() -> Self {
        Self {
            dir: PathBuf::from(".chain-solver/audit"),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SolverConfig {
    pub server: ServerSection,
    pub credentials: CredentialsSection,
    pub llm: LlmSection,
    pub retry: RetrySection,
    pub sandbox: SandboxSection,
    pub page: PageSection,
    pub logging: LoggingSection,
    pub audit: AuditSection,
}

impl SolverConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&content, path)
    }

    pub fn parse(content: &str, path: &Path) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Defaults when the file does not exist.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// File, then `.env` and the process environment.
    pub fn resolve(path: &Path) -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();
        let mut config = Self::load_or_default(path)?;
        config.apply_env_from(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Apply environment overrides using `lookup` to read variables.
    pub fn apply_env_from<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(email) = non_empty("STUDENT_EMAIL") {
            self.credentials.email = Some(email);
        }
        if let Some(secret) = non_empty("STUDENT_SECRET") {
            self.credentials.secret = Some(secret);
        }
        if let Some(key) = non_empty("OPENAI_API_KEY") {
            self.llm.api_key = Some(key);
        }
        if let Some(base) = non_empty("OPENAI_BASE_URL") {
            self.llm.api_base = base;
        }
        if let Some(model) = non_empty("CHAIN_SOLVER_MODEL") {
            self.llm.model = model;
        }
        if let Some(renderer) = non_empty("CHAIN_SOLVER_RENDERER") {
            self.page.renderer = match renderer.trim().to_ascii_lowercase().as_str() {
                "http" => PageRenderer::Http,
                "browser" => PageRenderer::Browser,
                other => {
                    return Err(ConfigError::InvalidValue {
                        key: "CHAIN_SOLVER_RENDERER".to_string(),
                        message: format!("'{}' is not one of: http, browser", other),
                    });
                }
            };
        }
        if let Some(port) = non_empty("CHAIN_SOLVER_PORT") {
            self.server.port = port.trim().parse().map_err(|_| ConfigError::InvalidValue {
                key: "CHAIN_SOLVER_PORT".to_string(),
                message: format!("'{}' is not a port number", port),
            })?;
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_wrong_retries: self.retry.max_wrong_retries,
            retry_window: Duration::from_secs(self.retry.retry_window_secs),
            projected_limit: Duration::from_secs(self.retry.projected_limit_secs),
            max_parse_failures: self.retry.max_parse_failures,
        }
    }

    pub fn execution_limits(&self) -> ExecutionLimits {
        ExecutionLimits {
            timeout: Duration::from_secs(self.sandbox.timeout_secs),
            loop_iteration_limit: self.sandbox.loop_iteration_limit,
            ..ExecutionLimits::default()
        }
    }

    pub fn openai(&self) -> OpenAiConfig {
        OpenAiConfig {
            api_key: self.llm.api_key.clone(),
            api_base: self.llm.api_base.clone(),
            model: self.llm.model.clone(),
            temperature: self.llm.temperature,
            timeout: Duration::from_secs(self.llm.timeout_secs),
        }
    }

    /// Both halves of the credentials, or an error naming the missing one.
    pub fn credentials(&self) -> Result<Credentials, ConfigError> {
        let missing = |key: &str| ConfigError::InvalidValue {
            key: key.to_string(),
            message: "not set (config file or environment)".to_string(),
        };
        Ok(Credentials {
            email: self
                .credentials
                .email
                .clone()
                .ok_or_else(|| missing("STUDENT_EMAIL"))?,
            secret: self
                .credentials
                .secret
                .clone()
                .ok_or_else(|| missing("STUDENT_SECRET"))?,
        })
    }

    /// Reject values that would make the retry policy or sandbox meaningless.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.retry.projected_limit_secs < self.retry.retry_window_secs {
            return Err(ConfigError::InvalidValue {
                key: "retry.projected_limit_secs".to_string(),
                message: "must not be smaller than retry.retry_window_secs".to_string(),
            });
        }
        if self.sandbox.timeout_secs == 0 {
            return Err(ConfigError::InvalidValue {
                key: "sandbox.timeout_secs".to_string(),
                message: "must be positive".to_string(),
            });
        }
        if self.llm.max_solver_steps == 0 {
            return Err(ConfigError::InvalidValue {
                key: "llm.max_solver_steps".to_string(),
                message: "must be positive".to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_match_retry_constants() {
        let config = SolverConfig::default();
        assert_eq!(config.retry_policy(), RetryPolicy::default());
        assert_eq!(config.server.port, 8000);
        assert_eq!(config.llm.max_solver_steps, 12);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let config = SolverConfig::parse(
            r#"
[server]
port = 9000

[retry]
max_wrong_retries = 1
"#,
            Path::new(CONFIG_FILE),
        )
        .unwrap();
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.retry.max_wrong_retries, 1);
        assert_eq!(config.retry.retry_window_secs, 150);
        assert_eq!(config.sandbox.work_dir, PathBuf::from("downloads"));
    }

    #[test]
    fn test_invalid_toml_is_parse_error() {
        let err = SolverConfig::parse("[server\nport = ", Path::new("x.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
        assert!(err.to_string().contains("x.toml"));
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = SolverConfig::load_or_default(&dir.path().join(CONFIG_FILE)).unwrap();
        assert_eq!(config.audit.dir, PathBuf::from(".chain-solver/audit"));
    }

    #[test]
    fn test_env_overrides_file() {
        let mut config = SolverConfig::parse(
            "[credentials]\nemail = \"file@example.com\"\nsecret = \"file\"\n",
            Path::new(CONFIG_FILE),
        )
        .unwrap();
        config
            .apply_env_from(env(&[
                ("STUDENT_SECRET", "from-env"),
                ("OPENAI_API_KEY", "sk-test"),
                ("CHAIN_SOLVER_PORT", "8123"),
                ("CHAIN_SOLVER_MODEL", "  "),
            ]))
            .unwrap();

        let creds = config.credentials().unwrap();
        assert_eq!(creds.email, "file@example.com");
        assert_eq!(creds.secret, "from-env");
        assert_eq!(config.llm.api_key.as_deref(), Some("sk-test"));
        assert_eq!(config.server.port, 8123);
        // blank values do not override
        assert_eq!(config.llm.model, "gpt-4o-mini");
    }

    #[test]
    fn test_bad_port_in_env_is_rejected() {
        let mut config = SolverConfig::default();
        let err = config
            .apply_env_from(env(&[("CHAIN_SOLVER_PORT", "eighty")]))
            .unwrap_err();
        assert!(err.to_string().contains("CHAIN_SOLVER_PORT"));
    }

    #[test]
    fn test_missing_credentials_named() {
        let err = SolverConfig::default().credentials().unwrap_err();
        assert!(err.to_string().contains("STUDENT_EMAIL"));
    }

    #[test]
    fn test_api_key_is_never_serialized() {
        let mut config = SolverConfig::default();
        config.llm.api_key = Some("sk-secret".into());
        let text = toml::to_string(&config).unwrap();
        assert!(!text.contains("sk-secret"));
    }

    #[test]
    fn test_page_renderer_from_file_and_env() {
        let mut config =
            SolverConfig::parse("[page]\nrenderer = \"browser\"\n", Path::new(CONFIG_FILE)).unwrap();
        assert_eq!(config.page.renderer, PageRenderer::Browser);
        assert_eq!(config.page.settle_ms, 3000);

        config
            .apply_env_from(env(&[("CHAIN_SOLVER_RENDERER", "HTTP")]))
            .unwrap();
        assert_eq!(config.page.renderer, PageRenderer::Http);

        let err = config
            .apply_env_from(env(&[("CHAIN_SOLVER_RENDERER", "curl")]))
            .unwrap_err();
        assert!(err.to_string().contains("CHAIN_SOLVER_RENDERER"));
    }

    #[test]
    fn test_validate_rejects_inverted_retry_window() {
        let mut config = SolverConfig::default();
        config.retry.projected_limit_secs = 100;
        assert!(config.validate().is_err());
    }
}
