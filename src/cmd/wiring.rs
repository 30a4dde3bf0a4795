//! Builds the production collaborators from configuration.

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use chain_solver::chain::Collaborators;
use chain_solver::config::{PageRenderer, SolverConfig};
use chain_solver::extract::LlmTaskExtractor;
use chain_solver::llm::{LlmClient, OpenAiClient};
use chain_solver::page::{
    DisabledTranscriber, HttpPageVisitor, PageVisitor, Transcriber, WhisperTranscriber,
    prepare_work_dir,
};
use chain_solver::sandbox::{CapabilitySet, HostContext, Sandbox};
use chain_solver::solver::ToolLoopSolver;
use chain_solver::submit::HttpSubmitter;

const USER_AGENT: &str = concat!("chain-solver/", env!("CARGO_PKG_VERSION"));

pub fn http_client() -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .user_agent(USER_AGENT)
        .timeout(Duration::from_secs(60))
        .build()
        .context("Failed to build HTTP client")
}

/// The capability table, bound to the current runtime so the network
/// capabilities can be used from the sandbox thread.
pub fn capabilities(work_dir: PathBuf, http: reqwest::Client) -> Arc<CapabilitySet> {
    let host = HostContext::new(http, work_dir, tokio::runtime::Handle::try_current().ok());
    Arc::new(CapabilitySet::standard(host))
}

pub fn sandbox(config: &SolverConfig, work_dir: PathBuf, http: reqwest::Client) -> Sandbox {
    Sandbox::new(capabilities(work_dir, http), config.execution_limits())
}

/// The configured work directory, created and made absolute. The page visitor
/// records artifact paths under it and the sandbox resolves paths against it.
pub fn work_dir(config: &SolverConfig) -> Result<PathBuf> {
    prepare_work_dir(&config.sandbox.work_dir)
}

pub async fn collaborators(config: &SolverConfig) -> Result<Collaborators> {
    let work_dir = work_dir(config)?;
    let http = http_client()?;
    let llm: Arc<dyn LlmClient> = Arc::new(OpenAiClient::new(config.openai())?);

    let transcriber: Arc<dyn Transcriber> = match &config.llm.api_key {
        Some(key) => Arc::new(WhisperTranscriber::new(http.clone(), &config.llm.api_base, key)),
        None => {
            warn!("no API key configured, media transcription disabled");
            Arc::new(DisabledTranscriber)
        }
    };
    let visitor = page_visitor(config, http.clone(), work_dir.clone(), transcriber).await?;

    let solver = ToolLoopSolver::new(
        llm.clone(),
        sandbox(config, work_dir.clone(), http.clone()),
        visitor.clone(),
        config.llm.max_solver_steps,
    );
    info!(
        model = %config.llm.model,
        renderer = config.page.renderer.as_str(),
        work_dir = %work_dir.display(),
        "collaborators ready"
    );

    Ok(Collaborators {
        visitor,
        extractor: Arc::new(LlmTaskExtractor::new(llm)),
        solver: Arc::new(solver),
        submitter: Arc::new(HttpSubmitter::new(http)),
    })
}

async fn page_visitor(
    config: &SolverConfig,
    http: reqwest::Client,
    work_dir: PathBuf,
    transcriber: Arc<dyn Transcriber>,
) -> Result<Arc<dyn PageVisitor>> {
    match config.page.renderer {
        PageRenderer::Http => Ok(Arc::new(HttpPageVisitor::new(http, work_dir, transcriber))),
        #[cfg(feature = "browser")]
        PageRenderer::Browser => {
            let settings = chain_solver::page::BrowserSettings {
                settle: Duration::from_millis(config.page.settle_ms),
                navigation_timeout: Duration::from_secs(config.page.navigation_timeout_secs),
                executable: config.page.chrome_executable.clone(),
            };
            let visitor =
                chain_solver::page::BrowserPageVisitor::launch(http, work_dir, transcriber, settings)
                    .await?;
            Ok(Arc::new(visitor))
        }
        #[cfg(not(feature = "browser"))]
        PageRenderer::Browser => anyhow::bail!(
            "page.renderer = \"browser\" needs a build with the `browser` feature"
        ),
    }
}
