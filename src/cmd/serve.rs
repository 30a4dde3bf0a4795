//! `chain-solver serve`

use anyhow::{Context, Result};
use std::sync::Arc;

use chain_solver::config::SolverConfig;
use chain_solver::server::{AppState, OrchestratorLauncher, serve};

use super::wiring;

pub async fn cmd_serve(config: &SolverConfig) -> Result<()> {
    let expected_secret = config
        .credentials
        .secret
        .clone()
        .context("STUDENT_SECRET must be set to accept start requests")?;

    let launcher = OrchestratorLauncher::new(
        wiring::collaborators(config).await?,
        config.retry_policy(),
        Some(config.audit.dir.clone()),
    );
    let state = Arc::new(AppState {
        expected_secret,
        launcher: Arc::new(launcher),
    });

    serve(&config.server.host, config.server.port, state).await
}
