//! `chain-solver run <url>`

use anyhow::Result;

use chain_solver::audit::AuditLogger;
use chain_solver::chain::ChainOrchestrator;
use chain_solver::config::SolverConfig;

use super::wiring;

pub async fn cmd_run(config: &SolverConfig, url: &str) -> Result<()> {
    let credentials = config.credentials()?;
    let orchestrator = ChainOrchestrator::new(
        wiring::collaborators(config).await?,
        credentials,
        config.retry_policy(),
    )
    .with_audit(AuditLogger::new(&config.audit.dir));

    let report = orchestrator.run(url).await;
    println!("{}", serde_json::to_string_pretty(&report)?);

    if !report.is_done() {
        anyhow::bail!(
            "chain aborted: {}",
            report.abort_reason.as_deref().unwrap_or("unknown reason")
        );
    }
    Ok(())
}
