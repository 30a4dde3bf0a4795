//! `chain-solver audit list|show`

use anyhow::Result;

use chain_solver::audit::{AuditLogger, TerminalRecord};
use chain_solver::config::SolverConfig;

use crate::AuditCommands;

pub fn cmd_audit(config: &SolverConfig, command: &AuditCommands) -> Result<()> {
    match command {
        AuditCommands::List => {
            let runs = AuditLogger::list_runs(&config.audit.dir)?;
            if runs.is_empty() {
                println!("No finished runs in {}", config.audit.dir.display());
                return Ok(());
            }
            for path in runs {
                match AuditLogger::load_run(&path) {
                    Ok(run) => {
                        let outcome = match &run.terminal {
                            Some(TerminalRecord::Done { .. }) => "done".to_string(),
                            Some(TerminalRecord::Aborted { reason, .. }) => {
                                format!("aborted ({})", reason)
                            }
                            None => "unfinished".to_string(),
                        };
                        println!(
                            "{}  {}  {} links  {}  {}",
                            run.started_at.format("%Y-%m-%d %H:%M:%S"),
                            run.run_id,
                            run.links_visited().len(),
                            outcome,
                            path.display()
                        );
                    }
                    Err(e) => println!("{}  (unreadable: {:#})", path.display(), e),
                }
            }
        }
        AuditCommands::Show { file } => {
            let run = AuditLogger::load_run(file)?;
            println!("{}", serde_json::to_string_pretty(&run)?);
        }
    }
    Ok(())
}
