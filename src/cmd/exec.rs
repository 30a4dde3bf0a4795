//! `chain-solver exec [<file>]`

use anyhow::{Context, Result};
use std::io::Read;
use std::path::Path;

use chain_solver::config::SolverConfig;

use super::wiring;

pub async fn cmd_exec(config: &SolverConfig, file: Option<&Path>) -> Result<()> {
    let code = match file {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?,
        None => {
            let mut code = String::new();
            std::io::stdin()
                .read_to_string(&mut code)
                .context("Failed to read fragment from stdin")?;
            code
        }
    };

    let sandbox = wiring::sandbox(config, wiring::work_dir(config)?, wiring::http_client()?);
    println!("{}", sandbox.run(&code).await);
    Ok(())
}
