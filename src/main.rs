use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use chain_solver::config::{CONFIG_FILE, SolverConfig};

mod cmd;

#[derive(Parser)]
#[command(name = "chain-solver")]
#[command(version, about = "Solves chained web challenge pages")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Path to the config file
    #[arg(long, global = true, default_value = CONFIG_FILE)]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the HTTP start-trigger server
    Serve {
        /// Port to listen on (overrides config and CHAIN_SOLVER_PORT)
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Run one chain in the foreground and print its report
    Run {
        /// URL of the first challenge page
        url: String,

        #[arg(long)]
        email: Option<String>,

        #[arg(long)]
        secret: Option<String>,
    },
    /// Execute a sandbox fragment and print the result
    Exec {
        /// File holding the fragment; stdin when omitted
        file: Option<PathBuf>,
    },
    /// Inspect chain audit records
    Audit {
        #[command(subcommand)]
        command: AuditCommands,
    },
}

#[derive(Subcommand)]
pub enum AuditCommands {
    /// List finished runs, most recent first
    List,
    /// Print one run record
    Show { file: PathBuf },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = SolverConfig::resolve(&cli.config)?;

    match &cli.command {
        Commands::Serve { port } => {
            if let Some(port) = port {
                config.server.port = *port;
            }
            config.validate()?;
            let _guard = chain_solver::logging::init(&config.logging, cli.verbose)?;
            cmd::cmd_serve(&config).await?;
        }
        Commands::Run { url, email, secret } => {
            if let Some(email) = email {
                config.credentials.email = Some(email.clone());
            }
            if let Some(secret) = secret {
                config.credentials.secret = Some(secret.clone());
            }
            config.validate()?;
            let _guard = chain_solver::logging::init(&config.logging, cli.verbose)?;
            cmd::cmd_run(&config, url).await?;
        }
        Commands::Exec { file } => cmd::cmd_exec(&config, file.as_deref()).await?,
        Commands::Audit { command } => cmd::cmd_audit(&config, command)?,
    }

    Ok(())
}
