use super::{AttemptRecord, ChainRun, TerminalRecord, TransitionRecord};
use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Persists the audit trail of a single chain run.
///
/// While the chain is running its record lives in `active/<run_id>.json` and is
/// rewritten after every event. `finish_run` moves it to `runs/`. Each chain gets
/// its own logger, so concurrent chains never touch the same file.
pub struct AuditLogger {
    audit_dir: PathBuf,
    current_run: Option<ChainRun>,
}

impl AuditLogger {
    pub fn new(audit_dir: &Path) -> Self {
        Self {
            audit_dir: audit_dir.to_path_buf(),
            current_run: None,
        }
    }

    fn active_file(&self, run_id: &Uuid) -> PathBuf {
        self.audit_dir.join("active").join(format!("{}.json", run_id))
    }

    pub fn start_run(&mut self, run_id: Uuid, start_url: &str, email: &str) -> Result<()> {
        fs::create_dir_all(self.audit_dir.join("active"))
            .context("Failed to create active audit directory")?;
        fs::create_dir_all(self.audit_dir.join("runs"))
            .context("Failed to create runs audit directory")?;
        self.current_run = Some(ChainRun::new(run_id, start_url, email));
        self.save_current()
    }

    /// Returns an error if no run is active, so a forgotten `start_run` does
    /// not silently drop records.
    pub fn record_transition(&mut self, transition: TransitionRecord) -> Result<()> {
        let run = self
            .current_run
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("record_transition called with no active run"))?;
        run.transitions.push(transition);
        self.save_current()
    }

    pub fn record_attempt(&mut self, attempt: AttemptRecord) -> Result<()> {
        let run = self
            .current_run
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("record_attempt called with no active run"))?;
        run.attempts.push(attempt);
        self.save_current()
    }

    pub fn finish_run(&mut self, terminal: TerminalRecord) -> Result<PathBuf> {
        let run = self
            .current_run
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("No current run to finish"))?;

        run.finish(terminal);

        let filename = format!(
            "{}_{}.json",
            run.started_at.format("%Y-%m-%dT%H-%M-%S"),
            &run.run_id.to_string()[..8]
        );
        let run_file = self.audit_dir.join("runs").join(&filename);

        let json = serde_json::to_string_pretty(&run).context("Failed to serialize audit run")?;
        fs::write(&run_file, json).context("Failed to write audit run file")?;

        let run_id = run.run_id;
        let active = self.active_file(&run_id);
        if active.exists() {
            fs::remove_file(&active).context("Failed to remove active audit file")?;
        }

        self.current_run = None;
        Ok(run_file)
    }

    pub fn save_current(&self) -> Result<()> {
        if let Some(ref run) = self.current_run {
            let json =
                serde_json::to_string_pretty(run).context("Failed to serialize current run")?;
            fs::write(self.active_file(&run.run_id), json)
                .context("Failed to write active audit file")?;
        }
        Ok(())
    }

    pub fn current_run(&self) -> Option<&ChainRun> {
        self.current_run.as_ref()
    }

    /// Finished runs, most recent first.
    pub fn list_runs(audit_dir: &Path) -> Result<Vec<PathBuf>> {
        let runs_dir = audit_dir.join("runs");
        if !runs_dir.exists() {
            return Ok(Vec::new());
        }

        let mut runs: Vec<PathBuf> = fs::read_dir(&runs_dir)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().map(|e| e == "json").unwrap_or(false))
            .collect();

        runs.sort();
        runs.reverse();
        Ok(runs)
    }

    pub fn load_run(path: &Path) -> Result<ChainRun> {
        let content = fs::read_to_string(path).context("Failed to read audit run file")?;
        let run: ChainRun =
            serde_json::from_str(&content).context("Failed to parse audit run file")?;
        Ok(run)
    }
}
