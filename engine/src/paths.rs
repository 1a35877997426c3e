//! `.blockspool/` run-directory layout helpers
//!
//! Centralizes every path the engine touches under a project root so that
//! the on-disk layout in spec §4.1 stays consistent across modules.

use std::path::{Path, PathBuf};

/// Handle to the `.blockspool/` tree rooted at a project directory.
#[derive(Debug, Clone)]
pub struct ProjectPaths {
    root: PathBuf,
}

impl ProjectPaths {
    pub fn new(project_root: impl AsRef<Path>) -> Self {
        Self {
            root: project_root.as_ref().to_path_buf(),
        }
    }

    pub fn project_root(&self) -> &Path {
        &self.root
    }

    fn blockspool_dir(&self) -> PathBuf {
        self.root.join(".blockspool")
    }

    pub fn runs_dir(&self) -> PathBuf {
        self.blockspool_dir().join("runs")
    }

    pub fn run_dir(&self, run_id: &str) -> PathBuf {
        self.runs_dir().join(run_id)
    }

    pub fn state_file(&self, run_id: &str) -> PathBuf {
        self.run_dir(run_id).join("state.json")
    }

    pub fn events_file(&self, run_id: &str) -> PathBuf {
        self.run_dir(run_id).join("events.ndjson")
    }

    pub fn artifacts_dir(&self, run_id: &str) -> PathBuf {
        self.run_dir(run_id).join("artifacts")
    }

    pub fn artifact_file(&self, run_id: &str, step: u32, kind: &str) -> PathBuf {
        self.artifacts_dir(run_id).join(format!("{step}-{kind}.json"))
    }

    pub fn loop_state_file(&self) -> PathBuf {
        self.blockspool_dir().join("loop-state.json")
    }

    pub fn sectors_file(&self) -> PathBuf {
        self.blockspool_dir().join("sectors.json")
    }

    pub fn dedup_file(&self) -> PathBuf {
        self.blockspool_dir().join("dedup.json")
    }

    pub fn learnings_file(&self) -> PathBuf {
        self.blockspool_dir().join("learnings.json")
    }

    pub fn qa_stats_file(&self) -> PathBuf {
        self.blockspool_dir().join("qa-stats.json")
    }

    pub fn qa_baseline_file(&self) -> PathBuf {
        self.blockspool_dir().join("qa-baseline.json")
    }

    pub fn history_file(&self) -> PathBuf {
        self.blockspool_dir().join("history.ndjson")
    }

    pub fn error_ledger_file(&self) -> PathBuf {
        self.blockspool_dir().join("error-ledger.ndjson")
    }

    pub fn daemon_state_file(&self) -> PathBuf {
        self.blockspool_dir().join("daemon-state.json")
    }

    pub fn daemon_wake_metrics_file(&self) -> PathBuf {
        self.blockspool_dir().join("daemon-wake-metrics.json")
    }

    /// The currently-active ticket's resolved scope policy, written by the
    /// MCP server on every step that can change which ticket is active and
    /// read by the separately-invoked hook process, which has no other way
    /// to see session state (spec §4.7).
    pub fn active_scope_file(&self) -> PathBuf {
        self.blockspool_dir().join("active-scope.json")
    }

    pub fn trajectories_dir(&self) -> PathBuf {
        self.blockspool_dir().join("trajectories")
    }

    pub fn trajectory_file(&self, name: &str) -> PathBuf {
        self.trajectories_dir().join(format!("{name}.yaml"))
    }

    pub fn formulas_dir(&self) -> PathBuf {
        self.blockspool_dir().join("formulas")
    }

    pub fn formula_file(&self, name: &str) -> PathBuf {
        self.formulas_dir().join(format!("{name}.yaml"))
    }

    /// Create every directory this project will need, idempotently.
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(self.runs_dir())?;
        std::fs::create_dir_all(self.trajectories_dir())?;
        std::fs::create_dir_all(self.formulas_dir())?;
        Ok(())
    }

    pub fn ensure_run_dirs(&self, run_id: &str) -> std::io::Result<()> {
        std::fs::create_dir_all(self.artifacts_dir(run_id))
    }
}

/// Atomically write `contents` to `path` via a temp file + rename, matching
/// the crash-safety requirement for `state.json`/`sectors.json`/etc in spec
/// §4.1 and §5.
pub fn atomic_write(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp_path = path.with_extension(format!(
        "{}.tmp",
        path.extension().and_then(|e| e.to_str()).unwrap_or("tmp")
    ));
    std::fs::write(&tmp_path, contents)?;
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}
