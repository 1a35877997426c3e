//! The per-session `Run` record and its single-writer manager
//!
//! All mutations to a session's state go through `RunStateManager`, which
//! persists to `state.json` after every change (spec I4: "every mutation to
//! run state is immediately persisted before the event processor returns").

use crate::config::RunConfig;
use crate::error::{EngineError, EngineResult};
use crate::eventlog::{Event, EventLog, EventType};
use crate::paths::{atomic_write, ProjectPaths};
use crate::spindle::SpindleState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
    Scout,
    NextTicket,
    Plan,
    Execute,
    ParallelExecute,
    Qa,
    Pr,
    Done,
    FailedBudget,
    FailedValidation,
    FailedSpindle,
    BlockedNeedsHuman,
}

impl Phase {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Phase::Done
                | Phase::FailedBudget
                | Phase::FailedValidation
                | Phase::FailedSpindle
                | Phase::BlockedNeedsHuman
        )
    }

    /// The `SCREAMING_SNAKE_CASE` spelling this type's own serde rename
    /// produces. Every NDJSON/JSON phase field must render through this,
    /// not `{:?}` — hook consumers and `loop-state.json` readers match on
    /// this exact casing (e.g. `"DONE"`, not `"Done"`).
    pub fn as_wire_str(self) -> &'static str {
        match self {
            Phase::Scout => "SCOUT",
            Phase::NextTicket => "NEXT_TICKET",
            Phase::Plan => "PLAN",
            Phase::Execute => "EXECUTE",
            Phase::ParallelExecute => "PARALLEL_EXECUTE",
            Phase::Qa => "QA",
            Phase::Pr => "PR",
            Phase::Done => "DONE",
            Phase::FailedBudget => "FAILED_BUDGET",
            Phase::FailedValidation => "FAILED_VALIDATION",
            Phase::FailedSpindle => "FAILED_SPINDLE",
            Phase::BlockedNeedsHuman => "BLOCKED_NEEDS_HUMAN",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_wire_str())
    }
}

/// Per-ticket worker state, owned by the parallel scheduler (spec §3
/// "WorkerState", §4.11).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerState {
    pub phase: Phase,
    pub ticket_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan: Option<String>,
    pub qa_retries: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_qa_failure: Option<String>,
    pub spindle: SpindleState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pr_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl WorkerState {
    pub fn new(ticket_id: impl Into<String>) -> Self {
        Self {
            phase: Phase::Plan,
            ticket_id: ticket_id.into(),
            plan: None,
            qa_retries: 0,
            last_qa_failure: None,
            spindle: SpindleState::default(),
            branch_name: None,
            pr_url: None,
            completed_at: None,
        }
    }
}

/// The full per-session record, persisted whole-file to `state.json`
/// (spec §3 "Run (session) record").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub run_id: String,
    pub session_id: String,
    pub project_id: String,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    pub phase: Phase,

    pub step_budget: u32,
    pub step_count: u32,
    pub ticket_step_budget: u32,
    pub ticket_step_count: u32,
    pub max_prs: u32,
    pub prs_created: u32,
    pub tickets_completed: u32,
    pub tickets_failed: u32,
    pub tickets_blocked: u32,
    pub scout_cycles: u32,
    pub scout_retries: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_ticket_id: Option<String>,
    pub plan_approved: bool,
    pub plan_rejections: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_plan_rejection_reason: Option<String>,

    pub qa_retries: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_qa_failure: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_proposals: Option<serde_json::Value>,
    #[serde(default)]
    pub hints: Vec<String>,
    #[serde(default)]
    pub scouted_dirs: Vec<String>,
    #[serde(default)]
    pub scout_exploration_log: Vec<String>,

    #[serde(default)]
    pub cached_learnings: Vec<serde_json::Value>,
    #[serde(default)]
    pub injected_learning_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub codebase_index: Option<serde_json::Value>,
    #[serde(default)]
    pub codebase_index_dirty: bool,

    #[serde(default)]
    pub ticket_workers: HashMap<String, WorkerState>,

    pub config: RunConfig,

    /// Supplemented field: records which formula produced `config`, kept
    /// separately from `config.formula` so analytics can group runs even if
    /// a formula file is later renamed or deleted.
    #[serde(default)]
    pub formula_name: Option<String>,
}

impl Run {
    pub fn new(run_id: impl Into<String>, project_id: impl Into<String>, config: RunConfig) -> Self {
        let now = Utc::now();
        let formula_name = config.formula.clone();
        Self {
            run_id: run_id.into(),
            session_id: uuid::Uuid::new_v4().to_string(),
            project_id: project_id.into(),
            started_at: now,
            expires_at: None,
            phase: Phase::Scout,
            step_budget: config.step_budget,
            step_count: 0,
            ticket_step_budget: config.ticket_step_budget,
            ticket_step_count: 0,
            max_prs: config.max_prs,
            prs_created: 0,
            tickets_completed: 0,
            tickets_failed: 0,
            tickets_blocked: 0,
            scout_cycles: 0,
            scout_retries: 0,
            current_ticket_id: None,
            plan_approved: false,
            plan_rejections: 0,
            last_plan_rejection_reason: None,
            qa_retries: 0,
            last_qa_failure: None,
            pending_proposals: None,
            hints: Vec::new(),
            scouted_dirs: Vec::new(),
            scout_exploration_log: Vec::new(),
            cached_learnings: Vec::new(),
            injected_learning_ids: Vec::new(),
            codebase_index: None,
            codebase_index_dirty: true,
            ticket_workers: HashMap::new(),
            config,
            formula_name,
        }
    }

    pub fn budget_remaining(&self) -> u32 {
        self.step_budget.saturating_sub(self.step_count)
    }
}

/// Owns the single active `Run` for a project and is the only object
/// permitted to mutate it (spec §4.2).
pub struct RunStateManager {
    paths: ProjectPaths,
    run: Option<Run>,
}

impl RunStateManager {
    pub fn new(paths: ProjectPaths) -> Self {
        Self { paths, run: None }
    }

    pub fn project_root(&self) -> &std::path::Path {
        self.paths.project_root()
    }

    /// Load whatever run is currently persisted for `run_id`, if any.
    pub fn load(paths: ProjectPaths, run_id: &str) -> EngineResult<Self> {
        let state_path = paths.state_file(run_id);
        let run = if state_path.exists() {
            let content = std::fs::read_to_string(&state_path)?;
            Some(serde_json::from_str(&content)?)
        } else {
            None
        };
        Ok(Self { paths, run })
    }

    pub fn create(&mut self, project_id: &str, config: RunConfig) -> EngineResult<&Run> {
        let run_id = format!("run-{}", uuid::Uuid::new_v4());
        self.paths.ensure_dirs()?;
        self.paths.ensure_run_dirs(&run_id)?;
        let run = Run::new(run_id, project_id, config);
        self.run = Some(run);
        self.persist()?;
        Ok(self.run.as_ref().unwrap())
    }

    pub fn require(&self) -> EngineResult<&Run> {
        self.run.as_ref().ok_or_else(|| EngineError::NoActiveSession {
            project_id: "unknown".into(),
        })
    }

    pub fn require_mut(&mut self) -> EngineResult<&mut Run> {
        self.run.as_mut().ok_or_else(|| EngineError::NoActiveSession {
            project_id: "unknown".into(),
        })
    }

    pub fn event_log(&self) -> EngineResult<EventLog> {
        let run = self.require()?;
        Ok(EventLog::new(self.paths.events_file(&run.run_id)))
    }

    pub fn append_event(&mut self, event_type: EventType, payload: serde_json::Value) -> EngineResult<()> {
        let step = self.require()?.step_count;
        let phase = self.require()?.phase.as_wire_str().to_string();
        let event = Event::new(event_type, payload).with_step(step).with_phase(phase);
        self.event_log()?.append(&event)
    }

    pub fn add_hint(&mut self, text: impl Into<String>) -> EngineResult<()> {
        self.require_mut()?.hints.push(text.into());
        self.persist()
    }

    pub fn init_ticket_worker(&mut self, ticket_id: &str) -> EngineResult<()> {
        let run = self.require_mut()?;
        run.ticket_workers
            .insert(ticket_id.to_string(), WorkerState::new(ticket_id));
        self.persist()
    }

    pub fn get_ticket_worker(&self, ticket_id: &str) -> Option<&WorkerState> {
        self.run.as_ref()?.ticket_workers.get(ticket_id)
    }

    pub fn get_ticket_worker_mut(&mut self, ticket_id: &str) -> Option<&mut WorkerState> {
        self.run.as_mut()?.ticket_workers.get_mut(ticket_id)
    }

    pub fn remove_ticket_worker(&mut self, ticket_id: &str) -> EngineResult<Option<WorkerState>> {
        let removed = self.require_mut()?.ticket_workers.remove(ticket_id);
        self.persist()?;
        Ok(removed)
    }

    pub fn end(&mut self) -> EngineResult<Run> {
        let run = self.run.take().ok_or_else(|| EngineError::NoActiveSession {
            project_id: "unknown".into(),
        })?;
        let json = serde_json::to_vec_pretty(&run)?;
        atomic_write(&self.paths.state_file(&run.run_id), &json)?;
        crate::eventlog::clear_loop_state(&self.paths.loop_state_file())?;
        Ok(run)
    }

    /// Whole-file rewrite of `state.json` via tmp+rename (spec §4.1).
    pub fn persist(&self) -> EngineResult<()> {
        let run = self.require()?;
        let json = serde_json::to_vec_pretty(run)?;
        atomic_write(&self.paths.state_file(&run.run_id), &json)?;
        let loop_state = crate::eventlog::LoopState {
            run_id: run.run_id.clone(),
            phase: run.phase.as_wire_str().to_string(),
            updated_at: Utc::now(),
        };
        crate::eventlog::write_loop_state(&self.paths.loop_state_file(), &loop_state)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn require_fails_before_create() {
        let dir = tempdir().unwrap();
        let mgr = RunStateManager::new(ProjectPaths::new(dir.path()));
        assert!(mgr.require().is_err());
    }

    #[test]
    fn create_persists_and_reloads() {
        let dir = tempdir().unwrap();
        let mut mgr = RunStateManager::new(ProjectPaths::new(dir.path()));
        let run_id = mgr.create("proj-1", RunConfig::default()).unwrap().run_id.clone();
        let reloaded = RunStateManager::load(ProjectPaths::new(dir.path()), &run_id).unwrap();
        assert_eq!(reloaded.require().unwrap().project_id, "proj-1");
    }

    #[test]
    fn add_hint_appends_and_persists() {
        let dir = tempdir().unwrap();
        let mut mgr = RunStateManager::new(ProjectPaths::new(dir.path()));
        mgr.create("proj-1", RunConfig::default()).unwrap();
        mgr.add_hint("focus on error handling").unwrap();
        assert_eq!(mgr.require().unwrap().hints.len(), 1);
    }

    #[test]
    fn ticket_worker_lifecycle() {
        let dir = tempdir().unwrap();
        let mut mgr = RunStateManager::new(ProjectPaths::new(dir.path()));
        mgr.create("proj-1", RunConfig::default()).unwrap();
        mgr.init_ticket_worker("t-1").unwrap();
        assert!(mgr.get_ticket_worker("t-1").is_some());
        let removed = mgr.remove_ticket_worker("t-1").unwrap();
        assert!(removed.is_some());
        assert!(mgr.get_ticket_worker("t-1").is_none());
    }

    #[test]
    fn budget_remaining_saturates() {
        let mut run = Run::new("r1", "p1", RunConfig::default());
        run.step_count = run.step_budget + 5;
        assert_eq!(run.budget_remaining(), 0);
    }
}
