//! Trajectory engine: a YAML-defined ordered step plan with dependency
//! gating that restricts and focuses scout proposals (spec §4.16).

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

const DEFAULT_MAX_RETRIES: u32 = 3;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrajectoryStep {
    pub id: String,
    pub title: String,
    pub description: String,
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(default)]
    pub categories: Vec<String>,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
    #[serde(default)]
    pub verification_commands: Vec<String>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub measure: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trajectory {
    pub name: String,
    pub description: String,
    pub steps: Vec<TrajectoryStep>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Active,
    Completed,
    Skipped,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepState {
    pub status: StepStatus,
    pub cycles_attempted: u32,
    pub last_attempted_cycle: Option<u32>,
    pub completed_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl Default for StepState {
    fn default() -> Self {
        Self {
            status: StepStatus::Pending,
            cycles_attempted: 0,
            last_attempted_cycle: None,
            completed_at: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TrajectoryRunState {
    pub step_states: HashMap<String, StepState>,
    pub current_step_id: Option<String>,
    pub paused: bool,
}

impl Trajectory {
    pub fn load(path: &std::path::Path) -> crate::error::EngineResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_yaml::from_str(&content)?)
    }
}

/// `stepReady`: true iff every dependency step is completed.
pub fn step_ready(step: &TrajectoryStep, states: &HashMap<String, StepState>) -> bool {
    step.depends_on.iter().all(|dep| {
        states
            .get(dep)
            .map(|s| s.status == StepStatus::Completed)
            .unwrap_or(false)
    })
}

/// Returns the first pending/active step (declaration order) whose
/// dependencies are met.
pub fn get_next_step<'a>(trajectory: &'a Trajectory, run_state: &TrajectoryRunState) -> Option<&'a TrajectoryStep> {
    trajectory.steps.iter().find(|step| {
        let status = run_state
            .step_states
            .get(&step.id)
            .map(|s| s.status)
            .unwrap_or(StepStatus::Pending);
        matches!(status, StepStatus::Pending | StepStatus::Active) && step_ready(step, &run_state.step_states)
    })
}

/// A step active for `maxRetries` cycles without completing is flagged.
pub fn is_stuck(state: &StepState, max_retries: Option<u32>) -> bool {
    state.status == StepStatus::Active && state.cycles_attempted >= max_retries.unwrap_or(DEFAULT_MAX_RETRIES)
}

pub fn record_attempt(run_state: &mut TrajectoryRunState, step_id: &str, cycle: u32) {
    let entry = run_state.step_states.entry(step_id.to_string()).or_default();
    entry.status = StepStatus::Active;
    entry.cycles_attempted += 1;
    entry.last_attempted_cycle = Some(cycle);
}

pub fn complete_step(run_state: &mut TrajectoryRunState, step_id: &str) {
    let entry = run_state.step_states.entry(step_id.to_string()).or_default();
    entry.status = StepStatus::Completed;
    entry.completed_at = Some(chrono::Utc::now());
}
