//! Per-ticket worker mini state machine, PLAN → EXECUTE → QA → PR
//! (spec §4.11), driven independently of the session-wide phase by the
//! parallel scheduler.

use crate::run_state::{Phase, WorkerState};
use serde::{Deserialize, Serialize};

/// Legal worker-phase transitions, mirroring the session-wide table but
/// scoped to the subset of phases a worker actually visits.
pub fn is_legal_worker_transition(from: Phase, to: Phase) -> bool {
    use Phase::*;
    matches!(
        (from, to),
        (Plan, Execute) | (Execute, Qa) | (Qa, Execute) | (Qa, Pr) | (Qa, Done) | (Pr, Done)
    )
}

#[derive(Debug, Clone, PartialEq)]
pub enum WorkerAction {
    Prompt { phase: Phase, body: String },
    Completed { pr_url: Option<String> },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerTicketResult {
    pub status: String,
    #[serde(default)]
    pub message: Option<String>,
}

/// Compute the next prompt for a worker currently parked at `worker.phase`.
pub fn advance_ticket_worker(worker: &WorkerState, plan_text: Option<&str>) -> WorkerAction {
    match worker.phase {
        Phase::Plan => WorkerAction::Prompt {
            phase: Phase::Plan,
            body: format!("Submit a plan for ticket {}", worker.ticket_id),
        },
        Phase::Execute => WorkerAction::Prompt {
            phase: Phase::Execute,
            body: format!(
                "Execute the committed plan for ticket {}:\n{}",
                worker.ticket_id,
                plan_text.or(worker.plan.as_deref()).unwrap_or("")
            ),
        },
        Phase::Qa => WorkerAction::Prompt {
            phase: Phase::Qa,
            body: format!("Run QA for ticket {}", worker.ticket_id),
        },
        Phase::Pr => WorkerAction::Prompt {
            phase: Phase::Pr,
            body: format!("Create a PR for ticket {}", worker.ticket_id),
        },
        Phase::Done => WorkerAction::Completed {
            pr_url: worker.pr_url.clone(),
        },
        other => WorkerAction::Prompt {
            phase: other,
            body: String::new(),
        },
    }
}

/// Apply a worker-scoped event, mutating `worker` in place. Returns whether
/// the transition was legal (illegal transitions leave state untouched).
pub fn ingest_ticket_event(worker: &mut WorkerState, to: Phase) -> bool {
    if !is_legal_worker_transition(worker.phase, to) {
        return false;
    }
    worker.phase = to;
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spindle::SpindleState;

    fn worker(phase: Phase) -> WorkerState {
        WorkerState {
            phase,
            ticket_id: "t-1".into(),
            plan: None,
            qa_retries: 0,
            last_qa_failure: None,
            spindle: SpindleState::default(),
            branch_name: None,
            pr_url: None,
            completed_at: None,
        }
    }

    #[test]
    fn plan_phase_emits_plan_prompt() {
        let w = worker(Phase::Plan);
        match advance_ticket_worker(&w, None) {
            WorkerAction::Prompt { phase, .. } => assert_eq!(phase, Phase::Plan),
            _ => panic!("expected prompt"),
        }
    }

    #[test]
    fn done_phase_reports_completion_with_pr_url() {
        let mut w = worker(Phase::Done);
        w.pr_url = Some("https://example.com/pr/1".into());
        match advance_ticket_worker(&w, None) {
            WorkerAction::Completed { pr_url } => assert_eq!(pr_url.as_deref(), Some("https://example.com/pr/1")),
            _ => panic!("expected completion"),
        }
    }

    #[test]
    fn legal_transition_updates_phase() {
        let mut w = worker(Phase::Plan);
        assert!(ingest_ticket_event(&mut w, Phase::Execute));
        assert_eq!(w.phase, Phase::Execute);
    }

    #[test]
    fn illegal_transition_is_rejected() {
        let mut w = worker(Phase::Plan);
        assert!(!ingest_ticket_event(&mut w, Phase::Pr));
        assert_eq!(w.phase, Phase::Plan);
    }

    #[test]
    fn qa_failure_can_cycle_back_to_execute() {
        let mut w = worker(Phase::Qa);
        assert!(ingest_ticket_event(&mut w, Phase::Execute));
    }
}
