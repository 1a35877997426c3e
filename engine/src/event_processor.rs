//! `processEvent`: routes typed agent events to state transitions
//! (spec §4.10).

use crate::dedup::DedupStore;
use crate::eventlog::EventType;
use crate::proposal::{run_pipeline, Proposal};
use crate::qa::{QaFailureClass, QaStats};
use crate::run_state::{Phase, RunStateManager};
use crate::ticket::{Ticket, TicketStatus};
use serde::{Deserialize, Serialize};
use serde_json::json;

const MAX_SCOUT_RETRIES: u32 = 3;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessedOutcome {
    pub processed: bool,
    pub phase_changed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_phase: Option<String>,
    pub message: String,
}

fn outcome(phase_changed: bool, new_phase: Option<Phase>, message: impl Into<String>) -> ProcessedOutcome {
    ProcessedOutcome {
        processed: true,
        phase_changed,
        new_phase: new_phase.map(|p| p.as_wire_str().to_string()),
        message: message.into(),
    }
}

pub struct ProcessContext<'a> {
    pub tickets: &'a mut Vec<Ticket>,
    pub dedup_store: &'a mut DedupStore,
    pub qa_stats: &'a mut QaStats,
    pub existing_titles: &'a [String],
    pub max_proposals: usize,
    pub id_gen: Box<dyn Fn(usize) -> String + 'a>,
}

/// Single entry point matching spec §4.10's `processEvent(run, db, type,
/// payload, project)`. In PARALLEL_EXECUTE, events carrying `ticket_id` are
/// forwarded to the matching worker before falling through here.
pub fn process_event(
    manager: &mut RunStateManager,
    event_type: EventType,
    payload: serde_json::Value,
    ctx: &mut ProcessContext,
) -> crate::error::EngineResult<ProcessedOutcome> {
    if manager.require()?.phase == Phase::ParallelExecute {
        if let Some(ticket_id) = payload.get("ticket_id").and_then(|v| v.as_str()).map(str::to_owned) {
            if manager.get_ticket_worker(&ticket_id).is_some() {
                return forward_to_worker(manager, &ticket_id, event_type, payload, ctx);
            }
        }
    }

    let result = match event_type {
        EventType::ScoutOutput => handle_scout_output(manager, payload.clone(), ctx)?,
        EventType::ProposalsReviewed => handle_proposals_reviewed(manager, payload.clone(), ctx)?,
        EventType::PlanSubmitted => handle_plan_submitted(manager, payload.clone())?,
        EventType::TicketResult => handle_ticket_result(manager, payload.clone(), ctx)?,
        EventType::QaPassed => handle_qa_passed(manager, ctx)?,
        EventType::QaFailed => handle_qa_failed(manager, payload.clone())?,
        EventType::QaCommandResult => outcome(false, None, "recorded"),
        EventType::PrCreated => handle_pr_created(manager, payload.clone(), ctx)?,
        EventType::UserOverride => handle_user_override(manager, payload.clone(), ctx)?,
        EventType::BudgetWarning | EventType::ScopeAllowed | EventType::ScopeBlocked | EventType::Unknown => {
            outcome(false, None, "recorded")
        }
    };
    manager.append_event(event_type, payload)?;
    manager.persist()?;
    Ok(result)
}

fn forward_to_worker(
    manager: &mut RunStateManager,
    ticket_id: &str,
    event_type: EventType,
    payload: serde_json::Value,
    ctx: &mut ProcessContext,
) -> crate::error::EngineResult<ProcessedOutcome> {
    let to_phase = match event_type {
        EventType::PlanSubmitted => Some(Phase::Execute),
        EventType::QaPassed => Some(Phase::Pr),
        EventType::QaFailed => Some(Phase::Execute),
        EventType::PrCreated => Some(Phase::Done),
        _ => None,
    };
    if let Some(to) = to_phase {
        if let Some(worker) = manager.get_ticket_worker_mut(ticket_id) {
            crate::worker::ingest_ticket_event(worker, to);
        }
    }
    if to_phase == Some(Phase::Done) {
        crate::scheduler::complete_worker(manager, ticket_id, true)?;
        if let Some(t) = ctx.tickets.iter_mut().find(|t| t.id == ticket_id) {
            let _ = t.transition(TicketStatus::Done);
        }
    }
    manager.append_event(event_type, payload)?;
    manager.persist()?;
    Ok(outcome(true, to_phase, format!("forwarded to worker {ticket_id}")))
}

fn handle_scout_output(
    manager: &mut RunStateManager,
    payload: serde_json::Value,
    ctx: &mut ProcessContext,
) -> crate::error::EngineResult<ProcessedOutcome> {
    if manager.require()?.phase != Phase::Scout {
        return Ok(outcome(false, None, "ignored: not in SCOUT"));
    }

    // Fallback parse: a reviewed-proposals payload routed here.
    if payload.get("reviewed_proposals").is_some() && manager.require()?.pending_proposals.is_some() {
        return handle_proposals_reviewed(manager, payload, ctx);
    }

    manager
        .require_mut()?
        .scout_exploration_log
        .push(payload.to_string());

    let proposals: Vec<Proposal> = payload
        .get("proposals")
        .and_then(|v| serde_json::from_value(v.clone()).ok())
        .unwrap_or_default();

    if proposals.is_empty() {
        let run = manager.require_mut()?;
        if run.scout_retries < MAX_SCOUT_RETRIES {
            run.scout_retries += 1;
            return Ok(outcome(false, None, "no proposals, retrying scout"));
        }
        run.phase = Phase::Done;
        return Ok(outcome(true, Some(Phase::Done), "no proposals after max retries"));
    }

    let skip_review = manager.require()?.config.skip_review;
    if skip_review {
        materialize_proposals(manager, proposals, ctx)?;
        manager.require_mut()?.phase = Phase::NextTicket;
        return Ok(outcome(true, Some(Phase::NextTicket), "proposals materialized"));
    }

    manager.require_mut()?.pending_proposals = Some(json!({ "proposals": proposals }));
    Ok(outcome(false, None, "pending adversarial review"))
}

fn handle_proposals_reviewed(
    manager: &mut RunStateManager,
    payload: serde_json::Value,
    ctx: &mut ProcessContext,
) -> crate::error::EngineResult<ProcessedOutcome> {
    let pending = manager.require()?.pending_proposals.clone();
    let mut proposals: Vec<Proposal> = pending
        .as_ref()
        .and_then(|p| p.get("proposals"))
        .and_then(|v| serde_json::from_value(v.clone()).ok())
        .unwrap_or_default();

    if let Some(scores) = payload.get("reviewed_proposals").and_then(|v| v.as_array()) {
        for (i, score) in scores.iter().enumerate() {
            if let (Some(p), Some(conf)) = (proposals.get_mut(i), score.get("confidence").and_then(|v| v.as_u64())) {
                p.confidence = conf as u8;
            }
        }
    }

    manager.require_mut()?.pending_proposals = None;

    if proposals.is_empty() {
        let run = manager.require_mut()?;
        if run.scout_retries < MAX_SCOUT_RETRIES {
            run.scout_retries += 1;
            run.phase = Phase::Scout;
            return Ok(outcome(true, Some(Phase::Scout), "all rejected, retry scout"));
        }
        run.phase = Phase::Done;
        return Ok(outcome(true, Some(Phase::Done), "all rejected after max retries"));
    }

    materialize_proposals(manager, proposals, ctx)?;
    manager.require_mut()?.phase = Phase::NextTicket;
    Ok(outcome(true, Some(Phase::NextTicket), "proposals materialized"))
}

fn materialize_proposals(
    manager: &mut RunStateManager,
    proposals: Vec<Proposal>,
    ctx: &mut ProcessContext,
) -> crate::error::EngineResult<()> {
    let config = manager.require()?.config.clone();
    let project_id = manager.require()?.project_id.clone();
    let outcome = run_pipeline(
        proposals,
        &config,
        &project_id,
        ctx.existing_titles,
        ctx.dedup_store,
        ctx.max_proposals,
        &*ctx.id_gen,
    );
    ctx.tickets.extend(outcome.tickets);
    Ok(())
}

fn handle_plan_submitted(manager: &mut RunStateManager, payload: serde_json::Value) -> crate::error::EngineResult<ProcessedOutcome> {
    let plan_text = payload.get("plan").and_then(|v| v.as_str()).unwrap_or_default();
    let line_count = plan_text.lines().count() as u32;
    let run = manager.require_mut()?;
    if line_count > 2000 {
        run.plan_rejections += 1;
        run.last_plan_rejection_reason = Some("plan exceeds hard line limit".into());
        return Ok(outcome(false, None, "plan rejected: too long"));
    }
    run.plan_approved = true;
    run.phase = Phase::Execute;
    Ok(outcome(true, Some(Phase::Execute), "plan approved"))
}

fn handle_ticket_result(
    manager: &mut RunStateManager,
    payload: serde_json::Value,
    ctx: &mut ProcessContext,
) -> crate::error::EngineResult<ProcessedOutcome> {
    let status = payload.get("status").and_then(|v| v.as_str()).unwrap_or("failed");
    let run = manager.require_mut()?;
    match status {
        "done" | "success" => {
            run.phase = Phase::Qa;
            Ok(outcome(true, Some(Phase::Qa), "ticket succeeded, entering QA"))
        }
        _ => {
            run.tickets_failed += 1;
            run.phase = Phase::NextTicket;
            if let Some(ticket_id) = run.current_ticket_id.clone() {
                if let Some(t) = ctx.tickets.iter_mut().find(|t| t.id == ticket_id) {
                    t.mark_blocked(payload.get("message").and_then(|v| v.as_str()).unwrap_or("ticket failed"));
                }
                run.tickets_blocked += 1;
            }
            Ok(outcome(true, Some(Phase::NextTicket), "ticket failed"))
        }
    }
}

fn handle_qa_passed(manager: &mut RunStateManager, ctx: &mut ProcessContext) -> crate::error::EngineResult<ProcessedOutcome> {
    let run = manager.require_mut()?;
    if run.config.create_prs {
        run.phase = Phase::Pr;
        Ok(outcome(true, Some(Phase::Pr), "QA passed, creating PR"))
    } else {
        run.tickets_completed += 1;
        run.phase = Phase::NextTicket;
        if let Some(ticket_id) = run.current_ticket_id.clone() {
            if let Some(t) = ctx.tickets.iter_mut().find(|t| t.id == ticket_id) {
                let _ = t.transition(TicketStatus::Done);
            }
        }
        Ok(outcome(true, Some(Phase::NextTicket), "QA passed, ticket done"))
    }
}

fn handle_qa_failed(manager: &mut RunStateManager, payload: serde_json::Value) -> crate::error::EngineResult<ProcessedOutcome> {
    let class_str = payload.get("class").and_then(|v| v.as_str()).unwrap_or("code");
    let class = match class_str {
        "environment" => QaFailureClass::Environment,
        "timeout" => QaFailureClass::Timeout,
        _ => QaFailureClass::Code,
    };
    let message = payload.get("message").and_then(|v| v.as_str()).unwrap_or("qa failed").to_string();
    let run = manager.require_mut()?;
    run.last_qa_failure = Some(message);
    run.qa_retries += 1;
    if run.qa_retries <= class.max_retries() {
        run.phase = Phase::Execute;
        Ok(outcome(true, Some(Phase::Execute), "qa failed, retrying"))
    } else {
        run.tickets_blocked += 1;
        run.phase = Phase::NextTicket;
        Ok(outcome(true, Some(Phase::NextTicket), "qa failed, ticket blocked"))
    }
}

fn handle_pr_created(
    manager: &mut RunStateManager,
    payload: serde_json::Value,
    ctx: &mut ProcessContext,
) -> crate::error::EngineResult<ProcessedOutcome> {
    let url = payload.get("pr_url").and_then(|v| v.as_str()).map(String::from);
    let run = manager.require_mut()?;
    run.prs_created += 1;
    run.tickets_completed += 1;
    let current_ticket_id = run.current_ticket_id.clone();
    if let (Some(worker_id), Some(u)) = (current_ticket_id.clone(), url) {
        if let Some(w) = run.ticket_workers.get_mut(&worker_id) {
            w.pr_url = Some(u);
        }
    }
    run.phase = Phase::NextTicket;
    if let Some(ticket_id) = current_ticket_id {
        if let Some(t) = ctx.tickets.iter_mut().find(|t| t.id == ticket_id) {
            let _ = t.transition(TicketStatus::Done);
        }
    }
    Ok(outcome(true, Some(Phase::NextTicket), "pr created"))
}

fn handle_user_override(
    manager: &mut RunStateManager,
    payload: serde_json::Value,
    ctx: &mut ProcessContext,
) -> crate::error::EngineResult<ProcessedOutcome> {
    if let Some(hint) = payload.get("hint").and_then(|v| v.as_str()) {
        manager.require_mut()?.hints.push(hint.to_string());
        return Ok(outcome(false, None, "hint recorded"));
    }
    if payload.get("cancel").and_then(|v| v.as_bool()).unwrap_or(false) {
        manager.require_mut()?.phase = Phase::Done;
        return Ok(outcome(true, Some(Phase::Done), "cancelled by user"));
    }
    if let Some(skip) = payload.get("skip_review").and_then(|v| v.as_bool()) {
        let pending = manager.require()?.pending_proposals.clone();
        manager.require_mut()?.config.skip_review = skip;
        if skip && pending.is_some() {
            let proposals: Vec<Proposal> = pending
                .as_ref()
                .and_then(|p| p.get("proposals"))
                .and_then(|v| serde_json::from_value(v.clone()).ok())
                .unwrap_or_default();
            manager.require_mut()?.pending_proposals = None;
            materialize_proposals(manager, proposals, ctx)?;
            manager.require_mut()?.phase = Phase::NextTicket;
            return Ok(outcome(true, Some(Phase::NextTicket), "pending flushed after skip_review"));
        }
        return Ok(outcome(false, None, "skip_review updated"));
    }
    Ok(outcome(false, None, "override recorded"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RunConfig;
    use crate::paths::ProjectPaths;
    use tempfile::tempdir;

    fn manager_with_run(dir: &std::path::Path) -> RunStateManager {
        let mut m = RunStateManager::new(ProjectPaths::new(dir));
        m.create("proj", RunConfig::default()).unwrap();
        m
    }

    fn ctx<'a>(tickets: &'a mut Vec<Ticket>, dedup: &'a mut DedupStore, qa: &'a mut QaStats) -> ProcessContext<'a> {
        ProcessContext {
            tickets,
            dedup_store: dedup,
            qa_stats: qa,
            existing_titles: &[],
            max_proposals: 10,
            id_gen: Box::new(|i| format!("t-{i}")),
        }
    }

    #[test]
    fn scout_output_with_proposals_goes_to_pending_review() {
        let dir = tempdir().unwrap();
        let mut m = manager_with_run(dir.path());
        let mut tickets = vec![];
        let mut dedup = DedupStore::default();
        let mut qa = QaStats::default();
        let mut c = ctx(&mut tickets, &mut dedup, &mut qa);
        let payload = json!({ "proposals": [{
            "category": "fix", "title": "Fix bug", "description": "desc",
            "confidence": 80, "impact_score": 5, "risk": "low"
        }]});
        let result = process_event(&mut m, EventType::ScoutOutput, payload, &mut c).unwrap();
        assert!(!result.phase_changed);
        assert!(m.require().unwrap().pending_proposals.is_some());
    }

    #[test]
    fn scout_output_empty_retries_then_completes() {
        let dir = tempdir().unwrap();
        let mut m = manager_with_run(dir.path());
        let mut tickets = vec![];
        let mut dedup = DedupStore::default();
        let mut qa = QaStats::default();
        for _ in 0..3 {
            let mut c = ctx(&mut tickets, &mut dedup, &mut qa);
            process_event(&mut m, EventType::ScoutOutput, json!({"proposals": []}), &mut c).unwrap();
        }
        let mut c = ctx(&mut tickets, &mut dedup, &mut qa);
        let result = process_event(&mut m, EventType::ScoutOutput, json!({"proposals": []}), &mut c).unwrap();
        assert_eq!(result.new_phase.as_deref(), Some("DONE"));
    }

    #[test]
    fn plan_submitted_sets_approved_and_execute() {
        let dir = tempdir().unwrap();
        let mut m = manager_with_run(dir.path());
        let mut tickets = vec![];
        let mut dedup = DedupStore::default();
        let mut qa = QaStats::default();
        let mut c = ctx(&mut tickets, &mut dedup, &mut qa);
        let result = process_event(&mut m, EventType::PlanSubmitted, json!({"plan": "do the thing"}), &mut c).unwrap();
        assert_eq!(result.new_phase.as_deref(), Some("EXECUTE"));
        assert!(m.require().unwrap().plan_approved);
    }

    #[test]
    fn qa_failed_under_retry_limit_goes_back_to_execute() {
        let dir = tempdir().unwrap();
        let mut m = manager_with_run(dir.path());
        let mut tickets = vec![];
        let mut dedup = DedupStore::default();
        let mut qa = QaStats::default();
        let mut c = ctx(&mut tickets, &mut dedup, &mut qa);
        let result = process_event(&mut m, EventType::QaFailed, json!({"class": "code", "message": "test failed"}), &mut c).unwrap();
        assert_eq!(result.new_phase.as_deref(), Some("EXECUTE"));
    }

    #[test]
    fn qa_failed_over_retry_limit_blocks_ticket() {
        let dir = tempdir().unwrap();
        let mut m = manager_with_run(dir.path());
        let mut tickets = vec![];
        let mut dedup = DedupStore::default();
        let mut qa = QaStats::default();
        for _ in 0..4 {
            let mut c = ctx(&mut tickets, &mut dedup, &mut qa);
            process_event(&mut m, EventType::QaFailed, json!({"class": "environment"}), &mut c).unwrap();
        }
        assert_eq!(m.require().unwrap().phase, Phase::NextTicket);
        assert!(m.require().unwrap().tickets_blocked >= 1);
    }

    #[test]
    fn pr_created_increments_counters() {
        let dir = tempdir().unwrap();
        let mut m = manager_with_run(dir.path());
        let mut tickets = vec![];
        let mut dedup = DedupStore::default();
        let mut qa = QaStats::default();
        let mut c = ctx(&mut tickets, &mut dedup, &mut qa);
        process_event(&mut m, EventType::PrCreated, json!({"pr_url": "https://x/1"}), &mut c).unwrap();
        assert_eq!(m.require().unwrap().prs_created, 1);
        assert_eq!(m.require().unwrap().tickets_completed, 1);
    }

    #[test]
    fn user_override_cancel_sets_done() {
        let dir = tempdir().unwrap();
        let mut m = manager_with_run(dir.path());
        let mut tickets = vec![];
        let mut dedup = DedupStore::default();
        let mut qa = QaStats::default();
        let mut c = ctx(&mut tickets, &mut dedup, &mut qa);
        let result = process_event(&mut m, EventType::UserOverride, json!({"cancel": true}), &mut c).unwrap();
        assert_eq!(result.new_phase.as_deref(), Some("DONE"));
    }
}
