//! End-to-end session lifecycle tests driving the public engine API the way
//! the MCP tool surface does: create a run, loop `advance`/`process_event`
//! through scout -> ticket -> plan -> execute -> qa -> pr -> done.

use blockspool_engine::dedup::DedupStore;
use blockspool_engine::qa::QaStats;
use blockspool_engine::{
    advance, process_event, AdvanceContext, ConfigOverrides, EventType, NextAction, Phase,
    ProcessContext, ProjectPaths, RunConfig, RunStateManager, Ticket,
};
use serde_json::json;
use tempfile::tempdir;

fn new_session(dir: &std::path::Path, overrides: ConfigOverrides) -> RunStateManager {
    let config = RunConfig::compose(None, &overrides);
    let mut manager = RunStateManager::new(ProjectPaths::new(dir));
    manager.create("proj", config).unwrap();
    manager
}

fn process(manager: &mut RunStateManager, tickets: &mut Vec<Ticket>, event_type: EventType, payload: serde_json::Value) {
    let mut dedup = DedupStore::default();
    let mut qa = QaStats::default();
    let counter = tickets.len();
    let mut ctx = ProcessContext {
        tickets,
        dedup_store: &mut dedup,
        qa_stats: &mut qa,
        existing_titles: &[],
        max_proposals: 10,
        id_gen: Box::new(move |i| format!("t-{}", counter + i)),
    };
    process_event(manager, event_type, payload, &mut ctx).unwrap();
}

#[test]
fn full_session_scouts_a_ticket_through_to_a_pull_request() {
    let dir = tempdir().unwrap();
    let mut tickets = Vec::new();
    let mut manager = new_session(
        dir.path(),
        ConfigOverrides {
            create_prs: Some(true),
            skip_review: Some(true),
            ..Default::default()
        },
    );

    // Scout phase: advance() prompts the agent to scout.
    let mut ctx = AdvanceContext { tickets: &mut tickets, scouted_this_cycle: false };
    let result = advance(&mut manager, &mut ctx).unwrap();
    assert!(matches!(result.action, NextAction::Prompt { .. }));
    assert_eq!(result.phase, Phase::Scout);

    // Agent reports a scout finding; skip_review materializes it directly.
    process(
        &mut manager,
        &mut tickets,
        EventType::ScoutOutput,
        json!({ "proposals": [{
            "category": "fix", "title": "Fix off-by-one", "description": "desc",
            "confidence": 80, "impact_score": 6, "risk": "low"
        }]}),
    );
    assert_eq!(manager.require().unwrap().phase, Phase::NextTicket);
    assert_eq!(tickets.len(), 1);

    // advance() should now pick the ticket and move it into PLAN.
    let mut ctx = AdvanceContext { tickets: &mut tickets, scouted_this_cycle: true };
    let result = advance(&mut manager, &mut ctx).unwrap();
    assert_eq!(result.phase, Phase::Plan);
    let ticket_id = manager.require().unwrap().current_ticket_id.clone().unwrap();

    // Agent submits a plan; engine approves and moves to EXECUTE.
    process(&mut manager, &mut tickets, EventType::PlanSubmitted, json!({ "plan": "do the fix" }));
    assert_eq!(manager.require().unwrap().phase, Phase::Execute);
    assert!(manager.require().unwrap().plan_approved);

    // Agent reports success; engine moves to QA.
    process(&mut manager, &mut tickets, EventType::TicketResult, json!({ "status": "success" }));
    assert_eq!(manager.require().unwrap().phase, Phase::Qa);

    // QA passes, and since create_prs is set, the engine moves to PR.
    process(&mut manager, &mut tickets, EventType::QaPassed, json!({}));
    assert_eq!(manager.require().unwrap().phase, Phase::Pr);

    // PR is opened; counters update and the engine returns to NEXT_TICKET.
    process(&mut manager, &mut tickets, EventType::PrCreated, json!({ "pr_url": "https://example.com/pr/1" }));
    let run = manager.require().unwrap();
    assert_eq!(run.phase, Phase::NextTicket);
    assert_eq!(run.prs_created, 1);
    assert_eq!(run.tickets_completed, 1);

    // No more ready tickets and we've already scouted this cycle -> DONE.
    if let Some(t) = tickets.iter_mut().find(|t| t.id == ticket_id) {
        t.status = blockspool_engine::TicketStatus::Done;
    }
    let mut ctx = AdvanceContext { tickets: &mut tickets, scouted_this_cycle: true };
    let result = advance(&mut manager, &mut ctx).unwrap();
    assert_eq!(result.phase, Phase::Done);

    let ended = manager.end().unwrap();
    assert_eq!(ended.phase, Phase::Done);
}

#[test]
fn ticket_failure_marks_it_blocked_and_returns_to_next_ticket() {
    let dir = tempdir().unwrap();
    let mut tickets = vec![Ticket::new("t-1", "proj", "Flaky fix", "desc", blockspool_engine::Category::Fix, 5)];
    tickets[0].status = blockspool_engine::TicketStatus::InProgress;
    let mut manager = new_session(dir.path(), ConfigOverrides::default());
    manager.require_mut().unwrap().current_ticket_id = Some("t-1".to_string());
    manager.require_mut().unwrap().phase = Phase::Execute;

    process(&mut manager, &mut tickets, EventType::TicketResult, json!({ "status": "failed", "message": "compile error" }));

    let run = manager.require().unwrap();
    assert_eq!(run.phase, Phase::NextTicket);
    assert_eq!(run.tickets_failed, 1);
    let ticket = tickets.iter().find(|t| t.id == "t-1").unwrap();
    assert_eq!(ticket.status, blockspool_engine::TicketStatus::Blocked);
    assert_eq!(ticket.last_error_snippet.as_deref(), Some("compile error"));
}

#[test]
fn budget_exhaustion_stops_the_session() {
    let dir = tempdir().unwrap();
    let mut tickets = Vec::new();
    let mut manager = new_session(
        dir.path(),
        ConfigOverrides { step_budget: Some(2), ..Default::default() },
    );

    let mut last_phase = Phase::Scout;
    for _ in 0..5 {
        let mut ctx = AdvanceContext { tickets: &mut tickets, scouted_this_cycle: false };
        let result = advance(&mut manager, &mut ctx).unwrap();
        last_phase = result.phase;
        if matches!(result.action, NextAction::Stop { .. }) {
            break;
        }
    }
    assert_eq!(last_phase, Phase::FailedBudget);
}

#[test]
fn scope_policy_blocks_paths_outside_ticket_allowance() {
    use blockspool_engine::scope::{ScopeDecision, ScopePolicy};

    let policy = ScopePolicy::new(vec!["src/engine/**".to_string()], vec![], 500);
    assert_eq!(policy.is_file_allowed("src/engine/worker.rs"), ScopeDecision::Allowed);
    assert_eq!(policy.is_file_allowed("src/cli/main.rs"), ScopeDecision::Blocked);
    assert_eq!(policy.is_file_allowed(".env"), ScopeDecision::Blocked);
}

#[test]
fn loop_state_round_trips_through_the_project_paths() {
    use blockspool_engine::eventlog::{clear_loop_state, read_loop_state, write_loop_state, LoopState};

    let dir = tempdir().unwrap();
    let paths = ProjectPaths::new(dir.path());
    let path = paths.loop_state_file();
    assert!(read_loop_state(&path).unwrap().is_none());

    let state = LoopState {
        run_id: "run-1".to_string(),
        phase: "EXECUTE".to_string(),
        updated_at: chrono::Utc::now(),
    };
    write_loop_state(&path, &state).unwrap();
    assert_eq!(read_loop_state(&path).unwrap().unwrap(), state);

    clear_loop_state(&path).unwrap();
    assert!(read_loop_state(&path).unwrap().is_none());
}
