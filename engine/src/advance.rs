//! The phase state machine dispatcher: `advance()` (spec §4.9)
//!
//! Stateless over its inputs — each call reads the current `Run` and
//! ticket set and returns the next action without holding anything beyond
//! the borrow of the manager for the duration of the call.

use crate::eventlog::EventType;
use crate::run_state::{Phase, RunStateManager};
use crate::ticket::{Ticket, TicketStatus};
use serde::{Deserialize, Serialize};
use serde_json::json;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Digest {
    pub step: u32,
    pub phase: String,
    pub tickets_completed: u32,
    pub tickets_failed: u32,
    pub budget_remaining: u32,
}

#[derive(Debug, Clone)]
pub enum NextAction {
    Prompt { body: String, constraints: serde_json::Value },
    Stop { phase: Phase, reason: Option<String> },
}

#[derive(Debug, Clone)]
pub struct AdvanceResult {
    pub action: NextAction,
    pub phase: Phase,
    pub digest: Digest,
}

const BUDGET_WARNING_THRESHOLDS: [f64; 3] = [0.5, 0.8, 0.95];

fn digest(manager: &RunStateManager) -> crate::error::EngineResult<Digest> {
    let run = manager.require()?;
    Ok(Digest {
        step: run.step_count,
        phase: run.phase.as_wire_str().to_string(),
        tickets_completed: run.tickets_completed,
        tickets_failed: run.tickets_failed,
        budget_remaining: run.budget_remaining(),
    })
}

fn maybe_fire_budget_warning(manager: &mut RunStateManager) -> crate::error::EngineResult<()> {
    let (step_count, step_budget) = {
        let run = manager.require()?;
        (run.step_count, run.step_budget)
    };
    if step_budget == 0 {
        return Ok(());
    }
    let fraction = step_count as f64 / step_budget as f64;
    for threshold in BUDGET_WARNING_THRESHOLDS {
        // Fire once per threshold crossing: only on the exact step where the
        // fraction first reaches it.
        let prev_fraction = (step_count.saturating_sub(1)) as f64 / step_budget as f64;
        if prev_fraction < threshold && fraction >= threshold {
            manager.append_event(
                EventType::BudgetWarning,
                json!({ "threshold": threshold, "step_count": step_count, "step_budget": step_budget }),
            )?;
        }
    }
    Ok(())
}

/// Tie-break rule for ready tickets: higher priority, then older
/// `created_at`, then lexical id.
pub fn pick_next_ticket(tickets: &[Ticket]) -> Option<&Ticket> {
    tickets
        .iter()
        .filter(|t| t.status == TicketStatus::Ready)
        .max_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then_with(|| b.created_at.cmp(&a.created_at))
                .then_with(|| b.id.cmp(&a.id))
        })
}

pub struct AdvanceContext<'a> {
    pub tickets: &'a mut Vec<Ticket>,
    pub scouted_this_cycle: bool,
}

/// Run one `advance()` call against the active run.
pub fn advance(manager: &mut RunStateManager, ctx: &mut AdvanceContext) -> crate::error::EngineResult<AdvanceResult> {
    // 1. increment step_count; budget check
    {
        let run = manager.require_mut()?;
        run.step_count += 1;
        if run.step_count > run.step_budget {
            run.phase = Phase::FailedBudget;
        }
    }
    if manager.require()?.phase == Phase::FailedBudget {
        manager.persist()?;
        return Ok(AdvanceResult {
            action: NextAction::Stop {
                phase: Phase::FailedBudget,
                reason: Some("step budget exhausted".into()),
            },
            phase: Phase::FailedBudget,
            digest: digest(manager)?,
        });
    }

    // 2. expiry check
    if let Some(expires_at) = manager.require()?.expires_at {
        if chrono::Utc::now() > expires_at {
            manager.require_mut()?.phase = Phase::FailedBudget;
            manager.persist()?;
            return Ok(AdvanceResult {
                action: NextAction::Stop {
                    phase: Phase::FailedBudget,
                    reason: Some("time".into()),
                },
                phase: Phase::FailedBudget,
                digest: digest(manager)?,
            });
        }
    }

    // 3. terminal check
    let phase = manager.require()?.phase;
    if phase.is_terminal() {
        return Ok(AdvanceResult {
            action: NextAction::Stop { phase, reason: None },
            phase,
            digest: digest(manager)?,
        });
    }

    // 4. budget warnings
    maybe_fire_budget_warning(manager)?;

    // 5. dispatch
    let phase = manager.require()?.phase;
    let result = match phase {
        Phase::Scout => dispatch_scout(manager, ctx)?,
        Phase::NextTicket => dispatch_next_ticket(manager, ctx)?,
        Phase::Plan => dispatch_plan(manager)?,
        Phase::Execute => dispatch_execute(manager)?,
        Phase::Qa => dispatch_qa(manager)?,
        Phase::Pr => dispatch_pr(manager)?,
        Phase::ParallelExecute => dispatch_parallel_execute(manager, ctx)?,
        terminal => NextAction::Stop { phase: terminal, reason: None },
    };

    manager.persist()?;
    let phase = manager.require()?.phase;
    Ok(AdvanceResult {
        action: result,
        phase,
        digest: digest(manager)?,
    })
}

fn dispatch_scout(manager: &mut RunStateManager, ctx: &mut AdvanceContext) -> crate::error::EngineResult<NextAction> {
    let has_ready = ctx.tickets.iter().any(|t| t.status == TicketStatus::Ready);
    if has_ready {
        manager.require_mut()?.phase = Phase::NextTicket;
        return dispatch_next_ticket(manager, ctx);
    }
    let run = manager.require()?;
    Ok(NextAction::Prompt {
        body: "Scout the codebase for improvement opportunities.".into(),
        constraints: json!({
            "categories": run.config.categories,
            "hints": run.hints,
        }),
    })
}

fn dispatch_next_ticket(manager: &mut RunStateManager, ctx: &mut AdvanceContext) -> crate::error::EngineResult<NextAction> {
    let run = manager.require()?;
    if run.prs_created >= run.max_prs {
        manager.require_mut()?.phase = Phase::Done;
        return Ok(NextAction::Stop {
            phase: Phase::Done,
            reason: Some("max_prs reached".into()),
        });
    }
    let scouted = ctx.scouted_this_cycle;
    let next = pick_next_ticket(ctx.tickets).map(|t| t.id.clone());
    match next {
        None if scouted => {
            manager.require_mut()?.phase = Phase::Done;
            Ok(NextAction::Stop {
                phase: Phase::Done,
                reason: Some("no ready tickets after scout".into()),
            })
        }
        None => {
            manager.require_mut()?.phase = Phase::Scout;
            dispatch_scout(manager, ctx)
        }
        Some(id) => {
            if let Some(t) = ctx.tickets.iter_mut().find(|t| t.id == id) {
                t.transition(TicketStatus::InProgress)?;
            }
            let run = manager.require_mut()?;
            run.current_ticket_id = Some(id);
            run.plan_approved = false;
            run.phase = Phase::Plan;
            dispatch_plan(manager)
        }
    }
}

fn dispatch_plan(manager: &mut RunStateManager) -> crate::error::EngineResult<NextAction> {
    let run = manager.require()?;
    if run.plan_rejections >= 3 {
        manager.require_mut()?.phase = Phase::BlockedNeedsHuman;
        return Ok(NextAction::Stop {
            phase: Phase::BlockedNeedsHuman,
            reason: Some("too many plan rejections".into()),
        });
    }
    Ok(NextAction::Prompt {
        body: format!(
            "Submit a plan for ticket {}.",
            run.current_ticket_id.clone().unwrap_or_default()
        ),
        constraints: json!({ "plan_required": true }),
    })
}

fn dispatch_execute(manager: &mut RunStateManager) -> crate::error::EngineResult<NextAction> {
    let run = manager.require()?;
    if run.ticket_step_count >= run.ticket_step_budget {
        manager.require_mut()?.phase = Phase::BlockedNeedsHuman;
        return Ok(NextAction::Stop {
            phase: Phase::BlockedNeedsHuman,
            reason: Some("ticket step budget exhausted".into()),
        });
    }
    Ok(NextAction::Prompt {
        body: "Execute the committed plan.".into(),
        constraints: json!({}),
    })
}

fn dispatch_qa(manager: &mut RunStateManager) -> crate::error::EngineResult<NextAction> {
    let run = manager.require()?;
    Ok(NextAction::Prompt {
        body: "Run QA verification commands.".into(),
        constraints: json!({ "qa_commands": run.config.qa_commands }),
    })
}

fn dispatch_pr(_manager: &mut RunStateManager) -> crate::error::EngineResult<NextAction> {
    Ok(NextAction::Prompt {
        body: "Create a pull request for the completed ticket.".into(),
        constraints: json!({}),
    })
}

fn dispatch_parallel_execute(manager: &mut RunStateManager, ctx: &mut AdvanceContext) -> crate::error::EngineResult<NextAction> {
    let parallel = manager.require()?.config.parallel;
    let started = crate::scheduler::dispatch(manager, ctx.tickets, parallel)?;
    Ok(NextAction::Prompt {
        body: format!("Dispatching {} worker(s).", started.len()),
        constraints: json!({ "started_tickets": started }),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RunConfig;
    use crate::paths::ProjectPaths;
    use crate::ticket::Category;
    use tempfile::tempdir;

    fn manager_with_run(dir: &std::path::Path) -> RunStateManager {
        let mut m = RunStateManager::new(ProjectPaths::new(dir));
        m.create("proj", RunConfig::default()).unwrap();
        m
    }

    #[test]
    fn scout_with_no_tickets_emits_prompt() {
        let dir = tempdir().unwrap();
        let mut m = manager_with_run(dir.path());
        let mut tickets = vec![];
        let mut ctx = AdvanceContext { tickets: &mut tickets, scouted_this_cycle: false };
        let result = advance(&mut m, &mut ctx).unwrap();
        assert!(matches!(result.action, NextAction::Prompt { .. }));
    }

    #[test]
    fn over_budget_transitions_to_failed_budget() {
        let dir = tempdir().unwrap();
        let mut m = manager_with_run(dir.path());
        m.require_mut().unwrap().step_budget = 1;
        m.require_mut().unwrap().step_count = 1;
        let mut tickets = vec![];
        let mut ctx = AdvanceContext { tickets: &mut tickets, scouted_this_cycle: false };
        let result = advance(&mut m, &mut ctx).unwrap();
        assert_eq!(result.phase, Phase::FailedBudget);
    }

    #[test]
    fn ready_ticket_moves_to_plan_with_approval_reset() {
        let dir = tempdir().unwrap();
        let mut m = manager_with_run(dir.path());
        m.require_mut().unwrap().phase = Phase::NextTicket;
        m.require_mut().unwrap().plan_approved = true;
        let mut tickets = vec![Ticket::new("t-1", "proj", "Fix", "desc", Category::Fix, 5)];
        let mut ctx = AdvanceContext { tickets: &mut tickets, scouted_this_cycle: true };
        let result = advance(&mut m, &mut ctx).unwrap();
        assert_eq!(result.phase, Phase::Plan);
        assert!(!m.require().unwrap().plan_approved);
    }

    #[test]
    fn no_ready_tickets_after_scout_finishes_done() {
        let dir = tempdir().unwrap();
        let mut m = manager_with_run(dir.path());
        m.require_mut().unwrap().phase = Phase::NextTicket;
        let mut tickets = vec![];
        let mut ctx = AdvanceContext { tickets: &mut tickets, scouted_this_cycle: true };
        let result = advance(&mut m, &mut ctx).unwrap();
        assert_eq!(result.phase, Phase::Done);
    }

    #[test]
    fn plan_rejections_over_limit_blocks_needs_human() {
        let dir = tempdir().unwrap();
        let mut m = manager_with_run(dir.path());
        m.require_mut().unwrap().phase = Phase::Plan;
        m.require_mut().unwrap().plan_rejections = 3;
        let mut tickets = vec![];
        let mut ctx = AdvanceContext { tickets: &mut tickets, scouted_this_cycle: false };
        let result = advance(&mut m, &mut ctx).unwrap();
        assert_eq!(result.phase, Phase::BlockedNeedsHuman);
    }

    #[test]
    fn tie_break_prefers_older_ticket_on_equal_priority() {
        let mut a = Ticket::new("t-a", "proj", "A", "d", Category::Fix, 5);
        let mut b = Ticket::new("t-b", "proj", "B", "d", Category::Fix, 5);
        a.created_at = chrono::Utc::now() - chrono::Duration::days(1);
        b.created_at = chrono::Utc::now();
        let tickets = vec![a, b];
        assert_eq!(pick_next_ticket(&tickets).unwrap().id, "t-a");
    }
}
