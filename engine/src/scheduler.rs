//! Parallel ticket scheduler: dispatches up to N workers and serializes
//! main-repo git operations behind a cooperative mutex (spec §4.12).

use crate::git_controller::GitController;
use crate::run_state::{Phase, RunStateManager, WorkerState};
use crate::ticket::{Ticket, TicketStatus};
use std::sync::{Mutex, MutexGuard};

/// Serializes git calls against the main repository. Per-worktree
/// operations (after a worktree is created) do not need this — only calls
/// that touch the shared index.
#[derive(Default)]
pub struct GitMutex(Mutex<()>);

impl GitMutex {
    pub fn lock(&self) -> MutexGuard<'_, ()> {
        self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Select ready tickets to start, up to `min(parallel, ready_tickets)` minus
/// however many workers are already running.
pub fn tickets_to_dispatch<'a>(
    tickets: &'a [Ticket],
    active_worker_ids: &[String],
    parallel: u32,
) -> Vec<&'a Ticket> {
    let slots = (parallel as usize).saturating_sub(active_worker_ids.len());
    if slots == 0 {
        return Vec::new();
    }
    let mut ready: Vec<&Ticket> = tickets
        .iter()
        .filter(|t| t.status == TicketStatus::Ready && !active_worker_ids.contains(&t.id))
        .collect();
    ready.sort_by(|a, b| b.priority.cmp(&a.priority).then_with(|| a.created_at.cmp(&b.created_at)).then_with(|| a.id.cmp(&b.id)));
    ready.into_iter().take(slots).collect()
}

/// Start workers for every newly-dispatched ticket, flip their status to
/// `in_progress`, and — unless the run is in direct mode — give each its
/// own worktree under a dedicated branch so parallel workers never collide
/// on the main repo's index (spec §4.14).
pub fn dispatch(
    manager: &mut RunStateManager,
    tickets: &mut [Ticket],
    parallel: u32,
) -> crate::error::EngineResult<Vec<String>> {
    let active: Vec<String> = manager.require()?.ticket_workers.keys().cloned().collect();
    let to_start: Vec<String> = tickets_to_dispatch(tickets, &active, parallel)
        .into_iter()
        .map(|t| t.id.clone())
        .collect();

    let direct = manager.require()?.config.direct;
    let repo_root = manager.project_root().to_path_buf();
    let gc = GitController::new(repo_root, "origin");

    for id in &to_start {
        if let Some(t) = tickets.iter_mut().find(|t| &t.id == id) {
            t.transition(TicketStatus::InProgress)?;
        }
        manager.init_ticket_worker(id)?;
        if !direct {
            let branch = gc.branch_name_for(id);
            if gc.create_worktree(id, &branch).is_ok() {
                if let Some(w) = manager.get_ticket_worker_mut(id) {
                    w.branch_name = Some(branch);
                }
            }
        }
    }
    Ok(to_start)
}

/// Called when a worker reaches `Phase::Done`: merges its branch into the
/// milestone branch and removes its worktree (skipped for direct-mode runs,
/// which never created one), removes the worker, updates session counters,
/// and returns the completed `WorkerState` for reporting.
pub fn complete_worker(
    manager: &mut RunStateManager,
    ticket_id: &str,
    succeeded: bool,
) -> crate::error::EngineResult<Option<WorkerState>> {
    let direct = manager.require()?.config.direct;
    if succeeded && !direct {
        let repo_root = manager.project_root().to_path_buf();
        let gc = GitController::new(repo_root, "origin");
        if let Some(worker) = manager.get_ticket_worker(ticket_id) {
            if let Some(branch) = worker.branch_name.clone() {
                let _ = gc.merge_into_milestone("main", &branch);
            }
        }
        let _ = gc.remove_worktree(ticket_id);
    }
    let removed = manager.remove_ticket_worker(ticket_id)?;
    let run = manager.require_mut()?;
    if succeeded {
        run.tickets_completed += 1;
    } else {
        run.tickets_failed += 1;
    }
    Ok(removed)
}

pub fn is_worker_done(worker: &WorkerState) -> bool {
    worker.phase == Phase::Done
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RunConfig;
    use crate::paths::ProjectPaths;
    use crate::ticket::Category;
    use tempfile::tempdir;

    fn ready_ticket(id: &str, priority: u8) -> Ticket {
        Ticket::new(id, "proj", format!("Ticket {id}"), "desc", Category::Fix, priority)
    }

    #[test]
    fn dispatch_respects_parallel_cap() {
        let tickets = vec![ready_ticket("t-1", 5), ready_ticket("t-2", 5), ready_ticket("t-3", 5)];
        let picked = tickets_to_dispatch(&tickets, &[], 2);
        assert_eq!(picked.len(), 2);
    }

    #[test]
    fn dispatch_skips_already_active_tickets() {
        let tickets = vec![ready_ticket("t-1", 5), ready_ticket("t-2", 5)];
        let picked = tickets_to_dispatch(&tickets, &["t-1".to_string()], 2);
        assert_eq!(picked.len(), 1);
        assert_eq!(picked[0].id, "t-2");
    }

    #[test]
    fn higher_priority_dispatches_first() {
        let tickets = vec![ready_ticket("t-low", 1), ready_ticket("t-high", 9)];
        let picked = tickets_to_dispatch(&tickets, &[], 1);
        assert_eq!(picked[0].id, "t-high");
    }

    #[test]
    fn dispatch_flips_ticket_status_and_inits_worker() {
        let dir = tempdir().unwrap();
        let mut manager = RunStateManager::new(ProjectPaths::new(dir.path()));
        manager.create("proj", RunConfig::default()).unwrap();
        let mut tickets = vec![ready_ticket("t-1", 5)];
        let started = dispatch(&mut manager, &mut tickets, 2).unwrap();
        assert_eq!(started, vec!["t-1".to_string()]);
        assert_eq!(tickets[0].status, TicketStatus::InProgress);
        assert!(manager.get_ticket_worker("t-1").is_some());
    }

    #[test]
    fn complete_worker_updates_counters() {
        let dir = tempdir().unwrap();
        let mut manager = RunStateManager::new(ProjectPaths::new(dir.path()));
        manager.create("proj", RunConfig::default()).unwrap();
        manager.init_ticket_worker("t-1").unwrap();
        complete_worker(&mut manager, "t-1", true).unwrap();
        assert_eq!(manager.require().unwrap().tickets_completed, 1);
    }
}
