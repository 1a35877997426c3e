//! MCP tool surface consumed by the external agent (spec §6).
//!
//! Each tool is a thin shim: decode the request, take the session lock,
//! call into `blockspool-engine`, serialize the response. The engine owns
//! every state transition; this module owns none.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use blockspool_engine::{
    advance, process_event, AdvanceContext, ConfigOverrides, Formula, NextAction, ProcessContext,
    ProjectPaths, RunConfig, RunStateManager, Ticket,
};
use rmcp::{
    handler::server::wrapper::Parameters,
    model::{ServerCapabilities, ServerInfo},
    schemars, tool, tool_router, ServerHandler,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The active project's open session, if one has been started. A session is
/// a single in-memory `RunStateManager` plus the ticket backlog it is
/// working through; both are persisted to `.blockspool/` on every mutation.
struct SessionState {
    manager: RunStateManager,
    tickets: Vec<Ticket>,
    dedup_store: blockspool_engine::dedup::DedupStore,
    qa_stats: blockspool_engine::qa::QaStats,
}

fn load_json_or_default<T: serde::de::DeserializeOwned + Default>(path: &std::path::Path) -> T {
    std::fs::read_to_string(path)
        .ok()
        .and_then(|s| serde_json::from_str(&s).ok())
        .unwrap_or_default()
}

/// The active ticket's resolved scope policy, looked up from in-memory
/// session state. `None` if no session is running or no ticket is active
/// (parallel mode has several tickets in flight at once with no single
/// "active" one — callers fall back to the default-deny-only policy).
fn active_scope_policy(session: &SessionState) -> Option<blockspool_engine::scope::ScopePolicy> {
    let run = session.manager.require().ok()?;
    let ticket_id = run.current_ticket_id.as_ref()?;
    session.tickets.iter().find(|t| &t.id == ticket_id).map(blockspool_engine::scope::ScopePolicy::for_ticket)
}

/// Writes the active ticket's scope policy to `.blockspool/active-scope.json`
/// so the hook process (a fresh subprocess per invocation, with no access to
/// this session) can enforce the same policy `get_scope_policy` reports.
fn persist_active_scope_policy(paths: &ProjectPaths, session: &SessionState) -> Result<(), String> {
    let policy = active_scope_policy(session)
        .unwrap_or_else(|| blockspool_engine::scope::ScopePolicy::new(vec![], vec![], blockspool_engine::scope::DEFAULT_MAX_LINES_PER_TICKET));
    let json = serde_json::to_string_pretty(&policy).map_err(|e| e.to_string())?;
    blockspool_engine::paths::atomic_write(&paths.active_scope_file(), json.as_bytes()).map_err(|e| e.to_string())
}

#[derive(Clone)]
pub struct BlockSpoolServer {
    project_root: PathBuf,
    state: Arc<Mutex<Option<SessionState>>>,
}

/// Globs forbidden for every category regardless of a ticket's own scope,
/// mirrored here for `get_scope_policy` reporting (engine's copy is the one
/// actually enforced in `scope::ScopePolicy::is_file_allowed`).
const DEFAULT_DENY_GLOBS: &[&str] = &[".env", ".env.*", "node_modules/**", ".git/**", "**/*.pem", "**/*.key"];

/// Renders a phase the way every wire response spells it: `SCREAMING_SNAKE_CASE`
/// via `Phase`'s own serde rename, not `{:?}`'s bare Rust variant name.
fn phase_str(phase: impl Serialize) -> String {
    serde_json::to_value(phase)
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_default()
}

impl BlockSpoolServer {
    pub fn new(project_root: PathBuf) -> Self {
        Self {
            project_root,
            state: Arc::new(Mutex::new(None)),
        }
    }

    fn with_session<T>(&self, f: impl FnOnce(&mut SessionState) -> Result<T, String>) -> Result<T, String> {
        let mut guard = self.state.lock().map_err(|e| format!("lock error: {e}"))?;
        let session = guard.as_mut().ok_or_else(|| "no active session".to_string())?;
        f(session)
    }
}

#[derive(Debug, Default, Deserialize, schemars::JsonSchema)]
struct StartSessionRequest {
    #[schemars(description = "Name of a formula YAML under .blockspool/formulas/ to layer over defaults")]
    formula: Option<String>,
    #[schemars(description = "Categories to restrict scouting to, overriding the formula/default list")]
    categories: Option<Vec<String>>,
    #[schemars(description = "Minimum impact score (1-10) a proposal must clear to become a ticket")]
    min_impact_score: Option<u8>,
    #[schemars(description = "Open pull requests for completed tickets instead of finishing silently")]
    create_prs: Option<bool>,
    #[schemars(description = "Open PRs as drafts")]
    draft: Option<bool>,
    #[schemars(description = "Number of tickets to run concurrently (parallel mode)")]
    parallel: Option<u32>,
    #[schemars(description = "Skip the adversarial proposal-review round")]
    skip_review: Option<bool>,
    #[schemars(description = "Total step budget for the session")]
    step_budget: Option<u32>,
    #[schemars(description = "Per-ticket step budget before BLOCKED_NEEDS_HUMAN")]
    ticket_step_budget: Option<u32>,
    #[schemars(description = "Maximum pull requests to open before finishing")]
    max_prs: Option<u32>,
    #[schemars(description = "Plan actions without performing any writes")]
    dry_run: Option<bool>,
}

impl From<&StartSessionRequest> for ConfigOverrides {
    fn from(req: &StartSessionRequest) -> Self {
        ConfigOverrides {
            categories: req.categories.clone(),
            min_impact_score: req.min_impact_score,
            min_confidence: None,
            create_prs: req.create_prs,
            draft: req.draft,
            direct: None,
            parallel: req.parallel,
            cross_verify: None,
            skip_review: req.skip_review,
            learnings_enabled: None,
            qa_commands: None,
            step_budget: req.step_budget,
            ticket_step_budget: req.ticket_step_budget,
            max_prs: req.max_prs,
            dry_run: req.dry_run,
        }
    }
}

#[derive(Debug, Serialize, schemars::JsonSchema)]
struct StartSessionResponse {
    run_id: String,
    session_id: String,
    phase: String,
    step_budget: u32,
    expires_at: Option<chrono::DateTime<chrono::Utc>>,
    warnings: Vec<String>,
}

#[derive(Debug, Default, Deserialize, schemars::JsonSchema)]
struct AdvanceRequest {}

#[derive(Debug, Serialize, schemars::JsonSchema)]
struct AdvanceResponse {
    next_action: String,
    phase: String,
    prompt: Option<String>,
    constraints: Value,
    digest: Value,
    reason: Option<String>,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
struct IngestEventRequest {
    #[schemars(description = "Event type, e.g. TICKET_RESULT, QA_PASSED, SCOUT_OUTPUT")]
    r#type: String,
    #[schemars(description = "Event payload, shape depends on type")]
    payload: Value,
}

#[derive(Debug, Serialize, schemars::JsonSchema)]
struct IngestEventResponse {
    processed: bool,
    phase_changed: bool,
    new_phase: Option<String>,
    message: String,
    step: u32,
    current_phase: String,
}

#[derive(Debug, Default, Deserialize, schemars::JsonSchema)]
struct SessionStatusRequest {}

#[derive(Debug, Serialize, schemars::JsonSchema)]
struct SessionStatusResponse {
    phase: String,
    digest: Value,
    budget_warnings: Vec<Value>,
    last_qa_failure: Option<String>,
    last_plan_rejection: Option<String>,
}

#[derive(Debug, Default, Deserialize, schemars::JsonSchema)]
struct EndSessionRequest {}

#[derive(Debug, Serialize, schemars::JsonSchema)]
struct EndSessionResponse {
    run_id: String,
    phase: String,
    tickets_completed: u32,
    tickets_failed: u32,
    prs_created: u32,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
struct AdvanceTicketRequest {
    #[schemars(description = "Ticket id of the worker to advance")]
    ticket_id: String,
}

#[derive(Debug, Serialize, schemars::JsonSchema)]
struct AdvanceTicketResponse {
    kind: String,
    phase: Option<String>,
    body: Option<String>,
    pr_url: Option<String>,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
struct TicketEventRequest {
    ticket_id: String,
    r#type: String,
    payload: Value,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
struct GetScopePolicyRequest {
    #[schemars(description = "If set, also report whether this path is currently allowed")]
    file_path: Option<String>,
}

#[derive(Debug, Serialize, schemars::JsonSchema)]
struct GetScopePolicyResponse {
    forbidden_globs: Vec<String>,
    allowed: Option<bool>,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
struct NudgeRequest {
    #[schemars(description = "A freeform hint injected into the next prompt")]
    hint: String,
}

#[derive(Debug, Default, Deserialize, schemars::JsonSchema)]
struct ListFormulasRequest {}

#[derive(Debug, Serialize, schemars::JsonSchema)]
struct ListFormulasResponse {
    formulas: Vec<String>,
}

#[tool_router]
impl BlockSpoolServer {
    #[tool(
        description = "Start a new orchestration session for this project, layering an optional formula and explicit overrides over the built-in defaults. Call once at the beginning of an agent run."
    )]
    async fn start_session(&self, Parameters(req): Parameters<StartSessionRequest>) -> Result<String, String> {
        let paths = ProjectPaths::new(&self.project_root);
        let formula = match &req.formula {
            Some(name) => Some(Formula::load(&paths.formula_file(name)).map_err(|e| e.to_string())?),
            None => None,
        };
        let overrides = ConfigOverrides::from(&req);
        let config = RunConfig::compose(formula.as_ref(), &overrides);
        let dedup_store = load_json_or_default(&paths.dedup_file());
        let qa_stats = load_json_or_default(&paths.qa_stats_file());
        let mut manager = RunStateManager::new(paths);
        let run = manager.create(&self.project_root.display().to_string(), config).map_err(|e| e.to_string())?;
        let response = StartSessionResponse {
            run_id: run.run_id.clone(),
            session_id: run.session_id.clone(),
            phase: phase_str(run.phase),
            step_budget: run.config.step_budget,
            expires_at: run.expires_at,
            warnings: Vec::new(),
        };

        let mut guard = self.state.lock().map_err(|e| format!("lock error: {e}"))?;
        *guard = Some(SessionState { manager, tickets: Vec::new(), dedup_store, qa_stats });
        drop(guard);

        serde_json::to_string_pretty(&response).map_err(|e| e.to_string())
    }

    #[tool(
        description = "Advance the session's state machine by one step, producing either the next prompt for the agent or a STOP with the terminal reason."
    )]
    async fn advance(&self, Parameters(_req): Parameters<AdvanceRequest>) -> Result<String, String> {
        let paths = ProjectPaths::new(&self.project_root);
        self.with_session(|session| {
            let mut ctx = AdvanceContext {
                tickets: &mut session.tickets,
                scouted_this_cycle: false,
            };
            let result = advance(&mut session.manager, &mut ctx).map_err(|e| e.to_string())?;
            let (next_action, prompt, constraints, reason) = match result.action {
                NextAction::Prompt { body, constraints } => ("PROMPT".to_string(), Some(body), constraints, None),
                NextAction::Stop { reason, .. } => ("STOP".to_string(), None, Value::Null, reason),
            };
            let response = AdvanceResponse {
                next_action,
                phase: phase_str(result.phase),
                prompt,
                constraints,
                digest: serde_json::to_value(&result.digest).unwrap_or(Value::Null),
                reason,
            };
            let json = serde_json::to_string_pretty(&response).map_err(|e| e.to_string())?;
            persist_active_scope_policy(&paths, session)?;
            Ok(json)
        })
    }

    #[tool(
        description = "Report an event from the agent (TICKET_RESULT, QA_PASSED, QA_FAILED, SCOUT_OUTPUT, PLAN_SUBMITTED, PR_CREATED, ...). The engine updates run state and returns whether the phase changed."
    )]
    async fn ingest_event(&self, Parameters(req): Parameters<IngestEventRequest>) -> Result<String, String> {
        let paths = ProjectPaths::new(&self.project_root);
        self.with_session(|session| {
            let event_type: blockspool_engine::EventType = serde_json::from_value(Value::String(req.r#type.clone()))
                .map_err(|e| format!("unknown event type {}: {e}", req.r#type))?;
            let existing_titles: Vec<String> = session.tickets.iter().map(|t| t.title.clone()).collect();
            let counter = session.tickets.len();
            let step_budget = session.manager.require().map(|r| r.config.step_budget).unwrap_or(10) as usize;
            let mut ctx = ProcessContext {
                tickets: &mut session.tickets,
                dedup_store: &mut session.dedup_store,
                qa_stats: &mut session.qa_stats,
                existing_titles: &existing_titles,
                max_proposals: step_budget,
                id_gen: Box::new(move |i| format!("t-{}", counter + i)),
            };
            let outcome = process_event(&mut session.manager, event_type, req.payload, &mut ctx).map_err(|e| e.to_string())?;
            drop(ctx);
            let run = session.manager.require().map_err(|e| e.to_string())?;
            let response = IngestEventResponse {
                processed: outcome.processed,
                phase_changed: outcome.phase_changed,
                new_phase: outcome.new_phase,
                message: outcome.message,
                step: run.step_count,
                current_phase: phase_str(run.phase),
            };
            let json = serde_json::to_string_pretty(&response).map_err(|e| e.to_string())?;

            let dedup_json = serde_json::to_string_pretty(&session.dedup_store).map_err(|e| e.to_string())?;
            blockspool_engine::paths::atomic_write(&paths.dedup_file(), dedup_json.as_bytes()).map_err(|e| e.to_string())?;
            let qa_json = serde_json::to_string_pretty(&session.qa_stats).map_err(|e| e.to_string())?;
            blockspool_engine::paths::atomic_write(&paths.qa_stats_file(), qa_json.as_bytes()).map_err(|e| e.to_string())?;
            persist_active_scope_policy(&paths, session)?;

            Ok(json)
        })
    }

    #[tool(
        description = "Report the current session phase, digest, and recent warnings without mutating state.",
        annotations(read_only_hint = true)
    )]
    async fn session_status(&self, Parameters(_req): Parameters<SessionStatusRequest>) -> Result<String, String> {
        self.with_session(|session| {
            let run = session.manager.require().map_err(|e| e.to_string())?;
            let digest = serde_json::json!({
                "step": run.step_count,
                "phase": phase_str(run.phase),
                "tickets_completed": run.tickets_completed,
                "tickets_failed": run.tickets_failed,
                "budget_remaining": run.budget_remaining(),
            });
            let events = session.manager.event_log().map_err(|e| e.to_string())?.read_all().map_err(|e| e.to_string())?;
            let budget_warnings: Vec<Value> = events
                .iter()
                .filter(|e| e.event_type == blockspool_engine::EventType::BudgetWarning)
                .map(|e| e.payload.clone())
                .collect();
            let response = SessionStatusResponse {
                phase: phase_str(run.phase),
                digest,
                budget_warnings,
                last_qa_failure: run.last_qa_failure.clone(),
                last_plan_rejection: run.last_plan_rejection_reason.clone(),
            };
            serde_json::to_string_pretty(&response).map_err(|e| e.to_string())
        })
    }

    #[tool(
        description = "Finalize the session: clears loop-state and returns a summary. Call when the state machine reports STOP."
    )]
    async fn end_session(&self, Parameters(_req): Parameters<EndSessionRequest>) -> Result<String, String> {
        let mut guard = self.state.lock().map_err(|e| format!("lock error: {e}"))?;
        let mut session = guard.take().ok_or_else(|| "no active session".to_string())?;
        let run = session.manager.end().map_err(|e| e.to_string())?;
        let response = EndSessionResponse {
            run_id: run.run_id,
            phase: phase_str(run.phase),
            tickets_completed: run.tickets_completed,
            tickets_failed: run.tickets_failed,
            prs_created: run.prs_created,
        };
        serde_json::to_string_pretty(&response).map_err(|e| e.to_string())
    }

    #[tool(
        description = "Advance a single ticket worker's mini state machine (parallel mode). Returns the worker's next prompt or completion."
    )]
    async fn advance_ticket(&self, Parameters(req): Parameters<AdvanceTicketRequest>) -> Result<String, String> {
        self.with_session(|session| {
            let worker = session
                .manager
                .get_ticket_worker(&req.ticket_id)
                .cloned()
                .ok_or_else(|| format!("no worker for ticket {}", req.ticket_id))?;
            let action = blockspool_engine::worker::advance_ticket_worker(&worker, worker.plan.as_deref());
            let response = match action {
                blockspool_engine::worker::WorkerAction::Prompt { phase, body } => AdvanceTicketResponse {
                    kind: "PROMPT".to_string(),
                    phase: Some(phase_str(phase)),
                    body: Some(body),
                    pr_url: None,
                },
                blockspool_engine::worker::WorkerAction::Completed { pr_url } => AdvanceTicketResponse {
                    kind: "COMPLETED".to_string(),
                    phase: None,
                    body: None,
                    pr_url,
                },
            };
            serde_json::to_string_pretty(&response).map_err(|e| e.to_string())
        })
    }

    #[tool(
        description = "Report an event scoped to a single ticket worker in parallel mode (PLAN_SUBMITTED, TICKET_RESULT, QA_PASSED, QA_FAILED, PR_CREATED)."
    )]
    async fn ticket_event(&self, Parameters(req): Parameters<TicketEventRequest>) -> Result<String, String> {
        let mut payload = req.payload;
        if let Value::Object(ref mut map) = payload {
            map.insert("ticket_id".to_string(), Value::String(req.ticket_id.clone()));
        }
        self.ingest_event(Parameters(IngestEventRequest { r#type: req.r#type, payload })).await
    }

    #[tool(
        description = "Report the active scope policy's forbidden globs, and optionally whether a specific path is currently allowed.",
        annotations(read_only_hint = true)
    )]
    async fn get_scope_policy(&self, Parameters(req): Parameters<GetScopePolicyRequest>) -> Result<String, String> {
        self.with_session(|session| {
            let policy = active_scope_policy(session)
                .unwrap_or_else(|| blockspool_engine::scope::ScopePolicy::new(vec![], vec![], blockspool_engine::scope::DEFAULT_MAX_LINES_PER_TICKET));
            let allowed = req.file_path.as_ref().map(|p| {
                matches!(policy.is_file_allowed(p), blockspool_engine::scope::ScopeDecision::Allowed)
            });
            let forbidden_globs = DEFAULT_DENY_GLOBS
                .iter()
                .map(|s| s.to_string())
                .chain(policy.forbidden_paths.iter().cloned())
                .collect();
            let response = GetScopePolicyResponse { forbidden_globs, allowed };
            serde_json::to_string_pretty(&response).map_err(|e| e.to_string())
        })
    }

    #[tool(description = "Inject a freeform hint that the next advance() prompt will surface to the agent.")]
    async fn nudge(&self, Parameters(req): Parameters<NudgeRequest>) -> Result<String, String> {
        self.with_session(|session| {
            session.manager.add_hint(req.hint).map_err(|e| e.to_string())?;
            Ok("{\"ok\":true}".to_string())
        })
    }

    #[tool(
        description = "List formula YAML names available under .blockspool/formulas/.",
        annotations(read_only_hint = true)
    )]
    async fn list_formulas(&self, Parameters(_req): Parameters<ListFormulasRequest>) -> Result<String, String> {
        let paths = ProjectPaths::new(&self.project_root);
        let dir = paths.formulas_dir();
        let mut formulas = Vec::new();
        if let Ok(entries) = std::fs::read_dir(&dir) {
            for entry in entries.flatten() {
                if let Some(stem) = entry.path().file_stem().and_then(|s| s.to_str()) {
                    formulas.push(stem.to_string());
                }
            }
        }
        formulas.sort();
        let response = ListFormulasResponse { formulas };
        serde_json::to_string_pretty(&response).map_err(|e| e.to_string())
    }
}

impl ServerHandler for BlockSpoolServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            instructions: Some(
                "BlockSpool orchestration engine MCP surface.\n\
                 Workflow: start_session -> advance (loop: PROMPT -> do work -> ingest_event) -> end_session.\n\
                 Parallel tickets: advance_ticket(ticket_id) / ticket_event(ticket_id, type, payload).\n\
                 Use get_scope_policy before any file write to confirm the path is in scope."
                    .to_string(),
            ),
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_reports_tool_instructions() {
        let server = BlockSpoolServer::new(PathBuf::from("."));
        let info = server.get_info();
        assert!(info.instructions.unwrap().contains("start_session"));
    }

    #[tokio::test]
    async fn advance_without_session_errors() {
        let server = BlockSpoolServer::new(PathBuf::from("."));
        let result = server.advance(Parameters(AdvanceRequest {})).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn start_then_status_reports_scout_phase() {
        let dir = tempfile::tempdir().unwrap();
        let server = BlockSpoolServer::new(dir.path().to_path_buf());
        server
            .start_session(Parameters(StartSessionRequest::default()))
            .await
            .unwrap();
        let status = server.session_status(Parameters(SessionStatusRequest {})).await.unwrap();
        assert!(status.contains("\"SCOUT\""));
    }
}
