//! Host-hook handlers the Claude Code harness invokes around the agent
//! (spec §6 "PreToolUse"/"Stop host-hook contract").
//!
//! Both hooks read a single JSON object from stdin and, when they have
//! something to say, write a decision JSON object to stdout. Silence means
//! allow.

use std::io::{self, Read, Write};
use std::path::PathBuf;

use anyhow::Result;
use blockspool_engine::eventlog::{clear_loop_state, read_loop_state};
use blockspool_engine::scope::ScopePolicy;
use blockspool_engine::ProjectPaths;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;

/// Tools that write to the filesystem and therefore need a scope check
/// before they run.
const WRITE_LIKE_TOOLS: &[&str] = &["Write", "Edit", "MultiEdit", "NotebookEdit"];

#[derive(Default, Deserialize)]
struct PreToolUseInput {
    tool_name: Option<String>,
    #[serde(default)]
    tool_input: Option<Value>,
}

#[derive(Serialize)]
struct PreToolUseOutput {
    decision: String,
    reason: String,
}

#[derive(Default, Deserialize)]
struct StopHookInput {
    #[serde(default)]
    stop_hook_active: bool,
}

#[derive(Serialize)]
struct StopHookOutput {
    decision: String,
    reason: String,
}

fn read_hook_input<T: DeserializeOwned + Default>() -> Result<T> {
    let mut input_json = String::new();
    io::stdin().read_to_string(&mut input_json)?;
    Ok(serde_json::from_str(&input_json).unwrap_or_default())
}

fn write_decision<T: Serialize>(decision: &T) -> Result<()> {
    let json = serde_json::to_string(decision)?;
    io::stdout().write_all(json.as_bytes())?;
    io::stdout().flush()?;
    Ok(())
}

/// Extracts the file path a tool call would write to, if any.
fn write_target(tool_input: &Value) -> Option<&str> {
    tool_input
        .get("file_path")
        .or_else(|| tool_input.get("path"))
        .and_then(|v| v.as_str())
}

pub fn run_pretooluse(project_root: &PathBuf) -> Result<()> {
    let input: PreToolUseInput = read_hook_input()?;

    let Some(tool_name) = input.tool_name.as_deref() else {
        return Ok(());
    };
    if !WRITE_LIKE_TOOLS.contains(&tool_name) {
        return Ok(());
    }
    let Some(tool_input) = input.tool_input.as_ref() else {
        return Ok(());
    };
    let Some(path) = write_target(tool_input) else {
        return Ok(());
    };

    // The MCP server persists the active ticket's resolved policy to
    // active-scope.json on every advance()/ingest_event() call, since this
    // hook runs as its own subprocess with no access to the session.
    let paths = ProjectPaths::new(project_root);
    let policy = std::fs::read_to_string(paths.active_scope_file())
        .ok()
        .and_then(|s| serde_json::from_str::<ScopePolicy>(&s).ok())
        .unwrap_or_else(|| ScopePolicy::new(vec![], vec![], blockspool_engine::scope::DEFAULT_MAX_LINES_PER_TICKET));

    if policy.is_file_allowed(path) == blockspool_engine::scope::ScopeDecision::Blocked {
        write_decision(&PreToolUseOutput {
            decision: "deny".to_string(),
            reason: format!("{path} is outside the ticket's allowed scope"),
        })?;
    }

    Ok(())
}

pub fn run_stop(project_root: &PathBuf) -> Result<()> {
    let input: StopHookInput = read_hook_input()?;
    if input.stop_hook_active {
        return Ok(());
    }

    let paths = ProjectPaths::new(project_root);
    let loop_state_path = paths.loop_state_file();

    match read_loop_state(&loop_state_path).map_err(|e| anyhow::anyhow!(e.to_string()))? {
        Some(state) => {
            let terminal = matches!(
                state.phase.as_str(),
                "DONE" | "FAILED_BUDGET" | "FAILED_VALIDATION" | "FAILED_SPINDLE" | "BLOCKED_NEEDS_HUMAN"
            );
            if terminal {
                clear_loop_state(&loop_state_path).map_err(|e| anyhow::anyhow!(e.to_string()))?;
            } else {
                write_decision(&StopHookOutput {
                    decision: "block".to_string(),
                    reason: format!("session still in phase {}; call advance() before stopping", state.phase),
                })?;
            }
        }
        None => {}
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_target_reads_file_path_field() {
        let input = serde_json::json!({"file_path": "src/main.rs"});
        assert_eq!(write_target(&input), Some("src/main.rs"));
    }

    #[test]
    fn write_target_falls_back_to_path_field() {
        let input = serde_json::json!({"path": "src/lib.rs"});
        assert_eq!(write_target(&input), Some("src/lib.rs"));
    }

    #[test]
    fn write_target_missing_when_absent() {
        let input = serde_json::json!({"command": "ls"});
        assert_eq!(write_target(&input), None);
    }
}
