//! Git / PR controller: worktree lifecycle, milestone merges, push-safety
//! gate, and PR creation/polling through an abstract forge (spec §4.14).
//!
//! Every call that touches the main repository's index must be made while
//! holding the session's [`crate::scheduler::GitMutex`]; calls scoped to a
//! worktree (after creation) do not need it.

use crate::error::{EngineError, EngineResult};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

const MAX_RETRIES: u32 = 3;
/// Spec §5 "Timeouts": git operations have a 10s default.
const DEFAULT_GIT_TIMEOUT: Duration = Duration::from_secs(10);

fn run_git(repo: &Path, args: &[&str]) -> EngineResult<String> {
    run_git_with_retry(repo, args, MAX_RETRIES, DEFAULT_GIT_TIMEOUT)
}

fn run_git_with_retry(repo: &Path, args: &[&str], retries_left: u32, timeout: Duration) -> EngineResult<String> {
    let (stdout, stderr, succeeded) = run_git_timed(repo, args, timeout)?;
    if succeeded {
        return Ok(stdout);
    }
    let err = EngineError::git(args.join(" "), stderr);
    if retries_left > 0 && err.is_retryable() {
        std::thread::sleep(backoff_delay(MAX_RETRIES - retries_left));
        return run_git_with_retry(repo, args, retries_left - 1, timeout);
    }
    Err(err)
}

/// Spawn `git`, poll for completion, and escalate to SIGKILL if it outlives
/// `timeout` — a hung `git push`/`merge` must not wedge the session forever.
fn run_git_timed(repo: &Path, args: &[&str], timeout: Duration) -> EngineResult<(String, String, bool)> {
    let start = Instant::now();
    let mut child = Command::new("git")
        .args(args)
        .current_dir(repo)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| EngineError::Spawn(e.to_string()))?;

    loop {
        if let Some(status) = child.try_wait().map_err(|e| EngineError::Spawn(e.to_string()))? {
            let mut out = Vec::new();
            let mut err = Vec::new();
            if let Some(mut stdout) = child.stdout.take() {
                let _ = stdout.read_to_end(&mut out);
            }
            if let Some(mut stderr) = child.stderr.take() {
                let _ = stderr.read_to_end(&mut err);
            }
            return Ok((
                String::from_utf8_lossy(&out).into_owned(),
                String::from_utf8_lossy(&err).into_owned(),
                status.success(),
            ));
        }
        if start.elapsed() > timeout {
            let pid = Pid::from_raw(child.id() as i32);
            let _ = signal::kill(pid, Signal::SIGTERM);
            std::thread::sleep(Duration::from_millis(500));
            if child.try_wait().map_err(|e| EngineError::Spawn(e.to_string()))?.is_none() {
                let _ = signal::kill(pid, Signal::SIGKILL);
            }
            let _ = child.wait();
            return Ok((String::new(), format!("git {} timed out after {timeout:?}", args.join(" ")), false));
        }
        std::thread::sleep(Duration::from_millis(20));
    }
}

fn backoff_delay(attempt: u32) -> Duration {
    Duration::from_millis(200 * 2u64.pow(attempt))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrState {
    Open,
    Merged,
    Closed,
}

#[derive(Debug, Clone)]
pub struct PullRequest {
    pub url: String,
    pub number: u64,
    pub state: PrState,
}

/// Abstraction boundary for the out-of-scope host git-forge CLI (`gh` or
/// equivalent). A real implementation shells out; tests use a fake.
pub trait ForgeClient {
    fn create_pr(&self, branch: &str, title: &str, body: &str, draft: bool) -> EngineResult<PullRequest>;
    fn poll_pr(&self, number: u64) -> EngineResult<PrState>;
    fn auto_merge(&self, number: u64) -> EngineResult<()>;
}

pub struct GitController {
    pub repo_root: PathBuf,
    pub allowed_remote: String,
}

impl GitController {
    pub fn new(repo_root: impl Into<PathBuf>, allowed_remote: impl Into<String>) -> Self {
        Self {
            repo_root: repo_root.into(),
            allowed_remote: allowed_remote.into(),
        }
    }

    pub fn worktree_path(&self, ticket_id: &str) -> PathBuf {
        self.repo_root.join(".blockspool-worktrees").join(ticket_id)
    }

    pub fn create_worktree(&self, ticket_id: &str, branch: &str) -> EngineResult<PathBuf> {
        let path = self.worktree_path(ticket_id);
        run_git(
            &self.repo_root,
            &["worktree", "add", "-b", branch, path.to_str().unwrap_or_default()],
        )?;
        Ok(path)
    }

    pub fn remove_worktree(&self, ticket_id: &str) -> EngineResult<()> {
        let path = self.worktree_path(ticket_id);
        run_git(&self.repo_root, &["worktree", "remove", "--force", path.to_str().unwrap_or_default()])?;
        Ok(())
    }

    pub fn branch_name_for(&self, ticket_id: &str) -> String {
        format!("blockspool/{ticket_id}")
    }

    pub fn merge_into_milestone(&self, milestone_branch: &str, ticket_branch: &str) -> EngineResult<()> {
        run_git(&self.repo_root, &["checkout", milestone_branch])?;
        run_git(&self.repo_root, &["merge", "--no-ff", ticket_branch])?;
        Ok(())
    }

    /// Validates the remote matches the allowed remote before pushing
    /// (spec §4.14 "push-safety gate").
    pub fn push(&self, worktree: &Path, branch: &str, remote_name: &str) -> EngineResult<()> {
        let remote_url = run_git(worktree, &["remote", "get-url", remote_name])?;
        if !remote_url.trim().contains(&self.allowed_remote) {
            return Err(EngineError::git(
                "push",
                format!("remote '{remote_name}' does not match allowed remote '{}'", self.allowed_remote),
            ));
        }
        run_git(worktree, &["push", remote_name, branch])?;
        Ok(())
    }

    pub fn delete_branch(&self, branch: &str, also_remote: bool, remote_name: &str) -> EngineResult<()> {
        run_git(&self.repo_root, &["branch", "-D", branch])?;
        if also_remote {
            run_git(&self.repo_root, &["push", remote_name, "--delete", branch])?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    struct FakeForge {
        state: RefCell<PrState>,
    }

    impl ForgeClient for FakeForge {
        fn create_pr(&self, branch: &str, title: &str, _body: &str, _draft: bool) -> EngineResult<PullRequest> {
            Ok(PullRequest {
                url: format!("https://example.com/pr/{branch}"),
                number: 1,
                state: PrState::Open,
            })
            .map(|pr| {
                let _ = title;
                pr
            })
        }

        fn poll_pr(&self, _number: u64) -> EngineResult<PrState> {
            Ok(*self.state.borrow())
        }

        fn auto_merge(&self, _number: u64) -> EngineResult<()> {
            *self.state.borrow_mut() = PrState::Merged;
            Ok(())
        }
    }

    #[test]
    fn fake_forge_create_and_merge_roundtrip() {
        let forge = FakeForge {
            state: RefCell::new(PrState::Open),
        };
        let pr = forge.create_pr("blockspool/t-1", "Fix thing", "body", false).unwrap();
        assert_eq!(pr.state, PrState::Open);
        forge.auto_merge(pr.number).unwrap();
        assert_eq!(forge.poll_pr(pr.number).unwrap(), PrState::Merged);
    }

    #[test]
    fn branch_name_is_namespaced() {
        let gc = GitController::new("/tmp/repo", "origin");
        assert_eq!(gc.branch_name_for("t-1"), "blockspool/t-1");
    }

    #[test]
    fn worktree_path_is_under_dedicated_dir() {
        let gc = GitController::new("/tmp/repo", "origin");
        assert_eq!(
            gc.worktree_path("t-1"),
            PathBuf::from("/tmp/repo/.blockspool-worktrees/t-1")
        );
    }

    #[test]
    fn backoff_delay_grows_exponentially() {
        assert!(backoff_delay(1) > backoff_delay(0));
        assert!(backoff_delay(2) > backoff_delay(1));
    }
}
