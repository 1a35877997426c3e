//! Per-ticket scope policy: allow/deny path sets consulted before every
//! agent write (spec §4.7).

use crate::ticket::Ticket;
use serde::{Deserialize, Serialize};
use std::path::{Component, Path, PathBuf};

/// Paths denied by default for every category, regardless of the ticket's
/// own `allowed_paths`.
fn default_deny_globs() -> Vec<&'static str> {
    vec![".env", ".env.*", "node_modules/**", ".git/**", "**/*.pem", "**/*.key"]
}

/// Used when a ticket doesn't carry its own line budget. No ticket field
/// currently exists for this, so every ticket gets the same ceiling (spec
/// §4.7 names the budget but not a default value).
pub const DEFAULT_MAX_LINES_PER_TICKET: u32 = 500;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScopePolicy {
    pub allowed_paths: Vec<String>,
    pub forbidden_paths: Vec<String>,
    pub max_lines_per_ticket: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeDecision {
    Allowed,
    Blocked,
}

fn glob_match(pattern: &str, candidate: &str) -> bool {
    glob_match_segments(
        &pattern.split('/').collect::<Vec<_>>(),
        &candidate.split('/').collect::<Vec<_>>(),
    )
}

fn glob_match_segments(pattern: &[&str], candidate: &[&str]) -> bool {
    match (pattern.first(), candidate.first()) {
        (None, None) => true,
        (Some(&"**"), _) => {
            glob_match_segments(&pattern[1..], candidate)
                || (!candidate.is_empty() && glob_match_segments(pattern, &candidate[1..]))
        }
        (Some(p), Some(c)) => segment_match(p, c) && glob_match_segments(&pattern[1..], &candidate[1..]),
        _ => false,
    }
}

fn segment_match(pattern: &str, candidate: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    if let Some(prefix) = pattern.strip_suffix('*') {
        return candidate.starts_with(prefix);
    }
    pattern == candidate
}

/// Normalize a path: reject `..` traversal, strip a leading `./`, convert to
/// `/`-separated form relative to the project root.
fn normalize(path: &str) -> Option<String> {
    let p = Path::new(path);
    let mut parts = Vec::new();
    for component in p.components() {
        match component {
            Component::ParentDir => return None,
            Component::CurDir | Component::RootDir | Component::Prefix(_) => {}
            Component::Normal(s) => parts.push(s.to_string_lossy().into_owned()),
        }
    }
    Some(parts.join("/"))
}

impl ScopePolicy {
    pub fn new(allowed_paths: Vec<String>, forbidden_paths: Vec<String>, max_lines_per_ticket: u32) -> Self {
        Self {
            allowed_paths,
            forbidden_paths,
            max_lines_per_ticket,
        }
    }

    /// The policy actually in force for a ticket: its own allow/forbid
    /// lists, against the shared default-deny set enforced by
    /// `is_file_allowed` regardless.
    pub fn for_ticket(ticket: &Ticket) -> Self {
        Self::new(ticket.allowed_paths.clone(), ticket.forbidden_paths.clone(), DEFAULT_MAX_LINES_PER_TICKET)
    }

    /// `isFileAllowed`: normalize, reject deny-list matches, then require an
    /// allow-glob match unless the allow list is empty (accept-everything).
    pub fn is_file_allowed(&self, path: &str) -> ScopeDecision {
        let normalized = match normalize(path) {
            Some(n) => n,
            None => return ScopeDecision::Blocked,
        };

        for deny in default_deny_globs().iter().copied().chain(self.forbidden_paths.iter().map(String::as_str)) {
            if glob_match(deny, &normalized) {
                return ScopeDecision::Blocked;
            }
        }

        if self.allowed_paths.is_empty() {
            return ScopeDecision::Allowed;
        }

        if self
            .allowed_paths
            .iter()
            .any(|allow| glob_match(allow, &normalized))
        {
            ScopeDecision::Allowed
        } else {
            ScopeDecision::Blocked
        }
    }

    pub fn project_relative(&self, project_root: &Path, path: &str) -> PathBuf {
        project_root.join(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(allow: &[&str]) -> ScopePolicy {
        ScopePolicy::new(allow.iter().map(|s| s.to_string()).collect(), vec![], 500)
    }

    #[test]
    fn empty_allow_list_accepts_everything_not_denied() {
        let p = policy(&[]);
        assert_eq!(p.is_file_allowed("src/lib.rs"), ScopeDecision::Allowed);
    }

    #[test]
    fn default_deny_blocks_dotenv() {
        let p = policy(&["**"]);
        assert_eq!(p.is_file_allowed(".env"), ScopeDecision::Blocked);
    }

    #[test]
    fn default_deny_blocks_node_modules() {
        let p = policy(&[]);
        assert_eq!(
            p.is_file_allowed("node_modules/foo/index.js"),
            ScopeDecision::Blocked
        );
    }

    #[test]
    fn allow_glob_matches_nested_path() {
        let p = policy(&["src/engine/**"]);
        assert_eq!(
            p.is_file_allowed("src/engine/worker.rs"),
            ScopeDecision::Allowed
        );
        assert_eq!(p.is_file_allowed("src/cli/main.rs"), ScopeDecision::Blocked);
    }

    #[test]
    fn parent_dir_traversal_is_blocked() {
        let p = policy(&[]);
        assert_eq!(
            p.is_file_allowed("src/../../etc/passwd"),
            ScopeDecision::Blocked
        );
    }

    #[test]
    fn explicit_forbidden_path_overrides_allow() {
        let mut p = policy(&["**"]);
        p.forbidden_paths.push("secrets/**".to_string());
        assert_eq!(
            p.is_file_allowed("secrets/token.txt"),
            ScopeDecision::Blocked
        );
    }

    #[test]
    fn for_ticket_uses_the_tickets_own_scope() {
        use crate::ticket::Category;
        let mut ticket = Ticket::new("t-1", "proj", "title", "desc", Category::Fix, 5);
        ticket.allowed_paths = vec!["src/engine/**".to_string()];
        ticket.forbidden_paths = vec!["src/engine/secrets.rs".to_string()];
        let p = ScopePolicy::for_ticket(&ticket);
        assert_eq!(p.is_file_allowed("src/engine/worker.rs"), ScopeDecision::Allowed);
        assert_eq!(p.is_file_allowed("src/engine/secrets.rs"), ScopeDecision::Blocked);
        assert_eq!(p.is_file_allowed("src/cli/main.rs"), ScopeDecision::Blocked);
    }
}
