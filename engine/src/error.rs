//! Engine error types
//!
//! Structured errors for all orchestration operations, including an
//! agent-friendly payload so tool responses can tell the agent what to do
//! next instead of just failing.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for engine operations
pub type EngineResult<T> = Result<T, EngineError>;

/// Structured error response surfaced across the tool boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StructuredError {
    /// Machine-readable error code (e.g. "NO_ACTIVE_SESSION", "BUDGET_EXHAUSTED")
    pub code: String,
    /// Human-readable message
    pub message: String,
    /// Actionable recovery instruction for the agent
    pub recovery_action: String,
    /// Relevant context for debugging and recovery
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub context: HashMap<String, serde_json::Value>,
    /// Whether this error is retryable (transient failure)
    #[serde(default)]
    pub retryable: bool,
}

impl StructuredError {
    pub fn new(
        code: impl Into<String>,
        message: impl Into<String>,
        recovery_action: impl Into<String>,
    ) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            recovery_action: recovery_action.into(),
            context: HashMap::new(),
            retryable: false,
        }
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    pub fn retryable(mut self) -> Self {
        self.retryable = true;
        self
    }
}

impl std::fmt::Display for StructuredError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl std::error::Error for StructuredError {}

/// Errors that can occur during engine operations
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("no active session for project {project_id}")]
    NoActiveSession { project_id: String },

    #[error("run directory not found at {path}")]
    RunDirNotFound { path: PathBuf },

    #[error("invalid state transition: {from} -> {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("schema error: {message}")]
    Schema { message: String },

    #[error("step budget exhausted: {step_count}/{step_budget}")]
    BudgetExhausted { step_count: u32, step_budget: u32 },

    #[error("scope violation: {path} is not allowed ({reason})")]
    ScopeViolation { path: String, reason: String },

    #[error("git operation '{op}' failed: {message}")]
    Git { op: String, message: String },

    #[error("process spawn failed: {0}")]
    Spawn(String),

    #[error("ticket not found: {id}")]
    TicketNotFound { id: String },

    #[error("worker not found for ticket: {id}")]
    WorkerNotFound { id: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("{0}")]
    Other(String),
}

impl EngineError {
    pub fn git(op: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Git {
            op: op.into(),
            message: message.into(),
        }
    }

    pub fn schema(message: impl Into<String>) -> Self {
        Self::Schema {
            message: message.into(),
        }
    }

    /// Whether the underlying failure is worth retrying (transient I/O, git
    /// lock contention, etc.) rather than a structural problem.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Git { message, .. } => {
                message.contains("lock") || message.contains("index.lock")
            }
            Self::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::Interrupted | std::io::ErrorKind::WouldBlock
            ),
            _ => false,
        }
    }

    /// Convert into the agent-facing structured payload.
    pub fn to_structured(&self) -> StructuredError {
        match self {
            Self::NoActiveSession { project_id } => StructuredError::new(
                "NO_ACTIVE_SESSION",
                format!("no active session for project {project_id}"),
                "call start_session before advance/ingest_event",
            )
            .with_context("project_id", project_id.clone()),
            Self::BudgetExhausted {
                step_count,
                step_budget,
            } => StructuredError::new(
                "BUDGET_EXHAUSTED",
                format!("step budget exhausted: {step_count}/{step_budget}"),
                "call end_session; start a new session to continue",
            ),
            Self::ScopeViolation { path, reason } => StructuredError::new(
                "SCOPE_VIOLATION",
                format!("{path} is not allowed: {reason}"),
                "choose a file within the ticket's allowed_paths",
            )
            .with_context("path", path.clone()),
            Self::Git { op, message } => {
                let mut e = StructuredError::new(
                    "GIT_FAILURE",
                    format!("git {op} failed: {message}"),
                    "inspect repository state; retry if transient",
                );
                if self.is_retryable() {
                    e = e.retryable();
                }
                e
            }
            other => StructuredError::new("INTERNAL_ERROR", other.to_string(), "retry or escalate"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn structured_error_roundtrip() {
        let e = StructuredError::new("X", "msg", "do y").with_context("k", "v").retryable();
        let json = serde_json::to_string(&e).unwrap();
        let back: StructuredError = serde_json::from_str(&json).unwrap();
        assert_eq!(back.code, "X");
        assert!(back.retryable);
    }

    #[test]
    fn budget_exhausted_is_not_retryable() {
        let e = EngineError::BudgetExhausted {
            step_count: 10,
            step_budget: 10,
        };
        assert!(!e.is_retryable());
        assert_eq!(e.to_structured().code, "BUDGET_EXHAUSTED");
    }

    #[test]
    fn git_lock_contention_is_retryable() {
        let e = EngineError::git("commit", "Unable to create '.git/index.lock'");
        assert!(e.is_retryable());
        assert!(e.to_structured().retryable);
    }
}
