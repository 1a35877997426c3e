//! Ticket record and status transitions

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TicketStatus {
    Backlog,
    Ready,
    InProgress,
    InReview,
    Done,
    Blocked,
    Aborted,
    Leased,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Refactor,
    Test,
    Docs,
    Perf,
    Security,
    Fix,
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Risk {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ticket {
    pub id: String,
    pub project_id: String,
    pub title: String,
    pub description: String,
    pub status: TicketStatus,
    pub priority: u8,
    pub category: Category,
    #[serde(default)]
    pub allowed_paths: Vec<String>,
    #[serde(default)]
    pub forbidden_paths: Vec<String>,
    #[serde(default)]
    pub verification_commands: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Supplemented field: a short excerpt of the failure that most recently
    /// blocked or aborted this ticket, surfaced in CLI/analytics output.
    #[serde(default)]
    pub last_error_snippet: Option<String>,
}

impl Ticket {
    pub fn new(
        id: impl Into<String>,
        project_id: impl Into<String>,
        title: impl Into<String>,
        description: impl Into<String>,
        category: Category,
        priority: u8,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            project_id: project_id.into(),
            title: title.into(),
            description: description.into(),
            status: TicketStatus::Ready,
            priority,
            category,
            allowed_paths: Vec::new(),
            forbidden_paths: Vec::new(),
            verification_commands: Vec::new(),
            created_at: now,
            updated_at: now,
            last_error_snippet: None,
        }
    }

    /// Apply a status transition, validating it against the legal table in
    /// spec §3: `ready -> in_progress -> {in_review|done} | blocked`,
    /// and anything can move to `aborted`.
    pub fn transition(&mut self, to: TicketStatus) -> Result<(), crate::error::EngineError> {
        use TicketStatus::*;
        let legal = matches!(
            (self.status, to),
            (Backlog, Ready)
                | (Ready, InProgress)
                | (Ready, Leased)
                | (Leased, InProgress)
                | (InProgress, InReview)
                | (InProgress, Done)
                | (InProgress, Blocked)
                | (InReview, Done)
                | (InReview, Blocked)
                | (Blocked, Ready)
                | (_, Aborted)
        );
        if !legal {
            return Err(crate::error::EngineError::InvalidStateTransition {
                from: format!("{:?}", self.status),
                to: format!("{to:?}"),
            });
        }
        self.status = to;
        self.updated_at = Utc::now();
        Ok(())
    }

    pub fn mark_blocked(&mut self, error_snippet: impl Into<String>) {
        self.status = TicketStatus::Blocked;
        self.last_error_snippet = Some(error_snippet.into());
        self.updated_at = Utc::now();
    }
}
