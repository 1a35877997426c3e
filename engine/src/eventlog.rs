//! Append-only event log (`events.ndjson`) and the `loop-state.json` marker
//!
//! One JSON object per line, written with line-atomic appends (spec I5).
//! Unknown event types are tolerated on read (spec: "Event log").

use crate::error::EngineResult;
use crate::paths::atomic_write;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;

/// All event types the engine can emit (spec §3 "Event").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    ScoutOutput,
    ProposalsReviewed,
    PlanSubmitted,
    TicketResult,
    QaPassed,
    QaFailed,
    QaCommandResult,
    PrCreated,
    UserOverride,
    BudgetWarning,
    ScopeAllowed,
    ScopeBlocked,
    /// Any type not recognized by this build. Tolerated on read.
    #[serde(other)]
    Unknown,
}

/// A single appended event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub ts: i64,
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub payload: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
}

impl Event {
    pub fn new(event_type: EventType, payload: serde_json::Value) -> Self {
        Self {
            ts: Utc::now().timestamp_millis(),
            event_type,
            payload,
            step: None,
            phase: None,
        }
    }

    pub fn with_step(mut self, step: u32) -> Self {
        self.step = Some(step);
        self
    }

    pub fn with_phase(mut self, phase: impl Into<String>) -> Self {
        self.phase = Some(phase.into());
        self
    }
}

/// Writer/reader for a single run's `events.ndjson`.
pub struct EventLog {
    path: PathBuf,
}

impl EventLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Append one event as a single atomic line write (open in append mode,
    /// write the line, flush — no read-modify-write, so concurrent readers
    /// never see a torn line).
    pub fn append(&self, event: &Event) -> EngineResult<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut line = serde_json::to_string(event)?;
        line.push('\n');
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(line.as_bytes())?;
        file.flush()?;
        debug!(event_type = ?event.event_type, "event appended");
        Ok(())
    }

    /// Read all events currently on disk. Lines that fail to parse as known
    /// fields but carry an unrecognized `type` are preserved as `Unknown`;
    /// lines that are not valid JSON at all are skipped (defends against a
    /// torn write from a crash mid-append, spec §5 "crash-safe").
    pub fn read_all(&self) -> EngineResult<Vec<Event>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let content = std::fs::read_to_string(&self.path)?;
        Ok(content
            .lines()
            .filter_map(|line| serde_json::from_str::<Event>(line).ok())
            .collect())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// `loop-state.json` at the project root: the active phase marker a host
/// stop-hook polls (spec §4.1, §6 "Stop host-hook contract").
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoopState {
    pub run_id: String,
    pub phase: String,
    pub updated_at: DateTime<Utc>,
}

pub fn write_loop_state(path: &Path, state: &LoopState) -> EngineResult<()> {
    let json = serde_json::to_vec_pretty(state)?;
    atomic_write(path, &json)?;
    Ok(())
}

pub fn read_loop_state(path: &Path) -> EngineResult<Option<LoopState>> {
    if !path.exists() {
        return Ok(None);
    }
    let content = std::fs::read_to_string(path)?;
    Ok(Some(serde_json::from_str(&content)?))
}

pub fn clear_loop_state(path: &Path) -> EngineResult<()> {
    if path.exists() {
        std::fs::remove_file(path)?;
    }
    Ok(())
}
