//! Metrics aggregation over events, run history, and the error ledger
//! (spec §4.16 "Analytics & Reporting" leaf).

use crate::eventlog::{Event, EventType};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SessionReport {
    pub tickets_completed: u32,
    pub tickets_failed: u32,
    pub prs_created: u32,
    pub qa_failures: u32,
    pub scope_blocks: u32,
    pub budget_warnings: u32,
    pub event_counts: HashMap<String, u32>,
}

/// Fold a run's event stream into a single report. Pure function over the
/// events already read from `events.ndjson`.
pub fn summarize_events(events: &[Event]) -> SessionReport {
    let mut report = SessionReport::default();
    for event in events {
        let key = format!("{:?}", event.event_type);
        *report.event_counts.entry(key).or_insert(0) += 1;
        match event.event_type {
            EventType::PrCreated => report.prs_created += 1,
            EventType::QaFailed => report.qa_failures += 1,
            EventType::ScopeBlocked => report.scope_blocks += 1,
            EventType::BudgetWarning => report.budget_warnings += 1,
            EventType::TicketResult => {
                let status = event.payload.get("status").and_then(|v| v.as_str());
                match status {
                    Some("done") | Some("success") => report.tickets_completed += 1,
                    Some(_) => report.tickets_failed += 1,
                    None => {}
                }
            }
            _ => {}
        }
    }
    report
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub run_id: String,
    pub ended_at: chrono::DateTime<chrono::Utc>,
    pub ended_phase: String,
    pub report: SessionReport,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifiedFailure {
    pub ticket_id: String,
    pub class: String,
    pub message: String,
    pub at: chrono::DateTime<chrono::Utc>,
}

/// Aggregate across a run's full history for the `analytics` CLI command.
pub fn aggregate_history(entries: &[HistoryEntry]) -> SessionReport {
    let mut total = SessionReport::default();
    for entry in entries {
        total.tickets_completed += entry.report.tickets_completed;
        total.tickets_failed += entry.report.tickets_failed;
        total.prs_created += entry.report.prs_created;
        total.qa_failures += entry.report.qa_failures;
        total.scope_blocks += entry.report.scope_blocks;
        total.budget_warnings += entry.report.budget_warnings;
        for (k, v) in &entry.report.event_counts {
            *total.event_counts.entry(k.clone()).or_insert(0) += v;
        }
    }
    total
}

pub fn failures_by_class(failures: &[ClassifiedFailure]) -> HashMap<String, u32> {
    let mut out = HashMap::new();
    for f in failures {
        *out.entry(f.class.clone()).or_insert(0) += 1;
    }
    out
}
