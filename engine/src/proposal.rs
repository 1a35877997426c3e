//! Proposal pipeline: schema validation → trust ladder → dedup → rank →
//! cap → materialize (spec §4.8).

use crate::config::RunConfig;
use crate::dedup::DedupStore;
use crate::ticket::{Category, Ticket};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Risk {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Proposal {
    pub category: String,
    pub title: String,
    pub description: String,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
    #[serde(default)]
    pub verification_commands: Vec<String>,
    #[serde(default)]
    pub allowed_paths: Vec<String>,
    #[serde(default)]
    pub files: Vec<String>,
    pub confidence: u8,
    pub impact_score: u8,
    pub risk: Risk,
    #[serde(default)]
    pub rollback_note: Option<String>,
    #[serde(default)]
    pub touched_files_estimate: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    SchemaInvalid(String),
    CategoryNotAllowed,
    ImpactTooLow,
    CrossRunDuplicate,
    InBatchDuplicate,
    OverCap,
}

pub struct PipelineOutcome {
    pub tickets: Vec<Ticket>,
    pub rejections: Vec<(String, Rejection)>,
}

fn validate_schema(p: &Proposal) -> Result<(), String> {
    if p.title.trim().is_empty() {
        return Err("title is required".into());
    }
    if p.description.trim().is_empty() {
        return Err("description is required".into());
    }
    if !(1..=10).contains(&p.impact_score) {
        return Err("impact_score must be 1-10".into());
    }
    if p.confidence > 100 {
        return Err("confidence must be 0-100".into());
    }
    Ok(())
}

fn parse_category(raw: &str) -> Category {
    match raw.to_lowercase().as_str() {
        "refactor" => Category::Refactor,
        "test" => Category::Test,
        "docs" => Category::Docs,
        "perf" => Category::Perf,
        "security" => Category::Security,
        "fix" => Category::Fix,
        _ => Category::Other,
    }
}

fn render_description(p: &Proposal) -> String {
    let rollback = p.rollback_note.as_deref().unwrap_or("none noted");
    format!(
        "{}\n\nRisk: {:?}\nRollback: {rollback}\nAcceptance criteria:\n{}",
        p.description,
        p.risk,
        p.acceptance_criteria
            .iter()
            .map(|c| format!("- {c}"))
            .collect::<Vec<_>>()
            .join("\n"),
    )
}

/// Run the full pipeline over one scout batch.
///
/// `existing_titles` feeds cross-run dedup against non-aborted tickets for
/// the project; `dedup_store` is consulted (and updated) for weighted
/// cross-session memory.
pub fn run_pipeline(
    proposals: Vec<Proposal>,
    config: &RunConfig,
    project_id: &str,
    existing_titles: &[String],
    dedup_store: &mut DedupStore,
    max_proposals: usize,
    id_gen: impl Fn(usize) -> String,
) -> PipelineOutcome {
    let mut rejections = Vec::new();
    let mut accepted: Vec<Proposal> = Vec::new();

    for p in proposals {
        // 1. schema validate
        if let Err(reason) = validate_schema(&p) {
            rejections.push((p.title.clone(), Rejection::SchemaInvalid(reason)));
            continue;
        }
        // 2. category trust ladder
        if !config
            .categories
            .iter()
            .any(|c| c.eq_ignore_ascii_case(&p.category))
        {
            rejections.push((p.title.clone(), Rejection::CategoryNotAllowed));
            continue;
        }
        // 3. confidence/impact filter — confidence is a hint only, never a
        // filter (spec Open Question b).
        if p.impact_score < config.min_impact_score {
            rejections.push((p.title.clone(), Rejection::ImpactTooLow));
            continue;
        }
        // 4. cross-run dedup
        if existing_titles.iter().any(|t| crate::dedup::is_similar(t, &p.title)) {
            rejections.push((p.title.clone(), Rejection::CrossRunDuplicate));
            continue;
        }
        if dedup_store.check_and_record(&p.title) {
            rejections.push((p.title.clone(), Rejection::CrossRunDuplicate));
            continue;
        }
        // 5. in-batch dedup: reject anything similar to an already-accepted
        // proposal, iterating in arrival order.
        if accepted
            .iter()
            .any(|a| crate::dedup::is_similar(&a.title, &p.title))
        {
            rejections.push((p.title.clone(), Rejection::InBatchDuplicate));
            continue;
        }
        accepted.push(p);
    }

    // 6. rank by impact_score * confidence desc, stable on title
    accepted.sort_by(|a, b| {
        let score_a = a.impact_score as u32 * a.confidence as u32;
        let score_b = b.impact_score as u32 * b.confidence as u32;
        score_b.cmp(&score_a).then_with(|| a.title.cmp(&b.title))
    });

    // 7. cap
    if accepted.len() > max_proposals {
        for dropped in accepted.split_off(max_proposals) {
            rejections.push((dropped.title.clone(), Rejection::OverCap));
        }
    }

    // 8. materialize
    let tickets = accepted
        .into_iter()
        .enumerate()
        .map(|(i, p)| {
            let mut ticket = Ticket::new(
                id_gen(i),
                project_id,
                p.title.clone(),
                render_description(&p),
                parse_category(&p.category),
                p.impact_score,
            );
            ticket.allowed_paths = p.allowed_paths.clone();
            ticket.verification_commands = p.verification_commands.clone();
            ticket
        })
        .collect();

    PipelineOutcome { tickets, rejections }
}
