//! Learnings store: persistent text entries injected into ticket prompts,
//! scored by relevance and credited on outcome (spec §4.5).

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

const DEFAULT_CHAR_BUDGET: usize = 2_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LearningCategory {
    Pattern,
    Warning,
    Preference,
    Constraint,
    ProcessInsight,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LearningSource {
    #[serde(rename = "type")]
    pub kind: String,
    pub detail: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Learning {
    pub id: String,
    pub text: String,
    pub category: LearningCategory,
    pub source: LearningSource,
    #[serde(default)]
    pub tags: Vec<String>,
    pub weight: f64,
    pub access_count: u32,
    pub effectiveness: f64,
}

impl Learning {
    pub fn new(
        id: impl Into<String>,
        text: impl Into<String>,
        category: LearningCategory,
        source: LearningSource,
        tags: Vec<String>,
    ) -> Self {
        Self {
            id: id.into(),
            text: text.into(),
            category,
            source,
            tags,
            weight: 50.0,
            access_count: 0,
            effectiveness: 0.5,
        }
    }

    fn relevance(&self, ctx_paths: &HashSet<String>, ctx_commands: &HashSet<String>) -> f64 {
        let mut overlap = 0usize;
        for tag in &self.tags {
            if ctx_paths.iter().any(|p| p.contains(tag.as_str())) {
                overlap += 1;
            }
            if ctx_commands.contains(tag) {
                overlap += 1;
            }
        }
        overlap as f64 * self.weight.max(1.0) / 100.0
    }

    pub fn credit(&mut self, success: bool) {
        self.access_count += 1;
        let delta = if success { 0.05 } else { -0.05 };
        self.effectiveness = (self.effectiveness + delta).clamp(0.0, 1.0);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LearningsStore {
    pub entries: Vec<Learning>,
    #[serde(skip)]
    loaded: bool,
}

impl LearningsStore {
    pub fn ensure_loaded(&mut self, loader: impl FnOnce() -> Vec<Learning>) {
        if !self.loaded {
            if self.entries.is_empty() {
                self.entries = loader();
            }
            self.loaded = true;
        }
    }

    /// Score and select the top entries relevant to `ctx_paths`/`ctx_commands`
    /// that fit within `char_budget`, formatted inside `<learnings>` tags.
    pub fn select_relevant(
        &self,
        ctx_paths: &[String],
        ctx_commands: &[String],
        char_budget: Option<usize>,
    ) -> (String, Vec<String>) {
        let budget = char_budget.unwrap_or(DEFAULT_CHAR_BUDGET);
        let paths: HashSet<String> = ctx_paths.iter().cloned().collect();
        let commands: HashSet<String> = ctx_commands.iter().cloned().collect();

        let mut scored: Vec<(&Learning, f64)> = self
            .entries
            .iter()
            .map(|l| (l, l.relevance(&paths, &commands)))
            .filter(|(_, score)| *score > 0.0)
            .collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

        let mut body = String::new();
        let mut injected = Vec::new();
        for (learning, _) in scored {
            let line = format!("- [{:?}] {}\n", learning.category, learning.text);
            if body.len() + line.len() > budget {
                break;
            }
            body.push_str(&line);
            injected.push(learning.id.clone());
        }
        let formatted = if body.is_empty() {
            String::new()
        } else {
            format!("<learnings>\n{body}</learnings>")
        };
        (formatted, injected)
    }

    pub fn credit_many(&mut self, ids: &[String], success: bool) {
        for id in ids {
            if let Some(l) = self.entries.iter_mut().find(|l| &l.id == id) {
                l.credit(success);
            }
        }
    }

    pub fn process_insights(&self) -> Vec<&Learning> {
        self.entries
            .iter()
            .filter(|l| l.category == LearningCategory::ProcessInsight)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(id: &str, tags: Vec<&str>) -> Learning {
        Learning::new(
            id,
            format!("lesson {id}"),
            LearningCategory::Pattern,
            LearningSource {
                kind: "ticket".into(),
                detail: "t-1".into(),
            },
            tags.into_iter().map(String::from).collect(),
        )
    }

    #[test]
    fn ensure_loaded_only_loads_once() {
        let mut store = LearningsStore::default();
        let mut calls = 0;
        store.ensure_loaded(|| {
            calls += 1;
            vec![sample("l1", vec!["auth"])]
        });
        store.ensure_loaded(|| {
            calls += 1;
            vec![]
        });
        assert_eq!(calls, 1);
        assert_eq!(store.entries.len(), 1);
    }

    #[test]
    fn relevant_learnings_are_selected_and_tracked() {
        let mut store = LearningsStore::default();
        store.entries.push(sample("l1", vec!["auth"]));
        store.entries.push(sample("l2", vec!["unrelated-topic"]));
        let (formatted, ids) =
            store.select_relevant(&["src/auth/mod.rs".to_string()], &[], None);
        assert!(formatted.contains("lesson l1"));
        assert_eq!(ids, vec!["l1".to_string()]);
    }

    #[test]
    fn budget_truncates_output() {
        let mut store = LearningsStore::default();
        for i in 0..50 {
            store.entries.push(sample(&format!("l{i}"), vec!["auth"]));
        }
        let (formatted, ids) = store.select_relevant(&["auth".to_string()], &[], Some(100));
        assert!(formatted.len() < 400);
        assert!(ids.len() < 50);
    }

    #[test]
    fn credit_moves_effectiveness() {
        let mut store = LearningsStore::default();
        store.entries.push(sample("l1", vec!["auth"]));
        store.credit_many(&["l1".to_string()], true);
        assert!(store.entries[0].effectiveness > 0.5);
        store.credit_many(&["l1".to_string()], false);
        store.credit_many(&["l1".to_string()], false);
        assert!(store.entries[0].effectiveness < 0.5);
    }

    #[test]
    fn process_insights_are_filterable() {
        let mut store = LearningsStore::default();
        let mut insight = sample("l1", vec!["auth"]);
        insight.category = LearningCategory::ProcessInsight;
        store.entries.push(insight);
        store.entries.push(sample("l2", vec!["auth"]));
        assert_eq!(store.process_insights().len(), 1);
    }
}
