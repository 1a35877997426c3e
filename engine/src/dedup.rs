//! Weighted dedup memory preventing repeat proposals across runs
//! (spec §4.4).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

const DEFAULT_NEW_WEIGHT: f64 = 60.0;
const COMPLETED_WEIGHT: f64 = 100.0;
const REHIT_BUMP: f64 = 10.0;
const SIMILARITY_THRESHOLD: f64 = 0.6;

fn normalize(text: &str) -> String {
    text.to_lowercase()
        .chars()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace())
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn word_tokens(text: &str) -> HashSet<String> {
    normalize(text)
        .split_whitespace()
        .filter(|w| w.len() > 2)
        .map(|w| w.to_string())
        .collect()
}

fn char_bigrams(text: &str) -> HashSet<String> {
    let normalized = normalize(text);
    let chars: Vec<char> = normalized.chars().collect();
    if chars.len() < 2 {
        return HashSet::new();
    }
    chars
        .windows(2)
        .map(|w| w.iter().collect::<String>())
        .collect()
}

fn jaccard<T: std::hash::Hash + Eq>(a: &HashSet<T>, b: &HashSet<T>) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    let intersection = a.intersection(b).count();
    let union = a.union(b).count();
    if union == 0 {
        0.0
    } else {
        intersection as f64 / union as f64
    }
}

/// True when `a` and `b` are considered the same proposal: exact normalized
/// match, or either similarity measure crosses the threshold.
pub fn is_similar(a: &str, b: &str) -> bool {
    if normalize(a) == normalize(b) {
        return true;
    }
    let word_sim = jaccard(&word_tokens(a), &word_tokens(b));
    if word_sim >= SIMILARITY_THRESHOLD {
        return true;
    }
    let bigram_sim = jaccard(&char_bigrams(a), &char_bigrams(b));
    bigram_sim >= SIMILARITY_THRESHOLD
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DedupEntry {
    pub title: String,
    pub weight: f64,
    pub created_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub hit_count: u32,
    pub completed: bool,
}

impl DedupEntry {
    pub fn new(title: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            title: title.into(),
            weight: DEFAULT_NEW_WEIGHT,
            created_at: now,
            last_seen_at: now,
            hit_count: 0,
            completed: false,
        }
    }

    pub fn mark_completed(&mut self) {
        self.completed = true;
        self.weight = COMPLETED_WEIGHT;
    }

    pub fn rehit(&mut self) {
        self.weight += REHIT_BUMP;
        self.hit_count += 1;
        self.last_seen_at = Utc::now();
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DedupStore {
    pub entries: Vec<DedupEntry>,
}

impl DedupStore {
    pub fn find_similar(&self, title: &str) -> Option<usize> {
        self.entries.iter().position(|e| is_similar(&e.title, title))
    }

    /// Returns true if `title` is a duplicate of something already tracked.
    pub fn check_and_record(&mut self, title: &str) -> bool {
        if let Some(idx) = self.find_similar(title) {
            self.entries[idx].rehit();
            true
        } else {
            self.entries.push(DedupEntry::new(title));
            false
        }
    }

    pub fn mark_completed(&mut self, title: &str) {
        if let Some(idx) = self.find_similar(title) {
            self.entries[idx].mark_completed();
        }
    }

    /// Below this, multiplicative decay is treated as fully forgotten (it
    /// approaches zero asymptotically but never reaches it).
    const WEIGHT_FLOOR: f64 = 1e-6;

    /// Halve the gap to zero for every entry's weight; completed entries
    /// decay about half as fast as open ones. Entries at or below the floor
    /// are evicted.
    pub fn decay(&mut self, daily_rate: f64) {
        for entry in &mut self.entries {
            let rate = if entry.completed {
                daily_rate / 2.0
            } else {
                daily_rate
            };
            entry.weight -= entry.weight * rate;
        }
        self.entries.retain(|e| e.weight > Self::WEIGHT_FLOOR);
    }

    /// Format the highest-weight entries into a budget-bounded block for
    /// injection into the scout prompt.
    pub fn format_for_prompt(&self, char_budget: usize) -> String {
        let mut sorted: Vec<&DedupEntry> = self.entries.iter().collect();
        sorted.sort_by(|a, b| b.weight.partial_cmp(&a.weight).unwrap_or(std::cmp::Ordering::Equal));
        let mut out = String::new();
        for entry in sorted {
            let line = format!("- {}\n", entry.title);
            if out.len() + line.len() > char_budget {
                break;
            }
            out.push_str(&line);
        }
        out
    }
}
