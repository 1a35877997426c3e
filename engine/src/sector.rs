//! Sector map: flat codebase regions with staleness/yield tracking that
//! drives scout rotation (spec §4.3).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;

const EMA_ALPHA: f64 = 0.3;
const DECAY_EVERY_N_OUTCOMES: u32 = 20;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CategoryStats {
    pub attempts: u32,
    pub successes: u32,
}

impl CategoryStats {
    fn success_rate(&self) -> f64 {
        if self.attempts == 0 {
            0.0
        } else {
            self.successes as f64 / self.attempts as f64
        }
    }

    pub fn is_boosted(&self) -> bool {
        self.attempts >= 3 && self.success_rate() > 0.6
    }

    pub fn is_suppressed(&self) -> bool {
        self.attempts >= 3 && self.success_rate() < 0.3
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sector {
    pub path: String,
    pub purpose: String,
    pub production: bool,
    pub file_count: u32,
    pub production_file_count: u32,
    pub classification_confidence: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_scanned_at: Option<DateTime<Utc>>,
    pub last_scanned_cycle: u32,
    pub scan_count: u32,
    pub proposal_yield: f64,
    pub success_count: u32,
    pub failure_count: u32,
    pub outcome_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub polished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub merge_count: u32,
    #[serde(default)]
    pub closed_count: u32,
    #[serde(default)]
    pub category_stats: HashMap<String, CategoryStats>,
}

impl Sector {
    pub fn new(path: impl Into<String>, purpose: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            purpose: purpose.into(),
            production: true,
            file_count: 0,
            production_file_count: 0,
            classification_confidence: 0.5,
            last_scanned_at: None,
            last_scanned_cycle: 0,
            scan_count: 0,
            proposal_yield: 0.0,
            success_count: 0,
            failure_count: 0,
            outcome_count: 0,
            polished_at: None,
            merge_count: 0,
            closed_count: 0,
            category_stats: HashMap::new(),
        }
    }

    fn failure_rate(&self) -> f64 {
        let total = self.success_count + self.failure_count;
        if total == 0 {
            0.0
        } else {
            self.failure_count as f64 / total as f64
        }
    }

    pub fn is_polished(&self) -> bool {
        let history_ok = (self.success_count + self.failure_count) == 0
            || (self.success_count as f64
                / (self.success_count + self.failure_count).max(1) as f64)
                < 0.3;
        self.scan_count >= 5 && self.proposal_yield < 0.3 && history_ok
    }

    pub fn is_barren(&self) -> bool {
        self.scan_count > 2 && self.proposal_yield < 0.5
    }

    pub fn is_high_failure(&self) -> bool {
        self.failure_count >= 3 && self.failure_rate() > 0.6
    }

    /// Record a scan: bump counters and fold a new yield observation into
    /// the EMA. `had_proposals` is 1.0/0.0 folded as the raw observation.
    pub fn record_scan_result(
        &mut self,
        cycle: u32,
        proposal_count: u32,
        reclassify: Option<(&str, f64)>,
    ) {
        self.scan_count += 1;
        self.last_scanned_cycle = cycle;
        self.last_scanned_at = Some(Utc::now());
        let observation = if proposal_count > 0 { 1.0 } else { 0.0 };
        self.proposal_yield = if self.scan_count == 1 {
            observation
        } else {
            EMA_ALPHA * observation + (1.0 - EMA_ALPHA) * self.proposal_yield
        };
        if let Some((purpose, confidence)) = reclassify {
            if confidence >= 0.6 {
                self.purpose = purpose.to_string();
                self.classification_confidence = confidence;
            }
        }
        if self.is_polished() && self.polished_at.is_none() {
            self.polished_at = Some(Utc::now());
        } else if !self.is_polished() {
            self.polished_at = None;
        }
    }

    pub fn record_outcome(&mut self, category: &str, success: bool) {
        if success {
            self.success_count += 1;
        } else {
            self.failure_count += 1;
        }
        self.outcome_count += 1;
        let stats = self.category_stats.entry(category.to_string()).or_default();
        stats.attempts += 1;
        if success {
            stats.successes += 1;
        }
        if self.outcome_count % DECAY_EVERY_N_OUTCOMES == 0 {
            self.success_count /= 2;
            self.failure_count /= 2;
        }
    }

    pub fn is_boosted_for(&self, category: &str) -> bool {
        self.category_stats
            .get(category)
            .map(CategoryStats::is_boosted)
            .unwrap_or(false)
    }

    pub fn is_suppressed_for(&self, category: &str) -> bool {
        self.category_stats
            .get(category)
            .map(CategoryStats::is_suppressed)
            .unwrap_or(false)
    }
}

/// Pick-order comparator per spec §4.3 (lower sorts first / picked first).
pub fn pick_order(a: &Sector, b: &Sector) -> Ordering {
    // 1. non-polished before polished
    let polished_cmp = a.is_polished().cmp(&b.is_polished());
    if polished_cmp != Ordering::Equal {
        return polished_cmp;
    }
    // 2. never-scanned first
    let never_scanned = |s: &Sector| s.scan_count == 0;
    let never_cmp = never_scanned(b).cmp(&never_scanned(a));
    if never_cmp != Ordering::Equal {
        return never_cmp;
    }
    // 3. lower last_scanned_cycle first
    let cycle_cmp = a.last_scanned_cycle.cmp(&b.last_scanned_cycle);
    if cycle_cmp != Ordering::Equal {
        return cycle_cmp;
    }
    // 4. both older than 7 days and differ by > 1 day: older first
    if let (Some(a_at), Some(b_at)) = (a.last_scanned_at, b.last_scanned_at) {
        let now = Utc::now();
        let a_age = now - a_at;
        let b_age = now - b_at;
        let seven_days = chrono::Duration::days(7);
        let one_day = chrono::Duration::days(1);
        if a_age > seven_days && b_age > seven_days && (a_age - b_age).abs() > one_day {
            let age_cmp = b_age.cmp(&a_age);
            if age_cmp != Ordering::Equal {
                return age_cmp;
            }
        }
    }
    // 5. low classification confidence first
    let conf_cmp = a
        .classification_confidence
        .partial_cmp(&b.classification_confidence)
        .unwrap_or(Ordering::Equal);
    if conf_cmp != Ordering::Equal {
        return conf_cmp;
    }
    // 6. non-barren first
    let barren_cmp = a.is_barren().cmp(&b.is_barren());
    if barren_cmp != Ordering::Equal {
        return barren_cmp;
    }
    // 7. non-high-failure-rate first
    let failure_cmp = a.is_high_failure().cmp(&b.is_high_failure());
    if failure_cmp != Ordering::Equal {
        return failure_cmp;
    }
    // 8. higher proposal_yield first (reverse)
    let yield_cmp = b
        .proposal_yield
        .partial_cmp(&a.proposal_yield)
        .unwrap_or(Ordering::Equal);
    if yield_cmp != Ordering::Equal {
        return yield_cmp;
    }
    // 9. higher success_count first (reverse)
    let success_cmp = b.success_count.cmp(&a.success_count);
    if success_cmp != Ordering::Equal {
        return success_cmp;
    }
    // 10. alphabetical
    a.path.cmp(&b.path)
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SectorMap {
    pub sectors: Vec<Sector>,
}

impl SectorMap {
    pub fn next_pick(&self) -> Option<&Sector> {
        self.sectors.iter().min_by(|a, b| pick_order(a, b))
    }

    pub fn get_mut(&mut self, path: &str) -> Option<&mut Sector> {
        self.sectors.iter_mut().find(|s| s.path == path)
    }

    pub fn upsert(&mut self, sector: Sector) {
        if let Some(existing) = self.get_mut(&sector.path) {
            *existing = sector;
        } else {
            self.sectors.push(sector);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn never_scanned_beats_scanned() {
        let mut map = SectorMap::default();
        let mut scanned = Sector::new("src/old", "lib");
        scanned.scan_count = 3;
        scanned.last_scanned_cycle = 1;
        map.upsert(scanned);
        map.upsert(Sector::new("src/new", "lib"));
        assert_eq!(map.next_pick().unwrap().path, "src/new");
    }

    #[test]
    fn polished_sector_sorts_after_unpolished() {
        let mut map = SectorMap::default();
        let mut polished = Sector::new("src/done", "lib");
        polished.scan_count = 6;
        polished.proposal_yield = 0.1;
        map.upsert(polished);
        let mut fresh = Sector::new("src/fresh", "lib");
        fresh.scan_count = 1;
        fresh.last_scanned_cycle = 1;
        map.upsert(fresh);
        assert_eq!(map.next_pick().unwrap().path, "src/fresh");
    }

    #[test]
    fn ema_yield_updates_toward_observation() {
        let mut s = Sector::new("src/x", "lib");
        s.record_scan_result(1, 1, None);
        assert_eq!(s.proposal_yield, 1.0);
        s.record_scan_result(2, 0, None);
        assert!((s.proposal_yield - 0.7).abs() < 1e-9);
    }

    #[test]
    fn outcome_counts_decay_every_twenty() {
        let mut s = Sector::new("src/x", "lib");
        for _ in 0..20 {
            s.record_outcome("fix", true);
        }
        assert_eq!(s.success_count, 10);
    }

    #[test]
    fn category_affinity_boost_and_suppress() {
        let mut s = Sector::new("src/x", "lib");
        for _ in 0..3 {
            s.record_outcome("fix", true);
        }
        assert!(s.is_boosted_for("fix"));
        for _ in 0..3 {
            s.record_outcome("perf", false);
        }
        assert!(s.is_suppressed_for("perf"));
    }

    #[test]
    fn alphabetical_is_final_tiebreak() {
        let mut map = SectorMap::default();
        map.upsert(Sector::new("src/b", "lib"));
        map.upsert(Sector::new("src/a", "lib"));
        assert_eq!(map.next_pick().unwrap().path, "src/a");
    }
}
