//! Loop detector: catches a ticket worker stalling, oscillating, repeating
//! itself, QA ping-ponging, or hammering the same failing command.
//!
//! Detection rules run in a fixed priority order and the first match wins
//! (spec §4.6). Rolling buffers are capped so `SpindleState` stays small
//! enough to persist on every worker tick.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

const MAX_HASHES: usize = 10;
const MAX_COMMAND_SIGNATURES: usize = 20;
const MAX_FILE_EDIT_ENTRIES: usize = 50;

const DEFAULT_MAX_STALL_ITERATIONS: u32 = 5;
const DEFAULT_MAX_SIMILAR_OUTPUTS: usize = 3;
const DEFAULT_MAX_QA_PING_PONG: u32 = 3;
const DEFAULT_MAX_COMMAND_FAILURES: u32 = 3;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SpindleState {
    pub iterations_since_change: u32,
    pub diff_hashes: Vec<String>,
    pub output_hashes: Vec<String>,
    pub plan_hashes: Vec<String>,
    pub failing_command_signatures: Vec<String>,
    pub file_edit_counts: HashMap<String, u32>,
    pub total_output_chars: u64,
    pub total_change_chars: u64,
}

fn push_capped(buf: &mut Vec<String>, item: String, cap: usize) {
    buf.push(item);
    if buf.len() > cap {
        buf.remove(0);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    None,
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpindleAction {
    Continue,
    Abort,
    Block,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpindleVerdict {
    pub action: SpindleAction,
    pub risk: RiskLevel,
    pub trigger: Option<&'static str>,
    pub recommendation: Option<String>,
}

impl SpindleVerdict {
    fn continue_with_risk(risk: RiskLevel) -> Self {
        Self {
            action: SpindleAction::Continue,
            risk,
            trigger: None,
            recommendation: None,
        }
    }

    fn triggered(action: SpindleAction, trigger: &'static str, recommendation: impl Into<String>) -> Self {
        Self {
            action,
            risk: RiskLevel::High,
            trigger: Some(trigger),
            recommendation: Some(recommendation.into()),
        }
    }
}

/// Observed outcome of a single worker iteration fed into the spindle.
pub struct Observation<'a> {
    pub output_hash: &'a str,
    pub diff_hash: &'a str,
    pub plan_hash: Option<&'a str>,
    pub changed: bool,
    pub edited_files: &'a [String],
    pub failing_command_signature: Option<&'a str>,
}

impl SpindleState {
    pub fn record(&mut self, obs: &Observation) {
        if obs.changed {
            self.iterations_since_change = 0;
        } else {
            self.iterations_since_change += 1;
        }
        push_capped(&mut self.diff_hashes, obs.diff_hash.to_string(), MAX_HASHES);
        push_capped(&mut self.output_hashes, obs.output_hash.to_string(), MAX_HASHES);
        if let Some(p) = obs.plan_hash {
            push_capped(&mut self.plan_hashes, p.to_string(), MAX_HASHES);
        }
        if let Some(sig) = obs.failing_command_signature {
            push_capped(
                &mut self.failing_command_signatures,
                sig.to_string(),
                MAX_COMMAND_SIGNATURES,
            );
        }
        self.total_output_chars += obs.output_hash.len() as u64;
        self.total_change_chars += obs.diff_hash.len() as u64;
        for f in obs.edited_files {
            let count = self.file_edit_counts.entry(f.clone()).or_insert(0);
            *count += 1;
        }
        if self.file_edit_counts.len() > MAX_FILE_EDIT_ENTRIES {
            let mut keys: Vec<_> = self.file_edit_counts.keys().cloned().collect();
            keys.sort_by_key(|k| self.file_edit_counts[k]);
            for k in keys.into_iter().take(self.file_edit_counts.len() - MAX_FILE_EDIT_ENTRIES) {
                self.file_edit_counts.remove(&k);
            }
        }
    }

    fn is_oscillating(&self) -> bool {
        let h = &self.diff_hashes;
        if h.len() < 3 {
            return false;
        }
        for i in 2..h.len() {
            if h[i] == h[i - 2] && h[i - 1] != h[i] {
                return true;
            }
        }
        false
    }

    fn is_repeating(&self, max_similar: usize) -> bool {
        let h = &self.output_hashes;
        if h.len() < max_similar {
            return false;
        }
        let tail = &h[h.len() - max_similar..];
        tail.iter().all(|x| x == &tail[0])
    }

    fn qa_ping_pong_count(&self) -> u32 {
        let sigs = &self.failing_command_signatures;
        if sigs.len() < 2 {
            return 0;
        }
        let mut alternations = 0;
        for i in 1..sigs.len() {
            if sigs[i] != sigs[i - 1] {
                alternations += 1;
            }
        }
        alternations
    }

    fn max_command_failure_streak(&self) -> u32 {
        let mut counts: HashMap<&str, u32> = HashMap::new();
        for sig in &self.failing_command_signatures {
            *counts.entry(sig.as_str()).or_insert(0) += 1;
        }
        counts.values().copied().max().unwrap_or(0)
    }

    /// Run the ordered detection rules and return a verdict. First match
    /// wins; otherwise a risk score is computed for an informational
    /// continue-verdict.
    pub fn evaluate(&self) -> SpindleVerdict {
        self.evaluate_with(
            DEFAULT_MAX_STALL_ITERATIONS,
            DEFAULT_MAX_SIMILAR_OUTPUTS,
            DEFAULT_MAX_QA_PING_PONG,
            DEFAULT_MAX_COMMAND_FAILURES,
        )
    }

    pub fn evaluate_with(
        &self,
        max_stall_iterations: u32,
        max_similar_outputs: usize,
        max_qa_ping_pong: u32,
        max_command_failures: u32,
    ) -> SpindleVerdict {
        if self.iterations_since_change >= max_stall_iterations {
            return SpindleVerdict::triggered(
                SpindleAction::Abort,
                "stalling",
                "no file changes across the last several iterations; abort and re-plan",
            );
        }
        if self.is_oscillating() {
            return SpindleVerdict::triggered(
                SpindleAction::Abort,
                "oscillation",
                "the diff is flipping between two states; abort and re-plan with a narrower scope",
            );
        }
        if self.is_repeating(max_similar_outputs) {
            return SpindleVerdict::triggered(
                SpindleAction::Abort,
                "repetition",
                "identical output repeated; abort, the agent is not making progress",
            );
        }
        if self.qa_ping_pong_count() > max_qa_ping_pong {
            return SpindleVerdict::triggered(
                SpindleAction::Abort,
                "qa_ping_pong",
                "QA failures are alternating between commands without resolution; abort",
            );
        }
        if self.max_command_failure_streak() >= max_command_failures {
            return SpindleVerdict::triggered(
                SpindleAction::Block,
                "command_failure",
                "the same command keeps failing; escalate to a human",
            );
        }
        SpindleVerdict::continue_with_risk(self.risk_level())
    }

    /// Aggregate risk score per spec §4.6: stall proximity, repeated-output
    /// pairs, high file-edit counts, command-failure streak.
    pub fn risk_score(&self) -> u32 {
        let mut score = 0;
        if self.iterations_since_change >= DEFAULT_MAX_STALL_ITERATIONS.saturating_sub(1) {
            score += 2;
        } else if self.iterations_since_change >= 2 {
            score += 1;
        }
        let repeated_pairs = self
            .output_hashes
            .windows(2)
            .filter(|w| w[0] == w[1])
            .count() as u32;
        score += repeated_pairs.min(2);
        if self.file_edit_counts.values().any(|&c| c >= 5) {
            score += 1;
        }
        let streak = self.max_command_failure_streak();
        if streak >= 2 {
            score += streak.min(3) - 1;
        }
        score
    }

    pub fn risk_level(&self) -> RiskLevel {
        match self.risk_score() {
            0 => RiskLevel::None,
            1 => RiskLevel::Low,
            2..=3 => RiskLevel::Medium,
            _ => RiskLevel::High,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn obs<'a>(output: &'a str, diff: &'a str, changed: bool) -> Observation<'a> {
        Observation {
            output_hash: output,
            diff_hash: diff,
            plan_hash: None,
            changed,
            edited_files: &[],
            failing_command_signature: None,
        }
    }

    #[test]
    fn stalling_triggers_abort_after_threshold() {
        let mut s = SpindleState::default();
        for i in 0..5 {
            s.record(&obs(&format!("o{i}"), &format!("d{i}"), false));
        }
        let verdict = s.evaluate();
        assert_eq!(verdict.action, SpindleAction::Abort);
        assert_eq!(verdict.trigger, Some("stalling"));
    }

    #[test]
    fn oscillation_a_b_a_triggers_abort() {
        let mut s = SpindleState::default();
        s.record(&obs("o1", "A", true));
        s.record(&obs("o2", "B", true));
        s.record(&obs("o3", "A", true));
        let verdict = s.evaluate();
        assert_eq!(verdict.trigger, Some("oscillation"));
    }

    #[test]
    fn identical_outputs_trigger_repetition() {
        let mut s = SpindleState::default();
        s.record(&obs("same", "d1", true));
        s.record(&obs("same", "d2", true));
        s.record(&obs("same", "d3", true));
        let verdict = s.evaluate();
        assert_eq!(verdict.trigger, Some("repetition"));
    }

    #[test]
    fn command_failure_streak_blocks_not_aborts() {
        let mut s = SpindleState::default();
        for i in 0..3 {
            let output = format!("o{i}");
            let diff = format!("d{i}");
            let mut o = obs(&output, &diff, true);
            o.failing_command_signature = Some("cargo test::test_foo");
            s.record(&o);
        }
        let verdict = s.evaluate();
        assert_eq!(verdict.action, SpindleAction::Block);
        assert_eq!(verdict.trigger, Some("command_failure"));
    }

    #[test]
    fn clean_progress_has_low_risk() {
        let mut s = SpindleState::default();
        s.record(&obs("o1", "d1", true));
        let verdict = s.evaluate();
        assert_eq!(verdict.action, SpindleAction::Continue);
        assert_eq!(verdict.risk, RiskLevel::None);
    }

    #[test]
    fn hash_buffers_stay_capped() {
        let mut s = SpindleState::default();
        for i in 0..20 {
            s.record(&obs(&format!("o{i}"), &format!("d{i}"), true));
        }
        assert_eq!(s.diff_hashes.len(), MAX_HASHES);
        assert_eq!(s.output_hashes.len(), MAX_HASHES);
    }
}
