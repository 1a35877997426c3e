//! Outer wake loop: triggers a bounded session on a timer or new commit
//! activity, with adaptive sleep and quiet hours (spec §4.15).

use chrono::{DateTime, NaiveTime, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const BASE_INTERVAL_SECS: u64 = 15 * 60;
const MIN_INTERVAL_SECS: u64 = 5 * 60;
const MAX_INTERVAL_MULTIPLIER: f64 = 3.0;
const POLL_CAP_SECS: u64 = 60;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonState {
    pub last_wake_at: Option<DateTime<Utc>>,
    pub current_interval_secs: u64,
    pub consecutive_idle_wakes: u32,
    pub last_seen_commit: Option<String>,
}

impl Default for DaemonState {
    fn default() -> Self {
        Self {
            last_wake_at: None,
            current_interval_secs: BASE_INTERVAL_SECS,
            consecutive_idle_wakes: 0,
            last_seen_commit: None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct QuietHours {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl QuietHours {
    /// True if `now`'s time-of-day falls within the quiet window, handling
    /// windows that wrap past midnight.
    pub fn contains(&self, now: DateTime<Utc>) -> bool {
        let t = now.time();
        if self.start <= self.end {
            t >= self.start && t < self.end
        } else {
            t >= self.start || t < self.end
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeDecision {
    Sleep { for_secs: u64 },
    Wake,
}

pub struct WakeCheck<'a> {
    pub now: DateTime<Utc>,
    pub state: &'a DaemonState,
    pub quiet_hours: Option<QuietHours>,
    pub new_commits_since_wake: bool,
}

pub fn check_wake(check: &WakeCheck) -> WakeDecision {
    if let Some(qh) = check.quiet_hours {
        if qh.contains(check.now) {
            return WakeDecision::Sleep { for_secs: POLL_CAP_SECS };
        }
    }

    let elapsed = check
        .state
        .last_wake_at
        .map(|t| (check.now - t).num_seconds().max(0) as u64)
        .unwrap_or(u64::MAX);

    let timer_expired = elapsed >= check.state.current_interval_secs;
    if timer_expired || check.new_commits_since_wake {
        WakeDecision::Wake
    } else {
        let remaining = check.state.current_interval_secs - elapsed;
        WakeDecision::Sleep {
            for_secs: remaining.min(POLL_CAP_SECS),
        }
    }
}

/// Adaptive interval formula (spec §4.15): base × multiplier, clamped to
/// `[5 min, 3 × base]`.
pub fn next_interval(
    base_secs: u64,
    had_work: bool,
    had_commits: bool,
    in_quiet_hours: bool,
    consecutive_idle_wakes: u32,
) -> u64 {
    let multiplier = if in_quiet_hours {
        0.25
    } else if had_work && had_commits {
        0.5
    } else if had_commits {
        1.0
    } else {
        (1.5 + 0.25 * consecutive_idle_wakes as f64).min(MAX_INTERVAL_MULTIPLIER)
    };
    let raw = (base_secs as f64 * multiplier) as u64;
    raw.clamp(MIN_INTERVAL_SECS, (base_secs as f64 * MAX_INTERVAL_MULTIPLIER) as u64)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WakeMetrics {
    pub cycles_run: u32,
    pub tickets_completed: u32,
    pub prs_created: u32,
    pub ended_phase: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WebhookKind {
    Slack,
    Discord,
    Telegram,
    Generic,
}

#[derive(Debug, Clone)]
pub struct WebhookTarget {
    pub kind: WebhookKind,
    pub url: String,
}

/// Sends a wake-summary notification to every configured webhook. Uses
/// `reqwest::blocking` since the daemon's own loop is synchronous.
pub fn notify_webhooks(targets: &[WebhookTarget], metrics: &WakeMetrics) -> Vec<Result<(), String>> {
    let client = reqwest::blocking::Client::builder()
        .timeout(Duration::from_secs(10))
        .build();
    let client = match client {
        Ok(c) => c,
        Err(e) => return targets.iter().map(|_| Err(e.to_string())).collect(),
    };

    targets
        .iter()
        .map(|target| {
            let body = render_payload(target.kind, metrics);
            client
                .post(&target.url)
                .json(&body)
                .send()
                .map(|_| ())
                .map_err(|e| e.to_string())
        })
        .collect()
}

fn render_payload(kind: WebhookKind, metrics: &WakeMetrics) -> serde_json::Value {
    let text = format!(
        "BlockSpool wake: {} cycle(s), {} ticket(s) completed, {} PR(s), ended in {}",
        metrics.cycles_run, metrics.tickets_completed, metrics.prs_created, metrics.ended_phase
    );
    match kind {
        WebhookKind::Slack => serde_json::json!({ "text": text }),
        WebhookKind::Discord => serde_json::json!({ "content": text }),
        WebhookKind::Telegram => serde_json::json!({ "text": text }),
        WebhookKind::Generic => serde_json::json!({ "message": text, "metrics": metrics }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    #[test]
    fn timer_not_expired_and_no_commits_sleeps() {
        let state = DaemonState {
            last_wake_at: Some(Utc::now()),
            current_interval_secs: 900,
            ..Default::default()
        };
        let check = WakeCheck {
            now: Utc::now(),
            state: &state,
            quiet_hours: None,
            new_commits_since_wake: false,
        };
        assert!(matches!(check_wake(&check), WakeDecision::Sleep { .. }));
    }

    #[test]
    fn expired_timer_wakes() {
        let state = DaemonState {
            last_wake_at: Some(Utc::now() - ChronoDuration::seconds(1000)),
            current_interval_secs: 900,
            ..Default::default()
        };
        let check = WakeCheck {
            now: Utc::now(),
            state: &state,
            quiet_hours: None,
            new_commits_since_wake: false,
        };
        assert_eq!(check_wake(&check), WakeDecision::Wake);
    }

    #[test]
    fn new_commits_force_wake_even_before_timer() {
        let state = DaemonState {
            last_wake_at: Some(Utc::now()),
            current_interval_secs: 900,
            ..Default::default()
        };
        let check = WakeCheck {
            now: Utc::now(),
            state: &state,
            quiet_hours: None,
            new_commits_since_wake: true,
        };
        assert_eq!(check_wake(&check), WakeDecision::Wake);
    }

    #[test]
    fn quiet_hours_suppresses_wake() {
        let state = DaemonState::default();
        let qh = QuietHours {
            start: NaiveTime::from_hms_opt(22, 0, 0).unwrap(),
            end: NaiveTime::from_hms_opt(6, 0, 0).unwrap(),
        };
        let midnight = Utc::now().date_naive().and_hms_opt(23, 30, 0).unwrap().and_utc();
        let check = WakeCheck {
            now: midnight,
            state: &state,
            quiet_hours: Some(qh),
            new_commits_since_wake: true,
        };
        assert!(matches!(check_wake(&check), WakeDecision::Sleep { .. }));
    }

    #[test]
    fn interval_shrinks_under_active_work_and_commits() {
        let interval = next_interval(BASE_INTERVAL_SECS, true, true, false, 0);
        assert_eq!(interval, BASE_INTERVAL_SECS / 2);
    }

    #[test]
    fn interval_grows_with_consecutive_idle_wakes_but_is_capped() {
        let interval = next_interval(BASE_INTERVAL_SECS, false, false, false, 10);
        assert_eq!(interval, (BASE_INTERVAL_SECS as f64 * MAX_INTERVAL_MULTIPLIER) as u64);
    }

    #[test]
    fn interval_never_drops_below_minimum() {
        let interval = next_interval(60, true, true, false, 0);
        assert_eq!(interval, MIN_INTERVAL_SECS);
    }
}
