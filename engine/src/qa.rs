//! QA runner: executes verification commands with capped output capture,
//! retry classification, and per-command stats (spec §4.13).

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::Read;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

const DEFAULT_BYTE_CAP: usize = 2 * 1024 * 1024;
const DEFAULT_TAIL_BYTES: usize = 64 * 1024;
const RING_BUFFER_LEN: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QaFailureClass {
    Environment,
    Timeout,
    Code,
}

impl QaFailureClass {
    pub fn max_retries(self) -> u32 {
        match self {
            QaFailureClass::Environment => 1,
            QaFailureClass::Timeout => 2,
            QaFailureClass::Code => 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandOutcome {
    Passed,
    Failed { class: QaFailureClass, tail: String },
    SkippedPreExisting,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CommandStats {
    pub successes: u32,
    pub failures: u32,
    pub timeouts: u32,
    pub consecutive_failures: u32,
    pub avg_duration_ms: f64,
    pub recent: Vec<bool>,
}

impl CommandStats {
    pub fn record(&mut self, passed: bool, duration: Duration, timed_out: bool) {
        let ms = duration.as_millis() as f64;
        let n = (self.successes + self.failures) as f64;
        self.avg_duration_ms = if n == 0.0 {
            ms
        } else {
            (self.avg_duration_ms * n + ms) / (n + 1.0)
        };
        if passed {
            self.successes += 1;
            self.consecutive_failures = 0;
        } else {
            self.failures += 1;
            self.consecutive_failures += 1;
            if timed_out {
                self.timeouts += 1;
            }
        }
        self.recent.push(passed);
        if self.recent.len() > RING_BUFFER_LEN {
            self.recent.remove(0);
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct QaStats {
    pub commands: HashMap<String, CommandStats>,
}

#[derive(Debug, Clone)]
pub struct QaOutput {
    pub truncated: String,
    pub tail: String,
    pub exit_code: Option<i32>,
}

fn cap_and_tail(bytes: &[u8], byte_cap: usize, tail_len: usize) -> (String, String) {
    let capped = if bytes.len() > byte_cap {
        &bytes[..byte_cap]
    } else {
        bytes
    };
    let tail_start = capped.len().saturating_sub(tail_len);
    (
        String::from_utf8_lossy(capped).into_owned(),
        String::from_utf8_lossy(&capped[tail_start..]).into_owned(),
    )
}

/// Run one verification command with a timeout, capturing capped
/// stdout+stderr. Sends SIGTERM then SIGKILL after a grace period on
/// timeout (spec §5 "Timeouts").
pub fn run_command(cmd: &str, timeout: Duration, byte_cap: usize) -> std::io::Result<(QaOutput, Duration, bool)> {
    let start = Instant::now();
    let mut child = Command::new("sh")
        .arg("-c")
        .arg(cmd)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;

    let mut timed_out = false;
    loop {
        if let Some(status) = child.try_wait()? {
            let mut out = Vec::new();
            if let Some(mut stdout) = child.stdout.take() {
                let _ = stdout.read_to_end(&mut out);
            }
            if let Some(mut stderr) = child.stderr.take() {
                let _ = stderr.read_to_end(&mut out);
            }
            let (truncated, tail) = cap_and_tail(&out, byte_cap, DEFAULT_TAIL_BYTES);
            return Ok((
                QaOutput {
                    truncated,
                    tail,
                    exit_code: status.code(),
                },
                start.elapsed(),
                timed_out,
            ));
        }
        if start.elapsed() > timeout {
            timed_out = true;
            let pid = Pid::from_raw(child.id() as i32);
            let _ = signal::kill(pid, Signal::SIGTERM);
            std::thread::sleep(Duration::from_millis(1_500));
            if child.try_wait()?.is_none() {
                let _ = signal::kill(pid, Signal::SIGKILL);
            }
            let _ = child.wait();
            return Ok((
                QaOutput {
                    truncated: String::new(),
                    tail: String::new(),
                    exit_code: None,
                },
                start.elapsed(),
                timed_out,
            ));
        }
        std::thread::sleep(Duration::from_millis(20));
    }
}

fn classify_failure(exit_code: Option<i32>, timed_out: bool, tail: &str) -> QaFailureClass {
    if timed_out {
        return QaFailureClass::Timeout;
    }
    let lowered = tail.to_lowercase();
    if exit_code.is_none()
        || lowered.contains("command not found")
        || lowered.contains("no such file or directory")
        || lowered.contains("permission denied")
    {
        return QaFailureClass::Environment;
    }
    QaFailureClass::Code
}

/// Run every command in `verification_commands`, skipping ones already
/// failing in the pre-session baseline, and update `stats` in place.
pub fn run_qa(
    verification_commands: &[String],
    baseline_failures: &[String],
    stats: &mut QaStats,
    timeout: Duration,
) -> Vec<(String, CommandOutcome)> {
    let mut outcomes = Vec::new();
    for cmd in verification_commands {
        if baseline_failures.iter().any(|b| b == cmd) {
            outcomes.push((cmd.clone(), CommandOutcome::SkippedPreExisting));
            continue;
        }
        let (output, duration, timed_out) = match run_command(cmd, timeout, DEFAULT_BYTE_CAP) {
            Ok(r) => r,
            Err(e) => {
                let entry = stats.commands.entry(cmd.clone()).or_default();
                entry.record(false, Duration::from_secs(0), false);
                outcomes.push((
                    cmd.clone(),
                    CommandOutcome::Failed {
                        class: QaFailureClass::Environment,
                        tail: e.to_string(),
                    },
                ));
                continue;
            }
        };
        let passed = !timed_out && output.exit_code == Some(0);
        let entry = stats.commands.entry(cmd.clone()).or_default();
        entry.record(passed, duration, timed_out);
        if passed {
            outcomes.push((cmd.clone(), CommandOutcome::Passed));
        } else {
            let class = classify_failure(output.exit_code, timed_out, &output.tail);
            outcomes.push((cmd.clone(), CommandOutcome::Failed { class, tail: output.tail }));
        }
    }
    outcomes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn successful_command_is_recorded_passed() {
        let mut stats = QaStats::default();
        let outcomes = run_qa(&["true".to_string()], &[], &mut stats, Duration::from_secs(5));
        assert_eq!(outcomes[0].1, CommandOutcome::Passed);
        assert_eq!(stats.commands["true"].successes, 1);
    }

    #[test]
    fn failing_command_is_classified_code() {
        let mut stats = QaStats::default();
        let outcomes = run_qa(&["exit 1".to_string()], &[], &mut stats, Duration::from_secs(5));
        match &outcomes[0].1 {
            CommandOutcome::Failed { class, .. } => assert_eq!(*class, QaFailureClass::Code),
            _ => panic!("expected failure"),
        }
    }

    #[test]
    fn missing_binary_is_classified_environment() {
        let mut stats = QaStats::default();
        let outcomes = run_qa(
            &["definitely-not-a-real-binary-xyz".to_string()],
            &[],
            &mut stats,
            Duration::from_secs(5),
        );
        match &outcomes[0].1 {
            CommandOutcome::Failed { class, .. } => assert_eq!(*class, QaFailureClass::Environment),
            _ => panic!("expected failure"),
        }
    }

    #[test]
    fn pre_existing_baseline_failure_is_skipped() {
        let mut stats = QaStats::default();
        let outcomes = run_qa(
            &["exit 1".to_string()],
            &["exit 1".to_string()],
            &mut stats,
            Duration::from_secs(5),
        );
        assert_eq!(outcomes[0].1, CommandOutcome::SkippedPreExisting);
        assert!(stats.commands.is_empty());
    }

    #[test]
    fn consecutive_failures_reset_on_success() {
        let mut stats = QaStats::default();
        let mut entry = CommandStats::default();
        entry.record(false, Duration::from_millis(10), false);
        entry.record(false, Duration::from_millis(10), false);
        assert_eq!(entry.consecutive_failures, 2);
        entry.record(true, Duration::from_millis(10), false);
        assert_eq!(entry.consecutive_failures, 0);
        stats.commands.insert("x".into(), entry);
    }

    #[test]
    fn ring_buffer_caps_at_ten() {
        let mut entry = CommandStats::default();
        for _ in 0..15 {
            entry.record(true, Duration::from_millis(1), false);
        }
        assert_eq!(entry.recent.len(), RING_BUFFER_LEN);
    }

    #[test]
    fn failure_class_retry_limits_match_spec() {
        assert_eq!(QaFailureClass::Environment.max_retries(), 1);
        assert_eq!(QaFailureClass::Timeout.max_retries(), 2);
        assert_eq!(QaFailureClass::Code.max_retries(), 3);
    }
}
