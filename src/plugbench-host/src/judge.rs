//! Verdicts for autonomous test runs.
//!
//! The engine never talks to a model provider itself. A [`Judge`] receives the prompt,
//! the plugin's answer and the stated expectation, and decides whether the answer is
//! good enough or a follow-up turn is needed.

use crate::protocol::EXECUTE_TIMEOUT;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};

const WAIT_POLL: Duration = Duration::from_millis(20);
const OUTPUT_GRACE: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JudgeOutcome {
    Success,
    Acceptable,
    FollowUp,
    Failure,
}

/// One user/plugin exchange already seen by the judge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    pub user: String,
    pub assistant: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Assessment<'a> {
    pub prompt: &'a str,
    pub response: &'a str,
    pub expectation: &'a str,
    pub history: &'a [Turn],
    pub remaining_turns: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verdict {
    pub outcome: JudgeOutcome,
    #[serde(default)]
    pub reasoning: String,
    #[serde(default)]
    pub confidence: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub follow_up_prompt: Option<String>,
}

impl Verdict {
    pub fn passed(&self) -> bool {
        matches!(self.outcome, JudgeOutcome::Success | JudgeOutcome::Acceptable)
    }
}

#[derive(Debug, Error)]
pub enum JudgeError {
    #[error("judge unavailable: {0}")]
    Unavailable(String),
    #[error("judge returned an invalid verdict: {0}")]
    InvalidVerdict(String),
    #[error("judge did not answer within {} ms", .0.as_millis())]
    TimedOut(Duration),
    #[error("judge I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

pub trait Judge: Send + Sync {
    fn assess(&self, assessment: &Assessment<'_>) -> Result<Verdict, JudgeError>;
}

/// Runs an external command per assessment: the assessment is written to its stdin as
/// JSON and a [`Verdict`] is read back from its stdout.
#[derive(Debug, Clone)]
pub struct CommandJudge {
    program: PathBuf,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandJudge {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            timeout: EXECUTE_TIMEOUT,
        }
    }

    /// Kill the command when it has not exited after `timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Split a command line on whitespace: the first word is the program.
    pub fn from_command_line(line: &str) -> Result<Self, JudgeError> {
        let mut words = line.split_whitespace();
        let program = words
            .next()
            .ok_or_else(|| JudgeError::Unavailable("empty judge command".to_string()))?;
        Ok(Self::new(program, words.map(str::to_string).collect()))
    }
}

impl Judge for CommandJudge {
    fn assess(&self, assessment: &Assessment<'_>) -> Result<Verdict, JudgeError> {
        let payload = serde_json::to_vec(assessment)
            .map_err(|err| JudgeError::InvalidVerdict(err.to_string()))?;

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|err| {
                JudgeError::Unavailable(format!("{}: {err}", self.program.display()))
            })?;

        // Pipes are serviced on their own threads so a judge that never reads or never
        // exits cannot stall the run past the deadline.
        if let Some(mut stdin) = child.stdin.take() {
            thread::Builder::new()
                .name("judge-stdin".into())
                .spawn(move || {
                    if let Err(err) = stdin.write_all(&payload) {
                        debug!(error = %err, "judge closed stdin early");
                    }
                })?;
        }
        let (tx, rx) = mpsc::channel();
        if let Some(mut stdout) = child.stdout.take() {
            thread::Builder::new()
                .name("judge-stdout".into())
                .spawn(move || {
                    let mut buffer = Vec::new();
                    let _ = tx.send(stdout.read_to_end(&mut buffer).map(|_| buffer));
                })?;
        }

        let deadline = Instant::now() + self.timeout;
        let status = loop {
            if let Some(status) = child.try_wait()? {
                break status;
            }
            if Instant::now() >= deadline {
                let _ = child.kill();
                let _ = child.wait();
                warn!(
                    program = %self.program.display(),
                    timeout_ms = self.timeout.as_millis() as u64,
                    "judge timed out, killed"
                );
                return Err(JudgeError::TimedOut(self.timeout));
            }
            thread::sleep(WAIT_POLL);
        };
        if !status.success() {
            return Err(JudgeError::Unavailable(format!(
                "{} exited with {status}",
                self.program.display()
            )));
        }

        let wait = deadline.saturating_duration_since(Instant::now()).max(OUTPUT_GRACE);
        let stdout = match rx.recv_timeout(wait) {
            Ok(read) => read?,
            Err(_) => return Err(JudgeError::TimedOut(self.timeout)),
        };
        let verdict: Verdict = serde_json::from_slice(&stdout)
            .map_err(|err| JudgeError::InvalidVerdict(err.to_string()))?;
        debug!(outcome = ?verdict.outcome, confidence = verdict.confidence, "judge verdict");
        Ok(verdict)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assessment() -> Assessment<'static> {
        Assessment {
            prompt: "say hi",
            response: "hi",
            expectation: "greets the user",
            history: &[],
            remaining_turns: 2,
        }
    }

    #[test]
    fn verdict_parses_with_defaults() {
        let verdict: Verdict = serde_json::from_str(r#"{"outcome": "follow_up"}"#).unwrap();
        assert_eq!(verdict.outcome, JudgeOutcome::FollowUp);
        assert!(verdict.reasoning.is_empty());
        assert!(!verdict.passed());

        let ok: Verdict = serde_json::from_str(r#"{"outcome": "acceptable", "confidence": 0.7}"#).unwrap();
        assert!(ok.passed());
    }

    #[test]
    fn empty_command_is_rejected() {
        assert!(matches!(
            CommandJudge::from_command_line("   "),
            Err(JudgeError::Unavailable(_))
        ));
    }

    #[cfg(unix)]
    #[test]
    fn command_judge_reads_verdict_from_stdout() {
        let judge = CommandJudge::new(
            "sh",
            vec![
                "-c".into(),
                r#"cat > /dev/null; echo '{"outcome":"success","reasoning":"fine","confidence":0.9}'"#.into(),
            ],
        );
        let verdict = judge.assess(&assessment()).unwrap();
        assert_eq!(verdict.outcome, JudgeOutcome::Success);
        assert_eq!(verdict.reasoning, "fine");
    }

    #[cfg(unix)]
    #[test]
    fn command_judge_is_killed_after_timeout() {
        let judge = CommandJudge::new("sh", vec!["-c".into(), "sleep 5".into()])
            .with_timeout(Duration::from_millis(100));
        let started = Instant::now();
        let err = judge.assess(&assessment()).unwrap_err();
        assert!(matches!(err, JudgeError::TimedOut(_)));
        assert_eq!(err.to_string(), "judge did not answer within 100 ms");
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[cfg(unix)]
    #[test]
    fn command_judge_reports_garbage() {
        let judge = CommandJudge::new("sh", vec!["-c".into(), "cat > /dev/null; echo nope".into()]);
        assert!(matches!(
            judge.assess(&assessment()),
            Err(JudgeError::InvalidVerdict(_))
        ));
    }
}
