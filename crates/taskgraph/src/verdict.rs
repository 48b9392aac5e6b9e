use std::fmt;
use std::time::Duration;

use serde::Serialize;

use crate::error::TaskError;
use crate::process::ProcessOutcome;
use crate::value::Value;

/// Execution status of a single program run. Not a judgement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "code", rename_all = "snake_case")]
pub enum RunStatus {
    Ok,
    TimeLimitExceeded,
    /// Killed by the contained signal.
    RuntimeError(i32),
    /// Exited on its own with the contained non-zero code.
    ExitedAbnormally(i32),
}

impl RunStatus {
    /// Classify an exit code as reported by [`ProcessOutcome::code`].
    pub fn classify(code: i32) -> Self {
        match code {
            0 => RunStatus::Ok,
            c if c == -libc::SIGXCPU => RunStatus::TimeLimitExceeded,
            c if c < 0 => RunStatus::RuntimeError(-c),
            c => RunStatus::ExitedAbnormally(c),
        }
    }

    pub fn is_ok(self) -> bool {
        self == RunStatus::Ok
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunStatus::Ok => write!(f, "OK"),
            RunStatus::TimeLimitExceeded => write!(f, "Time Limit Exceeded"),
            RunStatus::RuntimeError(sig) => write!(f, "Runtime Error (signal {sig})"),
            RunStatus::ExitedAbnormally(code) => write!(f, "Exited Abnormally ({code})"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunResult {
    #[serde(flatten)]
    pub status: RunStatus,
    /// Wall time of the run; `None` when nothing was executed.
    pub elapsed: Option<Duration>,
}

impl RunResult {
    pub fn ok_without_run() -> Self {
        Self {
            status: RunStatus::Ok,
            elapsed: None,
        }
    }

    pub fn from_outcome(outcome: &ProcessOutcome) -> Self {
        Self {
            status: RunStatus::classify(outcome.code),
            elapsed: Some(outcome.elapsed),
        }
    }

    /// Interpret the value returned by a process unit or a compile step.
    pub fn from_value(value: &Value) -> Result<Self, TaskError> {
        match value {
            Value::Process(outcome) => Ok(Self::from_outcome(outcome)),
            Value::None => Ok(Self::ok_without_run()),
            other => Err(TaskError::msg(format!("not a run result: {other}"))),
        }
    }
}

impl fmt::Display for RunResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.elapsed {
            Some(elapsed) => write!(f, "{} ({:.2}s)", self.status, elapsed.as_secs_f64()),
            None => write!(f, "{}", self.status),
        }
    }
}
