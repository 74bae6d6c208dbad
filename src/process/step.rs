//! Classified outcome of one external invocation.

use std::time::Duration;

use serde::Serialize;

use crate::process::output::combine;

/// Exit code reported when a step was stopped by the terminate signal.
pub const TIMEOUT_EXIT_CODE: i32 = 124;

/// Exit code reported when a step had to be force-killed.
pub const KILLED_EXIT_CODE: i32 = 137;

/// How an invocation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepKind {
    /// Exit code 0.
    Success,
    /// Exceeded its budget. `forced` when the grace window also ran out.
    TimedOut { after: Duration, forced: bool },
    /// Nonzero exit without a timeout.
    Failed { exit_code: i32 },
}

impl StepKind {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::TimedOut { .. } => "timed_out",
            Self::Failed { .. } => "failed",
        }
    }
}

/// Outcome of one external invocation.
#[derive(Debug, Clone, Serialize)]
pub struct StepResult {
    /// Printable command line.
    pub command: String,
    pub kind: StepKind,
    pub stdout: String,
    pub stderr: String,
    /// Both pipes reached end-of-file before the result was produced.
    pub flushed: bool,
    pub elapsed: Duration,
}

impl StepResult {
    /// A failure that never reached a running process (spawn error, contract violation).
    pub fn failed(command: impl Into<String>, exit_code: i32, message: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            kind: StepKind::Failed { exit_code },
            stdout: String::new(),
            stderr: message.into(),
            flushed: true,
            elapsed: Duration::ZERO,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.kind, StepKind::Success)
    }

    /// Exit code to propagate: 0, 124/137 for the timeout variants, or the process code.
    pub fn exit_code(&self) -> i32 {
        match self.kind {
            StepKind::Success => 0,
            StepKind::TimedOut { forced: false, .. } => TIMEOUT_EXIT_CODE,
            StepKind::TimedOut { forced: true, .. } => KILLED_EXIT_CODE,
            StepKind::Failed { exit_code } => exit_code,
        }
    }

    /// Stdout and stderr combined for display.
    pub fn output(&self) -> String {
        combine(&self.stdout, &self.stderr)
    }
}
