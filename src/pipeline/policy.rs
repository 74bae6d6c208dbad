//! Step classification and the outcome fold.
//!
//! Steps run exactly once. The policy only decides whether a result lets the
//! pipeline continue and what the final status of a run is.

use crate::process::{StepKind, StepResult};

use super::types::{FailureKind, OutcomeStatus, Stage, StepPolicy, StepRecord};

/// Decision taken after one step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Continue,
    /// Stop and notify with this status.
    Abort(OutcomeStatus),
}

/// Classify one record. Best-effort steps always continue.
pub fn classify(record: &StepRecord) -> Verdict {
    if record.policy == StepPolicy::BestEffort {
        return Verdict::Continue;
    }
    match failure_status(record.stage, &record.result) {
        Some(status) => Verdict::Abort(status),
        None => Verdict::Continue,
    }
}

/// Fold the records of a run, in execution order, into a status.
///
/// The first fatal failure wins. With no failure the run committed when a
/// commit step ran, and is a no-op otherwise.
pub fn fold(records: &[StepRecord]) -> OutcomeStatus {
    let mut pull_request = None;
    let mut committed = false;

    for record in records {
        if let Verdict::Abort(status) = classify(record) {
            return status;
        }
        if record.stage == Stage::Commit {
            committed = true;
            if let Some(url) = pull_request_url(&record.result.stdout) {
                pull_request = Some(url);
            }
        }
    }

    if committed {
        OutcomeStatus::Committed { pull_request }
    } else {
        OutcomeStatus::NoChanges
    }
}

/// Status for a precondition that stopped the run before any step.
pub fn precondition(detail: impl Into<String>) -> OutcomeStatus {
    OutcomeStatus::Failed {
        kind: FailureKind::Precondition,
        stage: None,
        exit_code: PRECONDITION_EXIT_CODE,
        detail: detail.into(),
    }
}

/// Exit code for precondition failures.
pub const PRECONDITION_EXIT_CODE: i32 = 2;

fn failure_status(stage: Stage, result: &StepResult) -> Option<OutcomeStatus> {
    match result.kind {
        StepKind::Success => None,
        StepKind::TimedOut { after, forced } => Some(OutcomeStatus::Failed {
            kind: FailureKind::Timeout,
            stage: Some(stage),
            exit_code: result.exit_code(),
            detail: format!(
                "{stage} timed out after {} seconds{}",
                after.as_secs(),
                if forced { " and was killed" } else { "" }
            ),
        }),
        StepKind::Failed { exit_code } => Some(OutcomeStatus::Failed {
            kind: FailureKind::ProcessFailure,
            stage: Some(stage),
            exit_code,
            detail: failure_detail(stage, exit_code, result),
        }),
    }
}

fn failure_detail(stage: Stage, exit_code: i32, result: &StepResult) -> String {
    let mut detail = format!("{stage} failed with exit code {exit_code}");
    if let Some(line) = last_line(&result.stderr) {
        detail.push_str(": ");
        detail.push_str(line);
    }
    detail
}

/// Pull request URL printed by the host CLI: the last non-empty stdout line.
pub fn pull_request_url(stdout: &str) -> Option<String> {
    last_line(stdout)
        .filter(|line| line.starts_with("https://") || line.starts_with("http://"))
        .map(str::to_string)
}

fn last_line(s: &str) -> Option<&str> {
    s.lines().map(str::trim).rev().find(|l| !l.is_empty())
}
