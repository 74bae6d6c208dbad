//! Shared types for the task pipeline.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::process::StepResult;

// ── Task context ────────────────────────────────────────────────────

/// One triggering event and its target directory.
///
/// Built once by the mail source (or the `run` subcommand) and never changed
/// afterwards; fields are private and exposed through getters only.
#[derive(Debug, Clone, Serialize)]
pub struct TaskContext {
    id: Uuid,
    subject: String,
    prompt: String,
    /// Originating issue or pull request URL.
    origin: Option<String>,
    /// `owner/repo` on the repository host.
    repository: Option<String>,
    working_dir: PathBuf,
    /// Address to answer when notifying by mail.
    reply_to: Option<String>,
    received_at: DateTime<Utc>,
}

impl TaskContext {
    /// New context whose prompt is the subject itself.
    pub fn new(subject: impl Into<String>, working_dir: impl Into<PathBuf>) -> Self {
        let subject = subject.into();
        Self {
            id: Uuid::new_v4(),
            prompt: subject.clone(),
            subject,
            origin: None,
            repository: None,
            working_dir: working_dir.into(),
            reply_to: None,
            received_at: Utc::now(),
        }
    }

    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = prompt.into();
        self
    }

    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = Some(origin.into());
        self
    }

    pub fn with_repository(mut self, repository: impl Into<String>) -> Self {
        self.repository = Some(repository.into());
        self
    }

    pub fn with_reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.reply_to = Some(reply_to.into());
        self
    }

    pub fn with_received_at(mut self, received_at: DateTime<Utc>) -> Self {
        self.received_at = received_at;
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn prompt(&self) -> &str {
        &self.prompt
    }

    pub fn origin(&self) -> Option<&str> {
        self.origin.as_deref()
    }

    pub fn repository(&self) -> Option<&str> {
        self.repository.as_deref()
    }

    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    pub fn reply_to(&self) -> Option<&str> {
        self.reply_to.as_deref()
    }

    pub fn received_at(&self) -> DateTime<Utc> {
        self.received_at
    }
}

// ── Stages and states ───────────────────────────────────────────────

/// Logical step a `StepResult` belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Cloning a missing working directory.
    Clone,
    Assistant,
    /// Working-tree status query.
    Status,
    /// Branch, commit, push and pull request.
    Commit,
    /// Outcome message; always best-effort.
    Notify,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Clone => "clone",
            Self::Assistant => "assistant",
            Self::Status => "status",
            Self::Commit => "commit",
            Self::Notify => "notify",
        };
        write!(f, "{s}")
    }
}

/// Pipeline state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    Idle,
    /// Making sure the working directory exists.
    Preparing,
    RunningAssistant,
    CheckingChanges,
    Committing,
    Notifying,
    Done,
}

impl PipelineState {
    /// Check if this state allows transitioning to another state.
    pub fn can_transition_to(&self, target: PipelineState) -> bool {
        use PipelineState::*;

        matches!(
            (self, target),
            (Idle, Preparing) |
            (Preparing, RunningAssistant) |
            (RunningAssistant, CheckingChanges) |
            (CheckingChanges, Committing) |
            // No changes skips the commit
            (CheckingChanges, Notifying) |
            (Committing, Notifying) |
            (Notifying, Done) |
            // Error path from every working state
            (Preparing, Notifying) |
            (RunningAssistant, Notifying)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done)
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Preparing => "preparing",
            Self::RunningAssistant => "running_assistant",
            Self::CheckingChanges => "checking_changes",
            Self::Committing => "committing",
            Self::Notifying => "notifying",
            Self::Done => "done",
        };
        write!(f, "{s}")
    }
}

/// A state transition event.
#[derive(Debug, Clone, Serialize)]
pub struct StateTransition {
    pub from: PipelineState,
    pub to: PipelineState,
    pub timestamp: DateTime<Utc>,
    pub reason: Option<String>,
}

// ── Step records ────────────────────────────────────────────────────

/// Whether a failing step ends the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepPolicy {
    Fatal,
    /// Failure is logged; the fold ignores it.
    BestEffort,
}

/// One executed step, in execution order.
#[derive(Debug, Clone, Serialize)]
pub struct StepRecord {
    pub stage: Stage,
    pub policy: StepPolicy,
    pub result: StepResult,
}

// ── Outcome ─────────────────────────────────────────────────────────

/// Failure taxonomy surfaced to notifications and exit codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Timeout,
    ProcessFailure,
    Precondition,
}

/// Final classification of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum OutcomeStatus {
    /// Changes were committed and a pull request opened.
    Committed { pull_request: Option<String> },
    /// The assistant left the working tree clean.
    NoChanges,
    Failed {
        kind: FailureKind,
        /// `None` for preconditions checked before any step.
        stage: Option<Stage>,
        exit_code: i32,
        detail: String,
    },
}

impl OutcomeStatus {
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Committed { .. } | Self::NoChanges => 0,
            Self::Failed { exit_code, .. } => *exit_code,
        }
    }

    pub fn is_success(&self) -> bool {
        !matches!(self, Self::Failed { .. })
    }

    /// Human-readable message posted to the notification channel.
    pub fn message(&self, subject: &str) -> String {
        match self {
            Self::Committed {
                pull_request: Some(url),
            } => format!("Task \"{subject}\" completed; opened {url}"),
            Self::Committed { pull_request: None } => {
                format!("Task \"{subject}\" completed; changes pushed")
            }
            Self::NoChanges => format!("Task \"{subject}\" completed with no changes"),
            Self::Failed { detail, .. } => format!("Task \"{subject}\" failed: {detail}"),
        }
    }
}

/// Result of the best-effort notification step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "notification", rename_all = "snake_case")]
pub enum NotificationStatus {
    Delivered { sink: String },
    Failed { sink: String, reason: String },
}

/// Aggregate of one pipeline run.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineOutcome {
    pub task_id: Uuid,
    pub subject: String,
    pub working_dir: PathBuf,
    pub status: OutcomeStatus,
    /// Every step that ran, in execution order.
    pub steps: Vec<StepRecord>,
    pub transitions: Vec<StateTransition>,
    pub notification: NotificationStatus,
    /// Always `Done` once `run` returns.
    pub final_state: PipelineState,
    pub started_at: DateTime<Utc>,
    pub elapsed: Duration,
}

impl PipelineOutcome {
    /// Process exit code to hand back to the caller.
    pub fn exit_code(&self) -> i32 {
        self.status.exit_code()
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// Records for one stage, in order.
    pub fn steps_for(&self, stage: Stage) -> impl Iterator<Item = &StepRecord> {
        self.steps.iter().filter(move |s| s.stage == stage)
    }
}
