//! Task pipeline: one run from triggering task to notification.
//!
//! The run walks the state machine
//! `Idle → Preparing → RunningAssistant → CheckingChanges → Committing → Notifying → Done`.
//! Every working state may jump straight to `Notifying` when a fatal step
//! fails, and `CheckingChanges` jumps there when the tree is clean. Steps run
//! one at a time, each exactly once.

use std::sync::Arc;

use chrono::Utc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::AgentConfig;
use crate::error::{PipelineError, RunnerError};
use crate::journal::ResponseJournal;
use crate::notify::NotificationSink;
use crate::process::{CommandSpec, ProcessRunner, StepKind, StepResult, TracingSink};

use super::commands;
use super::policy::{self, PRECONDITION_EXIT_CODE, Verdict, classify, fold};
use super::types::{
    NotificationStatus, OutcomeStatus, PipelineOutcome, PipelineState, Stage, StateTransition,
    StepPolicy, StepRecord, TaskContext,
};

/// Exit code for a program that could not be found.
const NOT_FOUND_EXIT_CODE: i32 = 127;

/// Exit code for a program that was found but could not be started.
const CANNOT_EXECUTE_EXIT_CODE: i32 = 126;

/// Exit code when the assistant gave no summary line to commit with.
const MISSING_SUMMARY_EXIT_CODE: i32 = 1;

/// Exit code recorded on a failed notification step.
const NOTIFY_FAILED_EXIT_CODE: i32 = 1;

/// Runs tasks through the assistant, commit and notification steps.
#[derive(Clone)]
pub struct TaskPipeline {
    config: Arc<AgentConfig>,
    runner: Arc<dyn ProcessRunner>,
    notifier: Arc<dyn NotificationSink>,
    journal: Option<Arc<ResponseJournal>>,
}

/// Mutable bookkeeping for a single run.
struct Run {
    state: PipelineState,
    steps: Vec<StepRecord>,
    transitions: Vec<StateTransition>,
    /// Set when the run stopped on a precondition instead of a step result.
    precondition: Option<OutcomeStatus>,
}

impl Run {
    fn new() -> Self {
        Self {
            state: PipelineState::Idle,
            steps: Vec::new(),
            transitions: Vec::new(),
            precondition: None,
        }
    }

    fn transition_to(&mut self, to: PipelineState, reason: Option<String>) {
        if !self.state.can_transition_to(to) {
            // Only reachable through a bug in the loop below.
            error!(from = %self.state, to = %to, "Invalid pipeline transition");
        }
        self.transitions.push(StateTransition {
            from: self.state,
            to,
            timestamp: Utc::now(),
            reason,
        });
        self.state = to;
    }
}

impl TaskPipeline {
    pub fn new(
        config: Arc<AgentConfig>,
        runner: Arc<dyn ProcessRunner>,
        notifier: Arc<dyn NotificationSink>,
    ) -> Self {
        Self {
            config,
            runner,
            notifier,
            journal: None,
        }
    }

    /// Append every outcome to `journal`.
    pub fn with_journal(mut self, journal: Arc<ResponseJournal>) -> Self {
        self.journal = Some(journal);
        self
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Run one task to `Done`. Always returns exactly one outcome.
    pub async fn run(&self, ctx: &TaskContext) -> PipelineOutcome {
        let started_at = Utc::now();
        let clock = Instant::now();
        info!(
            task_id = %ctx.id(),
            subject = %ctx.subject(),
            dir = %ctx.working_dir().display(),
            "Starting task"
        );

        let mut run = Run::new();
        let mut assistant_stdout = String::new();
        let mut notification = None;

        while !run.state.is_terminal() {
            let (next, reason) = match run.state {
                PipelineState::Idle => (PipelineState::Preparing, None),

                PipelineState::Preparing => match self.prepare(ctx) {
                    Err(status) => {
                        let reason = failure_reason(&status);
                        run.precondition = Some(status);
                        (PipelineState::Notifying, reason)
                    }
                    Ok(None) => (PipelineState::RunningAssistant, None),
                    Ok(Some(clone)) => {
                        if let Err(status) = self.ensure_parent(ctx).await {
                            let reason = failure_reason(&status);
                            run.precondition = Some(status);
                            (PipelineState::Notifying, reason)
                        } else {
                            match self.step(&mut run, ctx, Stage::Clone, &clone).await {
                                Verdict::Continue => (PipelineState::RunningAssistant, None),
                                Verdict::Abort(status) => {
                                    (PipelineState::Notifying, failure_reason(&status))
                                }
                            }
                        }
                    }
                },

                PipelineState::RunningAssistant => {
                    let spec = commands::assistant(&self.config, ctx);
                    let verdict = self.step(&mut run, ctx, Stage::Assistant, &spec).await;
                    if let Some(record) = run.steps.last() {
                        assistant_stdout = record.result.stdout.clone();
                    }
                    match verdict {
                        Verdict::Continue => (PipelineState::CheckingChanges, None),
                        Verdict::Abort(status) => (PipelineState::Notifying, failure_reason(&status)),
                    }
                }

                PipelineState::CheckingChanges => {
                    let spec = commands::status(&self.config, ctx.working_dir());
                    match self.step(&mut run, ctx, Stage::Status, &spec).await {
                        Verdict::Abort(status) => (PipelineState::Notifying, failure_reason(&status)),
                        Verdict::Continue => {
                            let porcelain = run
                                .steps
                                .last()
                                .map(|r| r.result.stdout.as_str())
                                .unwrap_or_default();
                            if commands::has_changes(porcelain) {
                                (PipelineState::Committing, None)
                            } else {
                                info!(task_id = %ctx.id(), "Working tree clean; nothing to commit");
                                (PipelineState::Notifying, Some("no changes".to_string()))
                            }
                        }
                    }
                }

                PipelineState::Committing => {
                    match self.commit(&mut run, ctx, &assistant_stdout).await {
                        Verdict::Continue => (PipelineState::Notifying, None),
                        Verdict::Abort(status) => (PipelineState::Notifying, failure_reason(&status)),
                    }
                }

                PipelineState::Notifying => {
                    let status = run.precondition.clone().unwrap_or_else(|| fold(&run.steps));
                    notification = Some(self.notify(&mut run, ctx, &status).await);
                    (PipelineState::Done, None)
                }

                PipelineState::Done => break,
            };
            debug!(task_id = %ctx.id(), from = %run.state, to = %next, "Pipeline transition");
            run.transition_to(next, reason);
        }

        let status = run.precondition.take().unwrap_or_else(|| fold(&run.steps));
        let outcome = PipelineOutcome {
            task_id: ctx.id(),
            subject: ctx.subject().to_string(),
            working_dir: ctx.working_dir().to_path_buf(),
            status,
            steps: run.steps,
            transitions: run.transitions,
            notification: notification.unwrap_or_else(|| NotificationStatus::Failed {
                sink: self.notifier.name().to_string(),
                reason: "notification never attempted".into(),
            }),
            final_state: run.state,
            started_at,
            elapsed: clock.elapsed(),
        };

        if outcome.is_success() {
            info!(
                task_id = %ctx.id(),
                exit_code = outcome.exit_code(),
                elapsed_ms = outcome.elapsed.as_millis() as u64,
                "{}",
                outcome.status.message(ctx.subject())
            );
        } else {
            warn!(
                task_id = %ctx.id(),
                exit_code = outcome.exit_code(),
                elapsed_ms = outcome.elapsed.as_millis() as u64,
                "{}",
                outcome.status.message(ctx.subject())
            );
        }

        if let Some(journal) = &self.journal {
            journal.append(&outcome).await;
        }
        outcome
    }

    /// Decide whether the working directory is usable as is, needs cloning,
    /// or cannot be obtained at all.
    fn prepare(&self, ctx: &TaskContext) -> Result<Option<CommandSpec>, OutcomeStatus> {
        let dir = ctx.working_dir();
        if dir.is_dir() {
            return Ok(None);
        }
        match ctx.repository() {
            Some(repository) => {
                info!(task_id = %ctx.id(), repository, dir = %dir.display(), "Cloning repository");
                Ok(Some(commands::clone(&self.config, repository, dir)))
            }
            None => Err(policy::precondition(
                PipelineError::MissingWorkingDir {
                    path: dir.to_path_buf(),
                }
                .to_string(),
            )),
        }
    }

    async fn ensure_parent(&self, ctx: &TaskContext) -> Result<(), OutcomeStatus> {
        let Some(parent) = ctx
            .working_dir()
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
        else {
            return Ok(());
        };
        tokio::fs::create_dir_all(parent).await.map_err(|e| {
            policy::precondition(
                PipelineError::Workspace {
                    path: parent.to_path_buf(),
                    reason: e.to_string(),
                }
                .to_string(),
            )
        })
    }

    /// Branch, commit, push and open the pull request, stopping at the
    /// first failure.
    async fn commit(&self, run: &mut Run, ctx: &TaskContext, assistant_stdout: &str) -> Verdict {
        let Some(summary) = commands::commit_summary(assistant_stdout) else {
            warn!(task_id = %ctx.id(), "Assistant output has no summary line; refusing to commit");
            let record = StepRecord {
                stage: Stage::Commit,
                policy: StepPolicy::Fatal,
                result: StepResult::failed(
                    "commit",
                    MISSING_SUMMARY_EXIT_CODE,
                    "assistant output contained no summary line",
                ),
            };
            let verdict = classify(&record);
            run.steps.push(record);
            return verdict;
        };

        for spec in commands::commit_plan(&self.config, ctx, &summary) {
            if let Verdict::Abort(status) = self.step(run, ctx, Stage::Commit, &spec).await {
                return Verdict::Abort(status);
            }
        }
        Verdict::Continue
    }

    /// Run one fatal step, record it, and classify it.
    async fn step(&self, run: &mut Run, ctx: &TaskContext, stage: Stage, spec: &CommandSpec) -> Verdict {
        debug!(task_id = %ctx.id(), stage = %stage, command = %spec.display(), "Running step");
        let sink = TracingSink::new(stage.to_string());
        let result = match self.runner.run(spec, &sink).await {
            Ok(result) => result,
            Err(e @ RunnerError::MissingWorkingDir { .. }) => {
                warn!(task_id = %ctx.id(), stage = %stage, error = %e, "Working directory vanished");
                let status = policy::precondition(e.to_string());
                run.steps.push(StepRecord {
                    stage,
                    policy: StepPolicy::Fatal,
                    result: StepResult::failed(spec.display(), PRECONDITION_EXIT_CODE, e.to_string()),
                });
                run.precondition = Some(status.clone());
                return Verdict::Abort(status);
            }
            Err(e) => {
                let code = if e.is_not_found() {
                    NOT_FOUND_EXIT_CODE
                } else {
                    CANNOT_EXECUTE_EXIT_CODE
                };
                error!(task_id = %ctx.id(), stage = %stage, error = %e, "Step could not be started");
                StepResult::failed(spec.display(), code, e.to_string())
            }
        };

        let record = StepRecord {
            stage,
            policy: StepPolicy::Fatal,
            result,
        };
        let verdict = classify(&record);
        if let Verdict::Abort(status) = &verdict {
            warn!(task_id = %ctx.id(), stage = %stage, exit_code = status.exit_code(), "Step failed");
        }
        run.steps.push(record);
        verdict
    }

    /// Post the outcome message as a best-effort step. Failures are logged
    /// and recorded but never change the outcome.
    async fn notify(&self, run: &mut Run, ctx: &TaskContext, status: &OutcomeStatus) -> NotificationStatus {
        let sink = self.notifier.name().to_string();
        let command = format!("notify via {sink}");
        let message = status.message(ctx.subject());
        let clock = Instant::now();

        let (result, notification) = match self.notifier.notify(ctx, &message).await {
            Ok(()) => (
                StepResult {
                    command,
                    kind: StepKind::Success,
                    stdout: message,
                    stderr: String::new(),
                    flushed: true,
                    elapsed: clock.elapsed(),
                },
                NotificationStatus::Delivered { sink },
            ),
            Err(e) => {
                warn!(task_id = %ctx.id(), error = %e, "Notification failed");
                let result = StepResult {
                    elapsed: clock.elapsed(),
                    ..StepResult::failed(command, NOTIFY_FAILED_EXIT_CODE, e.to_string())
                };
                (
                    result,
                    NotificationStatus::Failed {
                        sink,
                        reason: e.to_string(),
                    },
                )
            }
        };

        run.steps.push(StepRecord {
            stage: Stage::Notify,
            policy: StepPolicy::BestEffort,
            result,
        });
        notification
    }
}

fn failure_reason(status: &OutcomeStatus) -> Option<String> {
    match status {
        OutcomeStatus::Failed { detail, .. } => Some(detail.clone()),
        _ => None,
    }
}
