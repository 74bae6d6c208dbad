//! Notification sinks: where a run's outcome is reported.
//!
//! Notifying is best-effort. Callers log a returned error and move on; it
//! never changes the outcome of the run being reported.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::channels::email::{EmailConfig, send_email};
use crate::config::{AgentConfig, NotifyKind};
use crate::error::NotificationError;
use crate::pipeline::types::TaskContext;
use crate::pipeline::commands;
use crate::process::{NullSink, ProcessRunner};

/// Upper bound for one SMTP delivery.
const EMAIL_TIMEOUT: Duration = Duration::from_secs(60);

/// Posts a status message for a task.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    fn name(&self) -> &str;

    async fn notify(&self, ctx: &TaskContext, message: &str) -> Result<(), NotificationError>;
}

// ── Log ─────────────────────────────────────────────────────────────

/// Writes the message to the log only.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

#[async_trait]
impl NotificationSink for LogSink {
    fn name(&self) -> &str {
        "log"
    }

    async fn notify(&self, ctx: &TaskContext, message: &str) -> Result<(), NotificationError> {
        info!(task_id = %ctx.id(), "{message}");
        Ok(())
    }
}

// ── Issue comment ───────────────────────────────────────────────────

/// Comments on the originating issue through the repository host CLI.
///
/// Tasks without an originating issue are logged instead.
pub struct IssueCommentSink {
    config: Arc<AgentConfig>,
    runner: Arc<dyn ProcessRunner>,
}

impl IssueCommentSink {
    pub fn new(config: Arc<AgentConfig>, runner: Arc<dyn ProcessRunner>) -> Self {
        Self { config, runner }
    }
}

#[async_trait]
impl NotificationSink for IssueCommentSink {
    fn name(&self) -> &str {
        "issue"
    }

    async fn notify(&self, ctx: &TaskContext, message: &str) -> Result<(), NotificationError> {
        let Some(url) = ctx.origin() else {
            return LogSink.notify(ctx, message).await;
        };

        let dir = if ctx.working_dir().is_dir() {
            ctx.working_dir()
        } else {
            Path::new(".")
        };
        let spec = commands::issue_comment(&self.config, dir, url, message);
        let result = self
            .runner
            .run(&spec, &NullSink)
            .await
            .map_err(|e| NotificationError::Failed {
                sink: self.name().into(),
                reason: e.to_string(),
            })?;

        if result.is_success() {
            info!(task_id = %ctx.id(), url, "Posted issue comment");
            Ok(())
        } else {
            Err(NotificationError::Failed {
                sink: self.name().into(),
                reason: format!(
                    "`{}` exited with code {}: {}",
                    result.command,
                    result.exit_code(),
                    result.stderr.trim()
                ),
            })
        }
    }
}

// ── Email reply ─────────────────────────────────────────────────────

/// Replies to the sender of the triggering mail over SMTP.
pub struct EmailReplySink {
    email: EmailConfig,
}

impl EmailReplySink {
    pub fn new(email: EmailConfig) -> Self {
        Self { email }
    }
}

#[async_trait]
impl NotificationSink for EmailReplySink {
    fn name(&self) -> &str {
        "email"
    }

    async fn notify(&self, ctx: &TaskContext, message: &str) -> Result<(), NotificationError> {
        let Some(to) = ctx.reply_to().map(str::to_string) else {
            return Err(NotificationError::NoRecipient {
                sink: self.name().into(),
                task: ctx.id().to_string(),
            });
        };

        let email = self.email.clone();
        let subject = format!("Re: {}", ctx.subject());
        let body = message.to_string();
        let recipient = to.clone();
        let send = tokio::task::spawn_blocking(move || send_email(&email, &recipient, &subject, &body));

        match tokio::time::timeout(EMAIL_TIMEOUT, send).await {
            Ok(Ok(Ok(()))) => {
                info!(task_id = %ctx.id(), to = %to, "Sent reply");
                Ok(())
            }
            Ok(Ok(Err(e))) => Err(NotificationError::Failed {
                sink: self.name().into(),
                reason: e.to_string(),
            }),
            Ok(Err(join)) => Err(NotificationError::Failed {
                sink: self.name().into(),
                reason: format!("send task failed: {join}"),
            }),
            Err(_) => Err(NotificationError::Timeout {
                sink: self.name().into(),
                timeout: EMAIL_TIMEOUT,
            }),
        }
    }
}

/// Pick the sink configured by `AGENT_NOTIFY`.
///
/// Mail replies need mail settings; without them the log sink is used.
pub fn build_sink(
    config: Arc<AgentConfig>,
    email: Option<EmailConfig>,
    runner: Arc<dyn ProcessRunner>,
) -> Arc<dyn NotificationSink> {
    match (config.notify, email) {
        (NotifyKind::Issue, _) => Arc::new(IssueCommentSink::new(config, runner)),
        (NotifyKind::Email, Some(email)) => Arc::new(EmailReplySink::new(email)),
        (NotifyKind::Email, None) => {
            warn!("Mail notifications requested but IMAP_HOST is not set; logging instead");
            Arc::new(LogSink)
        }
        (NotifyKind::Log, _) => Arc::new(LogSink),
    }
}
