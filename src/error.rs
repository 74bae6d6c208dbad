//! Error types for the inbox agent.
//!
//! Step outcomes (timeouts, nonzero exits) are not errors: they are classified
//! values carried by `StepResult`. The types here cover what stops the agent
//! from running a step at all.

use std::path::PathBuf;
use std::time::Duration;

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Mail channel errors (IMAP fetch, SMTP send).
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("Failed to connect to {host}: {reason}")]
    Connect { host: String, reason: String },

    #[error("Authentication failed for channel {name}: {reason}")]
    AuthFailed { name: String, reason: String },

    #[error("IMAP protocol error: {0}")]
    Protocol(String),

    #[error("Failed to send message on channel {name}: {reason}")]
    SendFailed { name: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors launching or supervising an external process.
#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed waiting for {program}: {source}")]
    Wait {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to signal process group {pid}: {reason}")]
    Signal { pid: u32, reason: String },

    #[error("Working directory {} does not exist", path.display())]
    MissingWorkingDir { path: PathBuf },
}

impl RunnerError {
    /// Whether the program could not be found at all.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::Spawn { source, .. } if source.kind() == std::io::ErrorKind::NotFound
        )
    }
}

/// Precondition failures: the pipeline cannot start its steps.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Required tool `{name}` not found on PATH")]
    ToolMissing { name: String },

    #[error("Working directory {} does not exist and no repository is known", path.display())]
    MissingWorkingDir { path: PathBuf },

    #[error("Failed to prepare {}: {reason}", path.display())]
    Workspace { path: PathBuf, reason: String },

    #[error("Repository host CLI is not authenticated: {0}")]
    NotAuthenticated(String),

    #[error("Process error: {0}")]
    Runner(#[from] RunnerError),
}

/// Best-effort notification errors. Logged, never propagated into an outcome.
#[derive(Debug, thiserror::Error)]
pub enum NotificationError {
    #[error("Notification via {sink} failed: {reason}")]
    Failed { sink: String, reason: String },

    #[error("Notification via {sink} timed out after {timeout:?}")]
    Timeout { sink: String, timeout: Duration },

    #[error("Notification via {sink} has no recipient for task {task}")]
    NoRecipient { sink: String, task: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_spawn_is_detected() {
        let err = RunnerError::Spawn {
            program: "claude".into(),
            source: std::io::Error::from(std::io::ErrorKind::NotFound),
        };
        assert!(err.is_not_found());

        let err = RunnerError::Spawn {
            program: "claude".into(),
            source: std::io::Error::from(std::io::ErrorKind::PermissionDenied),
        };
        assert!(!err.is_not_found());
    }

    #[test]
    fn precondition_messages_name_the_problem() {
        let err = PipelineError::MissingWorkingDir {
            path: PathBuf::from("/repo"),
        };
        assert!(err.to_string().contains("/repo"));

        let err = PipelineError::ToolMissing { name: "gh".into() };
        assert!(err.to_string().contains("`gh`"));

        let err = RunnerError::MissingWorkingDir {
            path: PathBuf::from("/gone"),
        };
        assert!(err.to_string().contains("/gone"));
    }
}
