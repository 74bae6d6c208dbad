//! Append-only, human-readable record of every run.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::pipeline::types::{NotificationStatus, PipelineOutcome};

/// File name of the journal inside the log directory.
pub const JOURNAL_FILE: &str = "agent-responses.log";

/// Longest output excerpt written per step.
const MAX_ENTRY_OUTPUT: usize = 16 * 1024;

pub struct ResponseJournal {
    path: PathBuf,
    // Whole entries only; concurrent runs must not interleave lines.
    write_lock: Mutex<()>,
}

impl ResponseJournal {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    /// Journal at `<dir>/agent-responses.log`.
    pub fn in_dir(dir: &Path) -> Self {
        Self::new(dir.join(JOURNAL_FILE))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one entry. Failures are logged, never returned.
    pub async fn append(&self, outcome: &PipelineOutcome) {
        let entry = render_entry(outcome);
        let _guard = self.write_lock.lock().await;
        if let Err(e) = self.write(entry.as_bytes()).await {
            warn!(path = %self.path.display(), error = %e, "Failed to write response journal");
        }
    }

    async fn write(&self, bytes: &[u8]) -> std::io::Result<()> {
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(bytes).await?;
        file.flush().await
    }

    /// Remove the journal file if it exists.
    pub async fn clear(&self) -> std::io::Result<()> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => {
                debug!(path = %self.path.display(), "Cleared response journal");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}

/// Render one journal entry.
pub fn render_entry(outcome: &PipelineOutcome) -> String {
    let mut out = String::new();
    let rule = "=".repeat(72);
    let _ = writeln!(out, "{rule}");
    let _ = writeln!(out, "Timestamp: {}", outcome.started_at.to_rfc3339());
    let _ = writeln!(out, "Task: {}", outcome.task_id);
    let _ = writeln!(out, "Subject: {}", outcome.subject);
    let _ = writeln!(out, "Directory: {}", outcome.working_dir.display());
    let _ = writeln!(
        out,
        "Result: {} (exit code {})",
        outcome.status.message(&outcome.subject),
        outcome.exit_code()
    );
    match &outcome.notification {
        NotificationStatus::Delivered { sink } => {
            let _ = writeln!(out, "Notification: delivered via {sink}");
        }
        NotificationStatus::Failed { sink, reason } => {
            let _ = writeln!(out, "Notification: {sink} failed: {reason}");
        }
    }

    for (i, step) in outcome.steps.iter().enumerate() {
        let result = &step.result;
        let _ = writeln!(out);
        let _ = writeln!(
            out,
            "[{}] {} :: {} ({}, exit code {}, {} ms)",
            i + 1,
            step.stage,
            result.command,
            result.kind.label(),
            result.exit_code(),
            result.elapsed.as_millis()
        );
        let output = result.output();
        let output = output.trim_end();
        if !output.is_empty() {
            let _ = writeln!(
                out,
                "{}",
                crate::process::output::truncate_output(output, MAX_ENTRY_OUTPUT)
            );
        }
    }
    let _ = writeln!(out);
    out
}
