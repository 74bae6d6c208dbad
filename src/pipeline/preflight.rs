//! Startup checks for the external tools every run depends on.

use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::config::AgentConfig;
use crate::error::PipelineError;
use crate::process::{NullSink, ProcessRunner};

use super::commands;

/// Resolve `program` on PATH (or as a path).
pub fn locate(program: &str) -> Result<PathBuf, PipelineError> {
    which::which(program).map_err(|e| {
        debug!(program, error = %e, "Tool lookup failed");
        PipelineError::ToolMissing {
            name: program.to_string(),
        }
    })
}

/// Check that the assistant, git and host CLIs exist and the host CLI is
/// logged in.
pub async fn check(config: &AgentConfig, runner: &dyn ProcessRunner) -> Result<(), PipelineError> {
    for program in [
        &config.assistant.command,
        &config.host.git_command,
        &config.host.command,
    ] {
        let path = locate(program)?;
        debug!(program = %program, path = %path.display(), "Found tool");
    }

    let spec = commands::auth_status(config, Path::new("."));
    let result = runner.run(&spec, &NullSink).await?;
    if !result.is_success() {
        let reason = result.output().trim().to_string();
        return Err(PipelineError::NotAuthenticated(if reason.is_empty() {
            format!("`{}` exited with code {}", spec.display(), result.exit_code())
        } else {
            reason
        }));
    }

    info!("Preflight passed");
    Ok(())
}
