//! Command lines for each pipeline step.
//!
//! Pure functions from config and task to `CommandSpec`s, so the argument
//! contracts with the external CLIs can be checked without running anything.

use std::path::Path;
use std::time::Duration;

use crate::config::AgentConfig;
use crate::process::CommandSpec;

use super::types::TaskContext;

/// Budget for the working-tree status query.
pub const STATUS_TIMEOUT: Duration = Duration::from_secs(30);

/// Longest commit summary line kept.
pub const MAX_SUMMARY_LEN: usize = 72;

/// Longest branch slug derived from a summary.
const MAX_SLUG_LEN: usize = 40;

/// Assistant invocation: prompt plus capability allow-list.
pub fn assistant(config: &AgentConfig, ctx: &TaskContext) -> CommandSpec {
    let assistant = &config.assistant;
    let mut spec = CommandSpec::new(&assistant.command, ctx.working_dir())
        .arg("-p")
        .arg(ctx.prompt());
    if !assistant.allowed_tools.is_empty() {
        spec = spec
            .arg("--allowedTools")
            .arg(assistant.allowed_tools.join(","));
    }
    spec.args(assistant.extra_args.iter().cloned())
        .env("AGENT_TASK_ID", ctx.id().to_string())
        .env("AGENT_SUBJECT", ctx.subject())
        .timeout(assistant.timeout)
}

/// `git status --porcelain`; empty stdout means a clean tree.
pub fn status(config: &AgentConfig, dir: &Path) -> CommandSpec {
    CommandSpec::new(&config.host.git_command, dir)
        .args(["status", "--porcelain"])
        .timeout(STATUS_TIMEOUT)
}

/// Clone `repository` into `dir`.
///
/// Runs from the parent directory with the last path component as the
/// target, so a relative `dir` is not resolved twice.
pub fn clone(config: &AgentConfig, repository: &str, dir: &Path) -> CommandSpec {
    let parent = dir
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    let target = dir
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| dir.to_string_lossy().into_owned());
    CommandSpec::new(&config.host.command, parent)
        .args(["repo", "clone", repository])
        .arg(target)
        .timeout(config.host.commit_timeout)
}

/// `<host> auth status`.
pub fn auth_status(config: &AgentConfig, dir: &Path) -> CommandSpec {
    CommandSpec::new(&config.host.command, dir)
        .args(["auth", "status"])
        .timeout(STATUS_TIMEOUT)
}

/// Comment on an issue or pull request.
pub fn issue_comment(config: &AgentConfig, dir: &Path, url: &str, body: &str) -> CommandSpec {
    CommandSpec::new(&config.host.command, dir)
        .args(["issue", "comment", url, "--body", body])
        .timeout(STATUS_TIMEOUT)
}

/// Whether `git status --porcelain` output lists any change.
pub fn has_changes(porcelain: &str) -> bool {
    porcelain.lines().any(|l| !l.trim().is_empty())
}

/// Commit summary supplied by the assistant: its first non-empty output line.
///
/// Markdown heading and bullet markers are dropped; the line is capped at
/// `MAX_SUMMARY_LEN` characters.
pub fn commit_summary(assistant_stdout: &str) -> Option<String> {
    let line = assistant_stdout
        .lines()
        .map(|l| l.trim().trim_start_matches(['#', '*', '-', '>']).trim())
        .find(|l| !l.is_empty())?;
    Some(line.chars().take(MAX_SUMMARY_LEN).collect::<String>().trim_end().to_string())
}

/// Branch name: prefix plus a lowercase slug of the summary and a short task id.
pub fn branch_name(prefix: &str, summary: &str, ctx: &TaskContext) -> String {
    let mut slug = String::new();
    for c in summary.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
        } else if !slug.ends_with('-') && !slug.is_empty() {
            slug.push('-');
        }
        if slug.len() >= MAX_SLUG_LEN {
            break;
        }
    }
    let slug = slug.trim_matches('-');
    let id = ctx.id().simple().to_string();
    let short = &id[..8];
    if slug.is_empty() {
        format!("{prefix}{short}")
    } else {
        format!("{prefix}{slug}-{short}")
    }
}

/// The commit stage as an ordered command list; the first failure ends it.
pub fn commit_plan(config: &AgentConfig, ctx: &TaskContext, summary: &str) -> Vec<CommandSpec> {
    let host = &config.host;
    let dir = ctx.working_dir();
    let branch = branch_name(&host.branch_prefix, summary, ctx);
    let git = |args: &[&str]| {
        CommandSpec::new(&host.git_command, dir)
            .args(args.iter().copied())
            .timeout(host.commit_timeout)
    };

    let mut pr = CommandSpec::new(&host.command, dir)
        .args(["pr", "create", "--title", summary, "--body"])
        .arg(pull_request_body(ctx))
        .arg("--head")
        .arg(&branch)
        .timeout(host.commit_timeout);
    if let Some(base) = &host.base_branch {
        pr = pr.arg("--base").arg(base);
    }

    vec![
        git(&["checkout", "-b", &branch]),
        git(&["add", "-A"]),
        git(&["commit", "-m", summary]),
        git(&["push", "-u", "origin", &branch]),
        pr,
    ]
}

fn pull_request_body(ctx: &TaskContext) -> String {
    let mut body = format!("Automated change for: {}\n", ctx.subject());
    if let Some(origin) = ctx.origin() {
        body.push_str(&format!("\nRefs {origin}\n"));
    }
    body
}
