//! Configuration types.
//!
//! Everything is read from environment variables (optionally seeded from a
//! `.env` file by the binary). `from_lookup` takes any key lookup so tests
//! never have to mutate the process environment.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;

/// Default budget for the assistant step.
pub const DEFAULT_ASSISTANT_TIMEOUT: Duration = Duration::from_secs(240);

/// Default budget for each command of the commit stage.
pub const DEFAULT_COMMIT_TIMEOUT: Duration = Duration::from_secs(120);

/// Default window between the terminate and kill signals.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(30);

/// Where step outcomes are reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyKind {
    /// Comment on the originating issue through the host CLI.
    Issue,
    /// Reply to the originating sender over SMTP.
    Email,
    /// Log only.
    Log,
}

impl FromStr for NotifyKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "issue" | "github" => Ok(Self::Issue),
            "email" | "smtp" => Ok(Self::Email),
            "log" | "none" => Ok(Self::Log),
            other => Err(format!("unknown notification channel `{other}`")),
        }
    }
}

/// How the coding assistant is invoked.
#[derive(Debug, Clone)]
pub struct AssistantConfig {
    /// Assistant binary.
    pub command: String,
    /// Capability allow-list passed to the assistant.
    pub allowed_tools: Vec<String>,
    /// Extra arguments appended after the allow-list.
    pub extra_args: Vec<String>,
    /// Wall-clock budget.
    pub timeout: Duration,
}

/// How the repository host CLI and git are invoked.
#[derive(Debug, Clone)]
pub struct HostConfig {
    /// Repository host CLI (clone, auth status, pull requests, comments).
    pub command: String,
    pub git_command: String,
    pub branch_prefix: String,
    /// Pull request base branch; the host default is used when unset.
    pub base_branch: Option<String>,
    /// Budget for each command of the commit stage.
    pub commit_timeout: Duration,
}

/// Agent configuration.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub assistant: AssistantConfig,
    pub host: HostConfig,
    /// Time between the terminate signal and the forced kill.
    pub grace_period: Duration,
    /// Fixed working directory for every task.
    pub project_folder: Option<PathBuf>,
    /// Root under which repositories named in mail are cloned.
    pub workspace_root: Option<PathBuf>,
    /// Append the cleaned mail body to the prompt.
    pub prompt_include_body: bool,
    pub notify: NotifyKind,
    /// Directory holding the execution log and the response journal.
    pub log_dir: PathBuf,
    /// Delete old logs on startup.
    pub clear_logs: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            assistant: AssistantConfig {
                command: "claude".to_string(),
                allowed_tools: vec!["Bash".to_string(), "Edit".to_string()],
                extra_args: Vec::new(),
                timeout: DEFAULT_ASSISTANT_TIMEOUT,
            },
            host: HostConfig {
                command: "gh".to_string(),
                git_command: "git".to_string(),
                branch_prefix: "inbox-agent/".to_string(),
                base_branch: None,
                commit_timeout: DEFAULT_COMMIT_TIMEOUT,
            },
            grace_period: DEFAULT_GRACE_PERIOD,
            project_folder: None,
            workspace_root: None,
            prompt_include_body: false,
            notify: NotifyKind::Issue,
            log_dir: PathBuf::from("."),
            clear_logs: true,
        }
    }
}

impl AgentConfig {
    /// Build config from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build config from an arbitrary key lookup. Unset keys take defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let allowed_tools = get("AGENT_ALLOWED_TOOLS")
            .map(|v| split_list(&v))
            .unwrap_or(defaults.assistant.allowed_tools);

        let assistant = AssistantConfig {
            command: get("AGENT_ASSISTANT_COMMAND").unwrap_or(defaults.assistant.command),
            allowed_tools,
            extra_args: get("AGENT_ASSISTANT_ARGS")
                .map(|v| v.split_whitespace().map(str::to_string).collect())
                .unwrap_or_default(),
            timeout: parse_secs(&get, "AGENT_ASSISTANT_TIMEOUT_SECS", defaults.assistant.timeout)?,
        };

        let host = HostConfig {
            command: get("AGENT_HOST_COMMAND").unwrap_or(defaults.host.command),
            git_command: get("AGENT_GIT_COMMAND").unwrap_or(defaults.host.git_command),
            branch_prefix: get("AGENT_BRANCH_PREFIX").unwrap_or(defaults.host.branch_prefix),
            base_branch: get("AGENT_BASE_BRANCH"),
            commit_timeout: parse_secs(&get, "AGENT_COMMIT_TIMEOUT_SECS", defaults.host.commit_timeout)?,
        };

        let notify = match get("AGENT_NOTIFY") {
            Some(v) => v.parse().map_err(|message| ConfigError::InvalidValue {
                key: "AGENT_NOTIFY".into(),
                message,
            })?,
            None => defaults.notify,
        };

        Ok(Self {
            assistant,
            host,
            grace_period: parse_secs(&get, "AGENT_GRACE_SECS", defaults.grace_period)?,
            project_folder: get("PROJECT_FOLDER").map(PathBuf::from),
            workspace_root: get("AGENT_WORKSPACE_ROOT").map(PathBuf::from),
            prompt_include_body: parse_bool(&get, "AGENT_PROMPT_INCLUDE_BODY", false)?,
            notify,
            log_dir: get("AGENT_LOG_DIR").map(PathBuf::from).unwrap_or(defaults.log_dir),
            clear_logs: parse_bool(&get, "AGENT_CLEAR_LOGS", defaults.clear_logs)?,
        })
    }
}

/// Split a comma-separated list, dropping empty entries.
pub fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Longest budget accepted for any timeout or grace window.
pub const MAX_DURATION_SECS: u64 = 7 * 24 * 60 * 60;

fn parse_secs<G>(get: &G, key: &str, default: Duration) -> Result<Duration, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    let Some(v) = get(key) else {
        return Ok(default);
    };
    let secs = v.parse::<u64>().map_err(|e| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("expected whole seconds, got `{v}` ({e})"),
    })?;
    if secs > MAX_DURATION_SECS {
        return Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("{secs} seconds exceeds the limit of {MAX_DURATION_SECS}"),
        });
    }
    Ok(Duration::from_secs(secs))
}

fn parse_bool<G>(get: &G, key: &str, default: bool) -> Result<bool, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    match get(key).map(|v| v.to_ascii_lowercase()) {
        None => Ok(default),
        Some(v) => match v.as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("expected a boolean, got `{v}`"),
            }),
        },
    }
}
