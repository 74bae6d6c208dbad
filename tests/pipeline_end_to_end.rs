//! End-to-end pipeline runs against real child processes.
//!
//! Shell scripts stand in for the assistant, git and the host CLI. Each
//! script appends its argv to a shared call log so tests can assert on the
//! exact sequence of invocations.

#![cfg(unix)]

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::timeout;

use inbox_agent::config::AgentConfig;
use inbox_agent::error::NotificationError;
use inbox_agent::notify::NotificationSink;
use inbox_agent::pipeline::types::FailureKind;
use inbox_agent::pipeline::{OutcomeStatus, PipelineState, Stage, TaskContext, TaskPipeline};
use inbox_agent::process::TokioProcessRunner;

const TEST_TIMEOUT: Duration = Duration::from_secs(20);

struct Fixture {
    _root: tempfile::TempDir,
    bin: PathBuf,
    repo: PathBuf,
    calls: PathBuf,
}

impl Fixture {
    fn new() -> Self {
        let root = tempfile::tempdir().unwrap();
        let bin = root.path().join("bin");
        let repo = root.path().join("repo");
        std::fs::create_dir_all(&bin).unwrap();
        std::fs::create_dir_all(&repo).unwrap();
        let calls = root.path().join("calls.log");

        // git: `status` reports a change once the assistant touched a file
        script(
            &bin,
            "git",
            &format!(
                "echo \"git $*\" >> '{calls}'\n\
                 if [ \"$1\" = status ]; then [ -f changed.txt ] && echo '?? changed.txt'; fi\n\
                 exit 0\n",
                calls = calls.display()
            ),
        );
        // gh: `pr create` prints a URL, `repo clone` creates the target
        script(
            &bin,
            "gh",
            &format!(
                "echo \"gh $*\" >> '{calls}'\n\
                 if [ \"$1\" = pr ]; then echo 'https://github.com/o/r/pull/77'; fi\n\
                 if [ \"$1\" = repo ]; then mkdir -p \"$4\"; fi\n\
                 exit 0\n",
                calls = calls.display()
            ),
        );

        Self {
            _root: root,
            bin,
            repo,
            calls,
        }
    }

    fn assistant(&self, body: &str) -> String {
        script(
            &self.bin,
            "assistant",
            &format!("echo \"assistant $1\" >> '{}'\n{body}", self.calls.display()),
        )
    }

    fn config(&self, assistant: String) -> AgentConfig {
        let mut config = AgentConfig::default();
        config.assistant.command = assistant;
        config.assistant.allowed_tools.clear();
        config.host.git_command = self.bin.join("git").display().to_string();
        config.host.command = self.bin.join("gh").display().to_string();
        config
    }

    fn calls(&self) -> Vec<String> {
        std::fs::read_to_string(&self.calls)
            .unwrap_or_default()
            .lines()
            .map(|l| l.split_whitespace().take(2).collect::<Vec<_>>().join(" "))
            .collect()
    }
}

fn script(dir: &Path, name: &str, body: &str) -> String {
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{body}")).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path.display().to_string()
}

#[derive(Default)]
struct Collected {
    messages: std::sync::Mutex<Vec<String>>,
}

#[async_trait]
impl NotificationSink for Collected {
    fn name(&self) -> &str {
        "collected"
    }

    async fn notify(&self, _ctx: &TaskContext, message: &str) -> Result<(), NotificationError> {
        self.messages.lock().unwrap().push(message.to_string());
        Ok(())
    }
}

fn pipeline(config: AgentConfig, grace: Duration) -> (TaskPipeline, Arc<Collected>) {
    let notifier = Arc::new(Collected::default());
    let pipeline = TaskPipeline::new(
        Arc::new(config),
        Arc::new(TokioProcessRunner::new(grace)),
        notifier.clone(),
    );
    (pipeline, notifier)
}

#[tokio::test]
async fn fix_bug_scenario_opens_pull_request() {
    let fx = Fixture::new();
    let assistant = fx.assistant("echo fixed > changed.txt\necho 'Fix bug #42 in parser'\n");
    let (pipeline, notifier) = pipeline(fx.config(assistant), Duration::from_secs(1));

    let ctx = TaskContext::new("Fix bug #42", &fx.repo);
    let outcome = timeout(TEST_TIMEOUT, pipeline.run(&ctx)).await.expect("run hung");

    assert_eq!(outcome.exit_code(), 0);
    assert_eq!(outcome.final_state, PipelineState::Done);
    assert_eq!(
        outcome.status,
        OutcomeStatus::Committed {
            pull_request: Some("https://github.com/o/r/pull/77".into())
        }
    );
    assert_eq!(
        fx.calls(),
        vec![
            "assistant -p",
            "git status",
            "git checkout",
            "git add",
            "git commit",
            "git push",
            "gh pr",
        ]
    );
    assert!(notifier.messages.lock().unwrap()[0].contains("pull/77"));
}

#[tokio::test]
async fn untouched_tree_is_no_op() {
    let fx = Fixture::new();
    let assistant = fx.assistant("echo 'Nothing to change'\n");
    let (pipeline, _) = pipeline(fx.config(assistant), Duration::from_secs(1));

    let outcome = pipeline.run(&TaskContext::new("Check docs", &fx.repo)).await;

    assert_eq!(outcome.status, OutcomeStatus::NoChanges);
    assert_eq!(fx.calls(), vec!["assistant -p", "git status"]);
}

#[tokio::test]
async fn assistant_timeout_never_commits() {
    let fx = Fixture::new();
    let assistant = fx.assistant("echo fixed > changed.txt\nsleep 30\necho 'late'\n");
    let mut config = fx.config(assistant);
    config.assistant.timeout = Duration::from_millis(300);
    let (pipeline, notifier) = pipeline(config, Duration::from_secs(2));

    let outcome = timeout(TEST_TIMEOUT, pipeline.run(&TaskContext::new("Fix bug #42", &fx.repo)))
        .await
        .expect("run hung");

    assert_eq!(outcome.exit_code(), 124);
    assert!(matches!(
        outcome.status,
        OutcomeStatus::Failed {
            kind: FailureKind::Timeout,
            stage: Some(Stage::Assistant),
            ..
        }
    ));
    // the file was written but nothing after the assistant ran
    assert_eq!(fx.calls(), vec!["assistant -p"]);
    assert_eq!(notifier.messages.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn assistant_ignoring_terminate_is_killed() {
    let fx = Fixture::new();
    let assistant = fx.assistant("trap '' TERM\nsleep 30\n");
    let mut config = fx.config(assistant);
    config.assistant.timeout = Duration::from_millis(200);
    let (pipeline, _) = pipeline(config, Duration::from_millis(300));

    let outcome = timeout(TEST_TIMEOUT, pipeline.run(&TaskContext::new("Hang", &fx.repo)))
        .await
        .expect("run hung");

    assert_eq!(outcome.exit_code(), 137);
}

#[tokio::test]
async fn assistant_failure_propagates_exit_code() {
    let fx = Fixture::new();
    let assistant = fx.assistant("echo 'rate limited' >&2\nexit 3\n");
    let (pipeline, notifier) = pipeline(fx.config(assistant), Duration::from_secs(1));

    let outcome = pipeline.run(&TaskContext::new("Fix", &fx.repo)).await;

    assert_eq!(outcome.exit_code(), 3);
    let message = notifier.messages.lock().unwrap()[0].clone();
    assert!(message.contains("assistant failed with exit code 3: rate limited"));
}

#[tokio::test]
async fn missing_assistant_binary_is_127() {
    let fx = Fixture::new();
    let config = fx.config(fx.bin.join("not-installed").display().to_string());
    let (pipeline, _) = pipeline(config, Duration::from_secs(1));

    let outcome = pipeline.run(&TaskContext::new("Fix", &fx.repo)).await;
    assert_eq!(outcome.exit_code(), 127);
}

#[tokio::test]
async fn missing_checkout_is_cloned_before_the_assistant_runs() {
    let fx = Fixture::new();
    let assistant = fx.assistant("pwd > where.txt\necho 'Nothing to change'\n");
    let (pipeline, _) = pipeline(fx.config(assistant), Duration::from_secs(1));

    let target = fx.repo.parent().unwrap().join("workspaces").join("o__r");
    let ctx = TaskContext::new("Check docs", &target).with_repository("o/r");
    let outcome = timeout(TEST_TIMEOUT, pipeline.run(&ctx)).await.expect("run hung");

    assert_eq!(outcome.status, OutcomeStatus::NoChanges);
    assert_eq!(fx.calls(), vec!["gh repo", "assistant -p", "git status"]);
    // the clone landed at the target, not nested under its parent again
    assert!(target.join("where.txt").is_file());
    assert!(!target.parent().unwrap().join("workspaces").exists());
}
