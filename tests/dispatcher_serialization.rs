//! Integration tests for per-directory serialization.
//!
//! A counting runner tracks how many steps are active per working directory
//! while concurrent triggers are dispatched. The count must never exceed one.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::timeout;

use inbox_agent::config::AgentConfig;
use inbox_agent::error::{NotificationError, RunnerError};
use inbox_agent::notify::NotificationSink;
use inbox_agent::pipeline::{OutcomeStatus, TaskContext, TaskPipeline};
use inbox_agent::process::{CommandSpec, OutputSink, ProcessRunner, StepKind, StepResult};
use inbox_agent::service::Dispatcher;

/// Maximum time any test is allowed to run before we consider it hung.
const TEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Counts concurrently active steps per directory and records the peak.
#[derive(Default)]
struct CountingRunner {
    active: Mutex<HashMap<PathBuf, usize>>,
    peak: Mutex<HashMap<PathBuf, usize>>,
    total_active: AtomicUsize,
    total_peak: AtomicUsize,
}

impl CountingRunner {
    fn peak_for(&self, dir: &PathBuf) -> usize {
        self.peak.lock().unwrap().get(dir).copied().unwrap_or(0)
    }
}

#[async_trait]
impl ProcessRunner for CountingRunner {
    async fn run(&self, spec: &CommandSpec, _sink: &dyn OutputSink) -> Result<StepResult, RunnerError> {
        let dir = spec.working_dir.clone();
        {
            let mut active = self.active.lock().unwrap();
            let count = active.entry(dir.clone()).or_default();
            *count += 1;
            let mut peak = self.peak.lock().unwrap();
            let p = peak.entry(dir.clone()).or_default();
            *p = (*p).max(*count);
        }
        let now = self.total_active.fetch_add(1, Ordering::SeqCst) + 1;
        self.total_peak.fetch_max(now, Ordering::SeqCst);

        tokio::time::sleep(Duration::from_millis(20)).await;

        self.total_active.fetch_sub(1, Ordering::SeqCst);
        *self.active.lock().unwrap().get_mut(&dir).unwrap() -= 1;

        let stdout = match spec.args.first().map(String::as_str) {
            Some("-p") => "Tidy imports\n",
            Some("status") => " M src/lib.rs\n",
            Some("pr") => "https://github.com/o/r/pull/1\n",
            _ => "",
        };
        Ok(StepResult {
            command: spec.display(),
            kind: StepKind::Success,
            stdout: stdout.to_string(),
            stderr: String::new(),
            flushed: true,
            elapsed: Duration::from_millis(20),
        })
    }
}

struct Silent;

#[async_trait]
impl NotificationSink for Silent {
    fn name(&self) -> &str {
        "silent"
    }

    async fn notify(&self, _ctx: &TaskContext, _message: &str) -> Result<(), NotificationError> {
        Ok(())
    }
}

fn dispatcher(runner: Arc<CountingRunner>) -> Dispatcher {
    let pipeline = TaskPipeline::new(Arc::new(AgentConfig::default()), runner, Arc::new(Silent));
    Dispatcher::new(pipeline)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_triggers_on_one_directory_never_interleave() {
    let dir = tempfile::tempdir().unwrap();
    let runner = Arc::new(CountingRunner::default());
    let dispatcher = dispatcher(Arc::clone(&runner));

    for i in 0..4 {
        dispatcher
            .spawn(TaskContext::new(format!("Task {i}"), dir.path()))
            .await;
    }
    let outcomes = timeout(TEST_TIMEOUT, dispatcher.wait_idle())
        .await
        .expect("runs hung");

    assert_eq!(outcomes.len(), 4);
    assert!(outcomes
        .iter()
        .all(|o| matches!(o.status, OutcomeStatus::Committed { .. })));
    assert_eq!(runner.peak_for(&dir.path().to_path_buf()), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn equivalent_paths_share_one_lock() {
    let dir = tempfile::tempdir().unwrap();
    let runner = Arc::new(CountingRunner::default());
    let dispatcher = dispatcher(Arc::clone(&runner));

    let plain = dir.path().to_path_buf();
    let dotted = dir.path().join(".");
    dispatcher.spawn(TaskContext::new("A", &plain)).await;
    dispatcher.spawn(TaskContext::new("B", &dotted)).await;
    timeout(TEST_TIMEOUT, dispatcher.wait_idle())
        .await
        .expect("runs hung");

    // both spellings point at one directory, so no two steps overlapped
    assert_eq!(runner.total_peak.load(Ordering::SeqCst), 1);
    assert_eq!(dispatcher.locks().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn different_directories_each_stay_serialized() {
    let a = tempfile::tempdir().unwrap();
    let b = tempfile::tempdir().unwrap();
    let runner = Arc::new(CountingRunner::default());
    let dispatcher = dispatcher(Arc::clone(&runner));

    for i in 0..3 {
        dispatcher.spawn(TaskContext::new(format!("A{i}"), a.path())).await;
        dispatcher.spawn(TaskContext::new(format!("B{i}"), b.path())).await;
    }
    let outcomes = timeout(TEST_TIMEOUT, dispatcher.wait_idle())
        .await
        .expect("runs hung");

    assert_eq!(outcomes.len(), 6);
    assert_eq!(runner.peak_for(&a.path().to_path_buf()), 1);
    assert_eq!(runner.peak_for(&b.path().to_path_buf()), 1);
    assert_eq!(dispatcher.locks().len(), 2);
}
