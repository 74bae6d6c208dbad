//! Dispatching tasks onto the runtime, one run per working directory at a time.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tokio::task::JoinSet;
use tracing::{debug, error, info};

use crate::pipeline::{PipelineOutcome, TaskContext, TaskPipeline};

/// One async mutex per working directory.
///
/// Paths are made absolute and lexically normalized, so `./repo` and
/// `/cwd/repo/` share a lock. Symlinks are not resolved. Waiters are served
/// in arrival order.
#[derive(Default)]
pub struct DirectoryLocks {
    locks: Mutex<HashMap<PathBuf, Arc<AsyncMutex<()>>>>,
}

impl DirectoryLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock key for `path`.
    pub fn key(path: &Path) -> PathBuf {
        let absolute = std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf());
        let mut normalized = PathBuf::new();
        for component in absolute.components() {
            match component {
                Component::CurDir => {}
                Component::ParentDir => {
                    normalized.pop();
                }
                other => normalized.push(other.as_os_str()),
            }
        }
        normalized
    }

    fn lock_for(&self, path: &Path) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(Self::key(path)).or_default())
    }

    /// Wait for exclusive use of `path`.
    pub async fn acquire(&self, path: &Path) -> OwnedMutexGuard<()> {
        self.lock_for(path).lock_owned().await
    }

    /// Number of directories seen so far.
    pub fn len(&self) -> usize {
        self.locks.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Runs pipelines, serialized per working directory.
#[derive(Clone)]
pub struct Dispatcher {
    pipeline: TaskPipeline,
    locks: Arc<DirectoryLocks>,
    in_flight: Arc<AsyncMutex<JoinSet<PipelineOutcome>>>,
}

impl Dispatcher {
    pub fn new(pipeline: TaskPipeline) -> Self {
        Self {
            pipeline,
            locks: Arc::new(DirectoryLocks::new()),
            in_flight: Arc::new(AsyncMutex::new(JoinSet::new())),
        }
    }

    pub fn locks(&self) -> &DirectoryLocks {
        &self.locks
    }

    /// Run one task once its directory is free.
    pub async fn run(&self, ctx: TaskContext) -> PipelineOutcome {
        let dir = ctx.working_dir().to_path_buf();
        debug!(task_id = %ctx.id(), dir = %dir.display(), "Waiting for working directory");
        let _guard = self.locks.acquire(&dir).await;
        self.pipeline.run(&ctx).await
    }

    /// Start a task in the background.
    pub async fn spawn(&self, ctx: TaskContext) {
        let dispatcher = self.clone();
        let mut set = self.in_flight.lock().await;
        while let Some(finished) = set.try_join_next() {
            log_join(finished);
        }
        info!(task_id = %ctx.id(), subject = %ctx.subject(), "Dispatching task");
        set.spawn(async move { dispatcher.run(ctx).await });
    }

    /// Wait until every spawned task has finished. Returns their outcomes.
    pub async fn wait_idle(&self) -> Vec<PipelineOutcome> {
        let mut set = self.in_flight.lock().await;
        let mut outcomes = Vec::new();
        while let Some(finished) = set.join_next().await {
            if let Some(outcome) = log_join(finished) {
                outcomes.push(outcome);
            }
        }
        outcomes
    }
}

fn log_join(finished: Result<PipelineOutcome, tokio::task::JoinError>) -> Option<PipelineOutcome> {
    match finished {
        Ok(outcome) => Some(outcome),
        Err(e) => {
            error!(error = %e, "Task panicked or was cancelled");
            None
        }
    }
}
