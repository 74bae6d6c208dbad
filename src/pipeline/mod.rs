//! Task pipeline.
//!
//! Every accepted mail becomes one `TaskContext` and flows through:
//! 1. `derive` — subject, repository and working directory
//! 2. `TaskPipeline::run()` — prepare, assistant, change check, commit
//! 3. `policy::fold()` — step records folded into one outcome
//! 4. `NotificationSink` — the outcome posted once, best-effort
//!
//! Runs against one directory never overlap; see `service::DirectoryLocks`.

pub mod commands;
pub mod derive;
pub mod policy;
pub mod preflight;
pub mod processor;
pub mod types;

pub use processor::TaskPipeline;
pub use types::{OutcomeStatus, PipelineOutcome, PipelineState, Stage, TaskContext};
