//! External process execution with bounded wall-clock budgets.

pub mod output;
pub mod runner;
pub mod step;

pub use output::{CollectingSink, NullSink, OutputSink, OutputStream, TracingSink};
pub use runner::{CommandSpec, ProcessRunner, TokioProcessRunner};
pub use step::{KILLED_EXIT_CODE, StepKind, StepResult, TIMEOUT_EXIT_CODE};
