//! Long-running service pieces: task dispatch and per-directory serialization.

pub mod dispatcher;

pub use dispatcher::{DirectoryLocks, Dispatcher};
