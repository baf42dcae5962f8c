//! Asynchronous execution of agent tasks.
//!
//! - [`ExecutionTracker`] owns the record of every execution.
//! - [`ExecutionAdapter`] starts jobs on a [`TaskRunner`], drives their
//!   records through `Pending -> Running -> terminal` and publishes
//!   [`ExecutionEvent`]s.

pub mod adapter;
pub mod events;
pub mod runner;
pub mod tracker;

pub use adapter::{ExecuteOptions, ExecutionAdapter, ExecutionHandle, ExecutionOutcome, ProgressCallback};
pub use events::{ExecutionEvent, ExecutionEventKind};
pub use runner::{FnRunner, JobDefinition, ProcessRunner, ProgressReporter, TaskRunner, UnconfiguredRunner};
pub use tracker::{ExecutionId, ExecutionRecord, ExecutionStatus, ExecutionTracker, RecordPatch};
