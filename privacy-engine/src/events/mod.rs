//! Lifecycle events for tasks and pipelines.
//!
//! The runner and orchestrator report progress through an [`EventSink`].
//! Event payloads carry ids, addresses and counts; row data and identity
//! values are never included.

mod sink;

pub use sink::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};

/// Event type names.
pub mod event_types {
    /// A task was claimed and is running.
    pub const TASK_STARTED: &str = "task.started";
    /// A task finished successfully.
    pub const TASK_COMPLETED: &str = "task.completed";
    /// A task had nothing to do.
    pub const TASK_SKIPPED: &str = "task.skipped";
    /// A task failed and was requeued.
    pub const TASK_RETRYING: &str = "task.retrying";
    /// A task failed terminally.
    pub const TASK_FAILED: &str = "task.failed";
    /// A task is waiting on an async job.
    pub const TASK_POLLING: &str = "task.polling";
    /// A task needs manual input.
    pub const TASK_REQUIRES_INPUT: &str = "task.requires_input";
    /// A task was paused.
    pub const TASK_PAUSED: &str = "task.paused";
    /// A pipeline checkpoint was persisted.
    pub const PIPELINE_CHECKPOINT: &str = "pipeline.checkpoint";
    /// A pipeline stopped before finishing.
    pub const PIPELINE_HALTED: &str = "pipeline.halted";
    /// A pipeline reached `done`.
    pub const PIPELINE_COMPLETED: &str = "pipeline.completed";
    /// A pipeline was canceled.
    pub const PIPELINE_CANCELED: &str = "pipeline.canceled";
}
