//! Task execution.
//!
//! [`EngineContext`] bundles the stores, queue, connectors and masking
//! registry. A [`TaskRunner`] turns one queue message into one task state
//! change, and a [`Worker`] drives runners with bounded concurrency until the
//! queue drains.

mod context;
mod runner;
mod worker;

pub use context::EngineContext;
pub use runner::{TaskOutcome, TaskRunner};
pub use worker::{Worker, WorkerStats};
