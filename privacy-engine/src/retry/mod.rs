//! Retry and resume.
//!
//! Error retries and async polls use separate delays: [`RetryConfig`]
//! backs off on failures, [`PollConfig`] paces re-polls. The
//! [`RetryController`] turns failed or interrupted tasks back into queued
//! work without ever requeueing a task whose claim is still live.

mod backoff;
mod controller;

pub use backoff::{should_retry, BackoffStrategy, JitterStrategy, PollConfig, RetryConfig, RetryDecision};
pub use controller::{ResumeSummary, RetryController};
