//! Requeue decisions for failed, paused and interrupted tasks.

use super::backoff::{should_retry, PollConfig, RetryConfig, RetryDecision};
use crate::core::{ActionType, TaskStatus};
use crate::errors::EngineError;
use crate::queue::{TaskMessage, TaskQueue};
use crate::tasks::{RequestTask, TaskStore, UPSTREAM_FAILED};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// What a resume pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResumeSummary {
    /// Tasks put back on the queue.
    pub requeued: Vec<Uuid>,
    /// `in_processing` tasks left alone because their lease is live.
    pub live: Vec<Uuid>,
    /// Tasks waiting on manual input.
    pub awaiting_input: Vec<Uuid>,
    /// `error` tasks left alone: terminal, or behind a terminal upstream.
    pub failed: Vec<Uuid>,
}

/// Requeues tasks according to the retry and poll policies.
#[derive(Clone)]
pub struct RetryController {
    retry: RetryConfig,
    polling: PollConfig,
    tasks: Arc<dyn TaskStore>,
    queue: Arc<dyn TaskQueue>,
}

impl std::fmt::Debug for RetryController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryController")
            .field("retry", &self.retry)
            .field("polling", &self.polling)
            .finish_non_exhaustive()
    }
}

impl RetryController {
    /// Creates a controller.
    #[must_use]
    pub fn new(retry: RetryConfig, polling: PollConfig, tasks: Arc<dyn TaskStore>, queue: Arc<dyn TaskQueue>) -> Self {
        Self {
            retry,
            polling,
            tasks,
            queue,
        }
    }

    /// The error-retry policy.
    #[must_use]
    pub fn retry_config(&self) -> &RetryConfig {
        &self.retry
    }

    /// The polling policy.
    #[must_use]
    pub fn poll_config(&self) -> &PollConfig {
        &self.polling
    }

    /// Decides whether a failed attempt of `task` gets another try.
    #[must_use]
    pub fn decide(&self, task: &RequestTask, retryable: bool) -> RetryDecision {
        should_retry(task.retry_count, retryable, &self.retry)
    }

    /// Delay before the next poll of an async job.
    #[must_use]
    pub fn poll_delay(&self) -> Duration {
        self.polling.interval()
    }

    /// True once a job has been polled more often than allowed.
    #[must_use]
    pub fn poll_budget_exceeded(&self, poll_count: u32) -> bool {
        poll_count > self.polling.max_polls
    }

    /// Enqueues a task after `delay`.
    pub async fn enqueue(&self, task: &RequestTask, delay: Duration) -> Result<(), EngineError> {
        self.queue
            .submit(TaskMessage::new(task.id, task.privacy_request_id), delay)
            .await?;
        Ok(())
    }

    /// Puts an `error` or `paused` task back to `pending` and enqueues it.
    ///
    /// For operators: an errored task starts a fresh retry budget. Returns
    /// false for tasks in any other state.
    pub async fn requeue_failed(&self, task_id: Uuid) -> Result<bool, EngineError> {
        let task = self.tasks.fetch(task_id).await?;
        if !task.status.is_retryable() {
            return Ok(false);
        }
        self.requeue(task, true).await?;
        Ok(true)
    }

    async fn requeue(&self, mut task: RequestTask, reset_budget: bool) -> Result<(), EngineError> {
        if reset_budget && task.status == TaskStatus::Error {
            task.retry_count = 0;
            task.poll_count = 0;
        }
        task.transition(TaskStatus::Pending)?;
        self.tasks.update(task.clone()).await?;
        self.enqueue(&task, Duration::ZERO).await?;
        tracing::info!(task_id = %task.id, collection = %task.address, retry_count = task.retry_count, "Requeued task");
        Ok(())
    }

    /// True if an errored task still has a retryable error and budget left.
    #[must_use]
    pub fn can_resume(&self, task: &RequestTask) -> bool {
        task.error.as_ref().is_some_and(|e| e.retryable) && task.retry_count < self.retry.max_retries
    }

    /// Requeues every unfinished task of a request.
    pub async fn resume_request(&self, privacy_request_id: Uuid) -> Result<ResumeSummary, EngineError> {
        self.resume(privacy_request_id, None).await
    }

    /// Requeues the unfinished tasks of one action of a request.
    pub async fn resume_action(&self, privacy_request_id: Uuid, action: ActionType) -> Result<ResumeSummary, EngineError> {
        self.resume(privacy_request_id, Some(action)).await
    }

    /// Resume keeps every task's retry budget. Terminal errors stay put, and
    /// an upstream failure is requeued only once none of its upstream tasks
    /// is left in `error`.
    async fn resume(&self, privacy_request_id: Uuid, action: Option<ActionType>) -> Result<ResumeSummary, EngineError> {
        let now = Utc::now();
        let mut summary = ResumeSummary::default();
        let tasks = self.tasks.fetch_by_privacy_request(privacy_request_id).await?;
        let mut statuses: HashMap<Uuid, TaskStatus> = tasks.iter().map(|t| (t.id, t.status)).collect();
        let mut blocked: Vec<RequestTask> = Vec::new();

        for mut task in tasks.into_iter().filter(|t| action.map_or(true, |a| t.action == a)) {
            match task.status {
                TaskStatus::Pending => {
                    self.enqueue(&task, Duration::ZERO).await?;
                    summary.requeued.push(task.id);
                }
                TaskStatus::Paused => {
                    let id = task.id;
                    self.requeue(task, false).await?;
                    statuses.insert(id, TaskStatus::Pending);
                    summary.requeued.push(id);
                }
                TaskStatus::Error if is_upstream_failure(&task) => blocked.push(task),
                TaskStatus::Error => {
                    if self.can_resume(&task) {
                        let id = task.id;
                        self.requeue(task, false).await?;
                        statuses.insert(id, TaskStatus::Pending);
                        summary.requeued.push(id);
                    } else {
                        tracing::debug!(task_id = %task.id, collection = %task.address, "Leaving terminal failure in place");
                        summary.failed.push(task.id);
                    }
                }
                TaskStatus::InProcessing => {
                    let expired = task.lease.as_ref().map_or(true, |lease| lease.is_expired(now));
                    if expired {
                        tracing::warn!(task_id = %task.id, collection = %task.address, "Reclaiming task with expired lease");
                        task.transition(TaskStatus::Pending)?;
                        self.tasks.update(task.clone()).await?;
                        self.enqueue(&task, Duration::ZERO).await?;
                        statuses.insert(task.id, TaskStatus::Pending);
                        summary.requeued.push(task.id);
                    } else {
                        summary.live.push(task.id);
                    }
                }
                TaskStatus::RequiresInput => summary.awaiting_input.push(task.id),
                TaskStatus::Complete | TaskStatus::Skipped => {}
            }
        }

        loop {
            let (ready, waiting): (Vec<RequestTask>, Vec<RequestTask>) = blocked.into_iter().partition(|task| {
                task.upstream_tasks
                    .iter()
                    .all(|id| statuses.get(id) != Some(&TaskStatus::Error))
            });
            blocked = waiting;
            if ready.is_empty() {
                break;
            }
            for task in ready {
                let id = task.id;
                self.requeue(task, false).await?;
                statuses.insert(id, TaskStatus::Pending);
                summary.requeued.push(id);
            }
        }
        summary.failed.extend(blocked.iter().map(|task| task.id));

        tracing::debug!(
            privacy_request_id = %privacy_request_id,
            requeued = summary.requeued.len(),
            live = summary.live.len(),
            failed = summary.failed.len(),
            "Resume pass finished"
        );
        Ok(summary)
    }
}

fn is_upstream_failure(task: &RequestTask) -> bool {
    task.error.as_ref().is_some_and(|e| e.kind == UPSTREAM_FAILED)
}
