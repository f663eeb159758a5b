//! Bounded-concurrency worker loop.

use super::runner::{TaskOutcome, TaskRunner};
use crate::errors::EngineError;
use futures::stream::{FuturesUnordered, StreamExt};
use std::collections::HashMap;
use tokio::task::JoinHandle;

/// Counts of dispatched messages by outcome.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerStats {
    /// Messages received from the queue.
    pub dispatched: usize,
    outcomes: HashMap<TaskOutcome, usize>,
}

impl WorkerStats {
    /// How many messages ended with `outcome`.
    #[must_use]
    pub fn count(&self, outcome: TaskOutcome) -> usize {
        self.outcomes.get(&outcome).copied().unwrap_or(0)
    }

    fn record(&mut self, outcome: TaskOutcome) {
        *self.outcomes.entry(outcome).or_insert(0) += 1;
    }
}

/// Pulls messages from the queue and runs up to `concurrency` of them at
/// once.
#[derive(Debug, Clone)]
pub struct Worker {
    runner: TaskRunner,
    concurrency: usize,
}

impl Worker {
    /// Creates a worker. A concurrency of zero is treated as one.
    #[must_use]
    pub fn new(runner: TaskRunner, concurrency: usize) -> Self {
        Self {
            runner,
            concurrency: concurrency.max(1),
        }
    }

    /// Runs until the queue is empty and nothing is in flight.
    ///
    /// Delayed messages are waited for. On the first infrastructure error no
    /// new messages are taken; in-flight runs are drained and the error is
    /// returned.
    pub async fn run_until_idle(&self) -> Result<WorkerStats, EngineError> {
        let queue = &self.runner.context().queue;
        let mut stats = WorkerStats::default();
        let mut first_error: Option<EngineError> = None;
        let mut in_flight: FuturesUnordered<JoinHandle<Result<TaskOutcome, EngineError>>> = FuturesUnordered::new();

        loop {
            while first_error.is_none() && in_flight.len() < self.concurrency {
                let Some(message) = queue.receive().await? else {
                    break;
                };
                stats.dispatched += 1;
                let runner = self.runner.clone();
                in_flight.push(tokio::spawn(async move { runner.run(message).await }));
            }

            if in_flight.is_empty() {
                if first_error.is_some() {
                    break;
                }
                match queue.next_ready_in().await? {
                    Some(wait) => {
                        tokio::time::sleep(wait).await;
                        continue;
                    }
                    None => break,
                }
            }

            if let Some(joined) = in_flight.next().await {
                let result = joined.map_err(|e| EngineError::Internal(format!("task run aborted: {e}")))?;
                match result {
                    Ok(outcome) => stats.record(outcome),
                    Err(error) => {
                        tracing::error!(error = %error, "Task run failed; draining worker");
                        first_error.get_or_insert(error);
                    }
                }
            }
        }

        match first_error {
            Some(error) => Err(error),
            None => Ok(stats),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::connectors::ConnectorRegistry;
    use crate::execution::EngineContext;
    use crate::queue::TaskMessage;
    use std::sync::Arc;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_empty_queue_is_idle() {
        let ctx = Arc::new(EngineContext::new(EngineConfig::default(), ConnectorRegistry::new()));
        let worker = Worker::new(TaskRunner::new(ctx, "w1"), 4);

        let stats = worker.run_until_idle().await.unwrap();
        assert_eq!(stats.dispatched, 0);
    }

    #[tokio::test]
    async fn test_missing_task_is_reported() {
        let ctx = Arc::new(EngineContext::new(EngineConfig::default(), ConnectorRegistry::new()));
        ctx.queue
            .submit(TaskMessage::new(Uuid::new_v4(), Uuid::new_v4()), std::time::Duration::ZERO)
            .await
            .unwrap();
        let worker = Worker::new(TaskRunner::new(ctx, "w1"), 0);

        let err = worker.run_until_idle().await.unwrap_err();
        assert!(matches!(err, EngineError::Store(_)));
    }
}
