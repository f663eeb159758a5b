//! Task queue abstraction.
//!
//! Workers pull [`TaskMessage`]s from a [`TaskQueue`]. Delayed submission
//! covers both retry backoff and async poll intervals. A message only names
//! a task; the runner re-reads the task record before doing anything, so
//! stale or duplicate messages are harmless.

use crate::errors::QueueError;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

/// A request to run one task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskMessage {
    /// Task to run.
    pub task_id: Uuid,
    /// Owning privacy request.
    pub privacy_request_id: Uuid,
}

impl TaskMessage {
    /// Creates a message.
    #[must_use]
    pub fn new(task_id: Uuid, privacy_request_id: Uuid) -> Self {
        Self {
            task_id,
            privacy_request_id,
        }
    }
}

/// Delivery substrate for task messages.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Enqueues a message, visible after `delay`.
    async fn submit(&self, message: TaskMessage, delay: Duration) -> Result<(), QueueError>;

    /// Takes the next visible message, if any.
    async fn receive(&self) -> Result<Option<TaskMessage>, QueueError>;

    /// Time until the next delayed message becomes visible. `None` when the
    /// queue is empty.
    async fn next_ready_in(&self) -> Result<Option<Duration>, QueueError>;

    /// Number of queued messages, visible or not.
    async fn len(&self) -> Result<usize, QueueError>;
}

#[derive(Debug)]
struct Entry {
    message: TaskMessage,
    ready_at: Instant,
    seq: u64,
}

#[derive(Debug, Default)]
struct QueueState {
    entries: Vec<Entry>,
    next_seq: u64,
    closed: bool,
}

/// In-process queue.
///
/// A task has at most one queued message; resubmitting keeps the earlier
/// visibility time.
#[derive(Debug, Clone, Default)]
pub struct InMemoryTaskQueue {
    state: Arc<Mutex<QueueState>>,
}

impl InMemoryTaskQueue {
    /// Creates an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stops accepting messages.
    pub fn close(&self) {
        self.state.lock().closed = true;
    }
}

#[async_trait]
impl TaskQueue for InMemoryTaskQueue {
    async fn submit(&self, message: TaskMessage, delay: Duration) -> Result<(), QueueError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(QueueError::Closed);
        }
        let ready_at = Instant::now() + delay;
        if let Some(existing) = state.entries.iter_mut().find(|e| e.message.task_id == message.task_id) {
            existing.ready_at = existing.ready_at.min(ready_at);
            return Ok(());
        }
        let seq = state.next_seq;
        state.next_seq += 1;
        state.entries.push(Entry { message, ready_at, seq });
        Ok(())
    }

    async fn receive(&self) -> Result<Option<TaskMessage>, QueueError> {
        let mut state = self.state.lock();
        let now = Instant::now();
        let next = state
            .entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.ready_at <= now)
            .min_by_key(|(_, e)| (e.ready_at, e.seq))
            .map(|(i, _)| i);
        Ok(next.map(|i| state.entries.swap_remove(i).message))
    }

    async fn next_ready_in(&self) -> Result<Option<Duration>, QueueError> {
        let state = self.state.lock();
        let now = Instant::now();
        Ok(state
            .entries
            .iter()
            .map(|e| e.ready_at.saturating_duration_since(now))
            .min())
    }

    async fn len(&self) -> Result<usize, QueueError> {
        Ok(self.state.lock().entries.len())
    }
}
