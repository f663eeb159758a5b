//! Action types and task/request status enums.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The kind of privacy action a task performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    /// Retrieve the subject's data.
    Access,
    /// Propagate consent preferences.
    Consent,
    /// Mask or delete the subject's data.
    Erasure,
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Access => write!(f, "access"),
            Self::Consent => write!(f, "consent"),
            Self::Erasure => write!(f, "erasure"),
        }
    }
}

/// The execution status of a request task.
///
/// ```text
/// pending -> in_processing -> { complete, error, skipped, requires_input, paused }
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting to be claimed by a worker.
    Pending,
    /// Claimed by exactly one worker.
    InProcessing,
    /// Finished successfully.
    Complete,
    /// Failed; may be requeued by the retry controller.
    Error,
    /// Nothing to do (empty inputs).
    Skipped,
    /// Waiting for manually supplied data.
    RequiresInput,
    /// Parked while the owning request is paused.
    Paused,
}

impl Default for TaskStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::InProcessing => write!(f, "in_processing"),
            Self::Complete => write!(f, "complete"),
            Self::Error => write!(f, "error"),
            Self::Skipped => write!(f, "skipped"),
            Self::RequiresInput => write!(f, "requires_input"),
            Self::Paused => write!(f, "paused"),
        }
    }
}

impl TaskStatus {
    /// Returns true if the task will never run again without outside action.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Skipped | Self::Error)
    }

    /// Returns true if downstream tasks may use this task's output.
    #[must_use]
    pub fn satisfies_gate(&self) -> bool {
        matches!(self, Self::Complete | Self::Skipped)
    }

    /// Returns true if the retry controller may requeue the task.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Error | Self::Paused)
    }

    /// Returns true if the state machine allows moving to `next`.
    #[must_use]
    pub fn can_transition_to(&self, next: Self) -> bool {
        use TaskStatus::{Complete, Error, InProcessing, Paused, Pending, RequiresInput, Skipped};
        match (self, next) {
            (Pending, InProcessing | Paused | Error) => true,
            (InProcessing, Complete | Error | Skipped | RequiresInput | Paused | Pending) => true,
            (Error | Paused | RequiresInput, Pending) => true,
            (a, b) => *a == b,
        }
    }
}

/// Overall status of a privacy request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    /// Accepted, not started.
    Pending,
    /// Pipeline running.
    InProcessing,
    /// Halted by a webhook or operator; resumable.
    Paused,
    /// Waiting on manually supplied data.
    RequiresInput,
    /// All steps finished without failures.
    Complete,
    /// At least one action failed.
    Error,
    /// Cancelled; no further tasks are dispatched.
    Canceled,
}

impl Default for RequestStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::InProcessing => write!(f, "in_processing"),
            Self::Paused => write!(f, "paused"),
            Self::RequiresInput => write!(f, "requires_input"),
            Self::Complete => write!(f, "complete"),
            Self::Error => write!(f, "error"),
            Self::Canceled => write!(f, "canceled"),
        }
    }
}
