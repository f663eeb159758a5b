//! Persisted task records.

use super::artifacts::ArtifactRef;
use crate::connectors::AsyncHandle;
use crate::core::{ActionType, CollectionAddress, Row, TaskStatus};
use crate::errors::{ConnectorError, MaskingStrategyError, StoreError};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Collection name used by the per-dataset consent tasks.
pub const CONSENT_COLLECTION: &str = "__consent__";

/// Error kind of a task skipped because an upstream task failed.
pub const UPSTREAM_FAILED: &str = "upstream_failed";

/// Rows produced by a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum TaskData {
    /// Rows stored on the task record.
    Inline(Vec<Row>),
    /// Rows stored in the artifact store.
    External(ArtifactRef),
}

/// Why a task failed. Never carries row values or credentials.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskErrorDetail {
    /// Error classification, e.g. `transient` or `upstream_failed`.
    pub kind: String,
    /// Human readable message.
    pub message: String,
    /// The collection the task serves.
    pub collection: String,
    /// Whether another attempt may succeed.
    #[serde(default)]
    pub retryable: bool,
}

impl TaskErrorDetail {
    /// Creates a detail record.
    #[must_use]
    pub fn new(kind: impl Into<String>, message: impl Into<String>, collection: &CollectionAddress) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            collection: collection.to_string(),
            retryable: false,
        }
    }

    /// Records a connector failure.
    #[must_use]
    pub fn from_connector(error: &ConnectorError, collection: &CollectionAddress) -> Self {
        let kind = serde_json::to_value(error.kind())
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_else(|| "connector".to_string());
        Self {
            retryable: error.is_retryable(),
            ..Self::new(kind, error.to_string(), collection)
        }
    }

    /// Records a masking failure.
    #[must_use]
    pub fn from_masking(error: &MaskingStrategyError, collection: &CollectionAddress) -> Self {
        Self::new("masking", error.to_string(), collection)
    }

    /// An upstream task ended in `error`.
    #[must_use]
    pub fn upstream_failed(collection: &CollectionAddress, upstream: &CollectionAddress) -> Self {
        Self::new(
            UPSTREAM_FAILED,
            format!("upstream failed: {upstream}"),
            collection,
        )
    }
}

/// A worker's claim on a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerLease {
    /// Claiming worker.
    pub worker_id: String,
    /// Identifies this claim. A reclaim of the same task gets a new one.
    pub claim_id: Uuid,
    /// When the claim lapses.
    pub expires_at: DateTime<Utc>,
}

impl WorkerLease {
    /// Creates a lease lasting `seconds` from now.
    #[must_use]
    pub fn new(worker_id: impl Into<String>, seconds: i64) -> Self {
        Self {
            worker_id: worker_id.into(),
            claim_id: Uuid::new_v4(),
            expires_at: Utc::now() + Duration::seconds(seconds),
        }
    }

    /// Pushes the expiry to `seconds` from now.
    pub fn renew(&mut self, seconds: i64) {
        self.expires_at = Utc::now() + Duration::seconds(seconds);
    }

    /// True once the holder can no longer be assumed alive.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// One unit of work: an action on one collection for one request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestTask {
    /// Task id.
    pub id: Uuid,
    /// Owning privacy request.
    pub privacy_request_id: Uuid,
    /// Collection served.
    pub address: CollectionAddress,
    /// Connector key.
    pub connection_key: String,
    /// Action performed.
    pub action: ActionType,
    /// Tasks that must finish first.
    #[serde(default)]
    pub upstream_tasks: Vec<Uuid>,
    /// Tasks waiting on this one.
    #[serde(default)]
    pub downstream_tasks: Vec<Uuid>,
    /// Current status.
    #[serde(default)]
    pub status: TaskStatus,
    /// Retrieved rows.
    #[serde(default)]
    pub data: Option<TaskData>,
    /// Rows supplied by a person for a manual collection.
    #[serde(default)]
    pub manual_input: Option<Vec<Row>>,
    /// Rows updated during erasure.
    #[serde(default)]
    pub rows_masked: usize,
    /// Error retries performed.
    #[serde(default)]
    pub retry_count: u32,
    /// Waiting on an async job.
    #[serde(default)]
    pub polling: bool,
    /// The submitted async job.
    #[serde(default)]
    pub async_handle: Option<AsyncHandle>,
    /// Pending polls since submission.
    #[serde(default)]
    pub poll_count: u32,
    /// Async jobs submitted.
    #[serde(default)]
    pub async_submissions: u32,
    /// Last failure.
    #[serde(default)]
    pub error: Option<TaskErrorDetail>,
    /// Current claim.
    #[serde(default)]
    pub lease: Option<WorkerLease>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last update time.
    pub updated_at: DateTime<Utc>,
    /// First claim time.
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    /// Time a terminal status was reached.
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
}

impl RequestTask {
    /// Creates a pending task.
    #[must_use]
    pub fn new(
        privacy_request_id: Uuid,
        address: CollectionAddress,
        connection_key: impl Into<String>,
        action: ActionType,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            privacy_request_id,
            address,
            connection_key: connection_key.into(),
            action,
            upstream_tasks: Vec::new(),
            downstream_tasks: Vec::new(),
            status: TaskStatus::Pending,
            data: None,
            manual_input: None,
            rows_masked: 0,
            retry_count: 0,
            polling: false,
            async_handle: None,
            poll_count: 0,
            async_submissions: 0,
            error: None,
            lease: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            finished_at: None,
        }
    }

    /// True for the per-dataset consent task.
    #[must_use]
    pub fn is_consent(&self) -> bool {
        self.address.collection == CONSENT_COLLECTION
    }

    /// Moves to `next`, enforcing the task state machine.
    pub fn transition(&mut self, next: TaskStatus) -> Result<(), StoreError> {
        if !self.status.can_transition_to(next) {
            return Err(StoreError::InvalidTransition {
                task_id: self.id.to_string(),
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        let now = Utc::now();
        if next == TaskStatus::InProcessing && self.started_at.is_none() {
            self.started_at = Some(now);
        }
        if next.is_terminal() {
            self.finished_at = Some(now);
        }
        if next != TaskStatus::InProcessing {
            self.lease = None;
        }
        self.status = next;
        self.updated_at = now;
        Ok(())
    }

    /// Rows stored inline, if any.
    #[must_use]
    pub fn inline_rows(&self) -> Option<&[Row]> {
        match &self.data {
            Some(TaskData::Inline(rows)) => Some(rows),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn task() -> RequestTask {
        RequestTask::new(
            Uuid::new_v4(),
            CollectionAddress::new("db", "customer"),
            "pg",
            ActionType::Access,
        )
    }

    #[test]
    fn test_transition_sets_timestamps() {
        let mut task = task();
        task.transition(TaskStatus::InProcessing).unwrap();
        assert!(task.started_at.is_some());
        assert!(task.finished_at.is_none());

        task.transition(TaskStatus::Complete).unwrap();
        assert!(task.finished_at.is_some());
    }

    #[test]
    fn test_invalid_transition() {
        let mut task = task();
        let err = task.transition(TaskStatus::Complete).unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition { .. }));
        assert_eq!(task.status, TaskStatus::Pending);
    }

    #[test]
    fn test_transition_drops_lease() {
        let mut task = task();
        task.transition(TaskStatus::InProcessing).unwrap();
        task.lease = Some(WorkerLease::new("w1", 60));
        task.transition(TaskStatus::Pending).unwrap();
        assert!(task.lease.is_none());
    }

    #[test]
    fn test_lease_expiry() {
        let lease = WorkerLease::new("w1", 60);
        assert!(!lease.is_expired(Utc::now()));
        assert!(lease.is_expired(Utc::now() + Duration::seconds(61)));
    }

    #[test]
    fn test_lease_renew_keeps_claim() {
        let mut lease = WorkerLease::new("w1", -1);
        let claim_id = lease.claim_id;
        assert!(lease.is_expired(Utc::now()));

        lease.renew(60);
        assert!(!lease.is_expired(Utc::now()));
        assert_eq!(lease.claim_id, claim_id);
        assert_ne!(WorkerLease::new("w1", 60).claim_id, claim_id);
    }

    #[test]
    fn test_error_detail_from_connector() {
        let address = CollectionAddress::new("db", "customer");
        let detail = TaskErrorDetail::from_connector(&ConnectorError::transient("refused"), &address);
        assert_eq!(detail.kind, "transient");
        assert!(detail.retryable);
        assert_eq!(detail.collection, "db:customer");
    }

    #[test]
    fn test_task_serde() {
        let mut task = task();
        task.data = Some(TaskData::Inline(vec![serde_json::json!({"id": 1})
            .as_object()
            .cloned()
            .unwrap()]));
        let json = serde_json::to_string(&task).unwrap();
        let back: RequestTask = serde_json::from_str(&json).unwrap();
        assert_eq!(back, task);
    }
}
