//! Task and request persistence.
//!
//! The traits are the seam for real databases. The in-memory versions keep
//! every record behind one `parking_lot` mutex per store, so a claim is a
//! single compare-and-set.

use super::model::{RequestTask, WorkerLease};
use super::request::PrivacyRequest;
use crate::core::{PipelineCheckpoint, RequestStatus, TaskStatus};
use crate::errors::StoreError;
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

/// Persistence for [`RequestTask`]s.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Inserts a new task.
    async fn create(&self, task: RequestTask) -> Result<(), StoreError>;

    /// Loads a task.
    async fn fetch(&self, id: Uuid) -> Result<RequestTask, StoreError>;

    /// All tasks of a request in creation order.
    async fn fetch_by_privacy_request(&self, privacy_request_id: Uuid) -> Result<Vec<RequestTask>, StoreError>;

    /// Replaces a task record.
    async fn update(&self, task: RequestTask) -> Result<(), StoreError>;

    /// Changes a task's status, validating the transition.
    async fn update_status(&self, id: Uuid, status: TaskStatus) -> Result<RequestTask, StoreError>;

    /// Atomically moves a `pending` task to `in_processing` under a lease.
    ///
    /// Returns `None` if the task is not pending, so at most one caller wins.
    async fn try_claim(&self, id: Uuid, worker_id: &str, lease_seconds: i64) -> Result<Option<RequestTask>, StoreError>;

    /// Extends the lease of claim `claim_id` to `lease_seconds` from now.
    ///
    /// Returns `false` if the task is no longer held under that claim.
    async fn renew_lease(&self, id: Uuid, claim_id: Uuid, lease_seconds: i64) -> Result<bool, StoreError>;

    /// Replaces a task record only while it is still `in_processing` under
    /// claim `claim_id`.
    ///
    /// Returns `false`, writing nothing, once the claim has been lost.
    async fn update_if_owner(&self, task: RequestTask, claim_id: Uuid) -> Result<bool, StoreError>;
}

/// Persistence for [`PrivacyRequest`]s and their checkpoints.
#[async_trait]
pub trait RequestStore: Send + Sync {
    /// Inserts a new request.
    async fn create(&self, request: PrivacyRequest) -> Result<(), StoreError>;

    /// Loads a request.
    async fn fetch(&self, id: Uuid) -> Result<PrivacyRequest, StoreError>;

    /// Replaces a request record.
    async fn update(&self, request: PrivacyRequest) -> Result<(), StoreError>;

    /// Sets the aggregate status.
    async fn set_status(&self, id: Uuid, status: RequestStatus) -> Result<(), StoreError>;

    /// Flags the request as canceled.
    async fn request_cancel(&self, id: Uuid) -> Result<(), StoreError>;

    /// The last completed checkpoint.
    async fn checkpoint(&self, id: Uuid) -> Result<Option<PipelineCheckpoint>, StoreError>;

    /// Records a completed checkpoint. Checkpoints never move backwards.
    async fn set_checkpoint(&self, id: Uuid, checkpoint: PipelineCheckpoint) -> Result<(), StoreError>;
}

#[derive(Debug, Default)]
struct TaskTable {
    tasks: HashMap<Uuid, RequestTask>,
    by_request: HashMap<Uuid, Vec<Uuid>>,
}

/// In-memory task store.
#[derive(Debug, Clone, Default)]
pub struct InMemoryTaskStore {
    table: Arc<Mutex<TaskTable>>,
}

impl InMemoryTaskStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored tasks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.table.lock().tasks.len()
    }

    /// True if no task is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.table.lock().tasks.is_empty()
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn create(&self, task: RequestTask) -> Result<(), StoreError> {
        let mut table = self.table.lock();
        if table.tasks.contains_key(&task.id) {
            return Err(StoreError::AlreadyExists {
                kind: "task".to_string(),
                id: task.id.to_string(),
            });
        }
        table.by_request.entry(task.privacy_request_id).or_default().push(task.id);
        table.tasks.insert(task.id, task);
        Ok(())
    }

    async fn fetch(&self, id: Uuid) -> Result<RequestTask, StoreError> {
        self.table
            .lock()
            .tasks
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("task", id))
    }

    async fn fetch_by_privacy_request(&self, privacy_request_id: Uuid) -> Result<Vec<RequestTask>, StoreError> {
        let table = self.table.lock();
        Ok(table
            .by_request
            .get(&privacy_request_id)
            .map(|ids| ids.iter().filter_map(|id| table.tasks.get(id).cloned()).collect())
            .unwrap_or_default())
    }

    async fn update(&self, mut task: RequestTask) -> Result<(), StoreError> {
        let mut table = self.table.lock();
        let slot = table
            .tasks
            .get_mut(&task.id)
            .ok_or_else(|| StoreError::not_found("task", task.id))?;
        task.updated_at = Utc::now();
        *slot = task;
        Ok(())
    }

    async fn update_status(&self, id: Uuid, status: TaskStatus) -> Result<RequestTask, StoreError> {
        let mut table = self.table.lock();
        let task = table.tasks.get_mut(&id).ok_or_else(|| StoreError::not_found("task", id))?;
        task.transition(status)?;
        Ok(task.clone())
    }

    async fn try_claim(&self, id: Uuid, worker_id: &str, lease_seconds: i64) -> Result<Option<RequestTask>, StoreError> {
        let mut table = self.table.lock();
        let task = table.tasks.get_mut(&id).ok_or_else(|| StoreError::not_found("task", id))?;
        if task.status != TaskStatus::Pending {
            return Ok(None);
        }
        task.transition(TaskStatus::InProcessing)?;
        task.lease = Some(WorkerLease::new(worker_id, lease_seconds));
        Ok(Some(task.clone()))
    }

    async fn renew_lease(&self, id: Uuid, claim_id: Uuid, lease_seconds: i64) -> Result<bool, StoreError> {
        let mut table = self.table.lock();
        let task = table.tasks.get_mut(&id).ok_or_else(|| StoreError::not_found("task", id))?;
        match task.lease.as_mut() {
            Some(lease) if task.status == TaskStatus::InProcessing && lease.claim_id == claim_id => {
                lease.renew(lease_seconds);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn update_if_owner(&self, mut task: RequestTask, claim_id: Uuid) -> Result<bool, StoreError> {
        let mut table = self.table.lock();
        let slot = table
            .tasks
            .get_mut(&task.id)
            .ok_or_else(|| StoreError::not_found("task", task.id))?;
        let owned = slot.status == TaskStatus::InProcessing && slot.lease.as_ref().is_some_and(|l| l.claim_id == claim_id);
        if !owned {
            return Ok(false);
        }
        task.updated_at = Utc::now();
        *slot = task;
        Ok(true)
    }
}

/// In-memory request store.
#[derive(Debug, Clone, Default)]
pub struct InMemoryRequestStore {
    requests: Arc<Mutex<HashMap<Uuid, (PrivacyRequest, Option<PipelineCheckpoint>)>>>,
}

impl InMemoryRequestStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RequestStore for InMemoryRequestStore {
    async fn create(&self, request: PrivacyRequest) -> Result<(), StoreError> {
        let mut requests = self.requests.lock();
        if requests.contains_key(&request.id) {
            return Err(StoreError::AlreadyExists {
                kind: "privacy request".to_string(),
                id: request.id.to_string(),
            });
        }
        requests.insert(request.id, (request, None));
        Ok(())
    }

    async fn fetch(&self, id: Uuid) -> Result<PrivacyRequest, StoreError> {
        self.requests
            .lock()
            .get(&id)
            .map(|(request, _)| request.clone())
            .ok_or_else(|| StoreError::not_found("privacy request", id))
    }

    async fn update(&self, mut request: PrivacyRequest) -> Result<(), StoreError> {
        let mut requests = self.requests.lock();
        let (slot, _) = requests
            .get_mut(&request.id)
            .ok_or_else(|| StoreError::not_found("privacy request", request.id))?;
        // A cancel issued while the caller held a stale copy must survive.
        request.cancel_requested |= slot.cancel_requested;
        request.updated_at = Utc::now();
        *slot = request;
        Ok(())
    }

    async fn set_status(&self, id: Uuid, status: RequestStatus) -> Result<(), StoreError> {
        let mut requests = self.requests.lock();
        let (request, _) = requests
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found("privacy request", id))?;
        request.set_status(status);
        Ok(())
    }

    async fn request_cancel(&self, id: Uuid) -> Result<(), StoreError> {
        let mut requests = self.requests.lock();
        let (request, _) = requests
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found("privacy request", id))?;
        request.cancel_requested = true;
        request.updated_at = Utc::now();
        Ok(())
    }

    async fn checkpoint(&self, id: Uuid) -> Result<Option<PipelineCheckpoint>, StoreError> {
        self.requests
            .lock()
            .get(&id)
            .map(|(_, checkpoint)| *checkpoint)
            .ok_or_else(|| StoreError::not_found("privacy request", id))
    }

    async fn set_checkpoint(&self, id: Uuid, checkpoint: PipelineCheckpoint) -> Result<(), StoreError> {
        let mut requests = self.requests.lock();
        let (_, current) = requests
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found("privacy request", id))?;
        if let Some(existing) = *current {
            if checkpoint < existing {
                return Err(StoreError::CheckpointRegression {
                    request_id: id.to_string(),
                    current: existing.to_string(),
                    requested: checkpoint.to_string(),
                });
            }
        }
        *current = Some(checkpoint);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{ActionType, CollectionAddress, IdentitySeeds, Policy};
    use pretty_assertions::assert_eq;

    fn task(request_id: Uuid, collection: &str) -> RequestTask {
        RequestTask::new(request_id, CollectionAddress::new("db", collection), "pg", ActionType::Access)
    }

    #[tokio::test]
    async fn test_create_and_fetch_in_order() {
        let store = InMemoryTaskStore::new();
        let request_id = Uuid::new_v4();
        let first = task(request_id, "customer");
        let second = task(request_id, "orders");
        store.create(first.clone()).await.unwrap();
        store.create(second.clone()).await.unwrap();
        store.create(task(Uuid::new_v4(), "other")).await.unwrap();

        let tasks = store.fetch_by_privacy_request(request_id).await.unwrap();
        let ids: Vec<Uuid> = tasks.iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![first.id, second.id]);
        assert_eq!(store.len(), 3);

        assert!(matches!(
            store.create(first).await.unwrap_err(),
            StoreError::AlreadyExists { .. }
        ));
    }

    #[tokio::test]
    async fn test_claim_is_exclusive() {
        let store = InMemoryTaskStore::new();
        let task = task(Uuid::new_v4(), "customer");
        store.create(task.clone()).await.unwrap();

        let claimed = store.try_claim(task.id, "w1", 60).await.unwrap().unwrap();
        assert_eq!(claimed.status, TaskStatus::InProcessing);
        assert_eq!(claimed.lease.as_ref().unwrap().worker_id, "w1");
        assert!(store.try_claim(task.id, "w2", 60).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_renew_lease_only_for_current_claim() {
        let store = InMemoryTaskStore::new();
        let task = task(Uuid::new_v4(), "customer");
        store.create(task.clone()).await.unwrap();

        let claimed = store.try_claim(task.id, "w1", -1).await.unwrap().unwrap();
        let claim_id = claimed.lease.as_ref().unwrap().claim_id;
        assert!(store.renew_lease(task.id, claim_id, 60).await.unwrap());
        let stored = store.fetch(task.id).await.unwrap();
        assert!(!stored.lease.unwrap().is_expired(Utc::now()));

        assert!(!store.renew_lease(task.id, Uuid::new_v4(), 60).await.unwrap());

        store.update_status(task.id, TaskStatus::Pending).await.unwrap();
        assert!(!store.renew_lease(task.id, claim_id, 60).await.unwrap());
    }

    #[tokio::test]
    async fn test_update_if_owner_rejects_lost_claim() {
        let store = InMemoryTaskStore::new();
        let task = task(Uuid::new_v4(), "customer");
        store.create(task.clone()).await.unwrap();

        let mut first = store.try_claim(task.id, "w1", 60).await.unwrap().unwrap();
        let first_claim = first.lease.as_ref().unwrap().claim_id;

        // Reclaimed after the first holder stalled.
        store.update_status(task.id, TaskStatus::Pending).await.unwrap();
        let mut second = store.try_claim(task.id, "w1", 60).await.unwrap().unwrap();
        let second_claim = second.lease.as_ref().unwrap().claim_id;

        first.transition(TaskStatus::Complete).unwrap();
        assert!(!store.update_if_owner(first, first_claim).await.unwrap());
        assert_eq!(store.fetch(task.id).await.unwrap().status, TaskStatus::InProcessing);

        second.transition(TaskStatus::Complete).unwrap();
        assert!(store.update_if_owner(second.clone(), second_claim).await.unwrap());
        assert_eq!(store.fetch(task.id).await.unwrap().status, TaskStatus::Complete);

        assert!(!store.update_if_owner(second, second_claim).await.unwrap());
    }

    #[tokio::test]
    async fn test_update_status_validates() {
        let store = InMemoryTaskStore::new();
        let task = task(Uuid::new_v4(), "customer");
        store.create(task.clone()).await.unwrap();

        let err = store.update_status(task.id, TaskStatus::Complete).await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition { .. }));

        let paused = store.update_status(task.id, TaskStatus::Paused).await.unwrap();
        assert_eq!(paused.status, TaskStatus::Paused);
    }

    #[tokio::test]
    async fn test_checkpoint_is_monotonic() {
        let store = InMemoryRequestStore::new();
        let request = PrivacyRequest::new(Policy::new("p"), IdentitySeeds::new());
        let id = request.id;
        store.create(request).await.unwrap();

        assert_eq!(store.checkpoint(id).await.unwrap(), None);
        store.set_checkpoint(id, PipelineCheckpoint::Access).await.unwrap();
        store.set_checkpoint(id, PipelineCheckpoint::Access).await.unwrap();
        store.set_checkpoint(id, PipelineCheckpoint::Erasure).await.unwrap();

        let err = store.set_checkpoint(id, PipelineCheckpoint::Consent).await.unwrap_err();
        assert!(matches!(err, StoreError::CheckpointRegression { .. }));
        assert_eq!(store.checkpoint(id).await.unwrap(), Some(PipelineCheckpoint::Erasure));
    }

    #[tokio::test]
    async fn test_cancel_survives_stale_update() {
        let store = InMemoryRequestStore::new();
        let request = PrivacyRequest::new(Policy::new("p"), IdentitySeeds::new());
        let id = request.id;
        store.create(request.clone()).await.unwrap();

        store.request_cancel(id).await.unwrap();
        store.update(request).await.unwrap();

        assert!(store.fetch(id).await.unwrap().is_canceled());
    }

    #[tokio::test]
    async fn test_missing_records() {
        let tasks = InMemoryTaskStore::new();
        let requests = InMemoryRequestStore::new();
        assert!(tasks.fetch(Uuid::new_v4()).await.is_err());
        assert!(requests.checkpoint(Uuid::new_v4()).await.is_err());
    }
}
