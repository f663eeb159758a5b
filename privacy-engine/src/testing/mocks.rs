//! Mock connectors, stores and webhook clients.

use crate::connectors::{Connector, ConnectorCapabilities, ConsentPreference, QueryConditions, RowUpdate};
use crate::core::row::{get_path, set_path};
use crate::core::{CollectionAddress, IdentitySeeds, PipelineCheckpoint, RequestStatus, Row, TaskStatus};
use crate::errors::{ConnectorError, StoreError, WebhookError};
use crate::graph::TraversalNode;
use crate::pipeline::{Webhook, WebhookClient, WebhookPayload, WebhookResponse};
use crate::tasks::{PrivacyRequest, RequestStore, RequestTask, TaskStore};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Start or end of a connector call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallPhase {
    /// The call began.
    Start,
    /// The call returned.
    End,
}

/// One entry of [`InMemoryConnector`]'s call log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectorCall {
    /// Start or end.
    pub phase: CallPhase,
    /// `retrieve` or `mutate`.
    pub operation: &'static str,
    /// The collection served.
    pub collection: CollectionAddress,
}

/// A connector over in-memory tables keyed by collection name.
///
/// Rows match when any condition field holds any of its values. Every call
/// is logged with a start and an end entry, and errors can be scripted per
/// collection.
#[derive(Debug, Default)]
pub struct InMemoryConnector {
    tables: Mutex<HashMap<String, Vec<Row>>>,
    failures: Mutex<HashMap<String, VecDeque<ConnectorError>>>,
    log: Mutex<Vec<ConnectorCall>>,
    consent_updates: Mutex<Vec<Vec<ConsentPreference>>>,
    supports_consent: bool,
    delay: Duration,
}

impl InMemoryConnector {
    /// Creates an empty connector.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds a table.
    #[must_use]
    pub fn with_rows(self, collection: impl Into<String>, rows: Vec<Row>) -> Self {
        self.tables.lock().insert(collection.into(), rows);
        self
    }

    /// Accepts consent updates.
    #[must_use]
    pub fn with_consent(mut self) -> Self {
        self.supports_consent = true;
        self
    }

    /// Sleeps this long inside every call.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Queues an error returned by the next call for `collection`.
    pub fn fail_next(&self, collection: impl Into<String>, error: ConnectorError) {
        self.failures
            .lock()
            .entry(collection.into())
            .or_default()
            .push_back(error);
    }

    /// Current rows of a table.
    #[must_use]
    pub fn rows(&self, collection: &str) -> Vec<Row> {
        self.tables.lock().get(collection).cloned().unwrap_or_default()
    }

    /// The call log in order.
    #[must_use]
    pub fn calls(&self) -> Vec<ConnectorCall> {
        self.log.lock().clone()
    }

    /// Number of started calls of one operation on one collection.
    #[must_use]
    pub fn call_count(&self, operation: &str, collection: &str) -> usize {
        self.log
            .lock()
            .iter()
            .filter(|c| c.phase == CallPhase::Start && c.operation == operation && c.collection.collection == collection)
            .count()
    }

    /// Consent preference sets received.
    #[must_use]
    pub fn consent_updates(&self) -> Vec<Vec<ConsentPreference>> {
        self.consent_updates.lock().clone()
    }

    fn record(&self, phase: CallPhase, operation: &'static str, node: &TraversalNode) {
        self.log.lock().push(ConnectorCall {
            phase,
            operation,
            collection: node.address.clone(),
        });
    }

    async fn enter(&self, operation: &'static str, node: &TraversalNode) -> Result<(), ConnectorError> {
        self.record(CallPhase::Start, operation, node);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let scripted = self
            .failures
            .lock()
            .get_mut(&node.address.collection)
            .and_then(VecDeque::pop_front);
        match scripted {
            Some(error) => {
                self.record(CallPhase::End, operation, node);
                Err(error)
            }
            None => Ok(()),
        }
    }
}

#[async_trait]
impl Connector for InMemoryConnector {
    fn kind(&self) -> &'static str {
        "in_memory"
    }

    fn capabilities(&self) -> ConnectorCapabilities {
        ConnectorCapabilities {
            query: true,
            mutate: true,
            consent: self.supports_consent,
            ..ConnectorCapabilities::default()
        }
    }

    async fn retrieve(&self, node: &TraversalNode, conditions: &QueryConditions) -> Result<Vec<Row>, ConnectorError> {
        self.enter("retrieve", node).await?;
        let rows: Vec<Row> = self
            .rows(&node.address.collection)
            .into_iter()
            .filter(|row| {
                conditions
                    .iter()
                    .any(|(path, values)| get_path(row, path).is_some_and(|v| values.contains(v)))
            })
            .collect();
        self.record(CallPhase::End, "retrieve", node);
        Ok(rows)
    }

    async fn mutate(&self, node: &TraversalNode, updates: &[RowUpdate]) -> Result<usize, ConnectorError> {
        self.enter("mutate", node).await?;
        let mut affected = 0;
        {
            let mut tables = self.tables.lock();
            let table = tables.entry(node.address.collection.clone()).or_default();
            for update in updates {
                for row in table
                    .iter_mut()
                    .filter(|row| update.key.iter().all(|(k, v)| get_path(row, k) == Some(v)))
                {
                    for (path, value) in &update.changes {
                        set_path(row, path, value.clone());
                    }
                    affected += 1;
                }
            }
        }
        self.record(CallPhase::End, "mutate", node);
        Ok(affected)
    }

    async fn update_consent(
        &self,
        _identity: &IdentitySeeds,
        preferences: &[ConsentPreference],
    ) -> Result<bool, ConnectorError> {
        if !self.supports_consent {
            return Err(ConnectorError::unsupported("update_consent"));
        }
        self.consent_updates.lock().push(preferences.to_vec());
        Ok(true)
    }
}

/// Wraps a [`RequestStore`] and simulates a process crash right after the
/// n-th checkpoint is persisted.
pub struct FaultInjectingRequestStore {
    inner: Arc<dyn RequestStore>,
    crash_after: Mutex<Option<usize>>,
    checkpoints: AtomicUsize,
}

impl std::fmt::Debug for FaultInjectingRequestStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FaultInjectingRequestStore")
            .field("crash_after", &*self.crash_after.lock())
            .field("checkpoints", &self.checkpoints.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl FaultInjectingRequestStore {
    /// Wraps a store without any fault armed.
    #[must_use]
    pub fn new(inner: Arc<dyn RequestStore>) -> Self {
        Self {
            inner,
            crash_after: Mutex::new(None),
            checkpoints: AtomicUsize::new(0),
        }
    }

    /// Fails once, after persisting the n-th checkpoint (1-based).
    #[must_use]
    pub fn crash_after_checkpoint(self, n: usize) -> Self {
        *self.crash_after.lock() = Some(n);
        self
    }
}

#[async_trait]
impl RequestStore for FaultInjectingRequestStore {
    async fn create(&self, request: PrivacyRequest) -> Result<(), StoreError> {
        self.inner.create(request).await
    }

    async fn fetch(&self, id: Uuid) -> Result<PrivacyRequest, StoreError> {
        self.inner.fetch(id).await
    }

    async fn update(&self, request: PrivacyRequest) -> Result<(), StoreError> {
        self.inner.update(request).await
    }

    async fn set_status(&self, id: Uuid, status: RequestStatus) -> Result<(), StoreError> {
        self.inner.set_status(id, status).await
    }

    async fn request_cancel(&self, id: Uuid) -> Result<(), StoreError> {
        self.inner.request_cancel(id).await
    }

    async fn checkpoint(&self, id: Uuid) -> Result<Option<PipelineCheckpoint>, StoreError> {
        self.inner.checkpoint(id).await
    }

    async fn set_checkpoint(&self, id: Uuid, checkpoint: PipelineCheckpoint) -> Result<(), StoreError> {
        self.inner.set_checkpoint(id, checkpoint).await?;
        let count = self.checkpoints.fetch_add(1, Ordering::SeqCst) + 1;
        let mut armed = self.crash_after.lock();
        if *armed == Some(count) {
            *armed = None;
            return Err(StoreError::Backend(format!("injected crash after checkpoint {checkpoint}")));
        }
        Ok(())
    }
}

/// Wraps a [`TaskStore`] and fails the n-th task update, leaving the task
/// claimed as a crashed worker would.
pub struct FaultInjectingTaskStore {
    inner: Arc<dyn TaskStore>,
    fail_update: Mutex<Option<usize>>,
    updates: AtomicUsize,
}

impl std::fmt::Debug for FaultInjectingTaskStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FaultInjectingTaskStore")
            .field("fail_update", &*self.fail_update.lock())
            .field("updates", &self.updates.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl FaultInjectingTaskStore {
    /// Wraps a store without any fault armed.
    #[must_use]
    pub fn new(inner: Arc<dyn TaskStore>) -> Self {
        Self {
            inner,
            fail_update: Mutex::new(None),
            updates: AtomicUsize::new(0),
        }
    }

    /// Fails the n-th record write (1-based) without writing.
    ///
    /// Both `update` and `update_if_owner` count as writes.
    #[must_use]
    pub fn fail_update(self, n: usize) -> Self {
        *self.fail_update.lock() = Some(n);
        self
    }

    fn check_write(&self, id: Uuid) -> Result<(), StoreError> {
        let count = self.updates.fetch_add(1, Ordering::SeqCst) + 1;
        let mut armed = self.fail_update.lock();
        if *armed == Some(count) {
            *armed = None;
            return Err(StoreError::Backend(format!("injected failure updating task {id}")));
        }
        Ok(())
    }
}

#[async_trait]
impl TaskStore for FaultInjectingTaskStore {
    async fn create(&self, task: RequestTask) -> Result<(), StoreError> {
        self.inner.create(task).await
    }

    async fn fetch(&self, id: Uuid) -> Result<RequestTask, StoreError> {
        self.inner.fetch(id).await
    }

    async fn fetch_by_privacy_request(&self, privacy_request_id: Uuid) -> Result<Vec<RequestTask>, StoreError> {
        self.inner.fetch_by_privacy_request(privacy_request_id).await
    }

    async fn update(&self, task: RequestTask) -> Result<(), StoreError> {
        self.check_write(task.id)?;
        self.inner.update(task).await
    }

    async fn update_status(&self, id: Uuid, status: TaskStatus) -> Result<RequestTask, StoreError> {
        self.inner.update_status(id, status).await
    }

    async fn try_claim(&self, id: Uuid, worker_id: &str, lease_seconds: i64) -> Result<Option<RequestTask>, StoreError> {
        self.inner.try_claim(id, worker_id, lease_seconds).await
    }

    async fn renew_lease(&self, id: Uuid, claim_id: Uuid, lease_seconds: i64) -> Result<bool, StoreError> {
        self.inner.renew_lease(id, claim_id, lease_seconds).await
    }

    async fn update_if_owner(&self, task: RequestTask, claim_id: Uuid) -> Result<bool, StoreError> {
        self.check_write(task.id)?;
        self.inner.update_if_owner(task, claim_id).await
    }
}

/// A webhook client with scripted answers per webhook name.
///
/// Webhooks without a script answer with the default response.
#[derive(Debug, Default)]
pub struct RecordingWebhookClient {
    scripts: Mutex<HashMap<String, VecDeque<Result<WebhookResponse, WebhookError>>>>,
    calls: Mutex<Vec<(String, WebhookPayload)>>,
}

impl RecordingWebhookClient {
    /// Creates a client with no scripts.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues an answer for a webhook.
    pub fn respond(&self, name: impl Into<String>, response: Result<WebhookResponse, WebhookError>) {
        self.scripts.lock().entry(name.into()).or_default().push_back(response);
    }

    /// Calls received, as `(webhook name, payload)`.
    #[must_use]
    pub fn calls(&self) -> Vec<(String, WebhookPayload)> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl WebhookClient for RecordingWebhookClient {
    async fn call(&self, webhook: &Webhook, payload: &WebhookPayload) -> Result<WebhookResponse, WebhookError> {
        self.calls.lock().push((webhook.name.clone(), payload.clone()));
        self.scripts
            .lock()
            .get_mut(&webhook.name)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| Ok(WebhookResponse::default()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::fixtures::{customer_orders_dataset, email_identity, row};
    use crate::graph::Traversal;
    use serde_json::{json, Value};

    fn customer_node() -> TraversalNode {
        let traversal = Traversal::build(&[customer_orders_dataset()], &email_identity("a@b.c")).unwrap();
        let node = traversal
            .node(&CollectionAddress::new("postgres_example", "customer"))
            .unwrap()
            .clone();
        node
    }

    #[tokio::test]
    async fn test_in_memory_connector_filters_and_masks() {
        let connector = InMemoryConnector::new().with_rows(
            "customer",
            vec![
                row(json!({"id": 1, "email": "a@b.c"})),
                row(json!({"id": 2, "email": "x@y.z"})),
            ],
        );
        let node = customer_node();
        let conditions: QueryConditions = [("email".to_string(), vec![json!("a@b.c")])].into_iter().collect();

        let rows = connector.retrieve(&node, &conditions).await.unwrap();
        assert_eq!(rows.len(), 1);

        let update = RowUpdate {
            key: [("id".to_string(), json!(1))].into_iter().collect(),
            changes: [("email".to_string(), Value::Null)].into_iter().collect(),
        };
        assert_eq!(connector.mutate(&node, &[update]).await.unwrap(), 1);
        assert_eq!(connector.rows("customer")[0]["email"], Value::Null);
        assert_eq!(connector.call_count("retrieve", "customer"), 1);
        assert_eq!(connector.calls().len(), 4);
    }

    #[tokio::test]
    async fn test_scripted_failure_is_consumed() {
        let connector = InMemoryConnector::new().with_rows("customer", vec![row(json!({"id": 1, "email": "a@b.c"}))]);
        connector.fail_next("customer", ConnectorError::transient("refused"));
        let node = customer_node();
        let conditions: QueryConditions = [("email".to_string(), vec![json!("a@b.c")])].into_iter().collect();

        assert!(connector.retrieve(&node, &conditions).await.is_err());
        assert!(connector.retrieve(&node, &conditions).await.is_ok());
    }

    #[tokio::test]
    async fn test_request_store_crash_fires_once() {
        let store = FaultInjectingRequestStore::new(Arc::new(crate::tasks::InMemoryRequestStore::new()))
            .crash_after_checkpoint(1);
        let request = PrivacyRequest::new(crate::core::Policy::new("p"), email_identity("a@b.c"));
        let id = request.id;
        store.create(request).await.unwrap();

        assert!(store.set_checkpoint(id, PipelineCheckpoint::PreWebhooks).await.is_err());
        assert_eq!(store.checkpoint(id).await.unwrap(), Some(PipelineCheckpoint::PreWebhooks));
        assert!(store.set_checkpoint(id, PipelineCheckpoint::Access).await.is_ok());
    }
}
