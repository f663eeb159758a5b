//! Executes one task message.
//!
//! The runner re-reads the task, checks the request for cancellation and
//! pause, enforces the upstream gate, claims the task with a lease and then
//! dispatches by action. The lease is renewed while the dispatch runs, and
//! results are written back only while the claim is still held. Connector
//! and masking failures become task state; store and queue failures
//! propagate so the lease can lapse and a later resume picks the task up
//! again.

use super::context::EngineContext;
use crate::connectors::{Connector, PollOutcome, QueryConditions, RowUpdate};
use crate::core::row::{collect_values, get_path, payload_size};
use crate::core::{ActionType, CollectionAddress, MaskingStrategyConfig, RequestStatus, Row, TaskStatus};
use crate::errors::{ConnectorError, EngineError};
use crate::events::event_types;
use crate::graph::{Traversal, TraversalNode};
use crate::masking::MaskingContext;
use crate::observability::SpanTimer;
use crate::queue::TaskMessage;
use crate::retry::RetryDecision;
use crate::tasks::{PrivacyRequest, RequestTask, TaskData, TaskErrorDetail, UPSTREAM_FAILED};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use uuid::Uuid;

/// What happened to a dispatched message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskOutcome {
    /// The task finished.
    Completed,
    /// The task had nothing to do.
    Skipped,
    /// The task failed terminally.
    Failed,
    /// The task failed and was requeued with backoff.
    Retrying,
    /// The task is waiting on an async job.
    Polling,
    /// The task waits for manual input.
    RequiresInput,
    /// The request is paused; the task was parked.
    Paused,
    /// Upstream tasks have not finished.
    NotReady,
    /// Stale message, canceled request or lost claim.
    Ignored,
}

enum Execution {
    Complete,
    Skipped(&'static str),
    RequiresInput,
    AwaitPoll,
}

enum Gate {
    Open,
    Blocked,
    UpstreamFailed(CollectionAddress),
}

/// Runs task messages on behalf of one worker.
#[derive(Debug, Clone)]
pub struct TaskRunner {
    ctx: Arc<EngineContext>,
    worker_id: Arc<str>,
}

impl TaskRunner {
    /// Creates a runner identified by `worker_id` in task leases.
    #[must_use]
    pub fn new(ctx: Arc<EngineContext>, worker_id: impl Into<String>) -> Self {
        Self {
            ctx,
            worker_id: Arc::from(worker_id.into()),
        }
    }

    /// The shared context.
    #[must_use]
    pub fn context(&self) -> &Arc<EngineContext> {
        &self.ctx
    }

    /// Runs one message to a task state change, or ignores it.
    pub async fn run(&self, message: TaskMessage) -> Result<TaskOutcome, EngineError> {
        let task = self.ctx.tasks.fetch(message.task_id).await?;
        if task.status != TaskStatus::Pending {
            return Ok(TaskOutcome::Ignored);
        }

        let request = self.ctx.requests.fetch(task.privacy_request_id).await?;
        if request.is_canceled() {
            tracing::debug!(task_id = %task.id, "Request canceled; not dispatching");
            return Ok(TaskOutcome::Ignored);
        }
        if request.status == RequestStatus::Paused {
            self.ctx.tasks.update_status(task.id, TaskStatus::Paused).await?;
            self.emit(event_types::TASK_PAUSED, &task, None);
            return Ok(TaskOutcome::Paused);
        }
        let Some(traversal) = self.ctx.traversal(request.id) else {
            tracing::warn!(task_id = %task.id, privacy_request_id = %request.id, "No traversal registered; leaving task pending");
            return Ok(TaskOutcome::Ignored);
        };

        let gate = self.gate(&task).await?;
        if matches!(gate, Gate::Blocked) {
            return Ok(TaskOutcome::NotReady);
        }

        let Some(mut task) = self
            .ctx
            .tasks
            .try_claim(task.id, &self.worker_id, self.ctx.config.task_lease_seconds)
            .await?
        else {
            return Ok(TaskOutcome::Ignored);
        };
        let Some(claim_id) = task.lease.as_ref().map(|lease| lease.claim_id) else {
            return Err(EngineError::Internal(format!("claimed task {} carries no lease", task.id)));
        };

        if let Gate::UpstreamFailed(upstream) = gate {
            task.error = Some(TaskErrorDetail::upstream_failed(&task.address, &upstream));
            task.transition(TaskStatus::Error)?;
            if !self.commit(&task, claim_id).await? {
                return Ok(TaskOutcome::Ignored);
            }
            self.emit(event_types::TASK_FAILED, &task, Some(json!({"kind": UPSTREAM_FAILED})));
            self.enqueue_downstream(&task).await?;
            return Ok(TaskOutcome::Failed);
        }

        tracing::info!(
            task_id = %task.id,
            collection = %task.address,
            action = %task.action,
            worker_id = %self.worker_id,
            "Task started"
        );
        self.emit(event_types::TASK_STARTED, &task, None);

        let timer = SpanTimer::start(format!("{}:{}", task.action, task.address));
        let task_id = task.id;
        let dispatch = async {
            match task.action {
                ActionType::Access => self.run_access(&mut task, &request, &traversal).await,
                ActionType::Erasure => self.run_erasure(&mut task, &request, &traversal).await,
                ActionType::Consent => self.run_consent(&mut task, &request).await,
            }
        };
        let result = self.with_heartbeat(task_id, claim_id, dispatch).await;
        tracing::debug!(task_id = %task.id, span = timer.name(), duration_ms = timer.elapsed_ms(), "Task dispatch returned");
        self.finish(task, claim_id, result).await
    }

    /// Drives `work` while renewing the lease every third of its length.
    async fn with_heartbeat<F, T>(&self, task_id: Uuid, claim_id: Uuid, work: F) -> T
    where
        F: Future<Output = T>,
    {
        let lease_seconds = self.ctx.config.task_lease_seconds;
        let period_ms = u64::try_from(lease_seconds.max(1)).unwrap_or(1).saturating_mul(1000) / 3;
        let mut ticker = tokio::time::interval_at(
            tokio::time::Instant::now() + Duration::from_millis(period_ms),
            Duration::from_millis(period_ms),
        );
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(work);
        let mut held = true;
        loop {
            tokio::select! {
                output = &mut work => return output,
                _ = ticker.tick(), if held => {
                    match self.ctx.tasks.renew_lease(task_id, claim_id, lease_seconds).await {
                        Ok(true) => {}
                        Ok(false) => {
                            held = false;
                            tracing::warn!(task_id = %task_id, worker_id = %self.worker_id, "Lease lost during dispatch");
                        }
                        Err(error) => {
                            tracing::warn!(task_id = %task_id, error = %error, "Lease renewal failed");
                        }
                    }
                }
            }
        }
    }

    /// Writes the task back if this runner still holds the claim.
    async fn commit(&self, task: &RequestTask, claim_id: Uuid) -> Result<bool, EngineError> {
        let owned = self.ctx.tasks.update_if_owner(task.clone(), claim_id).await?;
        if !owned {
            tracing::warn!(
                task_id = %task.id,
                collection = %task.address,
                worker_id = %self.worker_id,
                "Claim lost; discarding result"
            );
        }
        Ok(owned)
    }

    async fn gate(&self, task: &RequestTask) -> Result<Gate, EngineError> {
        let mut open = true;
        for id in &task.upstream_tasks {
            let upstream = self.ctx.tasks.fetch(*id).await?;
            if upstream.status == TaskStatus::Error {
                return Ok(Gate::UpstreamFailed(upstream.address));
            }
            open &= upstream.status.satisfies_gate();
        }
        Ok(if open { Gate::Open } else { Gate::Blocked })
    }

    async fn finish(
        &self,
        mut task: RequestTask,
        claim_id: Uuid,
        result: Result<Execution, EngineError>,
    ) -> Result<TaskOutcome, EngineError> {
        match result {
            Ok(Execution::Complete) => {
                task.error = None;
                task.transition(TaskStatus::Complete)?;
                if !self.commit(&task, claim_id).await? {
                    return Ok(TaskOutcome::Ignored);
                }
                tracing::info!(task_id = %task.id, collection = %task.address, rows_masked = task.rows_masked, "Task completed");
                self.emit(event_types::TASK_COMPLETED, &task, Some(json!({"rows_masked": task.rows_masked})));
                self.enqueue_downstream(&task).await?;
                Ok(TaskOutcome::Completed)
            }
            Ok(Execution::Skipped(reason)) => {
                task.transition(TaskStatus::Skipped)?;
                if !self.commit(&task, claim_id).await? {
                    return Ok(TaskOutcome::Ignored);
                }
                tracing::info!(task_id = %task.id, collection = %task.address, reason, "Task skipped");
                self.emit(event_types::TASK_SKIPPED, &task, Some(json!({"reason": reason})));
                self.enqueue_downstream(&task).await?;
                Ok(TaskOutcome::Skipped)
            }
            Ok(Execution::RequiresInput) => {
                task.transition(TaskStatus::RequiresInput)?;
                if !self.commit(&task, claim_id).await? {
                    return Ok(TaskOutcome::Ignored);
                }
                self.emit(event_types::TASK_REQUIRES_INPUT, &task, None);
                Ok(TaskOutcome::RequiresInput)
            }
            Ok(Execution::AwaitPoll) => {
                task.transition(TaskStatus::Pending)?;
                if !self.commit(&task, claim_id).await? {
                    return Ok(TaskOutcome::Ignored);
                }
                let delay = self.ctx.retry().poll_delay();
                self.enqueue(&task, delay).await?;
                self.emit(event_types::TASK_POLLING, &task, Some(json!({"poll_count": task.poll_count})));
                Ok(TaskOutcome::Polling)
            }
            Err(EngineError::Connector(error)) => {
                let detail = TaskErrorDetail::from_connector(&error, &task.address);
                self.fail(task, claim_id, detail).await
            }
            Err(EngineError::Masking(error)) => {
                let detail = TaskErrorDetail::from_masking(&error, &task.address);
                self.fail(task, claim_id, detail).await
            }
            Err(other) => Err(other),
        }
    }

    async fn fail(&self, mut task: RequestTask, claim_id: Uuid, mut detail: TaskErrorDetail) -> Result<TaskOutcome, EngineError> {
        let decision = self.ctx.retry().decide(&task, detail.retryable);

        if let RetryDecision::Retry(delay) = decision {
            task.error = Some(detail);
            task.retry_count += 1;
            task.transition(TaskStatus::Pending)?;
            if !self.commit(&task, claim_id).await? {
                return Ok(TaskOutcome::Ignored);
            }
            self.enqueue(&task, delay).await?;
            tracing::warn!(
                task_id = %task.id,
                collection = %task.address,
                retry_count = task.retry_count,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                "Task failed; retrying"
            );
            self.emit(event_types::TASK_RETRYING, &task, Some(json!({"retry_count": task.retry_count})));
            return Ok(TaskOutcome::Retrying);
        }

        // An exhausted budget is terminal.
        detail.retryable = false;
        task.error = Some(detail);
        task.transition(TaskStatus::Error)?;
        if !self.commit(&task, claim_id).await? {
            return Ok(TaskOutcome::Ignored);
        }
        let kind = task.error.as_ref().map_or("", |e| e.kind.as_str());
        tracing::error!(task_id = %task.id, collection = %task.address, kind, "Task failed");
        self.emit(event_types::TASK_FAILED, &task, Some(json!({"kind": kind})));
        self.enqueue_downstream(&task).await?;
        Ok(TaskOutcome::Failed)
    }

    async fn run_access(
        &self,
        task: &mut RequestTask,
        request: &PrivacyRequest,
        traversal: &Traversal,
    ) -> Result<Execution, EngineError> {
        let node = node_for(traversal, &task.address)?;
        let connector = self.ctx.connectors.get(&task.connection_key)?;

        if connector.capabilities().manual {
            return match task.manual_input.take() {
                Some(rows) => {
                    self.store_rows(task, rows).await?;
                    Ok(Execution::Complete)
                }
                None => Ok(Execution::RequiresInput),
            };
        }

        if task.polling {
            return self.poll(task, node, connector.as_ref()).await;
        }

        let conditions = self.query_conditions(task, node, request).await?;
        if conditions.values().all(Vec::is_empty) {
            return Ok(Execution::Skipped("no query values"));
        }

        if connector.uses_async_read(node) {
            let handle = connector.submit_async(node, &conditions).await?;
            task.async_handle = Some(handle);
            task.polling = true;
            task.poll_count = 0;
            task.async_submissions += 1;
            return Ok(Execution::AwaitPoll);
        }

        let rows = connector.retrieve(node, &conditions).await?;
        self.store_rows(task, rows).await?;
        Ok(Execution::Complete)
    }

    async fn poll(&self, task: &mut RequestTask, node: &TraversalNode, connector: &dyn Connector) -> Result<Execution, EngineError> {
        let handle = task
            .async_handle
            .clone()
            .ok_or_else(|| EngineError::Internal(format!("task {} is polling without a job handle", task.id)))?;

        match connector.poll_async(node, &handle).await? {
            PollOutcome::Pending => {
                task.poll_count += 1;
                if self.ctx.retry().poll_budget_exceeded(task.poll_count) {
                    let polls = task.poll_count;
                    task.poll_count = 0;
                    return Err(ConnectorError::PollTimeout { polls }.into());
                }
                Ok(Execution::AwaitPoll)
            }
            PollOutcome::Rows(rows) => {
                task.polling = false;
                self.store_rows(task, rows).await?;
                Ok(Execution::Complete)
            }
            PollOutcome::Failed(message) => {
                task.polling = false;
                task.async_handle = None;
                Err(ConnectorError::permanent(message).into())
            }
        }
    }

    /// Values to query by field: seeded identity values plus values read
    /// from upstream rows through incoming edges.
    async fn query_conditions(
        &self,
        task: &RequestTask,
        node: &TraversalNode,
        request: &PrivacyRequest,
    ) -> Result<QueryConditions, EngineError> {
        let mut conditions = QueryConditions::new();
        let identity = request.effective_identity();
        for (path, identity_type) in &node.identity_fields {
            if let Some(value) = identity.get(identity_type) {
                let values = match value {
                    Value::Array(items) => items.iter().filter(|v| !v.is_null()).cloned().collect(),
                    Value::Null => Vec::new(),
                    other => vec![other.clone()],
                };
                extend_unique(conditions.entry(path.clone()).or_default(), values);
            }
        }

        if node.incoming.is_empty() {
            return Ok(conditions);
        }
        let mut upstream_rows: BTreeMap<CollectionAddress, Vec<Row>> = BTreeMap::new();
        for id in &task.upstream_tasks {
            let upstream = self.ctx.tasks.fetch(*id).await?;
            if upstream.status == TaskStatus::Complete {
                let rows = self.ctx.load_rows(&upstream).await?;
                upstream_rows.insert(upstream.address, rows);
            }
        }
        for edge in &node.incoming {
            if let Some(rows) = upstream_rows.get(&edge.from.collection) {
                let values = collect_values(rows, &edge.from.path);
                extend_unique(conditions.entry(edge.to.path.clone()).or_default(), values);
            }
        }
        Ok(conditions)
    }

    async fn run_erasure(
        &self,
        task: &mut RequestTask,
        request: &PrivacyRequest,
        traversal: &Traversal,
    ) -> Result<Execution, EngineError> {
        let node = node_for(traversal, &task.address)?;
        let connector = self.ctx.connectors.get(&task.connection_key)?;

        if connector.capabilities().manual {
            return match task.manual_input.take() {
                Some(rows) => {
                    task.rows_masked = rows.len();
                    Ok(Execution::Complete)
                }
                None => Ok(Execution::RequiresInput),
            };
        }

        let access_task = self
            .ctx
            .tasks
            .fetch_by_privacy_request(request.id)
            .await?
            .into_iter()
            .find(|t| t.action == ActionType::Access && t.address == task.address);
        let rows = match access_task {
            Some(access) if access.status == TaskStatus::Complete => self.ctx.load_rows(&access).await?,
            _ => return Ok(Execution::Skipped("no access data")),
        };

        let targets: Vec<(String, Vec<MaskingStrategyConfig>)> = node
            .collection
            .flattened_fields()
            .into_iter()
            .filter(|(_, field)| !field.primary_key && field.fields.is_empty())
            .map(|(path, field)| (path, request.policy.masking_chain(&field.data_categories)))
            .filter(|(_, chain)| !chain.is_empty())
            .collect();
        if targets.is_empty() {
            return Ok(Execution::Skipped("no fields targeted by erasure rules"));
        }
        if rows.is_empty() {
            task.rows_masked = 0;
            return Ok(Execution::Complete);
        }
        if !connector.capabilities().mutate {
            return Err(ConnectorError::unsupported("mutate").into());
        }

        let mut keys = node.collection.primary_keys();
        if keys.is_empty() && rows.iter().all(|row| row.contains_key("_id")) {
            keys.push("_id".to_string());
        }
        if keys.is_empty() {
            return Err(ConnectorError::permanent(format!("collection '{}' declares no primary key", task.address)).into());
        }

        let context = MaskingContext::new(request.id, Arc::clone(&self.ctx.secrets));
        let mut changes: Vec<BTreeMap<String, Value>> = vec![BTreeMap::new(); rows.len()];
        for (path, chain) in &targets {
            let values: Vec<Value> = rows
                .iter()
                .map(|row| get_path(row, path).cloned().unwrap_or(Value::Null))
                .collect();
            let masked = self.ctx.masking.mask_chain(chain, values, &context)?;
            for ((row, change), value) in rows.iter().zip(changes.iter_mut()).zip(masked) {
                if get_path(row, path).is_some_and(|original| !original.is_null()) {
                    change.insert(path.clone(), value);
                }
            }
        }

        let mut updates = Vec::new();
        for (row, change) in rows.iter().zip(changes) {
            if change.is_empty() {
                continue;
            }
            let key = keys
                .iter()
                .map(|k| {
                    get_path(row, k)
                        .cloned()
                        .map(|v| (k.clone(), v))
                        .ok_or_else(|| ConnectorError::permanent(format!("row in '{}' is missing key field '{k}'", task.address)))
                })
                .collect::<Result<BTreeMap<_, _>, _>>()?;
            updates.push(RowUpdate { key, changes: change });
        }
        if updates.is_empty() {
            task.rows_masked = 0;
            return Ok(Execution::Complete);
        }

        task.rows_masked = connector.mutate(node, &updates).await?;
        Ok(Execution::Complete)
    }

    async fn run_consent(&self, task: &mut RequestTask, request: &PrivacyRequest) -> Result<Execution, EngineError> {
        let connector = self.ctx.connectors.get(&task.connection_key)?;
        if !connector.capabilities().consent {
            return Ok(Execution::Skipped("connector does not propagate consent"));
        }
        if request.consent_preferences.is_empty() {
            return Ok(Execution::Skipped("no consent preferences"));
        }
        let accepted = connector
            .update_consent(&request.effective_identity(), &request.consent_preferences)
            .await?;
        if accepted {
            Ok(Execution::Complete)
        } else {
            Err(ConnectorError::permanent("consent update rejected").into())
        }
    }

    async fn store_rows(&self, task: &mut RequestTask, rows: Vec<Row>) -> Result<(), EngineError> {
        if payload_size(&rows) > self.ctx.config.large_payload_threshold_bytes {
            let bytes = serde_json::to_vec(&rows)?;
            let key = format!("{}/{}.json", task.privacy_request_id, task.id);
            let artifact = self.ctx.artifacts.write(&key, bytes).await?;
            tracing::debug!(task_id = %task.id, size_bytes = artifact.size_bytes, "Spilled rows to artifact store");
            task.data = Some(TaskData::External(artifact));
        } else {
            task.data = Some(TaskData::Inline(rows));
        }
        Ok(())
    }

    async fn enqueue(&self, task: &RequestTask, delay: Duration) -> Result<(), EngineError> {
        self.ctx
            .queue
            .submit(TaskMessage::new(task.id, task.privacy_request_id), delay)
            .await?;
        Ok(())
    }

    async fn enqueue_downstream(&self, task: &RequestTask) -> Result<(), EngineError> {
        for id in &task.downstream_tasks {
            self.ctx
                .queue
                .submit(TaskMessage::new(*id, task.privacy_request_id), Duration::ZERO)
                .await?;
        }
        Ok(())
    }

    fn emit(&self, event_type: &str, task: &RequestTask, extra: Option<Value>) {
        let mut data = json!({
            "task_id": task.id,
            "privacy_request_id": task.privacy_request_id,
            "collection": task.address.to_string(),
            "action": task.action,
        });
        if let (Some(Value::Object(extra)), Value::Object(map)) = (extra, &mut data) {
            map.extend(extra);
        }
        self.ctx.events.try_emit(event_type, Some(data));
    }
}

fn node_for<'a>(traversal: &'a Traversal, address: &CollectionAddress) -> Result<&'a TraversalNode, EngineError> {
    traversal
        .node(address)
        .ok_or_else(|| EngineError::Internal(format!("collection {address} is not part of the traversal")))
}

fn extend_unique(target: &mut Vec<Value>, values: Vec<Value>) {
    for value in values {
        if !target.contains(&value) {
            target.push(value);
        }
    }
}
