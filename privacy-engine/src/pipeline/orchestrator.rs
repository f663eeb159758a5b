//! Checkpointed privacy request pipeline.

use super::webhooks::{Webhook, WebhookClient, WebhookDirection, WebhookPayload};
use crate::core::row::project;
use crate::core::{ActionType, CollectionAddress, IdentitySeeds, PipelineCheckpoint, RequestStatus, Row, TaskStatus};
use crate::errors::{ConfigError, EngineError, StoreError};
use crate::events::event_types;
use crate::execution::{EngineContext, TaskRunner, Worker};
use crate::graph::{DatasetConfig, Traversal};
use crate::queue::TaskMessage;
use crate::tasks::{PrivacyRequest, RequestTask, WebhookResumePoint, CONSENT_COLLECTION};
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Outcome of one pipeline step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepResult {
    /// The step finished; persist its checkpoint and go on.
    Continue,
    /// Stop and pause the request.
    Halt(String),
    /// Stop without pausing; running the request again retries the step.
    Retry(String),
    /// Tasks are waiting on manual input.
    AwaitingInput,
}

/// Pre or post execution webhooks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HookPhase {
    Pre,
    Post,
}

/// Drives privacy requests through the checkpoint sequence
/// `pre_webhooks → access → consent → erasure → finalize_erasure →
/// post_webhooks → done`.
///
/// Every step boundary persists a checkpoint, so [`run`](Self::run) on a
/// request that stopped part way skips finished steps and resumes the
/// current one at task granularity.
#[derive(Clone)]
pub struct Orchestrator {
    ctx: Arc<EngineContext>,
    datasets: Arc<Vec<DatasetConfig>>,
    pre_webhooks: Vec<Webhook>,
    post_webhooks: Vec<Webhook>,
    webhook_client: Option<Arc<dyn WebhookClient>>,
    worker_id: String,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("datasets", &self.datasets.iter().map(|d| d.name.as_str()).collect::<Vec<_>>())
            .field("pre_webhooks", &self.pre_webhooks.len())
            .field("post_webhooks", &self.post_webhooks.len())
            .field("worker_id", &self.worker_id)
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    /// Creates an orchestrator over a context and the active datasets.
    #[must_use]
    pub fn new(ctx: Arc<EngineContext>, datasets: Vec<DatasetConfig>) -> Self {
        Self {
            ctx,
            datasets: Arc::new(datasets),
            pre_webhooks: Vec::new(),
            post_webhooks: Vec::new(),
            webhook_client: None,
            worker_id: format!("worker-{}", Uuid::new_v4()),
        }
    }

    /// Adds a webhook called before any graph step.
    #[must_use]
    pub fn with_pre_webhook(mut self, webhook: Webhook) -> Self {
        self.pre_webhooks.push(webhook);
        self
    }

    /// Adds a webhook called after every graph step.
    #[must_use]
    pub fn with_post_webhook(mut self, webhook: Webhook) -> Self {
        self.post_webhooks.push(webhook);
        self
    }

    /// Sets the client used to call webhooks.
    #[must_use]
    pub fn with_webhook_client(mut self, client: Arc<dyn WebhookClient>) -> Self {
        self.webhook_client = Some(client);
        self
    }

    /// Sets the worker id recorded in task leases.
    #[must_use]
    pub fn with_worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = worker_id.into();
        self
    }

    /// The shared context.
    #[must_use]
    pub fn context(&self) -> &Arc<EngineContext> {
        &self.ctx
    }

    /// Stores a new request and returns its id.
    pub async fn submit(&self, request: PrivacyRequest) -> Result<Uuid, EngineError> {
        let id = request.id;
        self.ctx.requests.create(request).await?;
        tracing::info!(privacy_request_id = %id, "Privacy request submitted");
        Ok(id)
    }

    /// Runs a request from its last checkpoint until it finishes or stops.
    ///
    /// Returns the request status at the point the run stopped.
    pub async fn run(&self, request_id: Uuid) -> Result<RequestStatus, EngineError> {
        let mut request = self.ctx.requests.fetch(request_id).await?;
        if request.is_canceled() {
            return self.finish_canceled(request_id).await;
        }
        if request.status == RequestStatus::Paused && request.webhook_resume.is_some() {
            tracing::info!(privacy_request_id = %request_id, "Request is waiting on a webhook");
            return Ok(RequestStatus::Paused);
        }
        if request.status != RequestStatus::InProcessing {
            request.set_status(RequestStatus::InProcessing);
            self.ctx.requests.update(request).await?;
        }

        let completed = self.ctx.requests.checkpoint(request_id).await?;
        for step in PipelineCheckpoint::remaining_after(completed) {
            if self.ctx.requests.fetch(request_id).await?.is_canceled() {
                return self.finish_canceled(request_id).await;
            }

            tracing::debug!(privacy_request_id = %request_id, step = %step, "Running pipeline step");
            let result = match step {
                PipelineCheckpoint::PreWebhooks => self.run_webhooks(request_id, HookPhase::Pre).await?,
                PipelineCheckpoint::Access | PipelineCheckpoint::Consent | PipelineCheckpoint::Erasure => {
                    let action = step
                        .action()
                        .ok_or_else(|| EngineError::Internal(format!("step {step} has no action")))?;
                    self.run_action(request_id, action).await?
                }
                PipelineCheckpoint::FinalizeErasure => self.finalize_erasure(request_id),
                PipelineCheckpoint::PostWebhooks => self.run_webhooks(request_id, HookPhase::Post).await?,
                PipelineCheckpoint::Done => StepResult::Continue,
            };

            if self.ctx.requests.fetch(request_id).await?.is_canceled() {
                return self.finish_canceled(request_id).await;
            }

            match result {
                StepResult::Continue => {
                    self.ctx.requests.set_checkpoint(request_id, step).await?;
                    tracing::info!(privacy_request_id = %request_id, checkpoint = %step, "Checkpoint reached");
                    self.ctx.events.try_emit(
                        event_types::PIPELINE_CHECKPOINT,
                        Some(json!({"privacy_request_id": request_id, "checkpoint": step})),
                    );
                }
                StepResult::Halt(reason) => {
                    self.set_status(request_id, RequestStatus::Paused).await?;
                    self.halted(request_id, step, &reason);
                    return Ok(RequestStatus::Paused);
                }
                StepResult::Retry(reason) => {
                    self.halted(request_id, step, &reason);
                    return Ok(RequestStatus::InProcessing);
                }
                StepResult::AwaitingInput => {
                    self.set_status(request_id, RequestStatus::RequiresInput).await?;
                    self.halted(request_id, step, "awaiting manual input");
                    return Ok(RequestStatus::RequiresInput);
                }
            }
        }

        self.finish(request_id).await
    }

    /// Merges identity returned by a halting webhook and continues the run
    /// with the next webhook.
    pub async fn resume_from_webhook(
        &self,
        request_id: Uuid,
        derived_identity: IdentitySeeds,
    ) -> Result<RequestStatus, EngineError> {
        let mut request = self.ctx.requests.fetch(request_id).await?;
        if request.webhook_resume.is_none() {
            return Err(EngineError::Internal(format!(
                "privacy request {request_id} is not waiting on a webhook"
            )));
        }
        request.derived_identity.extend(derived_identity);
        request.set_status(RequestStatus::InProcessing);
        self.ctx.requests.update(request).await?;
        tracing::info!(privacy_request_id = %request_id, "Resuming after webhook");
        self.run(request_id).await
    }

    /// Cancels a request. In-flight connector calls finish; nothing new is
    /// dispatched.
    pub async fn cancel(&self, request_id: Uuid) -> Result<(), EngineError> {
        self.ctx.requests.request_cancel(request_id).await?;
        self.finish_canceled(request_id).await?;
        Ok(())
    }

    /// Pauses a request. Tasks not yet claimed are parked; calling
    /// [`run`](Self::run) resumes it.
    pub async fn pause(&self, request_id: Uuid) -> Result<(), EngineError> {
        self.set_status(request_id, RequestStatus::Paused).await?;
        tracing::info!(privacy_request_id = %request_id, "Privacy request paused");
        Ok(())
    }

    /// Supplies rows for a manual task waiting on input and puts it back in
    /// the queue. Call [`run`](Self::run) to continue the request.
    pub async fn provide_manual_input(
        &self,
        request_id: Uuid,
        action: ActionType,
        address: &CollectionAddress,
        rows: Vec<Row>,
    ) -> Result<(), EngineError> {
        let mut task = self
            .ctx
            .tasks
            .fetch_by_privacy_request(request_id)
            .await?
            .into_iter()
            .find(|t| t.action == action && &t.address == address)
            .ok_or_else(|| StoreError::not_found("request task", format!("{request_id}/{action}/{address}")))?;

        if task.status != TaskStatus::RequiresInput {
            return Err(StoreError::InvalidTransition {
                task_id: task.id.to_string(),
                from: task.status.to_string(),
                to: TaskStatus::Pending.to_string(),
            }
            .into());
        }
        task.manual_input = Some(rows);
        task.transition(TaskStatus::Pending)?;
        self.ctx.tasks.update(task.clone()).await?;
        self.ctx
            .queue
            .submit(TaskMessage::new(task.id, request_id), Duration::ZERO)
            .await?;
        tracing::info!(privacy_request_id = %request_id, collection = %address, action = %action, "Manual input supplied");
        Ok(())
    }

    async fn run_webhooks(&self, request_id: Uuid, phase: HookPhase) -> Result<StepResult, EngineError> {
        let (hooks, checkpoint) = match phase {
            HookPhase::Pre => (&self.pre_webhooks, PipelineCheckpoint::PreWebhooks),
            HookPhase::Post => (&self.post_webhooks, PipelineCheckpoint::PostWebhooks),
        };
        if hooks.is_empty() {
            return Ok(StepResult::Continue);
        }
        let client = self.webhook_client.as_ref().ok_or_else(|| ConfigError::InvalidValue {
            key: "webhooks".to_string(),
            value: "webhooks are registered but no webhook client is configured".to_string(),
        })?;

        let mut request = self.ctx.requests.fetch(request_id).await?;
        let start = match request.webhook_resume.take() {
            Some(point) if point.checkpoint == checkpoint => point.next_index,
            _ => 0,
        };

        for (index, hook) in hooks.iter().enumerate().skip(start) {
            let payload = WebhookPayload {
                privacy_request_id: request_id,
                identity: request.effective_identity(),
                direction: hook.direction,
            };
            let response = match client.call(hook, &payload).await {
                Ok(response) => response,
                Err(e) if e.is_retryable() => {
                    tracing::warn!(privacy_request_id = %request_id, webhook = %hook.name, error = %e, "Webhook unavailable");
                    request.webhook_resume = Some(WebhookResumePoint {
                        checkpoint,
                        next_index: index,
                    });
                    self.ctx.requests.update(request).await?;
                    return Ok(StepResult::Retry(e.to_string()));
                }
                Err(e) => {
                    tracing::error!(privacy_request_id = %request_id, webhook = %hook.name, error = %e, "Webhook failed");
                    request.set_status(RequestStatus::Error);
                    self.ctx.requests.update(request).await?;
                    return Err(e.into());
                }
            };

            if hook.direction == WebhookDirection::TwoWay && phase == HookPhase::Pre {
                if let Some(derived) = response.derived_identity {
                    request.derived_identity.extend(derived);
                }
                if response.halt {
                    request.webhook_resume = Some(WebhookResumePoint {
                        checkpoint,
                        next_index: index + 1,
                    });
                    self.ctx.requests.update(request).await?;
                    return Ok(StepResult::Halt(format!("webhook '{}' halted the request", hook.name)));
                }
            }
        }

        self.ctx.requests.update(request).await?;
        Ok(StepResult::Continue)
    }

    async fn run_action(&self, request_id: Uuid, action: ActionType) -> Result<StepResult, EngineError> {
        let request = self.ctx.requests.fetch(request_id).await?;
        let runs = match action {
            ActionType::Access => {
                request.policy.has_action(ActionType::Access) || request.policy.has_action(ActionType::Erasure)
            }
            other => request.policy.has_action(other),
        };
        if !runs {
            return Ok(StepResult::Continue);
        }
        if self.ctx.config.fail_fast_across_actions && !request.failed_actions.is_empty() {
            tracing::warn!(privacy_request_id = %request_id, action = %action, "Skipping action after an earlier failure");
            return Ok(StepResult::Continue);
        }

        let traversal = self.traversal_for(&request)?;
        let existing: Vec<RequestTask> = self
            .ctx
            .tasks
            .fetch_by_privacy_request(request_id)
            .await?
            .into_iter()
            .filter(|t| t.action == action)
            .collect();

        if existing.is_empty() {
            let tasks = Self::build_tasks(&request, &traversal, action)?;
            tracing::info!(privacy_request_id = %request_id, action = %action, tasks = tasks.len(), "Created request tasks");
            for task in &tasks {
                self.ctx.tasks.create(task.clone()).await?;
            }
            for task in tasks.iter().filter(|t| t.upstream_tasks.is_empty()) {
                self.ctx
                    .queue
                    .submit(TaskMessage::new(task.id, request_id), Duration::ZERO)
                    .await?;
            }
        } else {
            let summary = self.ctx.retry().resume_action(request_id, action).await?;
            tracing::info!(
                privacy_request_id = %request_id,
                action = %action,
                requeued = summary.requeued.len(),
                live = summary.live.len(),
                "Resuming request tasks"
            );
        }

        let worker = Worker::new(
            TaskRunner::new(Arc::clone(&self.ctx), self.worker_id.clone()),
            self.ctx.config.worker_concurrency,
        );
        worker.run_until_idle().await?;

        let result = self.evaluate(request_id, action).await?;
        if result == StepResult::Continue && action == ActionType::Access && request.policy.has_action(ActionType::Access) {
            self.write_access_results(request_id, &traversal).await?;
        }
        Ok(result)
    }

    /// Creates the tasks of one action with their dependency links.
    fn build_tasks(
        request: &PrivacyRequest,
        traversal: &Traversal,
        action: ActionType,
    ) -> Result<Vec<RequestTask>, EngineError> {
        if action == ActionType::Consent {
            let datasets: BTreeMap<&str, &str> = traversal
                .nodes()
                .map(|n| (n.address.dataset.as_str(), n.connection_key.as_str()))
                .collect();
            return Ok(datasets
                .into_iter()
                .map(|(dataset, key)| {
                    RequestTask::new(request.id, CollectionAddress::new(dataset, CONSENT_COLLECTION), key, action)
                })
                .collect());
        }

        let (order, upstream): (Vec<CollectionAddress>, BTreeMap<CollectionAddress, BTreeSet<CollectionAddress>>) =
            if action == ActionType::Erasure {
                let erasure = traversal.erasure_order()?;
                (erasure.order, erasure.upstream)
            } else {
                let upstream = traversal.nodes().map(|n| (n.address.clone(), n.upstream.clone())).collect();
                (traversal.topological_order().to_vec(), upstream)
            };

        let mut tasks: Vec<RequestTask> = Vec::with_capacity(order.len());
        let mut index: HashMap<CollectionAddress, usize> = HashMap::new();
        for address in order {
            let node = traversal
                .node(&address)
                .ok_or_else(|| EngineError::Internal(format!("collection {address} missing from traversal")))?;
            index.insert(address.clone(), tasks.len());
            tasks.push(RequestTask::new(request.id, address, node.connection_key.clone(), action));
        }
        for position in 0..tasks.len() {
            let ups: Vec<usize> = upstream
                .get(&tasks[position].address)
                .into_iter()
                .flatten()
                .filter_map(|a| index.get(a).copied())
                .collect();
            for up in ups {
                let (up_id, down_id) = (tasks[up].id, tasks[position].id);
                tasks[position].upstream_tasks.push(up_id);
                tasks[up].downstream_tasks.push(down_id);
            }
        }
        Ok(tasks)
    }

    /// Looks at the tasks of a step after the worker went idle.
    async fn evaluate(&self, request_id: Uuid, action: ActionType) -> Result<StepResult, EngineError> {
        let all = self.ctx.tasks.fetch_by_privacy_request(request_id).await?;

        let mut request = self.ctx.requests.fetch(request_id).await?;
        request.errors = all.iter().filter(|t| t.status == TaskStatus::Error).filter_map(|t| t.error.clone()).collect();
        request.failed_actions = all.iter().filter(|t| t.status == TaskStatus::Error).map(|t| t.action).collect();
        self.ctx.requests.update(request).await?;

        let tasks: Vec<&RequestTask> = all.iter().filter(|t| t.action == action).collect();
        if tasks.iter().any(|t| t.status == TaskStatus::Paused) {
            return Ok(StepResult::Halt("request paused".to_string()));
        }
        if tasks.iter().any(|t| t.status == TaskStatus::RequiresInput) {
            return Ok(StepResult::AwaitingInput);
        }
        let unfinished = tasks
            .iter()
            .filter(|t| matches!(t.status, TaskStatus::Pending | TaskStatus::InProcessing))
            .count();
        if unfinished > 0 {
            return Ok(StepResult::Retry(format!("{unfinished} {action} tasks still running")));
        }

        let failed = tasks.iter().filter(|t| t.status == TaskStatus::Error).count();
        if failed > 0 {
            tracing::warn!(privacy_request_id = %request_id, action = %action, failed, "Action finished with failures");
        }
        Ok(StepResult::Continue)
    }

    /// Writes the access rows of every completed task, limited to fields the
    /// policy's access rules target.
    async fn write_access_results(&self, request_id: Uuid, traversal: &Traversal) -> Result<(), EngineError> {
        let mut request = self.ctx.requests.fetch(request_id).await?;
        let tasks = self.ctx.tasks.fetch_by_privacy_request(request_id).await?;

        let mut results = Map::new();
        for task in tasks
            .iter()
            .filter(|t| t.action == ActionType::Access && t.status == TaskStatus::Complete)
        {
            let Some(node) = traversal.node(&task.address) else {
                continue;
            };
            let paths: Vec<String> = node
                .collection
                .flattened_fields()
                .into_iter()
                .filter(|(_, field)| field.fields.is_empty() && request.policy.access_targets(&field.data_categories))
                .map(|(path, _)| path)
                .collect();
            if paths.is_empty() {
                continue;
            }
            let rows: Vec<Value> = self
                .ctx
                .load_rows(task)
                .await?
                .iter()
                .map(|row| Value::Object(project(row, &paths)))
                .collect();
            results.insert(task.address.to_string(), Value::Array(rows));
        }

        let key = format!("{request_id}/access_results.json");
        let artifact = self.ctx.artifacts.write(&key, serde_json::to_vec(&results)?).await?;
        tracing::info!(privacy_request_id = %request_id, collections = results.len(), size_bytes = artifact.size_bytes, "Access results written");
        request.access_result = Some(artifact);
        self.ctx.requests.update(request).await?;
        Ok(())
    }

    fn finalize_erasure(&self, request_id: Uuid) -> StepResult {
        let discarded = self.ctx.secrets.discard(request_id);
        if discarded > 0 {
            tracing::info!(privacy_request_id = %request_id, discarded, "Masking secrets discarded");
        }
        StepResult::Continue
    }

    fn traversal_for(&self, request: &PrivacyRequest) -> Result<Arc<Traversal>, EngineError> {
        if let Some(traversal) = self.ctx.traversal(request.id) {
            return Ok(traversal);
        }
        let traversal = Arc::new(Traversal::build(&self.datasets, &request.effective_identity())?);
        self.ctx.register_traversal(request.id, Arc::clone(&traversal));
        Ok(traversal)
    }

    async fn finish(&self, request_id: Uuid) -> Result<RequestStatus, EngineError> {
        let mut request = self.ctx.requests.fetch(request_id).await?;
        let status = if request.failed_actions.is_empty() {
            RequestStatus::Complete
        } else {
            RequestStatus::Error
        };
        request.set_status(status);
        self.ctx.requests.update(request).await?;
        self.ctx.release_traversal(request_id);
        tracing::info!(privacy_request_id = %request_id, status = %status, "Privacy request finished");
        self.ctx.events.try_emit(
            event_types::PIPELINE_COMPLETED,
            Some(json!({"privacy_request_id": request_id, "status": status})),
        );
        Ok(status)
    }

    async fn finish_canceled(&self, request_id: Uuid) -> Result<RequestStatus, EngineError> {
        let mut request = self.ctx.requests.fetch(request_id).await?;
        if request.status != RequestStatus::Canceled {
            request.set_status(RequestStatus::Canceled);
            self.ctx.requests.update(request).await?;
            tracing::info!(privacy_request_id = %request_id, "Privacy request canceled");
            self.ctx.events.try_emit(
                event_types::PIPELINE_CANCELED,
                Some(json!({"privacy_request_id": request_id})),
            );
        }
        self.ctx.secrets.discard(request_id);
        self.ctx.release_traversal(request_id);
        Ok(RequestStatus::Canceled)
    }

    async fn set_status(&self, request_id: Uuid, status: RequestStatus) -> Result<(), EngineError> {
        self.ctx.requests.set_status(request_id, status).await?;
        Ok(())
    }

    fn halted(&self, request_id: Uuid, step: PipelineCheckpoint, reason: &str) {
        tracing::info!(privacy_request_id = %request_id, step = %step, reason, "Pipeline stopped");
        self.ctx.events.try_emit(
            event_types::PIPELINE_HALTED,
            Some(json!({"privacy_request_id": request_id, "step": step, "reason": reason})),
        );
    }
}
