//! Shared handles used by the runner, worker and orchestrator.

use crate::config::EngineConfig;
use crate::connectors::ConnectorRegistry;
use crate::core::Row;
use crate::errors::EngineError;
use crate::events::{EventSink, NoOpEventSink};
use crate::graph::Traversal;
use crate::masking::{MaskingSecretCache, MaskingStrategyRegistry};
use crate::queue::{InMemoryTaskQueue, TaskQueue};
use crate::retry::RetryController;
use crate::tasks::{
    ArtifactStore, InMemoryArtifactStore, InMemoryRequestStore, InMemoryTaskStore, RequestStore, RequestTask,
    TaskData, TaskStore,
};
use dashmap::DashMap;
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

/// Everything a worker needs to execute tasks.
///
/// Defaults to in-memory stores, an in-memory queue and a no-op event sink.
pub struct EngineContext {
    /// Engine configuration.
    pub config: EngineConfig,
    /// Connectors by connection key.
    pub connectors: ConnectorRegistry,
    /// Masking strategies by name.
    pub masking: MaskingStrategyRegistry,
    /// Request-scoped masking secrets.
    pub secrets: Arc<MaskingSecretCache>,
    /// Task persistence.
    pub tasks: Arc<dyn TaskStore>,
    /// Request persistence.
    pub requests: Arc<dyn RequestStore>,
    /// Large payload storage.
    pub artifacts: Arc<dyn ArtifactStore>,
    /// Work queue.
    pub queue: Arc<dyn TaskQueue>,
    /// Lifecycle events.
    pub events: Arc<dyn EventSink>,
    traversals: DashMap<Uuid, Arc<Traversal>>,
}

impl fmt::Debug for EngineContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineContext")
            .field("config", &self.config)
            .field("connectors", &self.connectors.keys())
            .field("masking", &self.masking.names())
            .field("active_requests", &self.traversals.len())
            .finish_non_exhaustive()
    }
}

impl EngineContext {
    /// Creates a context with in-memory infrastructure.
    #[must_use]
    pub fn new(config: EngineConfig, connectors: ConnectorRegistry) -> Self {
        Self {
            config,
            connectors,
            masking: MaskingStrategyRegistry::with_defaults(),
            secrets: Arc::new(MaskingSecretCache::new()),
            tasks: Arc::new(InMemoryTaskStore::new()),
            requests: Arc::new(InMemoryRequestStore::new()),
            artifacts: Arc::new(InMemoryArtifactStore::new()),
            queue: Arc::new(InMemoryTaskQueue::new()),
            events: Arc::new(NoOpEventSink),
            traversals: DashMap::new(),
        }
    }

    /// Replaces the masking registry.
    #[must_use]
    pub fn with_masking(mut self, masking: MaskingStrategyRegistry) -> Self {
        self.masking = masking;
        self
    }

    /// Replaces the task store.
    #[must_use]
    pub fn with_task_store(mut self, tasks: Arc<dyn TaskStore>) -> Self {
        self.tasks = tasks;
        self
    }

    /// Replaces the request store.
    #[must_use]
    pub fn with_request_store(mut self, requests: Arc<dyn RequestStore>) -> Self {
        self.requests = requests;
        self
    }

    /// Replaces the artifact store.
    #[must_use]
    pub fn with_artifact_store(mut self, artifacts: Arc<dyn ArtifactStore>) -> Self {
        self.artifacts = artifacts;
        self
    }

    /// Replaces the queue.
    #[must_use]
    pub fn with_queue(mut self, queue: Arc<dyn TaskQueue>) -> Self {
        self.queue = queue;
        self
    }

    /// Replaces the event sink.
    #[must_use]
    pub fn with_event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// Replaces the secret cache.
    #[must_use]
    pub fn with_secret_cache(mut self, secrets: Arc<MaskingSecretCache>) -> Self {
        self.secrets = secrets;
        self
    }

    /// A retry controller over this context's store and queue.
    #[must_use]
    pub fn retry(&self) -> RetryController {
        RetryController::new(
            self.config.task_retry.clone(),
            self.config.polling.clone(),
            Arc::clone(&self.tasks),
            Arc::clone(&self.queue),
        )
    }

    /// Makes a request's traversal available to workers.
    pub fn register_traversal(&self, privacy_request_id: Uuid, traversal: Arc<Traversal>) {
        self.traversals.insert(privacy_request_id, traversal);
    }

    /// The traversal registered for a request.
    #[must_use]
    pub fn traversal(&self, privacy_request_id: Uuid) -> Option<Arc<Traversal>> {
        self.traversals.get(&privacy_request_id).map(|t| Arc::clone(t.value()))
    }

    /// Forgets a request's traversal.
    pub fn release_traversal(&self, privacy_request_id: Uuid) {
        self.traversals.remove(&privacy_request_id);
    }

    /// Loads a task's rows, reading spilled payloads from the artifact store.
    pub async fn load_rows(&self, task: &RequestTask) -> Result<Vec<Row>, EngineError> {
        match &task.data {
            None => Ok(Vec::new()),
            Some(TaskData::Inline(rows)) => Ok(rows.clone()),
            Some(TaskData::External(artifact)) => {
                let bytes = self.artifacts.read(artifact).await?;
                Ok(serde_json::from_slice(&bytes)?)
            }
        }
    }
}
