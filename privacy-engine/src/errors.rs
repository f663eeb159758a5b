//! Error types for the privacy request engine.
//!
//! Errors are split by the component that raises them. Graph and masking
//! configuration errors are fatal; connector errors carry their own
//! retryability so the task runner can decide between a requeue and a
//! terminal failure.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// The main error type for engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The dataset graph could not be built.
    #[error("{0}")]
    GraphValidation(#[from] GraphValidationError),

    /// A connector call failed.
    #[error("{0}")]
    Connector(#[from] ConnectorError),

    /// A masking strategy is misconfigured.
    #[error("{0}")]
    Masking(#[from] MaskingStrategyError),

    /// A persistence operation failed.
    #[error("{0}")]
    Store(#[from] StoreError),

    /// The task queue rejected an operation.
    #[error("{0}")]
    Queue(#[from] QueueError),

    /// A webhook call failed.
    #[error("{0}")]
    Webhook(#[from] WebhookError),

    /// Engine configuration is invalid.
    #[error("{0}")]
    Config(#[from] ConfigError),

    /// Execution was interrupted before the current unit of work finished.
    #[error("Interrupted: {0}")]
    Interrupted(String),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A generic internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Metadata about a validation error for better diagnostics.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ErrorInfo {
    /// Error code (e.g., "GRAPH-CYCLE").
    pub code: String,
    /// Short summary of the error.
    pub summary: String,
    /// Hint for fixing the error.
    pub fix_hint: Option<String>,
    /// Additional context key-value pairs.
    #[serde(default)]
    pub context: HashMap<String, String>,
}

impl ErrorInfo {
    /// Creates a new error info.
    #[must_use]
    pub fn new(code: impl Into<String>, summary: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            summary: summary.into(),
            fix_hint: None,
            context: HashMap::new(),
        }
    }

    /// Sets the fix hint.
    #[must_use]
    pub fn with_fix_hint(mut self, hint: impl Into<String>) -> Self {
        self.fix_hint = Some(hint.into());
        self
    }

    /// Adds a single context entry.
    #[must_use]
    pub fn with_context_entry(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    /// Converts to a dictionary representation.
    #[must_use]
    pub fn to_dict(&self) -> HashMap<String, serde_json::Value> {
        let mut map = HashMap::new();
        map.insert("code".to_string(), serde_json::json!(self.code));
        map.insert("summary".to_string(), serde_json::json!(self.summary));
        if let Some(ref hint) = self.fix_hint {
            map.insert("fix_hint".to_string(), serde_json::json!(hint));
        }
        if !self.context.is_empty() {
            map.insert("context".to_string(), serde_json::json!(self.context));
        }
        map
    }
}

/// Error codes raised by the graph builder.
pub mod codes {
    /// A reference points at a dataset, collection or field that does not exist.
    pub const UNRESOLVED_REFERENCE: &str = "GRAPH-UNRESOLVED-REFERENCE";
    /// The reference graph contains a cycle.
    pub const CYCLE: &str = "GRAPH-CYCLE";
    /// Some collections cannot be reached from the identity seeds.
    pub const UNREACHABLE: &str = "GRAPH-UNREACHABLE";
    /// Two collections share an address.
    pub const DUPLICATE: &str = "GRAPH-DUPLICATE";
    /// No collection can be seeded from the supplied identities.
    pub const NO_SEEDS: &str = "GRAPH-NO-SEEDS";
}

/// Error raised when the dataset graph is invalid.
///
/// Always fatal: the graph builder never repairs a broken graph.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct GraphValidationError {
    /// The error message.
    pub message: String,
    /// Collection addresses involved, formatted as `dataset:collection`.
    pub collections: Vec<String>,
    /// Diagnostic info.
    pub error_info: ErrorInfo,
}

impl GraphValidationError {
    /// Creates a new graph validation error.
    #[must_use]
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            error_info: ErrorInfo::new(code, message.clone()),
            message,
            collections: Vec::new(),
        }
    }

    /// A reference points at something absent from the dataset set.
    #[must_use]
    pub fn unresolved_reference(source: impl Into<String>, target: impl Into<String>) -> Self {
        let source = source.into();
        let target = target.into();
        let mut err = Self::new(
            codes::UNRESOLVED_REFERENCE,
            format!("Field '{source}' references unknown target '{target}'"),
        )
        .with_collections(vec![source, target]);
        err.error_info = err
            .error_info
            .with_fix_hint("Add the referenced dataset to the active set or fix the reference.");
        err
    }

    /// The reference graph contains a cycle.
    #[must_use]
    pub fn cycle(cycle_path: Vec<String>) -> Self {
        let mut err = Self::new(
            codes::CYCLE,
            format!("Cycle detected in dataset graph: {}", cycle_path.join(" -> ")),
        )
        .with_collections(cycle_path);
        err.error_info = err
            .error_info
            .with_fix_hint("Remove or reverse one of the references in the cycle.");
        err
    }

    /// Collections that no identity or reference can reach.
    #[must_use]
    pub fn unreachable(collections: Vec<String>) -> Self {
        Self::new(
            codes::UNREACHABLE,
            format!("Collections not reachable from identity seeds: {}", collections.join(", ")),
        )
        .with_collections(collections)
    }

    /// Sets the collections involved.
    #[must_use]
    pub fn with_collections(mut self, collections: Vec<String>) -> Self {
        self.collections = collections;
        self
    }

    /// Returns the error code.
    #[must_use]
    pub fn code(&self) -> &str {
        &self.error_info.code
    }

    /// Converts to a dictionary representation.
    #[must_use]
    pub fn to_dict(&self) -> HashMap<String, serde_json::Value> {
        let mut map = HashMap::new();
        map.insert("message".to_string(), serde_json::json!(self.message));
        map.insert("collections".to_string(), serde_json::json!(self.collections));
        let info: serde_json::Map<String, serde_json::Value> =
            self.error_info.to_dict().into_iter().collect();
        map.insert("error_info".to_string(), serde_json::Value::Object(info));
        map
    }
}

/// Classification of connector errors, persisted on failed tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectorErrorKind {
    /// Connection refused, timeout, throttling.
    Transient,
    /// Credentials rejected.
    Auth,
    /// The remote rejected the request permanently.
    Permanent,
    /// The remote answered with something unparseable.
    MalformedResponse,
    /// An async job never finished within the poll budget.
    PollTimeout,
    /// The connector does not support the requested operation.
    Unsupported,
    /// No connector is registered for the connection key.
    NotConfigured,
}

/// Errors raised by connectors.
///
/// Messages must never contain credentials or secret material.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConnectorError {
    /// A retryable failure such as a refused connection.
    #[error("Transient connector error: {message}")]
    Transient {
        /// The error message.
        message: String,
    },

    /// Authentication failed.
    #[error("Connector authentication failed: {message}")]
    Auth {
        /// The error message.
        message: String,
    },

    /// A non-retryable failure.
    #[error("Connector error: {message}")]
    Permanent {
        /// The error message.
        message: String,
    },

    /// The response could not be interpreted.
    #[error("Malformed connector response: {message}")]
    MalformedResponse {
        /// The error message.
        message: String,
    },

    /// Polling an async job exceeded the poll budget.
    #[error("Async job not finished after {polls} polls")]
    PollTimeout {
        /// Number of polls performed.
        polls: u32,
    },

    /// The connector cannot perform the operation.
    #[error("Operation '{operation}' is not supported by this connector")]
    Unsupported {
        /// The operation name.
        operation: String,
    },

    /// No connector registered for the connection key.
    #[error("No connector configured for '{connection_key}'")]
    NotConfigured {
        /// The connection key.
        connection_key: String,
    },
}

impl ConnectorError {
    /// Creates a transient error.
    #[must_use]
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient { message: message.into() }
    }

    /// Creates an authentication error.
    #[must_use]
    pub fn auth(message: impl Into<String>) -> Self {
        Self::Auth { message: message.into() }
    }

    /// Creates a permanent error.
    #[must_use]
    pub fn permanent(message: impl Into<String>) -> Self {
        Self::Permanent { message: message.into() }
    }

    /// Creates a malformed response error.
    #[must_use]
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::MalformedResponse { message: message.into() }
    }

    /// Creates an unsupported operation error.
    #[must_use]
    pub fn unsupported(operation: impl Into<String>) -> Self {
        Self::Unsupported { operation: operation.into() }
    }

    /// Returns true if another attempt may succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient { .. } | Self::PollTimeout { .. })
    }

    /// Returns the error classification.
    #[must_use]
    pub fn kind(&self) -> ConnectorErrorKind {
        match self {
            Self::Transient { .. } => ConnectorErrorKind::Transient,
            Self::Auth { .. } => ConnectorErrorKind::Auth,
            Self::Permanent { .. } => ConnectorErrorKind::Permanent,
            Self::MalformedResponse { .. } => ConnectorErrorKind::MalformedResponse,
            Self::PollTimeout { .. } => ConnectorErrorKind::PollTimeout,
            Self::Unsupported { .. } => ConnectorErrorKind::Unsupported,
            Self::NotConfigured { .. } => ConnectorErrorKind::NotConfigured,
        }
    }
}

/// Error raised when a masking strategy cannot be built or applied.
///
/// Carries the strategy name only, never the value or secret involved.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Masking strategy '{strategy}': {message}")]
pub struct MaskingStrategyError {
    /// The strategy name.
    pub strategy: String,
    /// What went wrong.
    pub message: String,
}

impl MaskingStrategyError {
    /// Creates a new masking strategy error.
    #[must_use]
    pub fn new(strategy: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            strategy: strategy.into(),
            message: message.into(),
        }
    }

    /// The strategy name is not registered.
    #[must_use]
    pub fn unknown(strategy: impl Into<String>) -> Self {
        Self::new(strategy, "no strategy registered under this name")
    }

    /// The configuration does not match the strategy's schema.
    #[must_use]
    pub fn invalid_configuration(strategy: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::new(strategy, format!("invalid configuration: {reason}"))
    }
}

/// Errors raised by the task, request and artifact stores.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// The record does not exist.
    #[error("{kind} not found: {id}")]
    NotFound {
        /// The record kind.
        kind: String,
        /// The record id.
        id: String,
    },

    /// The record already exists.
    #[error("{kind} already exists: {id}")]
    AlreadyExists {
        /// The record kind.
        kind: String,
        /// The record id.
        id: String,
    },

    /// A status transition is not allowed by the task state machine.
    #[error("Task {task_id}: invalid transition {from} -> {to}")]
    InvalidTransition {
        /// The task id.
        task_id: String,
        /// Current status.
        from: String,
        /// Requested status.
        to: String,
    },

    /// A checkpoint would move backwards.
    #[error("Privacy request {request_id}: checkpoint cannot move from {current} to {requested}")]
    CheckpointRegression {
        /// The privacy request id.
        request_id: String,
        /// Stored checkpoint.
        current: String,
        /// Requested checkpoint.
        requested: String,
    },

    /// Backend failure.
    #[error("Store backend error: {0}")]
    Backend(String),
}

impl StoreError {
    /// Creates a not-found error.
    #[must_use]
    pub fn not_found(kind: impl Into<String>, id: impl std::fmt::Display) -> Self {
        Self::NotFound {
            kind: kind.into(),
            id: id.to_string(),
        }
    }
}

/// Errors raised by the task queue.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum QueueError {
    /// The queue no longer accepts messages.
    #[error("Task queue closed")]
    Closed,

    /// Backend failure.
    #[error("Task queue backend error: {0}")]
    Backend(String),
}

/// Errors raised by webhook calls.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum WebhookError {
    /// The endpoint could not be reached; the step may be retried.
    #[error("Webhook '{name}' unavailable: {message}")]
    Transient {
        /// The webhook name.
        name: String,
        /// The error message.
        message: String,
    },

    /// The endpoint rejected the call.
    #[error("Webhook '{name}' failed: {message}")]
    Permanent {
        /// The webhook name.
        name: String,
        /// The error message.
        message: String,
    },

    /// The endpoint answered with an unexpected body.
    #[error("Webhook '{name}' returned an invalid response: {message}")]
    InvalidResponse {
        /// The webhook name.
        name: String,
        /// The error message.
        message: String,
    },
}

impl WebhookError {
    /// Returns true if the step may be retried later.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }
}

/// Errors raised while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("Cannot read configuration: {0}")]
    Io(#[from] std::io::Error),

    /// The configuration could not be parsed.
    #[error("Cannot parse configuration: {0}")]
    Parse(#[from] serde_json::Error),

    /// A value is out of range or malformed.
    #[error("Invalid configuration value for '{key}': {value}")]
    InvalidValue {
        /// The configuration key.
        key: String,
        /// The rejected value.
        value: String,
    },
}
